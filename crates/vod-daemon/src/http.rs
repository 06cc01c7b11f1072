use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{get, post},
    Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use vod_core::latency::measure_round_trip;
use vod_core::{CoreMessage, SessionEvent};
use vod_proto::protocol::{
    Broadcast, Command, PingRequest, PingResponse, PlaybackState, PlayerEntry, SourceGroup,
    VideoSource,
};
use vod_proto::state::StateManager;

#[derive(Clone)]
pub struct HttpState {
    pub state_manager: Arc<StateManager>,
    pub event_tx: mpsc::Sender<SessionEvent>,
    pub broadcast_tx: broadcast::Sender<CoreMessage>,
    pub client: reqwest::Client,
    pub ping_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct PlayerQuery {
    id: Option<String>,
    source: Option<String>,
    title: Option<String>,
    episode: Option<String>,
    #[serde(rename = "groupedSources")]
    grouped_sources: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TimeUpdate {
    current_time: f64,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct SwitchSource {
    source_id: String,
    #[serde(default)]
    video_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SettingsPatch {
    #[serde(default)]
    episode_reverse_order: Option<bool>,
    #[serde(default)]
    realtime_latency: Option<bool>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/groups", get(get_groups))
        .route("/api/latency", get(get_latency))
        .route("/api/events", get(events))
        .route("/api/player", get(open_player))
        .route("/api/episode/:idx", post(select_episode))
        .route("/api/next", post(next_episode))
        .route("/api/time", post(time_update))
        .route("/api/source", post(switch_source))
        .route("/api/retry", post(retry))
        .route("/api/stop", post(stop))
        .route("/api/sources", post(set_sources))
        .route("/api/settings", post(update_settings))
        .route("/api/latency/refresh", post(refresh_all))
        .route("/api/latency/refresh/:id", post(refresh_one))
        .route("/api/ping", post(ping))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state: HttpState,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(SessionEvent::ClientCommand(cmd))
        .await
        .is_err()
    {
        error!("Failed to reach session core");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

// ── reads ────────────────────────────────────────────────────────────────────

async fn get_state(State(state): State<HttpState>) -> Json<PlaybackState> {
    Json(state.state_manager.playback().await)
}

async fn get_groups(State(state): State<HttpState>) -> Json<Vec<SourceGroup>> {
    Json(state.state_manager.get_state().await.groups)
}

async fn get_latency(State(state): State<HttpState>) -> Json<HashMap<String, u64>> {
    Json(state.state_manager.get_state().await.latencies)
}

/// Server-sent stream of `Broadcast` messages: state snapshots, regrouped
/// results, player directives and forwarded warnings.
async fn events(
    State(state): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcast_tx.subscribe();
    let manager = Arc::clone(&state.state_manager);

    let stream = stream::unfold((rx, manager), |(mut rx, manager)| async move {
        loop {
            let msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            let wire = match msg {
                CoreMessage::StateUpdated => Broadcast::State {
                    data: manager.playback().await,
                },
                CoreMessage::GroupsUpdated => Broadcast::Groups {
                    data: manager.get_state().await.groups,
                },
                CoreMessage::Directive(data) => Broadcast::Directive { data },
                CoreMessage::Log(message) => Broadcast::Log { message },
            };
            if let Ok(event) = Event::default().json_data(&wire) {
                return Some((Ok(event), (rx, manager)));
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

// ── session commands ─────────────────────────────────────────────────────────

async fn open_player(
    State(state): State<HttpState>,
    Query(q): Query<PlayerQuery>,
) -> Result<Json<PlayerEntry>, StatusCode> {
    let entry = PlayerEntry::from_params(
        q.id.as_deref(),
        q.source.as_deref(),
        q.title.as_deref(),
        q.episode.as_deref(),
        q.grouped_sources.as_deref(),
    )
    .ok_or(StatusCode::BAD_REQUEST)?;

    info!("HTTP API: open {} on {}", entry.video_id, entry.source_id);
    match send(&state, Command::Start { entry: entry.clone() }).await {
        StatusCode::OK => Ok(Json(entry)),
        status => Err(status),
    }
}

async fn select_episode(State(state): State<HttpState>, Path(idx): Path<usize>) -> StatusCode {
    info!("HTTP API: episode {}", idx);
    send(&state, Command::SelectEpisode { index: idx }).await
}

async fn next_episode(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::NextEpisode).await
}

async fn time_update(State(state): State<HttpState>, Json(t): Json<TimeUpdate>) -> StatusCode {
    send(
        &state,
        Command::TimeUpdate {
            current_time: t.current_time,
            duration: t.duration,
        },
    )
    .await
}

async fn switch_source(
    State(state): State<HttpState>,
    Json(req): Json<SwitchSource>,
) -> StatusCode {
    info!("HTTP API: switch source to {}", req.source_id);
    send(
        &state,
        Command::SwitchSource {
            source_id: req.source_id,
            video_id: req.video_id,
        },
    )
    .await
}

async fn retry(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: retry");
    send(&state, Command::Retry).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: stop");
    send(&state, Command::Stop).await
}

async fn set_sources(
    State(state): State<HttpState>,
    Json(sources): Json<Vec<VideoSource>>,
) -> StatusCode {
    send(&state, Command::SetSources { sources }).await
}

async fn update_settings(
    State(state): State<HttpState>,
    Json(patch): Json<SettingsPatch>,
) -> StatusCode {
    if let Some(reversed) = patch.episode_reverse_order {
        let status = send(&state, Command::SetReverseOrder { reversed }).await;
        if status != StatusCode::OK {
            return status;
        }
    }
    if let Some(enabled) = patch.realtime_latency {
        return send(&state, Command::SetRealtimeLatency { enabled }).await;
    }
    StatusCode::OK
}

async fn refresh_all(State(state): State<HttpState>) -> StatusCode {
    send(&state, Command::RefreshLatency { source_id: None }).await
}

async fn refresh_one(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    send(&state, Command::RefreshLatency { source_id: Some(id) }).await
}

// ── probe endpoint ───────────────────────────────────────────────────────────

async fn ping(
    State(state): State<HttpState>,
    Json(req): Json<PingRequest>,
) -> Result<Json<PingResponse>, StatusCode> {
    measure_round_trip(&state.client, &req.url, state.ping_timeout)
        .await
        .map(|latency| Json(PingResponse { latency }))
        .ok_or(StatusCode::BAD_GATEWAY)
}
