//! PlaybackSessionController: owns the canonical `PlaybackState`.
//!
//! Network work is split from state changes so a single-owner loop can run
//! it in the background: `begin_*` bumps the session generation and returns a
//! `PendingLoad`, the load runs anywhere, and `apply_detail` folds the result
//! back in only if the generation it was issued for is still current.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use vod_proto::config::{AutoSkipConfig, Settings, SourceConfig};
use vod_proto::protocol::{
    Direction, PlaybackState, PlayerDirective, PlayerEntry, SessionStatus, SourceRef, VideoDetail,
};

use crate::autoskip::{AutoSkipEngine, SkipAction};
use crate::detail::DetailLookup;
use crate::episode::{parse_requested_episode, EpisodeNavigator};
use crate::error::SessionError;
use crate::sinks::{HistoryEntry, HistorySink};

const UNKNOWN_TITLE: &str = "Unknown title";

/// A detail load issued for one session generation.
#[derive(Debug, Clone)]
pub struct PendingLoad {
    pub generation: u64,
    pub video_id: String,
    pub source: SourceRef,
}

impl PendingLoad {
    pub async fn run(self, lookup: Arc<dyn DetailLookup>) -> DetailOutcome {
        let result = lookup.fetch(&self.video_id, &self.source).await;
        DetailOutcome {
            generation: self.generation,
            result,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetailOutcome {
    pub generation: u64,
    pub result: Result<VideoDetail, SessionError>,
}

pub struct PlaybackSessionController {
    detail: Arc<dyn DetailLookup>,
    sinks: Vec<Arc<dyn HistorySink>>,
    settings: watch::Receiver<Settings>,
    sources: Vec<SourceConfig>,
    autoskip_config: AutoSkipConfig,

    state: PlaybackState,
    navigator: EpisodeNavigator,
    autoskip: AutoSkipEngine,
    /// The entry the current session was opened with.
    context: Option<PlayerEntry>,
    detail_data: Option<VideoDetail>,
}

impl PlaybackSessionController {
    pub fn new(
        detail: Arc<dyn DetailLookup>,
        settings: watch::Receiver<Settings>,
        sources: Vec<SourceConfig>,
        autoskip_config: AutoSkipConfig,
    ) -> Self {
        let direction = Direction::from_reversed(settings.borrow().episode_reverse_order);
        Self {
            detail,
            sinks: Vec::new(),
            settings,
            sources,
            autoskip: AutoSkipEngine::new(autoskip_config.window_for(None)),
            autoskip_config,
            state: PlaybackState {
                direction,
                ..PlaybackState::default()
            },
            navigator: EpisodeNavigator::default(),
            context: None,
            detail_data: None,
        }
    }

    pub fn add_sink(&mut self, sink: Arc<dyn HistorySink>) {
        self.sinks.push(sink);
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    pub fn context(&self) -> Option<&PlayerEntry> {
        self.context.as_ref()
    }

    pub fn detail_lookup(&self) -> Arc<dyn DetailLookup> {
        Arc::clone(&self.detail)
    }

    pub fn autoskip(&self) -> &AutoSkipEngine {
        &self.autoskip
    }

    /// Configured sources are addressed with their full config, anything
    /// else by bare id.
    pub fn resolve_source(&self, source_id: &str) -> SourceRef {
        self.sources
            .iter()
            .find(|s| s.id == source_id)
            .cloned()
            .map(SourceRef::Configured)
            .unwrap_or_else(|| SourceRef::Bare {
                id: source_id.to_string(),
            })
    }

    // ── session lifecycle ────────────────────────────────────────────────────

    /// Open a new session generation for `entry`. Everything from the
    /// previous session is discarded.
    pub fn begin_start(&mut self, entry: PlayerEntry) -> PendingLoad {
        let generation = self.state.generation + 1;
        let direction = self.current_direction();
        let source = self.resolve_source(&entry.source_id);

        info!(
            "session {}: start video={} source={}",
            generation, entry.video_id, entry.source_id
        );

        self.navigator = EpisodeNavigator::default();
        self.autoskip.reset_for_episode(self.autoskip_config.window_for(None));
        self.detail_data = None;
        self.state = PlaybackState {
            rev: self.state.rev + 1,
            generation,
            status: SessionStatus::Loading,
            video_id: Some(entry.video_id.clone()),
            source_id: Some(entry.source_id.clone()),
            title: entry.title.clone(),
            direction,
            ..PlaybackState::default()
        };

        let pending = PendingLoad {
            generation,
            video_id: entry.video_id.clone(),
            source,
        };
        self.context = Some(entry);
        pending
    }

    /// Fold a finished detail load into the session. Returns `Ok(false)` when
    /// the load belongs to an older generation and was ignored.
    pub fn apply_detail(&mut self, outcome: DetailOutcome) -> Result<bool, SessionError> {
        if outcome.generation != self.state.generation {
            debug!(
                "session {}: dropping detail for stale generation {}",
                self.state.generation, outcome.generation
            );
            return Ok(false);
        }

        let result = outcome.result.and_then(|detail| {
            let episodes = detail.episode_list();
            if episodes.is_empty() {
                Err(SessionError::NoEpisodes)
            } else {
                Ok((detail, episodes))
            }
        });

        let (detail, episodes) = match result {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("session {}: {}", self.state.generation, e);
                self.state.status = SessionStatus::Failed;
                self.state.last_error = Some(e.to_fault());
                self.state.rev += 1;
                return Err(e);
            }
        };

        let direction = self.current_direction();
        let requested = self
            .context
            .as_ref()
            .and_then(|c| c.episode.as_deref())
            .and_then(parse_requested_episode);

        self.navigator = EpisodeNavigator::new(episodes);
        let index = self
            .navigator
            .resolve_initial_index(requested, direction)
            .unwrap_or(0);
        if let Err(e) = self.navigator.select_episode(index) {
            // resolve_initial_index only yields valid indices
            warn!("session {}: {}", self.state.generation, e);
        }

        if let Some(name) = detail.vod_name.clone().filter(|n| !n.is_empty()) {
            self.state.title = Some(name);
        }
        self.state.poster = detail.vod_pic.clone();
        self.state.episodes = self.navigator.episodes().to_vec();
        self.state.direction = direction;
        self.state.status = SessionStatus::Active;
        self.state.last_error = None;
        self.detail_data = Some(detail);
        self.enter_episode();

        info!(
            "session {}: playing episode {:?} of {}",
            self.state.generation,
            self.state.current_episode,
            self.navigator.len()
        );
        Ok(true)
    }

    /// Start and wait for the detail load in place.
    pub async fn start(&mut self, entry: PlayerEntry) -> Result<(), SessionError> {
        let pending = self.begin_start(entry);
        let outcome = pending.run(self.detail_lookup()).await;
        self.apply_detail(outcome).map(|_| ())
    }

    /// Re-open the current session on another source, keeping the title and
    /// grouped-source context. `video_id` overrides the candidate lookup.
    pub fn begin_switch_source(
        &mut self,
        source_id: &str,
        video_id: Option<&str>,
    ) -> Option<PendingLoad> {
        let context = self.context.clone()?;
        let video_id = video_id
            .map(str::to_string)
            .or_else(|| {
                context
                    .grouped_sources
                    .iter()
                    .find(|c| c.source == source_id)
                    .map(|c| c.id.clone())
            })
            .unwrap_or_else(|| context.video_id.clone());

        info!(
            "session {}: switching source {} -> {}",
            self.state.generation, context.source_id, source_id
        );
        Some(self.begin_start(PlayerEntry {
            video_id,
            source_id: source_id.to_string(),
            title: context.title,
            episode: None,
            grouped_sources: context.grouped_sources,
        }))
    }

    pub async fn switch_source(
        &mut self,
        source_id: &str,
        video_id: Option<&str>,
    ) -> Result<(), SessionError> {
        let Some(pending) = self.begin_switch_source(source_id, video_id) else {
            return Ok(());
        };
        let outcome = pending.run(self.detail_lookup()).await;
        self.apply_detail(outcome).map(|_| ())
    }

    pub fn begin_retry(&mut self) -> Option<PendingLoad> {
        let context = self.context.clone()?;
        Some(self.begin_start(context))
    }

    /// Leave the player. Pending loads for the old generation are ignored.
    pub fn stop(&mut self) {
        info!("session {}: stopped", self.state.generation);
        self.navigator = EpisodeNavigator::default();
        self.autoskip.reset_for_episode(self.autoskip_config.window_for(None));
        self.context = None;
        self.detail_data = None;
        self.state = PlaybackState {
            rev: self.state.rev + 1,
            generation: self.state.generation + 1,
            direction: self.current_direction(),
            ..PlaybackState::default()
        };
    }

    // ── navigation and playback ──────────────────────────────────────────────

    /// Out-of-range requests are ignored and leave the state untouched.
    pub fn on_episode_click(&mut self, index: usize) -> Option<PlayerDirective> {
        if self.state.status != SessionStatus::Active {
            return None;
        }
        if let Err(e) = self.navigator.select_episode(index) {
            debug!("session {}: ignoring episode click: {}", self.state.generation, e);
            return None;
        }
        self.enter_episode()
    }

    /// Step in the active direction; at the end of the list nothing happens.
    pub fn on_next_episode(&mut self) -> Option<PlayerDirective> {
        if self.state.status != SessionStatus::Active {
            return None;
        }
        let direction = self.refresh_direction();
        if self.navigator.next(direction).is_none() {
            debug!("session {}: no further episode", self.state.generation);
            return None;
        }
        self.enter_episode()
    }

    pub fn on_time_update(&mut self, current_time: f64, duration: f64) -> Option<PlayerDirective> {
        if self.state.status != SessionStatus::Active {
            return None;
        }
        self.state.elapsed_secs = finite_or_zero(current_time);
        self.state.duration_secs = finite_or_zero(duration);
        self.state.rev += 1;

        let direction = self.refresh_direction();
        let has_next = self.navigator.has_next(direction);
        let action = self.autoskip.observe(current_time, duration, has_next);
        self.state.outro_active = self.autoskip.is_outro_active();

        match action {
            Some(SkipAction::SeekTo(to_secs)) => {
                debug!("session {}: skipping intro to {:.1}s", self.state.generation, to_secs);
                Some(PlayerDirective::Seek { to_secs })
            }
            Some(SkipAction::AdvanceEpisode) => {
                info!("session {}: outro reached, advancing", self.state.generation);
                self.on_next_episode()
            }
            None => None,
        }
    }

    pub fn set_direction(&mut self, direction: Direction) {
        if self.state.direction != direction {
            self.state.direction = direction;
            self.state.rev += 1;
        }
    }

    // ── internals ────────────────────────────────────────────────────────────

    fn current_direction(&self) -> Direction {
        Direction::from_reversed(self.settings.borrow().episode_reverse_order)
    }

    fn refresh_direction(&mut self) -> Direction {
        let direction = self.current_direction();
        self.set_direction(direction);
        direction
    }

    /// Make the navigator's current episode the playing one.
    fn enter_episode(&mut self) -> Option<PlayerDirective> {
        let index = self.navigator.current()?;
        let url = self.navigator.play_url()?.to_string();

        self.state.current_episode = Some(index);
        self.state.play_url = Some(url.clone());
        self.state.elapsed_secs = 0.0;
        self.state.duration_secs = 0.0;
        self.state.outro_active = false;
        self.state.last_error = None;
        self.state.rev += 1;

        let window = self.autoskip_config.window_for(self.state.title.as_deref());
        self.autoskip.reset_for_episode(window);

        self.record_history();
        Some(PlayerDirective::Load { url })
    }

    fn record_history(&self) {
        let (Some(video_id), Some(source_id), Some(play_url), Some(episode_index)) = (
            self.state.video_id.clone(),
            self.state.source_id.clone(),
            self.state.play_url.clone(),
            self.state.current_episode,
        ) else {
            return;
        };

        let title = self
            .detail_data
            .as_ref()
            .and_then(|d| d.vod_name.clone())
            .filter(|n| !n.is_empty())
            .or_else(|| self.context.as_ref().and_then(|c| c.title.clone()))
            .unwrap_or_else(|| UNKNOWN_TITLE.to_string());

        let entry = HistoryEntry {
            video_id,
            title,
            play_url,
            episode_index,
            source_id,
            position_secs: self.state.elapsed_secs,
            duration_secs: self.state.duration_secs,
            poster: self.state.poster.clone(),
            episodes: self.state.episodes.clone(),
        };
        for sink in &self.sinks {
            sink.record(&entry);
        }
    }
}

fn finite_or_zero(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}
