mod http;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vod_core::detail::HttpDetailClient;
use vod_core::latency::pinger_from_config;
use vod_core::sinks::{HistorySink, LogSink};
use vod_core::{CoreDeps, CoreMessage, SessionCore, SessionEvent};
use vod_proto::config::Config;
use vod_proto::protocol::Command;
use vod_proto::state::StateManager;

/// Forwards WARN and ERROR events to connected clients.
struct BroadcastLayer {
    sender: broadcast::Sender<CoreMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<CoreMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // no receivers is fine
        let _ = self.sender.send(CoreMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

fn init_logging(broadcast_tx: broadcast::Sender<CoreMessage>) -> anyhow::Result<()> {
    let log_path = vod_proto::platform::log_path();
    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,vod_core=debug,vod_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);
    Ok(())
}

/// Re-read the settings section on a fixed schedule and hand changes to the
/// core. The core ignores snapshots equal to the current one.
fn spawn_settings_refresh(
    every: Duration,
    event_tx: mpsc::Sender<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let path = Config::config_path();
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let settings = match Config::load_from(&path) {
                Ok(config) => config.settings,
                Err(e) => {
                    warn!("Settings refresh failed: {}", e);
                    continue;
                }
            };
            if event_tx.send(SessionEvent::SettingsChanged(settings)).await.is_err() {
                debug!("Settings refresh: core gone");
                break;
            }
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Created first so the logging layer can forward into it
    let (broadcast_tx, _) = broadcast::channel::<CoreMessage>(100);
    init_logging(broadcast_tx.clone())?;

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let client = reqwest::Client::builder().build()?;
    let detail = Arc::new(HttpDetailClient::new(
        client.clone(),
        config.detail.endpoint.clone(),
        Duration::from_millis(config.detail.timeout_ms),
    ));
    let deps = CoreDeps {
        detail,
        pinger: pinger_from_config(client.clone(), &config.latency),
        sinks: vec![Arc::new(LogSink) as Arc<dyn HistorySink>],
    };

    // Read before the core publishes its first snapshot
    let resume = config
        .daemon
        .resume_last_session
        .then(|| StateManager::load_persistent(&config.daemon.state_file).resume_entry())
        .flatten();

    let state_manager = Arc::new(StateManager::new(config.daemon.state_file.clone()));
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);

    let core = SessionCore::new(
        &config,
        deps,
        Arc::clone(&state_manager),
        broadcast_tx.clone(),
        event_tx.clone(),
    )
    .with_config_path(Config::config_path());

    if let Some(entry) = resume {
        info!("Resuming {} on {}", entry.video_id, entry.source_id);
        event_tx
            .send(SessionEvent::ClientCommand(Command::Start { entry }))
            .await?;
    }

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                state_manager: Arc::clone(&state_manager),
                event_tx: event_tx.clone(),
                broadcast_tx: broadcast_tx.clone(),
                client,
                ping_timeout: Duration::from_millis(config.latency.timeout_ms),
            },
        );
    }

    let _refresh_handle = spawn_settings_refresh(
        Duration::from_secs(config.daemon.settings_refresh_secs.max(1)),
        event_tx.clone(),
    );

    info!("Daemon initialised, running event loop");
    core.run(event_rx).await?;

    Ok(())
}
