//! SessionCore: single-owner event loop for all mutable session state.
//!
//! Clients (HTTP handlers, the settings refresher) send `SessionEvent`s into
//! this loop.  SessionCore owns the `PlaybackSessionController`, the
//! `LatencyProbe` schedule and the current search result set; no other task
//! touches them.
//!
//! Detail loads and probes run in spawned tasks.  Detail results come back
//! as `SessionEvent::DetailLoaded` tagged with the generation they were
//! issued for; the controller ignores stale ones.  Probe results land in the
//! probe's sample map and wake the loop through its update channel.
//!
//! After each event that mutates state, SessionCore publishes a snapshot
//! into the `StateManager` and broadcasts a `CoreMessage` to all listeners.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};
use vod_proto::config::{Config, Settings};
use vod_proto::protocol::{Command, Direction, PlayerDirective, VideoSource};
use vod_proto::state::StateManager;

use crate::aggregate;
use crate::detail::DetailLookup;
use crate::latency::{LatencyPinger, LatencyProbe};
use crate::session::{DetailOutcome, PendingLoad, PlaybackSessionController};
use crate::sinks::HistorySink;

// ── SessionEvent ──────────────────────────────────────────────────────────────

/// All inputs into the SessionCore loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A command from a client.
    ClientCommand(Command),
    /// A detail load finished.
    DetailLoaded(DetailOutcome),
    /// Fresh settings snapshot read by the orchestrator.
    SettingsChanged(Settings),
    Shutdown,
}

/// Pushed to observers after the core changed something.
#[derive(Debug, Clone)]
pub enum CoreMessage {
    StateUpdated,
    GroupsUpdated,
    Directive(PlayerDirective),
    Log(String),
}

/// Collaborators the core is wired to.
pub struct CoreDeps {
    pub detail: Arc<dyn DetailLookup>,
    pub pinger: Arc<dyn LatencyPinger>,
    pub sinks: Vec<Arc<dyn HistorySink>>,
}

// ── SessionCore ───────────────────────────────────────────────────────────────

pub struct SessionCore {
    controller: PlaybackSessionController,
    probe: LatencyProbe,
    settings_tx: watch::Sender<Settings>,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<SessionEvent>,
    broadcast_tx: broadcast::Sender<CoreMessage>,
    /// Current search results.
    sources: Vec<VideoSource>,
    /// Where preference changes are written back. `None` keeps them in memory.
    config_path: Option<PathBuf>,
}

impl SessionCore {
    pub fn new(
        config: &Config,
        deps: CoreDeps,
        state_manager: Arc<StateManager>,
        broadcast_tx: broadcast::Sender<CoreMessage>,
        event_tx: mpsc::Sender<SessionEvent>,
    ) -> Self {
        let (settings_tx, settings_rx) = watch::channel(config.settings.clone());

        let mut controller = PlaybackSessionController::new(
            deps.detail,
            settings_rx.clone(),
            config.sources.clone(),
            config.autoskip.clone(),
        );
        for sink in deps.sinks {
            controller.add_sink(sink);
        }
        let probe = LatencyProbe::new(deps.pinger, &config.latency, settings_rx);

        Self {
            controller,
            probe,
            settings_tx,
            state_manager,
            event_tx,
            broadcast_tx,
            sources: Vec::new(),
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    pub fn probe(&self) -> LatencyProbe {
        self.probe.clone()
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every event sender is gone.
    pub async fn run(
        mut self,
        mut event_rx: mpsc::Receiver<SessionEvent>,
    ) -> anyhow::Result<()> {
        info!("SessionCore: starting event loop");

        // The loop is the probe's observer; the timer stops once this is gone.
        let mut latency_rx = self.probe.subscribe();
        self.publish_state().await;

        loop {
            tokio::select! {
                evt = event_rx.recv() => match evt {
                    None => {
                        info!("SessionCore: event channel closed, shutting down");
                        break;
                    }
                    Some(SessionEvent::Shutdown) => {
                        info!("SessionCore: shutdown requested");
                        break;
                    }
                    Some(evt) => self.handle_event(evt).await,
                },
                update = latency_rx.recv() => match update {
                    Ok(update) => {
                        debug!("SessionCore: latency updated for {:?}", update.updated);
                        self.publish_groups().await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("SessionCore: skipped {} latency updates", n);
                        self.publish_groups().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
            }
        }

        self.probe.stop();
        Ok(())
    }

    pub async fn handle_event(&mut self, evt: SessionEvent) {
        match evt {
            SessionEvent::ClientCommand(cmd) => {
                debug!("SessionCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            SessionEvent::DetailLoaded(outcome) => {
                match self.controller.apply_detail(outcome) {
                    Ok(false) => return,
                    Ok(true) => {
                        let state = self.controller.state();
                        if let Some(url) = state.play_url.clone().filter(|_| state.is_playable()) {
                            self.send_directive(Some(PlayerDirective::Load { url }));
                        }
                    }
                    Err(e) => {
                        let _ = self.broadcast_tx.send(CoreMessage::Log(e.to_string()));
                    }
                }
                self.publish_state().await;
            }
            SessionEvent::SettingsChanged(settings) => {
                let changed = self.settings_tx.send_if_modified(|current| {
                    if *current == settings {
                        false
                    } else {
                        *current = settings;
                        true
                    }
                });
                if changed {
                    info!("SessionCore: settings changed");
                    self.apply_settings().await;
                }
            }
            SessionEvent::Shutdown => {}
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start { entry } => {
                self.probe.stop();
                let pending = self.controller.begin_start(entry);
                self.spawn_detail(pending);
                self.probe.sync();
                self.publish_state().await;
            }
            Command::Retry => {
                if let Some(pending) = self.controller.begin_retry() {
                    self.spawn_detail(pending);
                    self.publish_state().await;
                }
            }
            Command::Stop => {
                self.controller.stop();
                self.probe.stop();
                self.publish_state().await;
            }
            Command::SwitchSource {
                source_id,
                video_id,
            } => {
                self.probe.stop();
                match self
                    .controller
                    .begin_switch_source(&source_id, video_id.as_deref())
                {
                    Some(pending) => self.spawn_detail(pending),
                    None => warn!("SessionCore: switch to {} without a session", source_id),
                }
                self.probe.sync();
                self.publish_state().await;
            }
            Command::SelectEpisode { index } => {
                let directive = self.controller.on_episode_click(index);
                self.send_directive(directive);
                self.publish_state().await;
            }
            Command::NextEpisode => {
                let directive = self.controller.on_next_episode();
                self.send_directive(directive);
                self.publish_state().await;
            }
            Command::TimeUpdate {
                current_time,
                duration,
            } => {
                let directive = self.controller.on_time_update(current_time, duration);
                self.send_directive(directive);
                self.publish_state().await;
            }
            Command::SetSources { sources } => {
                info!("SessionCore: {} search results", sources.len());
                self.probe.set_sources(&sources);
                self.sources = sources;
                self.probe.sync();
                self.publish_groups().await;
            }
            Command::RefreshLatency { source_id } => {
                let probe = self.probe.clone();
                tokio::spawn(async move {
                    match source_id {
                        Some(id) => {
                            probe.refresh_one(&id).await;
                        }
                        None => {
                            probe.refresh_all().await;
                        }
                    }
                });
            }
            Command::SetReverseOrder { reversed } => {
                self.settings_tx
                    .send_modify(|s| s.episode_reverse_order = reversed);
                self.persist_settings();
                self.apply_settings().await;
            }
            Command::SetRealtimeLatency { enabled } => {
                self.settings_tx.send_modify(|s| s.realtime_latency = enabled);
                self.persist_settings();
                self.apply_settings().await;
            }
        }
    }

    async fn apply_settings(&mut self) {
        let reversed = self.settings_tx.borrow().episode_reverse_order;
        self.controller.set_direction(Direction::from_reversed(reversed));
        self.probe.sync();
        self.publish_state().await;
        self.publish_groups().await;
    }

    fn spawn_detail(&self, pending: PendingLoad) {
        let lookup = self.controller.detail_lookup();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = pending.run(lookup).await;
            if tx.send(SessionEvent::DetailLoaded(outcome)).await.is_err() {
                debug!("SessionCore: gone before detail load finished");
            }
        });
    }

    fn send_directive(&self, directive: Option<PlayerDirective>) {
        if let Some(directive) = directive {
            let _ = self.broadcast_tx.send(CoreMessage::Directive(directive));
        }
    }

    async fn publish_state(&self) {
        let snapshot = self.controller.state().clone();
        if let Err(e) = self.state_manager.set_playback(snapshot).await {
            error!("SessionCore: failed to persist session: {}", e);
        }
        let _ = self.broadcast_tx.send(CoreMessage::StateUpdated);
    }

    async fn publish_groups(&self) {
        let mode = self.settings_tx.borrow().search_display_mode;
        let latencies = self.probe.latencies();
        let annotated = aggregate::annotate(&self.sources, &latencies);
        let groups = aggregate::arrange(&annotated, mode);

        self.state_manager.set_groups(groups).await;
        self.state_manager.set_latencies(latencies).await;
        let _ = self.broadcast_tx.send(CoreMessage::GroupsUpdated);
    }

    fn persist_settings(&self) {
        let Some(path) = &self.config_path else {
            return;
        };
        let settings = self.settings_tx.borrow().clone();
        let result = Config::load_from(path).and_then(|mut config| {
            config.settings = settings;
            config.save_to(path)
        });
        if let Err(e) = result {
            warn!("SessionCore: failed to save settings: {}", e);
        }
    }
}
