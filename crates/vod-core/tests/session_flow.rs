//! End-to-end session flows against an in-memory detail source.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, watch};
use vod_core::detail::DetailLookup;
use vod_core::latency::LatencyPinger;
use vod_core::sinks::{ChannelSink, HistorySink};
use vod_core::{
    CoreDeps, CoreMessage, PlaybackSessionController, SessionCore, SessionError, SessionEvent,
};
use vod_proto::config::{AutoSkipConfig, Config, SearchDisplayMode, Settings, SourceConfig};
use vod_proto::protocol::{
    Command, Direction, FaultKind, PlayerDirective, PlayerEntry, RawEpisode, SessionStatus,
    SourceCandidate, SourceRef, VideoDetail, VideoSource,
};
use vod_proto::state::StateManager;

// ── fakes ────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct FakeDetail {
    replies: Mutex<HashMap<(String, String), Result<VideoDetail, SessionError>>>,
    calls: Mutex<Vec<SourceRef>>,
}

impl FakeDetail {
    fn set(&self, video_id: &str, source_id: &str, reply: Result<VideoDetail, SessionError>) {
        self.replies
            .lock()
            .unwrap()
            .insert((video_id.to_string(), source_id.to_string()), reply);
    }
}

#[async_trait]
impl DetailLookup for FakeDetail {
    async fn fetch(&self, video_id: &str, source: &SourceRef) -> Result<VideoDetail, SessionError> {
        self.calls.lock().unwrap().push(source.clone());
        self.replies
            .lock()
            .unwrap()
            .get(&(video_id.to_string(), source.id().to_string()))
            .cloned()
            .unwrap_or_else(|| Err(SessionError::DetailUnavailable("unknown video".to_string())))
    }
}

struct SilentPinger;

#[async_trait]
impl LatencyPinger for SilentPinger {
    async fn ping(&self, _base_url: &str) -> Option<u64> {
        None
    }
}

/// Answers after a fixed delay: 30ms for the first request, 45ms after that.
#[derive(Default)]
struct SlowPinger {
    calls: AtomicUsize,
}

#[async_trait]
impl LatencyPinger for SlowPinger {
    async fn ping(&self, _base_url: &str) -> Option<u64> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        Some(if n == 0 { 30 } else { 45 })
    }
}

fn detail(name: &str, urls: &[&str]) -> VideoDetail {
    VideoDetail {
        vod_name: Some(name.to_string()),
        episodes: urls
            .iter()
            .map(|u| RawEpisode {
                name: None,
                url: u.to_string(),
            })
            .collect(),
        ..VideoDetail::default()
    }
}

fn entry(video_id: &str, source_id: &str) -> PlayerEntry {
    PlayerEntry {
        video_id: video_id.to_string(),
        source_id: source_id.to_string(),
        ..PlayerEntry::default()
    }
}

fn controller_with(
    fake: Arc<FakeDetail>,
    settings: Settings,
    autoskip: AutoSkipConfig,
) -> (PlaybackSessionController, watch::Sender<Settings>) {
    let (tx, rx) = watch::channel(settings);
    let sources = vec![SourceConfig {
        id: "src1".to_string(),
        name: "Source One".to_string(),
        base_url: "http://src1.test".to_string(),
    }];
    (PlaybackSessionController::new(fake, rx, sources, autoskip), tx)
}

fn three_episodes() -> Arc<FakeDetail> {
    let fake = Arc::new(FakeDetail::default());
    fake.set("123", "src1", Ok(detail("Show", &["e0", "e1", "e2"])));
    fake
}

// ── controller flows ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_forward_start_and_step_to_end() {
    let (mut ctl, _settings) =
        controller_with(three_episodes(), Settings::default(), AutoSkipConfig::default());

    ctl.start(entry("123", "src1")).await.unwrap();
    assert_eq!(ctl.state().status, SessionStatus::Active);
    assert_eq!(ctl.state().current_episode, Some(0));
    assert_eq!(ctl.state().play_url.as_deref(), Some("e0"));
    assert_eq!(ctl.state().title.as_deref(), Some("Show"));

    ctl.on_next_episode();
    let directive = ctl.on_next_episode();
    assert_eq!(
        directive,
        Some(PlayerDirective::Load {
            url: "e2".to_string()
        })
    );
    assert_eq!(ctl.state().current_episode, Some(2));

    assert_eq!(ctl.on_next_episode(), None);
    assert_eq!(ctl.state().current_episode, Some(2));
    assert_eq!(ctl.state().play_url.as_deref(), Some("e2"));
}

#[tokio::test]
async fn test_reversed_start_and_step() {
    let settings = Settings {
        episode_reverse_order: true,
        ..Settings::default()
    };
    let (mut ctl, _settings) =
        controller_with(three_episodes(), settings, AutoSkipConfig::default());

    ctl.start(entry("123", "src1")).await.unwrap();
    assert_eq!(ctl.state().direction, Direction::Reversed);
    assert_eq!(ctl.state().current_episode, Some(2));

    ctl.on_next_episode();
    assert_eq!(ctl.state().current_episode, Some(1));
    assert_eq!(ctl.state().play_url.as_deref(), Some("e1"));
}

#[tokio::test]
async fn test_requested_episode_is_honored() {
    let (mut ctl, _settings) =
        controller_with(three_episodes(), Settings::default(), AutoSkipConfig::default());

    let mut e = entry("123", "src1");
    e.episode = Some("1".to_string());
    ctl.start(e).await.unwrap();
    assert_eq!(ctl.state().current_episode, Some(1));

    let mut e = entry("123", "src1");
    e.episode = Some("abc".to_string());
    ctl.start(e).await.unwrap();
    assert_eq!(ctl.state().current_episode, Some(0));
}

#[tokio::test]
async fn test_direction_change_applies_on_next_step() {
    let (mut ctl, settings) =
        controller_with(three_episodes(), Settings::default(), AutoSkipConfig::default());

    ctl.start(entry("123", "src1")).await.unwrap();
    ctl.on_episode_click(1);
    settings.send_modify(|s| s.episode_reverse_order = true);

    ctl.on_next_episode();
    assert_eq!(ctl.state().current_episode, Some(0));
    assert_eq!(ctl.state().direction, Direction::Reversed);
}

#[tokio::test]
async fn test_not_found_sets_unavailable_fault() {
    let fake = Arc::new(FakeDetail::default());
    fake.set(
        "123",
        "src1",
        Err(SessionError::DetailUnavailable("not available".to_string())),
    );
    let (mut ctl, _settings) =
        controller_with(fake, Settings::default(), AutoSkipConfig::default());

    let err = ctl.start(entry("123", "src1")).await.unwrap_err();
    assert!(matches!(err, SessionError::DetailUnavailable(_)));
    assert_eq!(ctl.state().status, SessionStatus::Failed);
    let fault = ctl.state().last_error.clone().unwrap();
    assert_eq!(fault.kind, FaultKind::DetailUnavailable);
    assert!(!fault.retryable);
    assert!(ctl.state().play_url.is_none());
}

#[tokio::test]
async fn test_empty_episode_list_is_no_episodes() {
    let fake = Arc::new(FakeDetail::default());
    fake.set("123", "src1", Ok(detail("Empty", &[])));
    let (mut ctl, _settings) =
        controller_with(fake, Settings::default(), AutoSkipConfig::default());

    let err = ctl.start(entry("123", "src1")).await.unwrap_err();
    assert_eq!(err, SessionError::NoEpisodes);
    assert_eq!(ctl.state().last_error.as_ref().unwrap().kind, FaultKind::NoEpisodes);
}

#[tokio::test]
async fn test_retry_recovers_after_upstream_error() {
    let fake = Arc::new(FakeDetail::default());
    fake.set("123", "src1", Err(SessionError::DetailError("HTTP 502".to_string())));
    let (mut ctl, _settings) =
        controller_with(Arc::clone(&fake), Settings::default(), AutoSkipConfig::default());

    assert!(ctl.start(entry("123", "src1")).await.is_err());
    assert_eq!(ctl.state().status, SessionStatus::Failed);
    assert!(ctl.state().last_error.as_ref().unwrap().retryable);

    fake.set("123", "src1", Ok(detail("Show", &["e0"])));
    let pending = ctl.begin_retry().unwrap();
    let outcome = pending.run(ctl.detail_lookup()).await;
    assert_eq!(ctl.apply_detail(outcome), Ok(true));
    assert_eq!(ctl.state().status, SessionStatus::Active);
    assert!(ctl.state().last_error.is_none());
}

#[tokio::test]
async fn test_stale_detail_after_switch_is_dropped() {
    let fake = three_episodes();
    fake.set("456", "src2", Ok(detail("Show", &["s0", "s1"])));
    let (mut ctl, _settings) =
        controller_with(Arc::clone(&fake), Settings::default(), AutoSkipConfig::default());

    let first = ctl.begin_start(entry("123", "src1"));
    let second = ctl.begin_switch_source("src2", Some("456")).unwrap();

    let lookup = ctl.detail_lookup();
    let second_outcome = second.run(Arc::clone(&lookup)).await;
    let first_outcome = first.run(lookup).await;

    assert_eq!(ctl.apply_detail(second_outcome), Ok(true));
    assert_eq!(ctl.apply_detail(first_outcome), Ok(false));
    assert_eq!(ctl.state().source_id.as_deref(), Some("src2"));
    assert_eq!(ctl.state().play_url.as_deref(), Some("s0"));
    assert_eq!(ctl.state().episodes.len(), 2);
}

#[tokio::test]
async fn test_switch_source_uses_grouped_candidate() {
    let fake = three_episodes();
    fake.set("456", "src2", Ok(detail("Show", &["s0", "s1"])));
    let (mut ctl, _settings) =
        controller_with(Arc::clone(&fake), Settings::default(), AutoSkipConfig::default());

    let mut e = entry("123", "src1");
    e.title = Some("Show".to_string());
    e.episode = Some("2".to_string());
    e.grouped_sources = vec![SourceCandidate {
        id: "456".to_string(),
        source: "src2".to_string(),
        source_name: Some("Source Two".to_string()),
    }];
    ctl.start(e).await.unwrap();
    assert_eq!(ctl.state().current_episode, Some(2));

    ctl.switch_source("src2", None).await.unwrap();
    assert_eq!(ctl.state().video_id.as_deref(), Some("456"));
    assert_eq!(ctl.state().current_episode, Some(0));
    let context = ctl.context().unwrap();
    assert_eq!(context.title.as_deref(), Some("Show"));
    assert_eq!(context.grouped_sources.len(), 1);

    // configured sources are sent with their config, others by id
    let calls = fake.calls.lock().unwrap();
    assert!(matches!(calls[0], SourceRef::Configured(_)));
    assert_eq!(
        calls[1],
        SourceRef::Bare {
            id: "src2".to_string()
        }
    );
}

#[tokio::test]
async fn test_out_of_range_click_is_ignored() {
    let (mut ctl, _settings) =
        controller_with(three_episodes(), Settings::default(), AutoSkipConfig::default());
    ctl.start(entry("123", "src1")).await.unwrap();
    let before = ctl.state().clone();

    assert_eq!(ctl.on_episode_click(7), None);
    assert_eq!(ctl.state(), &before);
}

#[tokio::test]
async fn test_stop_discards_session() {
    let (mut ctl, _settings) =
        controller_with(three_episodes(), Settings::default(), AutoSkipConfig::default());
    let pending = ctl.begin_start(entry("123", "src1"));
    ctl.stop();

    let outcome = pending.run(ctl.detail_lookup()).await;
    assert_eq!(ctl.apply_detail(outcome), Ok(false));
    assert_eq!(ctl.state().status, SessionStatus::Idle);
    assert!(ctl.context().is_none());
    assert_eq!(ctl.on_next_episode(), None);
}

#[tokio::test]
async fn test_intro_skip_and_outro_advance() {
    let autoskip = AutoSkipConfig {
        intro_end_secs: 90.0,
        outro_secs: 60.0,
        ..AutoSkipConfig::default()
    };
    let (mut ctl, _settings) = controller_with(three_episodes(), Settings::default(), autoskip);
    ctl.start(entry("123", "src1")).await.unwrap();

    assert_eq!(
        ctl.on_time_update(1.0, 1400.0),
        Some(PlayerDirective::Seek { to_secs: 90.0 })
    );
    assert_eq!(ctl.on_time_update(2.0, 1400.0), None);

    let directive = ctl.on_time_update(1350.0, 1400.0);
    assert_eq!(
        directive,
        Some(PlayerDirective::Load {
            url: "e1".to_string()
        })
    );
    assert_eq!(ctl.state().current_episode, Some(1));
    assert!(!ctl.state().outro_active);
    assert_eq!(ctl.state().elapsed_secs, 0.0);

    // the previous episode's element reports once more before the new one loads
    assert_eq!(ctl.on_time_update(1351.0, 1400.0), None);
    assert_eq!(ctl.state().current_episode, Some(1));
    assert!(!ctl.state().outro_active);
}

#[tokio::test]
async fn test_outro_on_last_episode_stays_active() {
    let autoskip = AutoSkipConfig {
        outro_secs: 60.0,
        ..AutoSkipConfig::default()
    };
    let (mut ctl, _settings) = controller_with(three_episodes(), Settings::default(), autoskip);
    ctl.start(entry("123", "src1")).await.unwrap();
    ctl.on_episode_click(2);

    assert_eq!(ctl.on_time_update(600.0, 1400.0), None);
    assert!(!ctl.state().outro_active);
    assert_eq!(ctl.on_time_update(1350.0, 1400.0), None);
    assert!(ctl.state().outro_active);
    assert_eq!(ctl.on_time_update(1390.0, 1400.0), None);
    assert!(ctl.state().outro_active);
    assert_eq!(ctl.state().current_episode, Some(2));
}

#[tokio::test]
async fn test_history_recorded_on_start_and_navigation() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let (mut ctl, _settings) =
        controller_with(three_episodes(), Settings::default(), AutoSkipConfig::default());
    ctl.add_sink(Arc::new(ChannelSink::new(tx)) as Arc<dyn HistorySink>);

    ctl.start(entry("123", "src1")).await.unwrap();
    ctl.on_next_episode();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.title, "Show");
    assert_eq!(first.episode_index, 0);
    assert_eq!(first.episodes.len(), 3);
    let second = rx.recv().await.unwrap();
    assert_eq!(second.episode_index, 1);
    assert_eq!(second.play_url, "e1");
}

// ── core loop ────────────────────────────────────────────────────────────────

struct Harness {
    core: SessionCore,
    events: mpsc::Receiver<SessionEvent>,
    messages: broadcast::Receiver<CoreMessage>,
    state: Arc<StateManager>,
    _dir: tempfile::TempDir,
}

fn harness(config: Config, fake: Arc<FakeDetail>) -> Harness {
    harness_with_pinger(config, fake, Arc::new(SilentPinger))
}

fn harness_with_pinger(
    config: Config,
    fake: Arc<FakeDetail>,
    pinger: Arc<dyn LatencyPinger>,
) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let state = Arc::new(StateManager::new(dir.path().join("session.json")));
    let (event_tx, events) = mpsc::channel(16);
    let (broadcast_tx, messages) = broadcast::channel(64);
    let deps = CoreDeps {
        detail: fake,
        pinger,
        sinks: Vec::new(),
    };
    let core = SessionCore::new(&config, deps, Arc::clone(&state), broadcast_tx, event_tx);
    Harness {
        core,
        events,
        messages,
        state,
        _dir: dir,
    }
}

fn directives(rx: &mut broadcast::Receiver<CoreMessage>) -> Vec<PlayerDirective> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        if let CoreMessage::Directive(d) = msg {
            out.push(d);
        }
    }
    out
}

#[tokio::test]
async fn test_core_start_loads_in_background() {
    let mut h = harness(Config::default(), three_episodes());

    h.core
        .handle_event(SessionEvent::ClientCommand(Command::Start {
            entry: entry("123", "src1"),
        }))
        .await;
    assert_eq!(h.state.playback().await.status, SessionStatus::Loading);

    let loaded = h.events.recv().await.unwrap();
    assert!(matches!(loaded, SessionEvent::DetailLoaded(_)));
    h.core.handle_event(loaded).await;

    let playback = h.state.playback().await;
    assert!(playback.is_playable());
    assert_eq!(playback.play_url.as_deref(), Some("e0"));
    assert_eq!(
        directives(&mut h.messages),
        vec![PlayerDirective::Load {
            url: "e0".to_string()
        }]
    );

    h.core
        .handle_event(SessionEvent::ClientCommand(Command::NextEpisode))
        .await;
    assert_eq!(h.state.playback().await.current_episode, Some(1));
}

#[tokio::test]
async fn test_core_publishes_grouped_results() {
    let config = Config {
        settings: Settings {
            search_display_mode: SearchDisplayMode::Grouped,
            ..Settings::default()
        },
        ..Config::default()
    };
    let mut h = harness(config, three_episodes());

    let video = |id: &str, title: &str| VideoSource {
        id: id.to_string(),
        video_id: format!("{id}-v"),
        name: id.to_uppercase(),
        title: title.to_string(),
        base_url: format!("http://{id}.test"),
        latency_ms: None,
    };
    h.core
        .handle_event(SessionEvent::ClientCommand(Command::SetSources {
            sources: vec![video("a", "Show"), video("b", "Other"), video("c", " show ")],
        }))
        .await;

    let groups = h.state.get_state().await.groups;
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].key, "show");
    assert_eq!(groups[0].len(), 2);
    assert_eq!(groups[1].key, "other");
}

#[tokio::test]
async fn test_core_reverse_order_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    Config::default().save_to(&config_path).unwrap();

    let h = harness(Config::default(), three_episodes());
    let mut core = h.core.with_config_path(config_path.clone());
    core.handle_event(SessionEvent::ClientCommand(Command::SetReverseOrder { reversed: true }))
        .await;

    let saved = Config::load_from(&config_path).unwrap();
    assert!(saved.settings.episode_reverse_order);
    assert_eq!(h.state.playback().await.direction, Direction::Reversed);
}

#[tokio::test]
async fn test_core_drops_detail_for_abandoned_session() {
    let fake = three_episodes();
    fake.set("456", "src2", Ok(detail("Other", &["x0"])));
    let mut h = harness(Config::default(), fake);

    h.core
        .handle_event(SessionEvent::ClientCommand(Command::Start {
            entry: entry("123", "src1"),
        }))
        .await;
    h.core
        .handle_event(SessionEvent::ClientCommand(Command::Stop))
        .await;

    let loaded = h.events.recv().await.unwrap();
    h.core.handle_event(loaded).await;
    let playback = h.state.playback().await;
    assert_eq!(playback.status, SessionStatus::Idle);
    assert!(!playback.is_playable());
    assert!(directives(&mut h.messages).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_core_switch_source_discards_running_latency_cycle() {
    let config = Config {
        settings: Settings {
            realtime_latency: true,
            ..Settings::default()
        },
        ..Config::default()
    };
    let pinger = Arc::new(SlowPinger::default());
    let mut h = harness_with_pinger(config, three_episodes(), pinger.clone());
    let _updates = h.core.probe().subscribe();

    let source = VideoSource {
        id: "a".to_string(),
        video_id: "a-v".to_string(),
        name: "A".to_string(),
        title: "Show".to_string(),
        base_url: "http://a.test".to_string(),
        latency_ms: None,
    };
    h.core
        .handle_event(SessionEvent::ClientCommand(Command::SetSources {
            sources: vec![source],
        }))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pinger.calls.load(Ordering::SeqCst), 1);

    h.core
        .handle_event(SessionEvent::ClientCommand(Command::SwitchSource {
            source_id: "src2".to_string(),
            video_id: None,
        }))
        .await;
    assert!(h.core.probe().is_running());

    tokio::time::sleep(Duration::from_millis(900)).await;
    assert_ne!(h.core.probe().latencies().get("a"), Some(&30));

    // the restarted timer measures again on its next tick
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.core.probe().latencies().get("a"), Some(&45));
}
