use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::config::SourceConfig;

/// Grouping key for titles: lowercase, surrounding whitespace removed.
pub fn normalize_title(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Messages sent from clients to the session core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Open the player on a video.
    Start { entry: PlayerEntry },
    /// Re-run the last start with the same context.
    Retry,
    /// Leave the player; the session is discarded.
    Stop,
    SelectEpisode { index: usize },
    NextEpisode,
    TimeUpdate { current_time: f64, duration: f64 },
    SwitchSource {
        source_id: String,
        #[serde(default)]
        video_id: Option<String>,
    },
    /// Replace the search result set the aggregator and probe work on.
    SetSources { sources: Vec<VideoSource> },
    RefreshLatency {
        #[serde(default)]
        source_id: Option<String>,
    },
    SetReverseOrder { reversed: bool },
    SetRealtimeLatency { enabled: bool },
}

/// Messages pushed from the session core to observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    State { data: PlaybackState },
    Groups { data: Vec<SourceGroup> },
    Directive { data: PlayerDirective },
    Log { message: String },
}

/// What the media element should do next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlayerDirective {
    Seek { to_secs: f64 },
    Load { url: String },
}

/// Traversal order through an episode list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Reversed,
}

impl Direction {
    pub fn from_reversed(reversed: bool) -> Self {
        if reversed {
            Self::Reversed
        } else {
            Self::Forward
        }
    }
}

/// One search result: a title as offered by one upstream source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoSource {
    /// Upstream source id.
    pub id: String,
    /// Video id inside that source.
    #[serde(default)]
    pub video_id: String,
    pub name: String,
    #[serde(default)]
    pub title: String,
    pub base_url: String,
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl VideoSource {
    pub fn group_key(&self) -> String {
        normalize_title(&self.title)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceGroup {
    pub key: String,
    /// Sorted by latency, unmeasured last. Never empty.
    pub members: Vec<VideoSource>,
}

impl SourceGroup {
    pub fn representative(&self) -> &VideoSource {
        &self.members[0]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySample {
    pub source_id: String,
    pub latency_ms: u64,
    pub measured_at: DateTime<Local>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Episode {
    pub name: String,
    pub url: String,
    pub index: usize,
}

/// How the session addresses its upstream source, resolved once at start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceRef {
    Configured(SourceConfig),
    Bare { id: String },
}

impl SourceRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Configured(cfg) => &cfg.id,
            Self::Bare { id } => id,
        }
    }
}

/// A candidate for source switching, as carried in `groupedSources`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCandidate {
    /// Video id inside the candidate source.
    pub id: String,
    pub source: String,
    #[serde(default, rename = "sourceName")]
    pub source_name: Option<String>,
}

/// Player entry parameters. `id` and `source` are mandatory; the rest is
/// optional context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub video_id: String,
    pub source_id: String,
    #[serde(default)]
    pub title: Option<String>,
    /// Raw requested episode; non-numeric values fall back to the default.
    #[serde(default)]
    pub episode: Option<String>,
    #[serde(default)]
    pub grouped_sources: Vec<SourceCandidate>,
}

impl PlayerEntry {
    /// Build an entry from query-style parameters. Returns `None` when the
    /// video id or source id is missing, which callers treat as a
    /// redirect-away condition.
    pub fn from_params(
        id: Option<&str>,
        source: Option<&str>,
        title: Option<&str>,
        episode: Option<&str>,
        grouped_sources: Option<&str>,
    ) -> Option<Self> {
        let video_id = id.map(str::trim).filter(|s| !s.is_empty())?;
        let source_id = source.map(str::trim).filter(|s| !s.is_empty())?;
        Some(Self {
            video_id: video_id.to_string(),
            source_id: source_id.to_string(),
            title: title.filter(|t| !t.is_empty()).map(str::to_string),
            episode: episode.map(str::to_string),
            grouped_sources: grouped_sources
                .map(parse_grouped_sources)
                .unwrap_or_default(),
        })
    }
}

/// Malformed candidate lists are treated as empty.
pub fn parse_grouped_sources(raw: &str) -> Vec<SourceCandidate> {
    serde_json::from_str(raw).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Loading,
    Active,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    DetailUnavailable,
    DetailError,
    NoEpisodes,
}

/// User-visible session error with a retry affordance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionFault {
    pub kind: FaultKind,
    pub message: String,
    /// Retrying the same source may succeed.
    #[serde(default)]
    pub retryable: bool,
}

/// The single mutable session object observed by renderers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaybackState {
    /// Incremented on every change.
    #[serde(default)]
    pub rev: u64,
    /// Session epoch; bumped by every start, switch and stop.
    #[serde(default)]
    pub generation: u64,
    pub status: SessionStatus,
    pub video_id: Option<String>,
    pub source_id: Option<String>,
    pub title: Option<String>,
    pub poster: Option<String>,
    #[serde(default)]
    pub episodes: Vec<Episode>,
    pub current_episode: Option<usize>,
    pub play_url: Option<String>,
    #[serde(default)]
    pub elapsed_secs: f64,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub outro_active: bool,
    pub last_error: Option<SessionFault>,
}

impl PlaybackState {
    pub fn is_playable(&self) -> bool {
        self.status == SessionStatus::Active && self.play_url.is_some()
    }
}

// ── Detail lookup wire format ────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct DetailResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Option<VideoDetail>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoDetail {
    #[serde(default)]
    pub vod_id: Option<String>,
    #[serde(default)]
    pub vod_name: Option<String>,
    #[serde(default)]
    pub vod_pic: Option<String>,
    #[serde(default)]
    pub type_name: Option<String>,
    #[serde(default)]
    pub vod_year: Option<String>,
    #[serde(default)]
    pub episodes: Vec<RawEpisode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEpisode {
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
}

impl VideoDetail {
    /// Index the episode list; unnamed episodes get a positional name.
    pub fn episode_list(&self) -> Vec<Episode> {
        self.episodes
            .iter()
            .enumerate()
            .map(|(index, ep)| Episode {
                name: ep
                    .name
                    .clone()
                    .filter(|n| !n.trim().is_empty())
                    .unwrap_or_else(|| format!("Episode {}", index + 1)),
                url: ep.url.clone(),
                index,
            })
            .collect()
    }
}

// ── Latency probe endpoint wire format ───────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingRequest {
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingResponse {
    pub latency: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_title() {
        assert_eq!(normalize_title("  The Show "), "the show");
        assert_eq!(normalize_title("THE SHOW"), normalize_title("the show"));
    }

    #[test]
    fn test_command_wire_format() {
        let cmd: Command =
            serde_json::from_str(r#"{"cmd":"TimeUpdate","current_time":12.5,"duration":1440.0}"#)
                .unwrap();
        assert!(matches!(
            cmd,
            Command::TimeUpdate { current_time, duration }
                if current_time == 12.5 && duration == 1440.0
        ));

        let cmd: Command = serde_json::from_str(r#"{"cmd":"RefreshLatency"}"#).unwrap();
        assert!(matches!(cmd, Command::RefreshLatency { source_id: None }));
    }

    #[test]
    fn test_player_entry_requires_id_and_source() {
        assert!(PlayerEntry::from_params(None, Some("src1"), None, None, None).is_none());
        assert!(PlayerEntry::from_params(Some("123"), None, None, None, None).is_none());
        assert!(PlayerEntry::from_params(Some("123"), Some("  "), None, None, None).is_none());

        let entry = PlayerEntry::from_params(
            Some("123"),
            Some("src1"),
            Some("Show"),
            Some("2"),
            Some(r#"[{"id":"9","source":"src2"}]"#),
        )
        .unwrap();
        assert_eq!(entry.video_id, "123");
        assert_eq!(entry.episode.as_deref(), Some("2"));
        assert_eq!(entry.grouped_sources.len(), 1);
        assert_eq!(entry.grouped_sources[0].source, "src2");
    }

    #[test]
    fn test_malformed_grouped_sources_is_empty() {
        assert!(parse_grouped_sources("not json").is_empty());
        assert!(parse_grouped_sources(r#"{"id":"1"}"#).is_empty());
    }

    #[test]
    fn test_episode_list_names_unnamed_episodes() {
        let detail: VideoDetail = serde_json::from_str(
            r#"{"vod_name":"Show","episodes":[{"name":"Pilot","url":"e0"},{"url":"e1"},{"name":" ","url":"e2"}]}"#,
        )
        .unwrap();
        let episodes = detail.episode_list();
        assert_eq!(episodes[0].name, "Pilot");
        assert_eq!(episodes[1].name, "Episode 2");
        assert_eq!(episodes[2].name, "Episode 3");
        assert_eq!(episodes[2].index, 2);
    }

    #[test]
    fn test_source_ref_id() {
        let bare = SourceRef::Bare { id: "src9".to_string() };
        assert_eq!(bare.id(), "src9");
        let configured = SourceRef::Configured(SourceConfig {
            id: "src1".to_string(),
            name: "One".to_string(),
            base_url: "https://one.example".to_string(),
        });
        assert_eq!(configured.id(), "src1");
    }
}
