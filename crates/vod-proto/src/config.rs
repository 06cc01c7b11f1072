use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::platform;
use crate::protocol::normalize_title;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub detail: DetailConfig,
    #[serde(default)]
    pub autoskip: AutoSkipConfig,
    /// Upstream sources known by configuration. Anything not listed here is
    /// addressed by bare id.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,
    #[serde(default = "default_true")]
    pub resume_last_session: bool,
    /// How often the daemon re-reads the settings section from disk.
    #[serde(default = "default_settings_refresh_secs")]
    pub settings_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Viewer preferences. This is the snapshot handed to every component; it
/// may change between two reads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub episode_reverse_order: bool,
    #[serde(default)]
    pub realtime_latency: bool,
    #[serde(default)]
    pub search_display_mode: SearchDisplayMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchDisplayMode {
    #[default]
    Normal,
    Grouped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConfig {
    #[serde(default = "default_probe_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    /// Remote probe endpoint (`POST {url}` → `{latency}`). When unset the
    /// base URL is timed directly.
    #[serde(default)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetailConfig {
    #[serde(default = "default_detail_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_detail_timeout_ms")]
    pub timeout_ms: u64,
}

/// Intro/outro windows in seconds. A zero end/length disables that half.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SkipWindow {
    #[serde(default)]
    pub intro_start_secs: f64,
    #[serde(default)]
    pub intro_end_secs: f64,
    #[serde(default)]
    pub outro_secs: f64,
}

impl SkipWindow {
    pub fn has_intro(&self) -> bool {
        self.intro_end_secs > self.intro_start_secs
    }

    pub fn has_outro(&self) -> bool {
        self.outro_secs > 0.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoSkipConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub intro_start_secs: f64,
    #[serde(default)]
    pub intro_end_secs: f64,
    #[serde(default)]
    pub outro_secs: f64,
    /// Per-title overrides keyed by normalized title.
    #[serde(default)]
    pub titles: HashMap<String, SkipWindow>,
}

impl AutoSkipConfig {
    /// Window that applies to `title`, falling back to the global one.
    /// Returns an empty window when auto-skip is switched off.
    pub fn window_for(&self, title: Option<&str>) -> SkipWindow {
        if !self.enabled {
            return SkipWindow::default();
        }
        title
            .map(normalize_title)
            .and_then(|key| self.titles.get(&key).copied())
            .unwrap_or(SkipWindow {
                intro_start_secs: self.intro_start_secs,
                intro_end_secs: self.intro_end_secs,
                outro_secs: self.outro_secs,
            })
    }
}

/// An upstream source known by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    pub name: String,
    pub base_url: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            resume_last_session: true,
            settings_refresh_secs: default_settings_refresh_secs(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_probe_interval_ms(),
            timeout_ms: default_probe_timeout_ms(),
            endpoint: None,
        }
    }
}

impl Default for DetailConfig {
    fn default() -> Self {
        Self {
            endpoint: default_detail_endpoint(),
            timeout_ms: default_detail_timeout_ms(),
        }
    }
}

impl Default for AutoSkipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            intro_start_secs: 0.0,
            intro_end_secs: 0.0,
            outro_secs: 0.0,
            titles: HashMap::new(),
        }
    }
}

fn default_state_file() -> PathBuf {
    platform::data_dir().join("session.json")
}

fn default_true() -> bool {
    true
}

fn default_settings_refresh_secs() -> u64 {
    10
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8990
}

fn default_probe_interval_ms() -> u64 {
    5000
}

fn default_probe_timeout_ms() -> u64 {
    3000
}

fn default_detail_endpoint() -> String {
    "http://127.0.0.1:3000/api/detail".to_string()
}

fn default_detail_timeout_ms() -> u64 {
    10_000
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            tracing::info!("Wrote default config to {:?}", config_path);
            return Ok(config);
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }

    pub fn find_source(&self, id: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.id == id)
    }
}
