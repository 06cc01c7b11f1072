use crate::protocol::{PlaybackState, PlayerEntry, SourceGroup};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// What survives a restart: enough to reopen the player where it was.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistentState {
    pub video_id: Option<String>,
    pub source_id: Option<String>,
    pub title: Option<String>,
    pub episode: Option<usize>,
}

impl PersistentState {
    /// Player entry that resumes the persisted session, if there is one.
    pub fn resume_entry(&self) -> Option<PlayerEntry> {
        Some(PlayerEntry {
            video_id: self.video_id.clone()?,
            source_id: self.source_id.clone()?,
            title: self.title.clone(),
            episode: self.episode.map(|e| e.to_string()),
            grouped_sources: Vec::new(),
        })
    }
}

/// Everything readers (HTTP handlers, renderers) may look at. Written only
/// by the session core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublishedState {
    pub playback: PlaybackState,
    pub groups: Vec<SourceGroup>,
    pub latencies: HashMap<String, u64>,
}

pub struct StateManager {
    state: Arc<RwLock<PublishedState>>,
    state_file: PathBuf,
}

impl StateManager {
    pub fn new(state_file: PathBuf) -> Self {
        Self {
            state: Arc::new(RwLock::new(PublishedState::default())),
            state_file,
        }
    }

    pub fn arc(&self) -> Arc<RwLock<PublishedState>> {
        Arc::clone(&self.state)
    }

    pub async fn get_state(&self) -> PublishedState {
        self.state.read().await.clone()
    }

    pub async fn playback(&self) -> PlaybackState {
        self.state.read().await.playback.clone()
    }

    /// Replace the playback snapshot. Persists the resume point when the
    /// session position changed.
    pub async fn set_playback(&self, playback: PlaybackState) -> anyhow::Result<()> {
        let changed_position = {
            let mut state = self.state.write().await;
            let changed = state.playback.video_id != playback.video_id
                || state.playback.source_id != playback.source_id
                || state.playback.current_episode != playback.current_episode;
            state.playback = playback;
            changed
        };
        if changed_position {
            self.save().await?;
        }
        Ok(())
    }

    pub async fn set_groups(&self, groups: Vec<SourceGroup>) {
        let mut state = self.state.write().await;
        state.groups = groups;
    }

    pub async fn set_latencies(&self, latencies: HashMap<String, u64>) {
        let mut state = self.state.write().await;
        state.latencies = latencies;
    }

    async fn save(&self) -> anyhow::Result<()> {
        let persistent = {
            let state = self.state.read().await;
            PersistentState {
                video_id: state.playback.video_id.clone(),
                source_id: state.playback.source_id.clone(),
                title: state.playback.title.clone(),
                episode: state.playback.current_episode,
            }
        };

        if let Some(parent) = self.state_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(&persistent)?;
        tokio::fs::write(&self.state_file, json).await?;
        Ok(())
    }

    pub fn load_persistent(state_file: &Path) -> PersistentState {
        if let Ok(content) = std::fs::read_to_string(state_file) {
            if let Ok(persistent) = serde_json::from_str::<PersistentState>(&content) {
                return persistent;
            }
        }
        PersistentState::default()
    }
}
