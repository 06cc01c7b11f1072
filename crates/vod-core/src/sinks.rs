//! Write-only sinks mirroring the session to history/favorites storage.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;
use vod_proto::protocol::Episode;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub video_id: String,
    pub title: String,
    pub play_url: String,
    pub episode_index: usize,
    pub source_id: String,
    pub position_secs: f64,
    pub duration_secs: f64,
    pub poster: Option<String>,
    pub episodes: Vec<Episode>,
}

/// Receives the session position on start and on every navigation.
pub trait HistorySink: Send + Sync {
    fn record(&self, entry: &HistoryEntry);
}

/// Logs entries; used when no storage is attached.
pub struct LogSink;

impl HistorySink for LogSink {
    fn record(&self, entry: &HistoryEntry) {
        info!(
            "history: {} [{}] ep {} on {}",
            entry.title, entry.video_id, entry.episode_index, entry.source_id
        );
    }
}

/// Forwards entries to a channel, e.g. a storage task.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<HistoryEntry>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<HistoryEntry>) -> Self {
        Self { tx }
    }
}

impl HistorySink for ChannelSink {
    fn record(&self, entry: &HistoryEntry) {
        let _ = self.tx.send(entry.clone());
    }
}
