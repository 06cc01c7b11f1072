use thiserror::Error;
use vod_proto::protocol::{FaultKind, SessionFault};

/// Failures that end a session start and are shown to the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The source confirmed it has no such video. Try another source.
    #[error("video not available from this source: {0}")]
    DetailUnavailable(String),
    /// Upstream failure of unknown cause. Retrying may help.
    #[error("failed to load video details: {0}")]
    DetailError(String),
    #[error("no playable episodes available from this source")]
    NoEpisodes,
}

impl SessionError {
    /// Whether retrying the same source can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DetailError(_))
    }

    pub fn kind(&self) -> FaultKind {
        match self {
            Self::DetailUnavailable(_) => FaultKind::DetailUnavailable,
            Self::DetailError(_) => FaultKind::DetailError,
            Self::NoEpisodes => FaultKind::NoEpisodes,
        }
    }

    pub fn to_fault(&self) -> SessionFault {
        SessionFault {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NavError {
    #[error("episode index {index} out of range (0..{len})")]
    OutOfRange { index: usize, len: usize },
}
