//! Playback session engine: source aggregation, latency probing, episode
//! navigation, intro/outro skipping and the single-owner session loop.

pub mod aggregate;
pub mod autoskip;
pub mod core;
pub mod detail;
pub mod episode;
pub mod error;
pub mod latency;
pub mod session;
pub mod sinks;

pub use crate::core::{CoreDeps, CoreMessage, SessionCore, SessionEvent};
pub use crate::error::{NavError, SessionError};
pub use crate::session::PlaybackSessionController;
