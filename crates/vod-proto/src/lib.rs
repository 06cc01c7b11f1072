//! Shared types for the playback session core: wire protocol, config file,
//! platform paths and the published state store.

pub mod config;
pub mod platform;
pub mod protocol;
pub mod state;
