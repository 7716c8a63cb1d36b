//! FXS Bridge - analog line to call control bridge
//!
//! Connects the FXS ports of a voice-processing device to a call engine:
//! hook and digit events drive a per-port line state machine, and voice
//! travels between the device's RTP media channels and the engine's call legs.

pub mod config;
pub mod core;
pub mod error;
pub mod interfaces;
pub mod protocols;
pub mod services;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/// Bridge version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
