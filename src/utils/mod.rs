//! Utility helpers for the FXS bridge

pub mod logger;

pub use logger::setup_logging;
