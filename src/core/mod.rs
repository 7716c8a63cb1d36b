//! Core line handling for the FXS bridge

pub mod bridge;
pub mod digits;
pub mod dispatcher;
pub mod line;
pub mod port;

pub use bridge::{BridgeEvent, BridgeStatus, FxsBridge};
pub use dispatcher::Dispatcher;
pub use line::Lines;
pub use port::{LineState, PortSnapshot};
