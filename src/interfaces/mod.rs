//! Hardware interfaces for the FXS bridge

pub mod device;
pub mod simulated;

pub use device::{
    CallerId, HardwareEvent, HardwareEventKind, HookStatus, JitterStats, LineDevice, LineFeed,
    Readiness, Tone,
};
pub use simulated::SimulatedDevice;
