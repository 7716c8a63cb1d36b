//! Call engine services for the FXS bridge

pub mod call_control;
pub mod dialplan;

pub use call_control::{
    same_leg, CallControl, CallLeg, DeviceState, Frame, Indication, LegHandle, Signal,
};
pub use dialplan::{EngineEvent, EngineLeg, StaticDialplan};
