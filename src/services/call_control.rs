//! Call control boundary
//!
//! The line state machine drives calls through `CallControl` and talks to the
//! call it owns through a `CallLeg`. Both are implemented by the call engine;
//! the bridge never inspects a leg beyond what is declared here.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use crate::protocols::rtp::VoiceFrame;
use crate::Result;

/// Control signals the bridge queues on a call leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ringing,
    Answered,
    Busy,
    Congestion,
}

/// Frames the bridge queues on a call leg.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Voice(VoiceFrame),
    Dtmf(char),
}

/// Indications the engine asks a port to present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indication {
    StopTone,
    Busy,
    Congestion,
    Ringing,
    Progress,
    Proceeding,
    Hold,
    Unhold,
    SourceUpdate,
}

/// Device state reported for a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    NotInUse,
    InUse,
    Ringing,
    Unknown,
    Invalid,
}

/// A call leg owned by a port.
pub trait CallLeg: Send {
    fn name(&self) -> &str;
    fn signal(&mut self, signal: Signal);
    fn enqueue_frame(&mut self, frame: Frame);
    /// Ask the engine to tear the leg down; the engine later calls back
    /// `hangup` on the port.
    fn request_hangup(&mut self);
    /// Whether the leg is up and accepts media.
    fn is_up(&self) -> bool;
}

pub type LegHandle = Arc<Mutex<dyn CallLeg>>;

/// Whether two handles refer to the same leg.
pub fn same_leg(a: &LegHandle, b: &LegHandle) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const u8,
        Arc::as_ptr(b) as *const u8,
    )
}

/// The call engine as seen from the ports.
pub trait CallControl: Send + Sync {
    fn extension_exists(&self, context: &str, extension: &str) -> bool;

    /// Allocate a leg for a call dialed on `port`.
    fn new_leg(&self, port: usize, extension: &str, context: &str) -> Result<LegHandle>;

    /// Hand a freshly dialed leg to the engine.
    fn start_execution(&self, leg: &LegHandle, extension: &str, context: &str) -> Result<()>;

    /// The hardware reported something the bridge cannot recover from.
    fn restart(&self, reason: &str);
}
