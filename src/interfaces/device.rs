//! Hardware boundary of the bridge
//!
//! A `LineDevice` is the voice-processing device with one FXS channel per
//! port. Calls are synchronous; `wait` is the only one expected to block.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::LineConfig;
use crate::protocols::codec::{CodecParams, CoderType};
use crate::Result;

/// Longest caller-id element the device accepts, in bytes.
pub const CALLER_ID_MAX_LEN: usize = 50;

/// Hardware event kinds reported per port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HardwareEventKind {
    HookOn,
    HookOff,
    DtmfDigit(char),
    /// Pulse-dialed digit as counted by the device, 0xB meaning zero.
    PulseDigit(u8),
    CodecChange,
    ToneEnd,
    CallerIdEnd,
    /// Raw event code the bridge does not understand.
    Other(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareEvent {
    pub port: usize,
    pub kind: HardwareEventKind,
}

impl HardwareEventKind {
    /// Digit carried by a DTMF or pulse event.
    pub fn digit(self) -> Option<char> {
        match self {
            HardwareEventKind::DtmfDigit(c) => Some(c),
            HardwareEventKind::PulseDigit(0x0B) => Some('0'),
            HardwareEventKind::PulseDigit(code) if code < 10 => Some((b'0' + code) as char),
            _ => None,
        }
    }
}

/// Call progress tones the device can play on a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Tone {
    None,
    Dial,
    Ringback,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineFeed {
    Active,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStatus {
    OnHook,
    OffHook,
    Unknown,
}

/// Jitter buffer counters read back from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JitterStats {
    pub size: u32,
    pub underflow: u32,
    pub overflow: u32,
    pub delay: u32,
    pub invalid: u32,
}

impl std::fmt::Display for JitterStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "jbBufSize={},jbUnderflow={},jbOverflow={},jbDelay={},jbInvalid={}",
            self.size, self.underflow, self.overflow, self.delay, self.invalid
        )
    }
}

/// Caller identification sent with the ring signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerId {
    pub number: Option<String>,
    pub name: Option<String>,
    pub time: DateTime<Utc>,
}

impl CallerId {
    pub fn new(number: Option<&str>, name: Option<&str>) -> Self {
        Self {
            number: number.map(truncate_element),
            name: name.map(truncate_element),
            time: Utc::now(),
        }
    }
}

fn truncate_element(value: &str) -> String {
    if value.len() <= CALLER_ID_MAX_LEN {
        return value.to_string();
    }
    let mut end = CALLER_ID_MAX_LEN;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    value[..end].to_string()
}

/// What became ready during a `wait`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The device-level event source has queued events.
    pub events: bool,
    /// Ports with media ready to read.
    pub media: Vec<usize>,
}

impl Readiness {
    pub fn is_idle(&self) -> bool {
        !self.events && self.media.is_empty()
    }
}

pub trait LineDevice: Send + Sync {
    fn channels(&self) -> usize;

    /// Bring the device up in voice coder mode.
    fn start(&self) -> Result<()>;
    fn stop(&self) -> Result<()>;

    /// Per-port line setup: line type, ring config and cadence, gains,
    /// echo canceller, jitter buffer, caller-id standard and VAD.
    fn configure_port(&self, port: usize, line: &LineConfig) -> Result<()>;
    fn set_payload_table(&self, port: usize, table: &[(CoderType, u8)]) -> Result<()>;
    fn hook_status(&self, port: usize) -> Result<HookStatus>;

    /// Block until events or media are ready, the timeout expires, or
    /// `wake` is called.
    fn wait(&self, timeout: Duration) -> Result<Readiness>;
    fn wake(&self);

    /// Fetch the next queued event of a port, `None` when there is none.
    fn next_event(&self, port: usize) -> Result<Option<HardwareEvent>>;

    fn read_media(&self, port: usize, buf: &mut [u8]) -> Result<usize>;
    fn write_media(&self, port: usize, data: &[u8]) -> Result<usize>;

    fn play_tone(&self, port: usize, tone: Tone) -> Result<()>;
    fn ring_start(&self, port: usize, caller_id: Option<&CallerId>) -> Result<()>;
    fn ring_stop(&self, port: usize) -> Result<()>;
    fn set_line_feed(&self, port: usize, feed: LineFeed) -> Result<()>;

    fn configure_encoder(&self, port: usize, params: CodecParams) -> Result<()>;
    fn start_coders(&self, port: usize) -> Result<()>;
    fn stop_coders(&self, port: usize) -> Result<()>;

    fn jitter_stats(&self, port: usize) -> Result<JitterStats>;
}
