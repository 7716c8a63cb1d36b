//! Per-port state

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::digits::DigitCollector;
use crate::interfaces::device::JitterStats;
use crate::protocols::codec::Codec;
use crate::protocols::rtp::MediaStream;
use crate::services::call_control::{DeviceState, LegHandle};

/// Line state of an FXS port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LineState {
    OnHook,
    OffHook,
    Dialing,
    InCall,
    CallEnded,
    Ringing,
    /// Hook status could not be determined; the port is not operational.
    Unknown,
}

impl LineState {
    pub fn device_state(self) -> DeviceState {
        match self {
            LineState::OnHook => DeviceState::NotInUse,
            LineState::OffHook | LineState::Dialing | LineState::InCall | LineState::CallEnded => {
                DeviceState::InUse
            }
            LineState::Ringing => DeviceState::Ringing,
            LineState::Unknown => DeviceState::Unknown,
        }
    }
}

impl fmt::Display for LineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LineState::OnHook => "ONHOOK",
            LineState::OffHook => "OFFHOOK",
            LineState::Dialing => "DIALING",
            LineState::InCall => "INCALL",
            LineState::CallEnded => "CALL_ENDED",
            LineState::Ringing => "RINGING",
            LineState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

/// Timestamps of the current call
#[derive(Debug, Clone, Default)]
pub struct CallTimes {
    pub setup_start: Option<Instant>,
    pub setup_delay: Option<Duration>,
    pub start: Option<DateTime<Utc>>,
    pub answer: Option<DateTime<Utc>>,
}

pub struct Port {
    pub id: usize,
    pub state: LineState,
    pub digits: DigitCollector,
    pub owner: Option<LegHandle>,
    pub media: MediaStream,
    pub times: CallTimes,
    pub jitter: JitterStats,
}

impl Port {
    pub fn new(id: usize, codec: Codec, max_extension_length: usize) -> Self {
        Self {
            id,
            state: LineState::Unknown,
            digits: DigitCollector::new(max_extension_length),
            owner: None,
            media: MediaStream::new(codec),
            times: CallTimes::default(),
            jitter: JitterStats::default(),
        }
    }

    pub fn snapshot(&self) -> PortSnapshot {
        PortSnapshot {
            port: self.id + 1,
            state: self.state,
            dialed: self.digits.as_str().to_string(),
            owner: self.owner.as_ref().map(|leg| match leg.try_lock() {
                Some(leg) => leg.name().to_string(),
                None => "<busy>".to_string(),
            }),
            codec: self.media.codec.name(),
            sequence: self.media.sequence,
            timestamp: self.media.timestamp,
            jitter: self.jitter,
            call_start: self.times.start,
            call_answer: self.times.answer,
            setup_delay_ms: self.times.setup_delay.map(|d| d.as_millis() as u64),
        }
    }
}

/// Serializable view of a port, 1-based like port destinations.
#[derive(Debug, Clone, Serialize)]
pub struct PortSnapshot {
    pub port: usize,
    pub state: LineState,
    pub dialed: String,
    pub owner: Option<String>,
    pub codec: &'static str,
    pub sequence: u16,
    pub timestamp: u32,
    pub jitter: JitterStats,
    pub call_start: Option<DateTime<Utc>>,
    pub call_answer: Option<DateTime<Utc>>,
    pub setup_delay_ms: Option<u64>,
}
