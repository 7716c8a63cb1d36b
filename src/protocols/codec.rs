//! Codec table for the DSP media channels
//!
//! Each codec the DSP can encode maps to a hardware coder type and to the
//! RTP payload type the DSP stamps on (and expects in) its media packets.
//! Standard codecs use their RFC 3551 static payload types; the rest use the
//! private range starting at 100.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// RTP payload types understood by the DSP.
pub mod payload_type {
    pub const PCMU: u8 = 0;
    pub const G723_63: u8 = 4;
    pub const PCMA: u8 = 8;
    pub const G722: u8 = 9;
    pub const CN: u8 = 13;
    pub const G729: u8 = 18;
    pub const G7221: u8 = 100;
    pub const G726: u8 = 101;
    pub const ILBC: u8 = 102;
    pub const SLIN8: u8 = 103;
    pub const SLIN16: u8 = 104;
    pub const SIREN7: u8 = 105;
    pub const G723_53: u8 = 106;
}

/// Voice codecs the bridge can negotiate on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    #[serde(rename = "g723")]
    G723,
    #[serde(rename = "g729")]
    G729,
    #[serde(rename = "ulaw")]
    Ulaw,
    #[serde(rename = "alaw")]
    Alaw,
    #[serde(rename = "g726")]
    G726,
    #[serde(rename = "ilbc")]
    Ilbc,
    #[serde(rename = "slin")]
    Slin8,
    #[serde(rename = "slin16")]
    Slin16,
    #[serde(rename = "g722")]
    G722,
    #[serde(rename = "siren7")]
    Siren7,
}

/// Encoder types of the DSP, as configured through the encoder setup call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoderType {
    G723_63,
    G723_53,
    G729,
    Mlaw,
    Alaw,
    G726_32,
    Ilbc133,
    Ilbc152,
    Lin16_8,
    Lin16_16,
    G722_64,
    G7221_32,
}

/// Static per-codec parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecParams {
    pub coder: CoderType,
    pub payload_type: u8,
    /// Base packet time in milliseconds used for subframe accounting.
    pub ptime: u32,
    /// Frame length the encoder is configured for, in milliseconds.
    pub frame_length_ms: u32,
    pub sample_rate: u32,
}

impl Codec {
    pub const ALL: [Codec; 10] = [
        Codec::G723,
        Codec::G729,
        Codec::Ulaw,
        Codec::Alaw,
        Codec::G726,
        Codec::Ilbc,
        Codec::Slin8,
        Codec::Slin16,
        Codec::G722,
        Codec::Siren7,
    ];

    pub fn params(self) -> CodecParams {
        let (coder, payload_type, ptime, frame_length_ms, sample_rate) = match self {
            // 6.3 kbit/s high rate mode
            Codec::G723 => (CoderType::G723_63, payload_type::G723_63, 30, 30, 8000),
            Codec::G729 => (CoderType::G729, payload_type::G729, 10, 20, 8000),
            Codec::Ulaw => (CoderType::Mlaw, payload_type::PCMU, 10, 20, 8000),
            Codec::Alaw => (CoderType::Alaw, payload_type::PCMA, 10, 20, 8000),
            Codec::G726 => (CoderType::G726_32, payload_type::G726, 10, 20, 8000),
            // 13.3 kbit/s, 30 ms frames
            Codec::Ilbc => (CoderType::Ilbc133, payload_type::ILBC, 30, 30, 8000),
            Codec::Slin8 => (CoderType::Lin16_8, payload_type::SLIN8, 10, 20, 8000),
            Codec::Slin16 => (CoderType::Lin16_16, payload_type::SLIN16, 10, 10, 16000),
            Codec::G722 => (CoderType::G722_64, payload_type::G722, 20, 20, 16000),
            Codec::Siren7 => (CoderType::G7221_32, payload_type::SIREN7, 20, 20, 16000),
        };

        CodecParams {
            coder,
            payload_type,
            ptime,
            frame_length_ms,
            sample_rate,
        }
    }

    pub fn payload_type(self) -> u8 {
        self.params().payload_type
    }

    pub fn from_payload_type(pt: u8) -> Option<Codec> {
        Self::ALL.into_iter().find(|c| c.payload_type() == pt)
    }

    /// Number of audio samples carried by `len` payload bytes.
    pub fn samples_for_len(self, len: usize) -> u32 {
        let len = len as u32;
        match self {
            Codec::Ulaw | Codec::Alaw => len,
            Codec::Slin8 | Codec::Slin16 => len / 2,
            // 4 bits per sample
            Codec::G726 | Codec::G722 => len * 2,
            // 10 byte frames of 10 ms
            Codec::G729 => (len / 10) * 80,
            // 24 byte frames of 30 ms
            Codec::G723 => (len / 24) * 240,
            // 50 byte frames of 30 ms
            Codec::Ilbc => (len / 50) * 240,
            // 80 byte frames of 20 ms at 16 kHz
            Codec::Siren7 => (len / 80) * 320,
        }
    }

    /// Timestamp advance for a chunk carrying `samples` samples.
    ///
    /// G.722 runs at 16 kHz but its RTP clock is 8 kHz (RFC 3551 §4.5.2).
    pub fn timestamp_advance(self, samples: u32) -> u32 {
        match self {
            Codec::G722 => samples / 2,
            _ => samples,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Codec::G723 => "g723",
            Codec::G729 => "g729",
            Codec::Ulaw => "ulaw",
            Codec::Alaw => "alaw",
            Codec::G726 => "g726",
            Codec::Ilbc => "ilbc",
            Codec::Slin8 => "slin",
            Codec::Slin16 => "slin16",
            Codec::G722 => "g722",
            Codec::Siren7 => "siren7",
        }
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Codec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|c| c.name() == lower)
            .ok_or_else(|| Error::UnsupportedCodec(s.to_string()))
    }
}

/// Coder type to payload type table pushed to every DSP channel at startup,
/// used for both directions.
pub fn payload_type_table() -> Vec<(CoderType, u8)> {
    vec![
        (CoderType::G723_63, payload_type::G723_63),
        (CoderType::G723_53, payload_type::G723_53),
        (CoderType::G729, payload_type::G729),
        (CoderType::Mlaw, payload_type::PCMU),
        (CoderType::Alaw, payload_type::PCMA),
        (CoderType::G726_32, payload_type::G726),
        (CoderType::Ilbc152, payload_type::ILBC),
        (CoderType::Lin16_8, payload_type::SLIN8),
        (CoderType::Lin16_16, payload_type::SLIN16),
        (CoderType::G722_64, payload_type::G722),
        (CoderType::G7221_32, payload_type::G7221),
    ]
}
