//! Media framing between the DSP channels and call legs

pub mod codec;
pub mod rtp;

pub use codec::{Codec, CodecParams, CoderType};
pub use rtp::{Inbound, MediaStream, RtpPacket, VoiceFrame};
