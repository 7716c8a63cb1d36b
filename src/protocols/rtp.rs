//! RTP framing between the DSP media channels and call legs
//!
//! The DSP reads and writes complete RTP packets on each channel descriptor.
//! Outbound voice frames are split into packets that fit the channel buffer;
//! inbound packets are checked against the negotiated payload type and turned
//! back into voice frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::protocols::codec::{payload_type, Codec};
use crate::{Error, Result};

pub const RTP_VERSION: u8 = 2;
pub const RTP_HEADER_LEN: usize = 12;
/// Size of one media transport unit, header included.
pub const RTP_BUFFER_LEN: usize = 512;
pub const MAX_PAYLOAD_LEN: usize = RTP_BUFFER_LEN - RTP_HEADER_LEN;

/// RTP packet structure
#[derive(Debug, Clone, PartialEq)]
pub struct RtpPacket {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    pub payload: Bytes,
}

impl RtpPacket {
    /// A packet as the DSP expects it: no padding, no extension, no CSRCs,
    /// no marker and a zero SSRC.
    pub fn new(payload_type: u8, sequence_number: u16, timestamp: u32, payload: Bytes) -> Self {
        Self {
            version: RTP_VERSION,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: payload_type & 0x7F,
            sequence_number,
            timestamp,
            ssrc: 0,
            payload,
        }
    }

    pub fn len(&self) -> usize {
        RTP_HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.len());

        // V(2) P(1) X(1) CC(4)
        let first_byte = (self.version << 6)
            | (if self.padding { 1 << 5 } else { 0 })
            | (if self.extension { 1 << 4 } else { 0 })
            | (self.csrc_count & 0x0F);
        buf.put_u8(first_byte);

        // M(1) PT(7)
        let second_byte = (if self.marker { 1 << 7 } else { 0 }) | (self.payload_type & 0x7F);
        buf.put_u8(second_byte);

        buf.put_u16(self.sequence_number);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        buf.put(self.payload.clone());

        buf.freeze()
    }

    /// Parse a packet read from a DSP channel.
    ///
    /// Everything after the fixed header is payload; the DSP never emits
    /// CSRC lists, extensions or padding.
    pub fn decode(mut data: Bytes) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::parse(format!("RTP packet too short: {} bytes", data.len())));
        }

        let first_byte = data.get_u8();
        let version = (first_byte >> 6) & 0x03;
        if version != RTP_VERSION {
            return Err(Error::parse(format!("Invalid RTP version {}", version)));
        }

        let second_byte = data.get_u8();
        let sequence_number = data.get_u16();
        let timestamp = data.get_u32();
        let ssrc = data.get_u32();

        Ok(Self {
            version,
            padding: (first_byte & 0x20) != 0,
            extension: (first_byte & 0x10) != 0,
            csrc_count: first_byte & 0x0F,
            marker: (second_byte & 0x80) != 0,
            payload_type: second_byte & 0x7F,
            sequence_number,
            timestamp,
            ssrc,
            payload: data,
        })
    }
}

/// One voice frame exchanged with a call leg.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceFrame {
    pub codec: Codec,
    pub data: Bytes,
    pub samples: u32,
    /// Declared duration of the frame in milliseconds.
    pub duration_ms: u32,
}

impl VoiceFrame {
    pub fn new(codec: Codec, data: Bytes) -> Self {
        let samples = codec.samples_for_len(data.len());
        let duration_ms = samples * 1000 / codec.params().sample_rate;
        Self {
            codec,
            data,
            samples,
            duration_ms,
        }
    }
}

/// Outcome of depacketizing one inbound transport unit.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Voice(VoiceFrame),
    ComfortNoise,
    PayloadMismatch { payload_type: u8 },
    Empty,
    Malformed,
}

/// Negotiated media parameters and running counters of one port.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaStream {
    pub codec: Codec,
    pub payload_type: u8,
    pub ptime: u32,
    pub sequence: u16,
    pub timestamp: u32,
}

impl MediaStream {
    pub fn new(codec: Codec) -> Self {
        let params = codec.params();
        Self {
            codec,
            payload_type: params.payload_type,
            ptime: params.ptime,
            sequence: 0,
            timestamp: 0,
        }
    }

    /// Switch to another codec, keeping the sequence and timestamp running.
    pub fn renegotiate(&mut self, codec: Codec) {
        let params = codec.params();
        self.codec = codec;
        self.payload_type = params.payload_type;
        self.ptime = params.ptime;
    }

    /// Split a voice frame into packets of at most `MAX_PAYLOAD_LEN` bytes.
    ///
    /// Chunks are a whole number of codec subframes where possible; the last
    /// chunk carries whatever is left once less than a full payload remains.
    /// Sequence and timestamp advance per packet regardless of whether the
    /// caller manages to write it.
    pub fn packetize(&mut self, frame: &VoiceFrame) -> Vec<RtpPacket> {
        let datalen = frame.data.len();
        if datalen == 0 {
            return Vec::new();
        }

        let ptime = self.ptime.max(1);
        let subframes = frame.duration_ms.div_ceil(ptime).max(1) as usize;
        let subframes_per_packet = MAX_PAYLOAD_LEN * subframes / datalen;

        let mut chunk_len = subframes_per_packet * datalen / subframes;
        if chunk_len == 0 {
            // a single subframe is larger than the payload budget
            chunk_len = MAX_PAYLOAD_LEN;
        }

        let mut packets = Vec::with_capacity(datalen / chunk_len + 1);
        let mut offset = 0;
        while offset < datalen {
            let remaining = datalen - offset;
            let len = if remaining < MAX_PAYLOAD_LEN {
                remaining
            } else {
                chunk_len
            };
            let samples = (len as u64 * frame.samples as u64 / datalen as u64) as u32;

            let packet = RtpPacket::new(
                self.payload_type,
                self.sequence,
                self.timestamp,
                frame.data.slice(offset..offset + len),
            );
            trace!(
                "RTP out: pt={} seq={} ts={} len={}",
                packet.payload_type,
                packet.sequence_number,
                packet.timestamp,
                len
            );

            self.sequence = self.sequence.wrapping_add(1);
            self.timestamp = self
                .timestamp
                .wrapping_add(self.codec.timestamp_advance(samples));

            packets.push(packet);
            offset += len;
        }

        packets
    }

    /// Turn one transport unit read from the DSP back into a voice frame.
    pub fn depacketize(&self, data: Bytes) -> Inbound {
        let packet = match RtpPacket::decode(data) {
            Ok(packet) => packet,
            Err(_) => return Inbound::Malformed,
        };

        if packet.payload_type != self.payload_type {
            if packet.payload_type == payload_type::CN {
                return Inbound::ComfortNoise;
            }
            return Inbound::PayloadMismatch {
                payload_type: packet.payload_type,
            };
        }

        if packet.payload.is_empty() {
            return Inbound::Empty;
        }

        Inbound::Voice(VoiceFrame::new(self.codec, packet.payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(codec: Codec, len: usize, duration_ms: u32) -> VoiceFrame {
        let data = Bytes::from((0..len).map(|i| i as u8).collect::<Vec<u8>>());
        VoiceFrame {
            codec,
            samples: codec.samples_for_len(len),
            data,
            duration_ms,
        }
    }

    #[test]
    fn test_header_layout() {
        let packet = RtpPacket::new(8, 0x1234, 0xdeadbeef, Bytes::from_static(b"ab"));
        let encoded = packet.encode();

        assert_eq!(encoded.len(), 14);
        assert_eq!(encoded[0], 0x80);
        assert_eq!(encoded[1], 8);
        assert_eq!(&encoded[2..4], &[0x12, 0x34]);
        assert_eq!(&encoded[4..8], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(&encoded[8..12], &[0, 0, 0, 0]);
        assert_eq!(&encoded[12..], b"ab");
    }

    #[test]
    fn test_decode_rejects_short_and_bad_version() {
        assert!(RtpPacket::decode(Bytes::from_static(&[0x80; 11])).is_err());

        let mut raw = RtpPacket::new(0, 1, 2, Bytes::new()).encode().to_vec();
        raw[0] = 0x40;
        assert!(RtpPacket::decode(Bytes::from(raw)).is_err());
    }

    #[test]
    fn test_small_frame_is_one_packet() {
        let mut stream = MediaStream::new(Codec::Alaw);
        let packets = stream.packetize(&frame(Codec::Alaw, 160, 20));

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].payload.len(), 160);
        assert_eq!(packets[0].sequence_number, 0);
        assert_eq!(packets[0].timestamp, 0);
        assert_eq!(stream.sequence, 1);
        assert_eq!(stream.timestamp, 160);
    }

    #[test]
    fn test_large_frame_split_on_subframe_boundaries() {
        let mut stream = MediaStream::new(Codec::Alaw);
        // 100 ms of A-law: 10 subframes of 80 bytes
        let packets = stream.packetize(&frame(Codec::Alaw, 800, 100));

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload.len(), 480);
        assert_eq!(packets[1].payload.len(), 320);
        assert_eq!(packets[1].sequence_number, packets[0].sequence_number + 1);
        assert_eq!(packets[1].timestamp, 480);
        assert_eq!(stream.timestamp, 800);
    }

    #[test]
    fn test_payload_never_exceeds_budget() {
        for codec in Codec::ALL {
            for (len, duration) in [(1, 0), (499, 10), (500, 60), (501, 0), (1600, 200), (4000, 250)] {
                let mut stream = MediaStream::new(codec);
                let f = frame(codec, len, duration);
                let packets = stream.packetize(&f);
                let total: usize = packets.iter().map(|p| p.payload.len()).sum();

                assert_eq!(total, len, "{} len={} dur={}", codec, len, duration);
                assert!(packets.iter().all(|p| p.payload.len() <= MAX_PAYLOAD_LEN));
                assert!(packets.iter().all(|p| p.len() <= RTP_BUFFER_LEN));
            }
        }
    }

    #[test]
    fn test_sequence_wraps() {
        let mut stream = MediaStream::new(Codec::Ulaw);
        stream.sequence = 65534;

        let mut seen = Vec::new();
        for _ in 0..3 {
            for packet in stream.packetize(&frame(Codec::Ulaw, 160, 20)) {
                seen.push(packet.sequence_number);
            }
        }
        assert_eq!(seen, vec![65534, 65535, 0]);
    }

    #[test]
    fn test_g722_timestamp_halved() {
        let mut stream = MediaStream::new(Codec::G722);
        stream.packetize(&frame(Codec::G722, 160, 20));
        // 160 bytes of G.722 are 320 samples at 16 kHz
        assert_eq!(stream.timestamp, 160);

        let mut stream = MediaStream::new(Codec::Slin16);
        stream.packetize(&frame(Codec::Slin16, 320, 10));
        assert_eq!(stream.timestamp, 160);
    }

    #[test]
    fn test_timestamp_wraps() {
        let mut stream = MediaStream::new(Codec::Alaw);
        stream.timestamp = u32::MAX - 10;
        stream.packetize(&frame(Codec::Alaw, 160, 20));
        assert_eq!(stream.timestamp, 149);
    }

    #[test]
    fn test_empty_frame_produces_nothing() {
        let mut stream = MediaStream::new(Codec::Alaw);
        assert!(stream.packetize(&frame(Codec::Alaw, 0, 20)).is_empty());
        assert_eq!(stream.sequence, 0);
    }

    #[test]
    fn test_depacketize_matching_payload() {
        let stream = MediaStream::new(Codec::Alaw);
        let raw = RtpPacket::new(8, 7, 1000, Bytes::from(vec![0x55; 160])).encode();

        match stream.depacketize(raw) {
            Inbound::Voice(frame) => {
                assert_eq!(frame.codec, Codec::Alaw);
                assert_eq!(frame.data.len(), 160);
                assert_eq!(frame.samples, 160);
                assert_eq!(frame.duration_ms, 20);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_depacketize_discards() {
        let stream = MediaStream::new(Codec::Alaw);

        let wrong = RtpPacket::new(0, 1, 0, Bytes::from_static(&[1; 80])).encode();
        assert_eq!(
            stream.depacketize(wrong),
            Inbound::PayloadMismatch { payload_type: 0 }
        );

        let cn = RtpPacket::new(payload_type::CN, 1, 0, Bytes::from_static(&[1])).encode();
        assert_eq!(stream.depacketize(cn), Inbound::ComfortNoise);

        let empty = RtpPacket::new(8, 1, 0, Bytes::new()).encode();
        assert_eq!(stream.depacketize(empty), Inbound::Empty);

        assert_eq!(stream.depacketize(Bytes::from_static(&[0x80, 8])), Inbound::Malformed);
    }

    #[test]
    fn test_huge_declared_duration() {
        let mut stream = MediaStream::new(Codec::Alaw);
        let packets = stream.packetize(&frame(Codec::Alaw, 1200, u32::MAX));
        let total: usize = packets.iter().map(|p| p.payload.len()).sum();
        assert_eq!(total, 1200);
        assert!(packets.iter().all(|p| p.payload.len() <= MAX_PAYLOAD_LEN));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn packets_fit_budget_and_count_up(
                codec_index in 0..Codec::ALL.len(),
                len in 1usize..4000,
                duration_ms in 0u32..2000,
                sequence in any::<u16>(),
                timestamp in any::<u32>(),
            ) {
                let codec = Codec::ALL[codec_index];
                let mut stream = MediaStream::new(codec);
                stream.sequence = sequence;
                stream.timestamp = timestamp;
                let f = frame(codec, len, duration_ms);

                let packets = stream.packetize(&f);
                prop_assert!(!packets.is_empty());

                let mut advance = 0u32;
                for (i, packet) in packets.iter().enumerate() {
                    prop_assert!(packet.payload.len() <= MAX_PAYLOAD_LEN);
                    prop_assert_eq!(packet.sequence_number, sequence.wrapping_add(i as u16));
                    prop_assert_eq!(packet.timestamp, timestamp.wrapping_add(advance));

                    let samples = (packet.payload.len() as u64 * u64::from(f.samples) / len as u64) as u32;
                    advance = advance.wrapping_add(codec.timestamp_advance(samples));
                }

                let total: usize = packets.iter().map(|p| p.payload.len()).sum();
                prop_assert_eq!(total, len);
                prop_assert_eq!(stream.sequence, sequence.wrapping_add(packets.len() as u16));
                prop_assert_eq!(stream.timestamp, timestamp.wrapping_add(advance));
            }
        }
    }
}
