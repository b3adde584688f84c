//! RTP packet formats used on the data and control channels.

use raop_core::error::{ParseError, Result};
use raop_core::{SequenceRange, MAX_PACKET_LEN};

/// RTP payload types for RAOP.
pub mod payload_types {
    pub const TIMING_REQUEST: u8 = 82;
    pub const TIMING_RESPONSE: u8 = 83;
    pub const SYNC: u8 = 84;
    pub const RETRANSMIT_REQUEST: u8 = 85;
    pub const RETRANSMIT_RESPONSE: u8 = 86;
    pub const AUDIO_REALTIME: u8 = 96;
}

/// RTP header length without CSRCs.
pub const RTP_HEADER_LEN: usize = 12;

/// Length of the prefix in front of a retransmitted packet.
const RETRANSMIT_HEADER_LEN: usize = 4;

/// Read the payload type (without marker bit) of any RTP-like packet.
pub fn payload_type(data: &[u8]) -> Option<u8> {
    data.get(1).map(|b| b & 0x7F)
}

/// Fixed part of an RTP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    /// Always 2 on the wire.
    pub version: u8,
    /// Padding flag.
    pub padding: bool,
    /// Extension flag.
    pub extension: bool,
    /// CSRC count.
    pub csrc_count: u8,
    /// Marker bit. Set on the first packet after RECORD or FLUSH.
    pub marker: bool,
    /// Payload type.
    pub payload_type: u8,
    /// Sequence number.
    pub sequence: u16,
    /// Timestamp.
    pub timestamp: u32,
    /// SSRC identifier.
    pub ssrc: u32,
}

impl RtpHeader {
    /// Version 2 header without padding, extension or CSRCs.
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    /// Set marker bit.
    pub fn with_marker(mut self, marker: bool) -> Self {
        self.marker = marker;
        self
    }

    pub fn serialize(&self) -> [u8; RTP_HEADER_LEN] {
        let mut buf = [0u8; RTP_HEADER_LEN];

        buf[0] = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrc_count & 0x0F);

        // Byte 1: M(1) PT(7)
        buf[1] = ((self.marker as u8) << 7) | (self.payload_type & 0x7F);

        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ssrc.to_be_bytes());

        buf
    }

    /// Parse from bytes.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(ParseError::TooShort {
                needed: RTP_HEADER_LEN,
                actual: data.len(),
            }
            .into());
        }

        Ok(Self {
            version: (data[0] >> 6) & 0x03,
            padding: (data[0] >> 5) & 0x01 != 0,
            extension: (data[0] >> 4) & 0x01 != 0,
            csrc_count: data[0] & 0x0F,
            marker: (data[1] >> 7) & 0x01 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }
}

/// Audio packet as received on the data channel (payload still encrypted).
#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    /// Create new packet.
    pub fn new(header: RtpHeader, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }

    /// Serialize to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.serialize());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Parse an audio packet, enforcing the size limit and payload type.
    pub fn parse_audio(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PACKET_LEN {
            return Err(ParseError::TooLong(data.len()).into());
        }

        let header = RtpHeader::parse(data)?;
        if header.payload_type != payload_types::AUDIO_REALTIME {
            return Err(ParseError::UnexpectedPayloadType(header.payload_type).into());
        }

        // CSRC identifiers are never sent by RAOP senders but skip them if present.
        let payload_start = RTP_HEADER_LEN + 4 * header.csrc_count as usize;
        if data.len() <= payload_start {
            return Err(ParseError::TooShort {
                needed: payload_start + 1,
                actual: data.len(),
            }
            .into());
        }

        Ok(Self {
            header,
            payload: data[payload_start..].to_vec(),
        })
    }
}

/// Retransmit request (payload type 85), sent by the receiver to the
/// sender's control port when audio packets are missing.
///
/// Wire format (8 bytes):
/// - Bytes 0-1: 0x80, 0xD5 (V=2, marker, PT=85)
/// - Bytes 2-3: request sequence number
/// - Bytes 4-5: first missing sequence number
/// - Bytes 6-7: number of missing packets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetransmitRequest {
    /// Request counter maintained by the receiver.
    pub sequence: u16,
    /// Missing packets.
    pub missing: SequenceRange,
}

impl RetransmitRequest {
    pub const LEN: usize = 8;

    pub fn new(sequence: u16, missing: SequenceRange) -> Self {
        Self { sequence, missing }
    }

    pub fn serialize(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = 0x80;
        buf[1] = 0x80 | payload_types::RETRANSMIT_REQUEST;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..6].copy_from_slice(&self.missing.first.to_be_bytes());
        buf[6..8].copy_from_slice(&self.missing.count.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(ParseError::TooShort {
                needed: Self::LEN,
                actual: data.len(),
            }
            .into());
        }

        let pt = data[1] & 0x7F;
        if pt != payload_types::RETRANSMIT_REQUEST {
            return Err(ParseError::UnexpectedPayloadType(pt).into());
        }

        Ok(Self {
            sequence: u16::from_be_bytes([data[2], data[3]]),
            missing: SequenceRange::new(
                u16::from_be_bytes([data[4], data[5]]),
                u16::from_be_bytes([data[6], data[7]]),
            ),
        })
    }
}

/// Build a retransmit response (payload type 86): a 4-byte header
/// carrying the original sequence number, followed by the original packet.
pub fn build_retransmit_response(original_packet: &[u8]) -> Vec<u8> {
    let mut response = Vec::with_capacity(RETRANSMIT_HEADER_LEN + original_packet.len());

    response.push(0x80);
    response.push(0x80 | payload_types::RETRANSMIT_RESPONSE);

    if original_packet.len() >= 4 {
        response.push(original_packet[2]);
        response.push(original_packet[3]);
    } else {
        response.push(0);
        response.push(0);
    }

    response.extend_from_slice(original_packet);
    response
}

/// Sync packet (payload type 84) sent by the sender on the control channel.
///
/// Wire format (20 bytes):
/// - Byte 0: 0x90 for the first sync after RECORD/FLUSH (extension bit), 0x80 otherwise
/// - Byte 1: 0xD4 (marker, PT=84)
/// - Bytes 2-3: sync counter
/// - Bytes 4-7: RTP timestamp currently playing (next timestamp minus latency)
/// - Bytes 8-15: sender NTP time at which `next_timestamp` is played
/// - Bytes 16-19: next RTP timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncPacket {
    pub first_after_flush: bool,
    pub current_timestamp: u32,
    pub ntp_time: u64,
    pub next_timestamp: u32,
}

impl SyncPacket {
    pub const LEN: usize = 20;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::LEN {
            return Err(ParseError::TooShort {
                needed: Self::LEN,
                actual: data.len(),
            }
            .into());
        }

        let pt = data[1] & 0x7F;
        if pt != payload_types::SYNC {
            return Err(ParseError::UnexpectedPayloadType(pt).into());
        }

        Ok(Self {
            first_after_flush: data[0] & 0x10 != 0,
            current_timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ntp_time: u64::from_be_bytes([
                data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
            ]),
            next_timestamp: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        })
    }

    pub fn serialize(&self, counter: u16) -> [u8; Self::LEN] {
        let mut packet = [0u8; Self::LEN];
        packet[0] = if self.first_after_flush { 0x90 } else { 0x80 };
        packet[1] = 0x80 | payload_types::SYNC;
        packet[2..4].copy_from_slice(&counter.to_be_bytes());
        packet[4..8].copy_from_slice(&self.current_timestamp.to_be_bytes());
        packet[8..16].copy_from_slice(&self.ntp_time.to_be_bytes());
        packet[16..20].copy_from_slice(&self.next_timestamp.to_be_bytes());
        packet
    }

    /// Sender latency in samples.
    pub fn latency(&self) -> u32 {
        self.next_timestamp.wrapping_sub(self.current_timestamp)
    }
}

/// Packet received on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlPacket<'a> {
    Sync(SyncPacket),
    /// Retransmitted audio packet, header prefix stripped.
    RetransmitResponse(&'a [u8]),
    RetransmitRequest(RetransmitRequest),
    Other(u8),
}

impl<'a> ControlPacket<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        let pt = payload_type(data).ok_or(ParseError::TooShort {
            needed: 2,
            actual: data.len(),
        })?;

        match pt {
            payload_types::SYNC => Ok(Self::Sync(SyncPacket::parse(data)?)),
            payload_types::RETRANSMIT_RESPONSE => {
                if data.len() < RETRANSMIT_HEADER_LEN + RTP_HEADER_LEN {
                    return Err(ParseError::TooShort {
                        needed: RETRANSMIT_HEADER_LEN + RTP_HEADER_LEN,
                        actual: data.len(),
                    }
                    .into());
                }
                Ok(Self::RetransmitResponse(&data[RETRANSMIT_HEADER_LEN..]))
            }
            payload_types::RETRANSMIT_REQUEST => {
                Ok(Self::RetransmitRequest(RetransmitRequest::parse(data)?))
            }
            other => Ok(Self::Other(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raop_core::Error;

    fn audio_bytes(sequence: u16, payload: &[u8]) -> Vec<u8> {
        RtpPacket::new(
            RtpHeader::new(payload_types::AUDIO_REALTIME, sequence, 1000, 0xABCD),
            payload.to_vec(),
        )
        .serialize()
    }

    mod rtp_header {
        use super::*;

        #[test]
        fn new_sets_version_2() {
            let header = RtpHeader::new(96, 0, 0, 0);
            assert_eq!(header.version, 2);
        }

        #[test]
        fn marker_is_top_bit_of_second_byte() {
            let bytes = RtpHeader::new(96, 0, 0, 0).with_marker(true).serialize();
            assert_eq!(bytes[0], 0x80);
            assert_eq!(bytes[1], 0xE0);

            let bytes = RtpHeader::new(96, 0, 0, 0).serialize();
            assert_eq!(bytes[1], 0x60);
        }

        #[test]
        fn parse_reads_fields() {
            let bytes = [
                0x80, 0xE0, 0x30, 0x39, 0xDE, 0xAD, 0xBE, 0xEF, 0x12, 0x34, 0x56, 0x78,
            ];
            let header = RtpHeader::parse(&bytes).unwrap();
            assert_eq!(header.version, 2);
            assert!(header.marker);
            assert_eq!(header.payload_type, 96);
            assert_eq!(header.sequence, 12345);
            assert_eq!(header.timestamp, 0xDEADBEEF);
            assert_eq!(header.ssrc, 0x12345678);
        }

        #[test]
        fn parse_rejects_short_input() {
            assert!(RtpHeader::parse(&[0x80; 11]).is_err());
        }
    }

    mod rtp_packet {
        use super::*;

        #[test]
        fn parse_audio_splits_header_and_payload() {
            let bytes = audio_bytes(42, &[1, 2, 3, 4]);
            let packet = RtpPacket::parse_audio(&bytes).unwrap();
            assert_eq!(packet.header.sequence, 42);
            assert_eq!(packet.header.timestamp, 1000);
            assert_eq!(packet.payload, vec![1, 2, 3, 4]);
        }

        #[test]
        fn parse_audio_rejects_empty_payload() {
            let bytes = audio_bytes(1, &[]);
            let err = RtpPacket::parse_audio(&bytes).unwrap_err();
            assert!(matches!(err, Error::Parse(ParseError::TooShort { .. })));
        }

        #[test]
        fn parse_audio_rejects_oversize() {
            let bytes = audio_bytes(1, &vec![0u8; MAX_PACKET_LEN]);
            let err = RtpPacket::parse_audio(&bytes).unwrap_err();
            assert!(matches!(err, Error::Parse(ParseError::TooLong(_))));
        }

        #[test]
        fn parse_audio_rejects_other_payload_types() {
            let bytes = RtpPacket::new(RtpHeader::new(payload_types::SYNC, 1, 0, 0), vec![0; 8])
                .serialize();
            let err = RtpPacket::parse_audio(&bytes).unwrap_err();
            assert!(matches!(err, Error::Parse(ParseError::UnexpectedPayloadType(84))));
        }
    }

    mod retransmit {
        use super::*;

        #[test]
        fn request_wire_format() {
            let request = RetransmitRequest::new(7, SequenceRange::new(100, 3));
            let bytes = request.serialize();
            assert_eq!(bytes, [0x80, 0xD5, 0x00, 0x07, 0x00, 0x64, 0x00, 0x03]);
            assert_eq!(RetransmitRequest::parse(&bytes).unwrap(), request);
        }

        #[test]
        fn request_parse_wrong_payload_type() {
            let mut bytes = RetransmitRequest::new(0, SequenceRange::new(1, 1)).serialize();
            bytes[1] = 0x80 | 96;
            assert!(RetransmitRequest::parse(&bytes).is_err());
            assert!(RetransmitRequest::parse(&bytes[..6]).is_err());
        }

        #[test]
        fn response_unwraps_original_packet() {
            let original = audio_bytes(42, &[0xDE, 0xAD, 0xBE, 0xEF]);
            let response = build_retransmit_response(&original);
            assert_eq!(response[1], 0x80 | payload_types::RETRANSMIT_RESPONSE);
            assert_eq!(u16::from_be_bytes([response[2], response[3]]), 42);

            match ControlPacket::parse(&response).unwrap() {
                ControlPacket::RetransmitResponse(inner) => assert_eq!(inner, &original[..]),
                other => panic!("unexpected {:?}", other),
            }
        }

        #[test]
        fn truncated_response_rejected() {
            let response = build_retransmit_response(&[0x80, 0x60, 0, 1]);
            assert!(ControlPacket::parse(&response).is_err());
        }
    }

    mod sync {
        use super::*;

        #[test]
        fn parses_sender_sync_layout() {
            let mut packet = [0u8; 20];
            packet[0] = 0x90;
            packet[1] = 0xD4;
            packet[2..4].copy_from_slice(&7u16.to_be_bytes());
            packet[4..8].copy_from_slice(&(44100u32 - 11025).to_be_bytes());
            packet[8..16].copy_from_slice(&0xAAAABBBBCCCCDDDDu64.to_be_bytes());
            packet[16..20].copy_from_slice(&44100u32.to_be_bytes());

            let sync = SyncPacket::parse(&packet).unwrap();
            assert!(sync.first_after_flush);
            assert_eq!(sync.current_timestamp, 33075);
            assert_eq!(sync.ntp_time, 0xAAAABBBBCCCCDDDD);
            assert_eq!(sync.next_timestamp, 44100);
            assert_eq!(sync.latency(), 11025);
        }

        #[test]
        fn regular_sync_has_no_extension_bit() {
            let sync = SyncPacket {
                first_after_flush: false,
                current_timestamp: 0,
                ntp_time: 0,
                next_timestamp: 0,
            };
            let bytes = sync.serialize(1);
            assert_eq!(bytes[0], 0x80);
            assert!(!SyncPacket::parse(&bytes).unwrap().first_after_flush);
        }

        #[test]
        fn latency_wraps() {
            let sync = SyncPacket {
                first_after_flush: false,
                current_timestamp: u32::MAX - 9,
                ntp_time: 0,
                next_timestamp: 10,
            };
            assert_eq!(sync.latency(), 20);
        }

        #[test]
        fn classified_as_control_sync() {
            let sync = SyncPacket {
                first_after_flush: false,
                current_timestamp: 1,
                ntp_time: 2,
                next_timestamp: 3,
            };
            let bytes = sync.serialize(0);
            assert_eq!(ControlPacket::parse(&bytes).unwrap(), ControlPacket::Sync(sync));
        }
    }

    mod packet_formats {
        use super::*;

        #[test]
        fn unknown_control_payload_type_is_other() {
            assert_eq!(ControlPacket::parse(&[0x80, 0xD7, 0, 0]).unwrap(), ControlPacket::Other(87));
        }

        #[test]
        fn payload_type_ignores_marker() {
            assert_eq!(payload_type(&[0x80, 0xD2]), Some(payload_types::TIMING_REQUEST));
            assert_eq!(payload_type(&[0x80]), None);
        }
    }
}
