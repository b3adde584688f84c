//! NTP-like timing packets (RTP payload types 82 and 83).

use crate::ntp_to_unix;
use raop_core::error::{ParseError, Result};

/// Timing request payload type.
pub const TIMING_REQUEST_PT: u8 = 82;

/// Timing response payload type.
pub const TIMING_RESPONSE_PT: u8 = 83;

/// Both timing packets are 32 bytes.
pub const TIMING_PACKET_LEN: usize = 32;

fn check_packet(data: &[u8], expected_pt: u8) -> Result<()> {
    if data.len() < TIMING_PACKET_LEN {
        return Err(ParseError::TooShort {
            needed: TIMING_PACKET_LEN,
            actual: data.len(),
        }
        .into());
    }
    let pt = data[1] & 0x7F;
    if pt != expected_pt {
        return Err(ParseError::UnexpectedPayloadType(pt).into());
    }
    Ok(())
}

fn read_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_be_bytes(bytes)
}

/// Timing request, sent by either side.
///
/// `80 D2 <seq:2> <pad:4> <zero:8> <zero:8> <send time:8>`, all big-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NtpRequest {
    pub sequence: u16,
    /// Requester's send time as NTP.
    pub reference_time: u64,
}

impl NtpRequest {
    pub fn new(sequence: u16, reference_time: u64) -> Self {
        Self {
            sequence,
            reference_time,
        }
    }

    pub fn serialize(&self) -> [u8; TIMING_PACKET_LEN] {
        let mut buf = [0u8; TIMING_PACKET_LEN];
        buf[0] = 0x80;
        buf[1] = TIMING_REQUEST_PT | 0x80;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[24..32].copy_from_slice(&self.reference_time.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        check_packet(data, TIMING_REQUEST_PT)?;
        Ok(Self {
            sequence: u16::from_be_bytes([data[2], data[3]]),
            reference_time: read_u64(data, 24),
        })
    }
}

/// Timing response.
///
/// `80 D3 <seq:2> <pad:4> <request send time:8> <received at:8> <sent at:8>`.
/// The first timestamp is copied from the request so the requester can match
/// it against its own clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtpResponse {
    pub sequence: u16,
    pub reference_time: u64,
    pub receive_time: u64,
    pub send_time: u64,
}

impl NtpResponse {
    /// Answer `request`, stamping our receive and send times.
    pub fn from_request(request: &NtpRequest, receive_time: u64, send_time: u64) -> Self {
        Self {
            sequence: request.sequence,
            reference_time: request.reference_time,
            receive_time,
            send_time,
        }
    }

    pub fn serialize(&self) -> [u8; TIMING_PACKET_LEN] {
        let mut buf = [0u8; TIMING_PACKET_LEN];
        buf[0] = 0x80;
        buf[1] = TIMING_RESPONSE_PT | 0x80;
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[8..16].copy_from_slice(&self.reference_time.to_be_bytes());
        buf[16..24].copy_from_slice(&self.receive_time.to_be_bytes());
        buf[24..32].copy_from_slice(&self.send_time.to_be_bytes());
        buf
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        check_packet(data, TIMING_RESPONSE_PT)?;
        Ok(Self {
            sequence: u16::from_be_bytes([data[2], data[3]]),
            reference_time: read_u64(data, 8),
            receive_time: read_u64(data, 16),
            send_time: read_u64(data, 24),
        })
    }

    /// Network round trip in ns, excluding the responder's turnaround.
    pub fn round_trip_time(&self, local_recv_time: u64) -> i64 {
        let (sent, their_recv, their_send, recv) = self.times(local_recv_time);
        (recv - sent) - (their_send - their_recv)
    }

    /// Responder clock minus ours, in ns.
    pub fn clock_offset(&self, local_recv_time: u64) -> i64 {
        let (sent, their_recv, their_send, recv) = self.times(local_recv_time);
        ((their_recv - sent) + (their_send - recv)) / 2
    }

    fn times(&self, local_recv_time: u64) -> (i64, i64, i64, i64) {
        (
            ntp_to_unix(self.reference_time) as i64,
            ntp_to_unix(self.receive_time) as i64,
            ntp_to_unix(self.send_time) as i64,
            ntp_to_unix(local_recv_time) as i64,
        )
    }
}
