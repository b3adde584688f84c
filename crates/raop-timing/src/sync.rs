//! Sender clock tracking.
//!
//! Combines the NTP-style offset exchange on the timing channel with the
//! sync packets on the control channel, so an RTP timestamp can be mapped to
//! the local time at which it should be played.

use crate::{Clock, ClockOffset, NtpRequest, NtpResponse};
use raop_audio::SyncPacket;
use raop_core::error::Result;
use std::collections::VecDeque;
use tracing::{debug, trace};

/// Number of offset samples kept. The lowest-RTT one is used.
pub const OFFSET_WINDOW: usize = 8;

/// RTP timestamp paired with the sender's NTP time at which it plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncAnchor {
    pub rtp: u32,
    pub ntp: u64,
    /// Sender latency in samples.
    pub latency: u32,
}

impl From<&SyncPacket> for SyncAnchor {
    fn from(packet: &SyncPacket) -> Self {
        Self {
            rtp: packet.next_timestamp,
            ntp: packet.ntp_time,
            latency: packet.latency(),
        }
    }
}

/// Clock state for one stream.
#[derive(Debug)]
pub struct TimingSynchronizer {
    clock: Clock,
    samples: VecDeque<ClockOffset>,
    anchor: Option<SyncAnchor>,
    sequence: u16,
}

impl TimingSynchronizer {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            clock: Clock::new(sample_rate),
            samples: VecDeque::with_capacity(OFFSET_WINDOW),
            anchor: None,
            sequence: 0,
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Build the next timing request, stamped with the current time.
    pub fn next_request(&mut self) -> NtpRequest {
        let request = NtpRequest::new(self.sequence, self.clock.now_ntp());
        self.sequence = self.sequence.wrapping_add(1);
        request
    }

    /// Record a timing response received now.
    pub fn handle_response(&mut self, data: &[u8]) -> Result<ClockOffset> {
        let response = NtpResponse::parse(data)?;
        Ok(self.record_response(&response, self.clock.now_ntp()))
    }

    /// Record a timing response received at `local_recv_time` (NTP format).
    pub fn record_response(&mut self, response: &NtpResponse, local_recv_time: u64) -> ClockOffset {
        let rtt_ns = response.round_trip_time(local_recv_time).unsigned_abs();
        let sample = ClockOffset {
            offset_ns: response.clock_offset(local_recv_time),
            error_ns: rtt_ns / 2,
            rtt_ns,
        };
        trace!(
            "Timing sample: offset {} ns, rtt {} ns",
            sample.offset_ns,
            sample.rtt_ns
        );

        if self.samples.len() == OFFSET_WINDOW {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        sample
    }

    /// Answer a timing request from the peer.
    pub fn answer_request(&self, data: &[u8]) -> Result<NtpResponse> {
        let receive_time = self.clock.now_ntp();
        let request = NtpRequest::parse(data)?;
        Ok(NtpResponse::from_request(&request, receive_time, self.clock.now_ntp()))
    }

    /// Record a sync packet from the control channel.
    pub fn handle_sync(&mut self, packet: &SyncPacket) {
        let anchor = SyncAnchor::from(packet);
        if packet.first_after_flush {
            debug!(
                "Sync anchor after flush: rtp {} latency {} samples",
                anchor.rtp, anchor.latency
            );
        }
        self.anchor = Some(anchor);
    }

    /// Best offset estimate: the sample with the lowest round-trip time.
    pub fn offset(&self) -> Option<ClockOffset> {
        self.samples.iter().min_by_key(|sample| sample.rtt_ns).copied()
    }

    pub fn anchor(&self) -> Option<SyncAnchor> {
        self.anchor
    }

    /// True once both an offset and a sync anchor are known.
    pub fn is_synchronized(&self) -> bool {
        self.anchor.is_some() && !self.samples.is_empty()
    }

    /// Local wall-clock time (ns since Unix epoch) at which `rtp` should play.
    pub fn rtp_to_local_ns(&self, rtp: u32) -> Option<u64> {
        let anchor = self.anchor?;
        let offset = self.offset()?;

        let delta = rtp.wrapping_sub(anchor.rtp) as i32 as i64;
        let remote_ns = (crate::ntp_to_unix(anchor.ntp) as i64)
            .saturating_add(self.clock.samples_delta_ns(delta));
        Some(offset.remote_to_local(remote_ns.max(0) as u64))
    }

    /// Forget offsets and anchor.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.anchor = None;
    }
}
