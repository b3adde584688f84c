//! Wall clock and conversions between Unix, NTP and sample time.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the NTP era start (1900) and the Unix epoch.
pub const NTP_EPOCH_OFFSET: u64 = 2_208_988_800;

const NS_PER_SEC: u64 = 1_000_000_000;

/// One estimate of how far the sender's clock is from ours.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockOffset {
    /// Sender minus local, in ns. Positive when the sender runs ahead.
    pub offset_ns: i64,
    /// Half the round trip.
    pub error_ns: u64,
    pub rtt_ns: u64,
}

impl ClockOffset {
    /// Map a remote time to local time.
    pub fn remote_to_local(&self, remote_ns: u64) -> u64 {
        (remote_ns as i64).saturating_sub(self.offset_ns).max(0) as u64
    }
}

/// Wall clock tied to the stream's sample rate.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    sample_rate: u32,
}

impl Clock {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    /// Unix time in ns.
    pub fn now_wall_ns(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |since| since.as_nanos() as u64)
    }

    pub fn now_ntp(&self) -> u64 {
        unix_to_ntp(self.now_wall_ns())
    }

    /// Duration of a signed sample count in nanoseconds.
    pub fn samples_delta_ns(&self, samples: i64) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        samples.saturating_mul(NS_PER_SEC as i64) / self.sample_rate as i64
    }

    pub fn samples_to_ns(&self, samples: u32) -> u64 {
        samples_to_ns(samples, self.sample_rate)
    }

    pub fn ns_to_samples(&self, ns: u64) -> u32 {
        ns_to_samples(ns, self.sample_rate)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Length of `samples` frames in ns. Zero for a zero rate.
pub fn samples_to_ns(samples: u32, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    samples as u64 * NS_PER_SEC / sample_rate as u64
}

pub fn ns_to_samples(ns: u64, sample_rate: u32) -> u32 {
    (ns as u128 * sample_rate as u128 / NS_PER_SEC as u128) as u32
}

/// Unix ns to 32.32 fixed-point NTP.
pub fn unix_to_ntp(unix_ns: u64) -> u64 {
    let secs = unix_ns / NS_PER_SEC + NTP_EPOCH_OFFSET;
    let frac = (((unix_ns % NS_PER_SEC) as u128) << 32) / NS_PER_SEC as u128;
    secs << 32 | frac as u64
}

/// Convert NTP timestamp to Unix nanoseconds. Times before 1970 saturate to 0.
pub fn ntp_to_unix(ntp: u64) -> u64 {
    let Some(secs) = (ntp >> 32).checked_sub(NTP_EPOCH_OFFSET) else {
        return 0;
    };
    let frac = ((ntp & 0xFFFF_FFFF) as u128 * NS_PER_SEC as u128) >> 32;
    secs * NS_PER_SEC + frac as u64
}
