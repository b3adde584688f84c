//! Pacing of retransmission requests.

use raop_audio::RetransmitRequest;
use raop_core::SequenceRange;
use std::time::{Duration, Instant};
use tracing::debug;

/// When and how often missing packets are requested again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResendPolicy {
    /// Minimum time between requests for the same hole.
    pub backoff: Duration,
    /// Requests per hole before giving up.
    pub max_attempts: u32,
    /// Largest count in a single request.
    pub max_count: u16,
}

impl Default for ResendPolicy {
    fn default() -> Self {
        Self {
            backoff: Duration::from_millis(25),
            max_attempts: 3,
            max_count: 128,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Pending {
    first: u16,
    attempts: u32,
    last_sent: Instant,
}

/// Tracks the hole currently blocking playout and decides when to ask for it.
#[derive(Debug)]
pub struct ResendTracker {
    policy: ResendPolicy,
    pending: Option<Pending>,
    sequence: u16,
    sent: u64,
}

impl ResendTracker {
    pub fn new(policy: ResendPolicy) -> Self {
        Self {
            policy,
            pending: None,
            sequence: 0,
            sent: 0,
        }
    }

    pub fn policy(&self) -> &ResendPolicy {
        &self.policy
    }

    /// Requests issued so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Feed the buffer's current hole. Returns a request when one is due.
    pub fn poll(&mut self, missing: Option<SequenceRange>, now: Instant) -> Option<RetransmitRequest> {
        let Some(missing) = missing.filter(|range| !range.is_empty()) else {
            self.pending = None;
            return None;
        };

        match self.pending {
            Some(pending) if pending.first == missing.first => {
                if pending.attempts >= self.policy.max_attempts {
                    return None;
                }
                if now.saturating_duration_since(pending.last_sent) < self.policy.backoff {
                    return None;
                }
            }
            _ => {}
        }

        let attempts = match self.pending {
            Some(pending) if pending.first == missing.first => pending.attempts + 1,
            _ => 1,
        };
        self.pending = Some(Pending {
            first: missing.first,
            attempts,
            last_sent: now,
        });

        let count = missing.count.min(self.policy.max_count);
        let request = RetransmitRequest::new(self.sequence, SequenceRange::new(missing.first, count));
        self.sequence = self.sequence.wrapping_add(1);
        self.sent += 1;
        debug!(
            "Requesting resend of {} packets from seq {} (attempt {})",
            count, missing.first, attempts
        );
        Some(request)
    }

    pub fn reset(&mut self) {
        self.pending = None;
    }
}

impl Default for ResendTracker {
    fn default() -> Self {
        Self::new(ResendPolicy::default())
    }
}
