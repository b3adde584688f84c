//! Session configuration and builder.

use crate::RtpSession;
use raop_audio::{AudioSink, BufferConfig};
use raop_core::error::Result;
use raop_timing::ResendPolicy;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Tuning for one receiver session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Local address the three channels bind to.
    pub bind_addr: IpAddr,
    /// Sender address for control and timing traffic. Learned from the first
    /// received packet when unset.
    pub peer_addr: Option<IpAddr>,
    /// Reorder buffer slots.
    pub buffer_capacity: usize,
    /// How long a missing packet may hold up playout.
    pub gap_timeout: Duration,
    /// Packets queued behind a hole before it is skipped.
    pub max_gap_span: u16,
    /// Longest a worker waits on its socket before checking for stop.
    pub poll_interval: Duration,
    /// Period of timing requests to the sender.
    pub timing_interval: Duration,
    pub resend_backoff: Duration,
    pub resend_max_attempts: u32,
    pub resend_max_count: u16,
    /// Consecutive receive failures tolerated on one channel.
    pub max_receive_errors: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let buffer = BufferConfig::default();
        let resend = ResendPolicy::default();
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            peer_addr: None,
            buffer_capacity: buffer.capacity,
            gap_timeout: buffer.gap_timeout,
            max_gap_span: buffer.max_gap_span,
            poll_interval: Duration::from_millis(20),
            timing_interval: Duration::from_secs(3),
            resend_backoff: resend.backoff,
            resend_max_attempts: resend.max_attempts,
            resend_max_count: resend.max_count,
            max_receive_errors: 16,
        }
    }
}

impl SessionConfig {
    pub fn buffer_config(&self) -> BufferConfig {
        BufferConfig {
            capacity: self.buffer_capacity,
            gap_timeout: self.gap_timeout,
            max_gap_span: self.max_gap_span,
        }
    }

    pub fn resend_policy(&self) -> ResendPolicy {
        ResendPolicy {
            backoff: self.resend_backoff,
            max_attempts: self.resend_max_attempts,
            max_count: self.resend_max_count,
        }
    }
}

/// Builder for configuring an [`RtpSession`].
#[derive(Debug, Clone, Default)]
pub struct SessionBuilder {
    config: SessionConfig,
}

impl SessionBuilder {
    /// Create new builder with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.config.bind_addr = addr;
        self
    }

    /// Fix the sender address instead of learning it from traffic.
    pub fn peer_addr(mut self, addr: IpAddr) -> Self {
        self.config.peer_addr = Some(addr);
        self
    }

    pub fn buffer_capacity(mut self, slots: usize) -> Self {
        self.config.buffer_capacity = slots;
        self
    }

    pub fn gap_timeout(mut self, timeout: Duration) -> Self {
        self.config.gap_timeout = timeout;
        self
    }

    pub fn max_gap_span(mut self, span: u16) -> Self {
        self.config.max_gap_span = span;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn timing_interval(mut self, interval: Duration) -> Self {
        self.config.timing_interval = interval;
        self
    }

    /// Set retransmission pacing.
    pub fn resend_policy(mut self, policy: ResendPolicy) -> Self {
        self.config.resend_backoff = policy.backoff;
        self.config.resend_max_attempts = policy.max_attempts;
        self.config.resend_max_count = policy.max_count;
        self
    }

    pub fn max_receive_errors(mut self, count: u32) -> Self {
        self.config.max_receive_errors = count;
        self
    }

    pub fn build_config(self) -> SessionConfig {
        self.config
    }

    /// Build the session.
    pub fn build(
        self,
        sink: Arc<dyn AudioSink>,
        fmtp: &str,
        aes_key: &[u8],
        aes_iv: &[u8],
    ) -> Result<RtpSession> {
        RtpSession::init_with_config(self.config, sink, fmtp, aes_key, aes_iv)
    }
}
