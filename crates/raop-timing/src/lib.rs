//! # raop-timing
//!
//! Timing synchronization for a RAOP receiver.
//!
//! This crate provides:
//! - NTP-like timing exchange (payload types 82/83)
//! - Clock offset estimation
//! - Sync-packet anchors mapping RTP timestamps to local playback time
//! - Retransmission request pacing

mod clock;
mod ntp;
mod retransmit;
mod sync;

pub use clock::{ns_to_samples, ntp_to_unix, samples_to_ns, unix_to_ntp, Clock, ClockOffset, NTP_EPOCH_OFFSET};
pub use ntp::{NtpRequest, NtpResponse, TIMING_PACKET_LEN, TIMING_REQUEST_PT, TIMING_RESPONSE_PT};
pub use retransmit::{ResendPolicy, ResendTracker};
pub use sync::{SyncAnchor, TimingSynchronizer, OFFSET_WINDOW};
