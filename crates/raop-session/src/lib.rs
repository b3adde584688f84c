//! RAOP RTP receiver session.
//!
//! An [`RtpSession`] binds the data, control and timing channels of one
//! AirTunes v2 audio stream, decrypts and reorders incoming audio, asks the
//! sender to retransmit lost packets and keeps a clock offset to the sender.
//! Decrypted frames reach the application through an [`AudioSink`].

mod config;
mod playout;
mod session;
pub mod transport;
mod worker;

pub use config::{SessionBuilder, SessionConfig};
pub use session::{LocalPorts, RtpSession, SessionState, SessionStats, VOLUME_MAX, VOLUME_MIN};
pub use transport::{ChannelEndpoint, DatagramEndpoint, Received, StreamEndpoint, StreamFramer};

pub use raop_audio::{AudioFrame, AudioSink, BufferStats};
pub use raop_core::{AudioFormat, Error, Result};
pub use raop_timing::ResendPolicy;
