//! # raop-audio
//!
//! Audio packet handling for a RAOP receiver.
//!
//! This crate provides:
//! - RTP wire formats for the data and control channels
//! - Per-packet AES payload decryption
//! - A wrap-aware reorder/jitter buffer
//! - The output sink interface

pub mod buffer;
pub mod cipher;
pub mod rtp;
mod traits;

pub use buffer::{
    Admission, AudioFrame, BufferConfig, BufferStats, Drained, FlushTarget, ReorderBuffer,
};
pub use cipher::{AesPacketCipher, PacketCipher};
pub use rtp::{
    build_retransmit_response, payload_types, ControlPacket, RetransmitRequest, RtpHeader,
    RtpPacket, SyncPacket,
};
pub use traits::AudioSink;

#[cfg(test)]
pub use traits::MockAudioSink;
