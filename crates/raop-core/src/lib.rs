//! # raop-core
//!
//! Core types and error definitions shared across the RAOP receiver crates.
//!
//! This crate provides:
//! - Common error types
//! - ALAC codec parameter (fmtp) parsing
//! - Wrap-aware RTP sequence number arithmetic
//! - Protocol constants

pub mod codec;
pub mod error;
pub mod seq;

pub use codec::{AudioFormat, Fmtp};
pub use error::{
    ConstructionError, CryptoError, Error, ParseError, Result, StateError, TransportError,
};
pub use seq::{seq_diff, seq_is_older, seq_max, SequenceRange};

/// AES key length in bytes.
pub const AES_KEY_LEN: usize = 16;

/// AES initialization vector length in bytes.
pub const AES_IV_LEN: usize = 16;

/// Largest packet accepted on any channel, including stream framing.
pub const MAX_PACKET_LEN: usize = 32768;
