//! # raop-crypto
//!
//! Cryptographic primitives for RAOP audio streaming.
//!
//! RAOP senders encrypt each audio packet independently with AES-128-CBC,
//! restarting the chain from the session IV for every packet. Key material
//! is zeroized on drop.

pub mod aes;

pub use crate::aes::AesCbcCipher;
