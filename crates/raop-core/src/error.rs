//! Error types for the RAOP receiver.

use thiserror::Error;

/// Primary error type for all session operations.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Construction error: {0}")]
    Construction(#[from] ConstructionError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid state: {0}")]
    State(#[from] StateError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while creating a session. No session is produced.
#[derive(Error, Debug)]
pub enum ConstructionError {
    #[error("Invalid AES key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid AES IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    #[error("Invalid fmtp: {0}")]
    InvalidFmtp(#[from] ParseError),
}

/// Errors on the network channels.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind {channel} channel: {source}")]
    Bind {
        channel: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to spawn {0} worker")]
    Spawn(&'static str),

    #[error("Receive on {channel} channel failed {count} times in a row: {last}")]
    ReceiveFailed {
        channel: &'static str,
        count: u32,
        last: std::io::Error,
    },

    #[error("Channel not started")]
    NotStarted,
}

/// Operation called in a lifecycle state that does not allow it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    #[error("{operation} is not allowed while {state}")]
    InvalidTransition {
        operation: &'static str,
        state: &'static str,
    },
}

/// Cryptographic operation errors.
#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },
}

/// Parsing errors for packets and parameter strings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Packet too short: need {needed} bytes, got {actual}")]
    TooShort { needed: usize, actual: usize },

    #[error("Packet too long: {0} bytes")]
    TooLong(usize),

    #[error("Unexpected payload type {0}")]
    UnexpectedPayloadType(u8),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

/// Convenience Result type.
pub type Result<T> = std::result::Result<T, Error>;
