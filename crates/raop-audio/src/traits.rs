//! Output sink abstraction.

use crate::AudioFrame;
use raop_core::{AudioFormat, Error};

/// Receives ordered, decrypted audio from a session (enables testing with mocks).
///
/// Callbacks run on session worker threads while the session's playout lock
/// is held, so implementations must not call back into the session.
#[cfg_attr(test, mockall::automock)]
pub trait AudioSink: Send + Sync {
    /// Stream is starting with this format.
    fn start(&self, format: &AudioFormat);

    /// Next frame in sequence order.
    fn process(&self, frame: &AudioFrame);

    /// Volume changed (dB attenuation, -144.0 is mute).
    fn set_volume(&self, volume: f32);

    /// Buffered audio was discarded.
    fn flush(&self);

    /// Stream stopped.
    fn stop(&self);

    /// A channel failed and the session stopped receiving.
    fn transport_failed(&self, _error: &Error) {}
}
