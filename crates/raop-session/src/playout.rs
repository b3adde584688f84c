//! Ordered delivery into the sink.

use raop_audio::{Admission, AudioFrame, AudioSink, BufferConfig, BufferStats, FlushTarget, ReorderBuffer};
use raop_core::{AudioFormat, Error, SequenceRange};
use std::sync::Arc;
use std::time::Instant;
use tracing::trace;

/// Reorder buffer plus the sink it drains into. All sink callbacks go
/// through here, under the session's playout lock.
pub(crate) struct Playout {
    buffer: ReorderBuffer,
    sink: Arc<dyn AudioSink>,
    applied_volume: Option<f32>,
}

impl Playout {
    pub(crate) fn new(config: BufferConfig, sink: Arc<dyn AudioSink>) -> Self {
        Self {
            buffer: ReorderBuffer::new(config),
            sink,
            applied_volume: None,
        }
    }

    /// Announce a new stream to the sink.
    pub(crate) fn start(&mut self, format: &AudioFormat, volume: f32) {
        self.buffer.clear();
        self.sink.start(format);
        self.sink.set_volume(volume);
        self.applied_volume = Some(volume);
    }

    /// Admit a frame and deliver whatever became ready.
    pub(crate) fn push(
        &mut self,
        frame: AudioFrame,
        now: Instant,
        volume: f32,
    ) -> (Admission, Option<SequenceRange>) {
        let sequence = frame.sequence;
        let admission = self.buffer.admit(frame);
        if admission != Admission::Accepted {
            trace!("Packet {} not admitted: {:?}", sequence, admission);
        }
        (admission, self.deliver(now, volume))
    }

    /// Deliver ready frames and apply pending volume changes. Returns the hole
    /// blocking delivery, if any.
    pub(crate) fn deliver(&mut self, now: Instant, volume: f32) -> Option<SequenceRange> {
        self.apply_volume(volume);
        let drained = self.buffer.drain(now);
        for frame in &drained.frames {
            self.sink.process(frame);
        }
        drained.missing
    }

    fn apply_volume(&mut self, volume: f32) {
        if self.applied_volume != Some(volume) {
            self.sink.set_volume(volume);
            self.applied_volume = Some(volume);
        }
    }

    /// Returns true when the flush took effect.
    pub(crate) fn flush(&mut self, target: FlushTarget) -> bool {
        let applied = self.buffer.flush(target);
        if applied {
            self.sink.flush();
        }
        applied
    }

    pub(crate) fn stop(&mut self) {
        self.buffer.clear();
        self.applied_volume = None;
        self.sink.stop();
    }

    pub(crate) fn report_failure(&self, error: &Error) {
        self.sink.transport_failed(error);
    }

    pub(crate) fn stats(&self) -> BufferStats {
        self.buffer.stats()
    }
}
