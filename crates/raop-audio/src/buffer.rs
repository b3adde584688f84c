//! Reorder/jitter buffer for incoming audio packets.
//!
//! Packets are stored by sequence number and handed out strictly in order.
//! A hole at the delivery head blocks output until the missing packet shows
//! up, the hole has been open for `gap_timeout`, or too many packets have
//! piled up behind it. All comparisons are wrap-aware.

use raop_core::{seq_diff, seq_is_older, seq_max, SequenceRange};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Largest supported slot count. Must divide 65536 so that slot indices stay
/// unique across the sequence wrap.
const MAX_CAPACITY: usize = 32768;

/// Decrypted audio packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    /// RTP sequence number.
    pub sequence: u16,
    /// RTP timestamp in samples.
    pub timestamp: u32,
    /// Decrypted payload (still codec-encoded).
    pub payload: Vec<u8>,
    /// Local playback time in nanoseconds since the Unix epoch, when known.
    pub playback_ns: Option<u64>,
}

impl AudioFrame {
    pub fn new(sequence: u16, timestamp: u32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            timestamp,
            payload,
            playback_ns: None,
        }
    }
}

/// Reorder buffer tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Number of slots. Rounded up to a power of two.
    pub capacity: usize,
    /// How long a hole at the head may block delivery.
    pub gap_timeout: Duration,
    /// Distance between head and newest packet that forces a skip.
    pub max_gap_span: u16,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: 512,
            gap_timeout: Duration::from_millis(100),
            max_gap_span: 32,
        }
    }
}

/// Result of offering a packet to the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    /// Same sequence number is already buffered.
    Duplicate,
    /// Older than the delivery head.
    Late,
    /// Older than the flush watermark.
    Stale,
}

/// Where a flush moves the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTarget {
    /// Drop everything older than this sequence number.
    Sequence(u16),
    /// Drop everything and forget the stream position.
    All,
}

/// Buffer counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub received: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub late: u64,
    /// Dropped because of a flush.
    pub stale: u64,
    /// Skipped holes.
    pub lost: u64,
    /// Dropped on overflow.
    pub evicted: u64,
}

/// Output of one drain pass.
#[derive(Debug, Default)]
pub struct Drained {
    /// Frames ready for the sink, in sequence order.
    pub frames: Vec<AudioFrame>,
    /// Hole currently blocking delivery.
    pub missing: Option<SequenceRange>,
}

/// Sequence-ordered packet buffer.
pub struct ReorderBuffer {
    config: BufferConfig,
    slots: Vec<Option<AudioFrame>>,
    /// Next sequence number to deliver.
    head: Option<u16>,
    /// Newest admitted sequence number.
    newest: Option<u16>,
    watermark: Option<u16>,
    /// Target of the last applied flush. Outlives the watermark.
    last_flush: Option<u16>,
    blocked_since: Option<Instant>,
    buffered: usize,
    stats: BufferStats,
}

impl ReorderBuffer {
    pub fn new(config: BufferConfig) -> Self {
        let capacity = config.capacity.clamp(1, MAX_CAPACITY).next_power_of_two();
        let max_gap_span = config.max_gap_span.clamp(1, capacity.min(u16::MAX as usize) as u16);
        Self {
            config: BufferConfig {
                capacity,
                max_gap_span,
                ..config
            },
            slots: vec![None; capacity],
            head: None,
            newest: None,
            watermark: None,
            last_flush: None,
            blocked_since: None,
            buffered: 0,
            stats: BufferStats::default(),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.buffered
    }

    pub fn is_empty(&self) -> bool {
        self.buffered == 0
    }

    /// Next sequence number to be delivered.
    pub fn head(&self) -> Option<u16> {
        self.head
    }

    pub fn watermark(&self) -> Option<u16> {
        self.watermark
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    fn index(&self, seq: u16) -> usize {
        seq as usize % self.slots.len()
    }

    /// Offer a packet to the buffer.
    pub fn admit(&mut self, frame: AudioFrame) -> Admission {
        let seq = frame.sequence;
        self.stats.received += 1;

        if let Some(mark) = self.watermark {
            if seq_is_older(seq, mark) {
                trace!("Dropping seq {} below flush watermark {}", seq, mark);
                self.stats.stale += 1;
                return Admission::Stale;
            }
        }

        match self.head {
            None => {
                debug!("Reorder buffer anchored at seq {}", seq);
                self.head = Some(seq);
            }
            Some(head) => {
                let distance = seq_diff(head, seq);
                if distance < 0 {
                    trace!("Dropping late seq {} (head {})", seq, head);
                    self.stats.late += 1;
                    return Admission::Late;
                }
                if distance as usize >= self.capacity() {
                    self.make_room(seq);
                }
            }
        }

        let index = self.index(seq);
        match &self.slots[index] {
            Some(existing) if existing.sequence == seq => {
                self.stats.duplicates += 1;
                return Admission::Duplicate;
            }
            Some(existing) => {
                debug!("Slot {} still held seq {}, replacing", index, existing.sequence);
                self.stats.evicted += 1;
                self.buffered -= 1;
            }
            None => {}
        }

        self.slots[index] = Some(frame);
        self.buffered += 1;
        self.newest = Some(match self.newest {
            Some(newest) => seq_max(newest, seq),
            None => seq,
        });
        Admission::Accepted
    }

    /// `seq` is at least a full buffer ahead of the head.
    fn make_room(&mut self, seq: u16) {
        if self.buffered == 0 {
            debug!(
                "Stream discontinuity: re-anchoring reorder buffer from {:?} to {}",
                self.head, seq
            );
            self.head = Some(seq);
            self.newest = None;
            self.blocked_since = None;
            return;
        }

        let capacity = self.capacity() as i32;
        let mut evicted = 0u64;
        let mut skipped = 0u64;
        while let Some(head) = self.head {
            if seq_diff(head, seq) < capacity {
                break;
            }
            let index = self.index(head);
            match self.slots[index].take() {
                Some(_) => {
                    evicted += 1;
                    self.buffered -= 1;
                }
                None => skipped += 1,
            }
            self.head = Some(head.wrapping_add(1));
        }
        if self.buffered == 0 {
            self.newest = None;
        }
        self.blocked_since = None;
        self.stats.evicted += evicted;
        self.stats.lost += skipped;
        warn!(
            "Reorder buffer overflow at seq {}: evicted {} packets, skipped {}",
            seq, evicted, skipped
        );
    }

    /// Hand out every frame that is ready, skipping a hole at the head once
    /// it has waited long enough.
    pub fn drain(&mut self, now: Instant) -> Drained {
        let mut drained = Drained::default();

        while let Some(head) = self.head {
            if self.buffered == 0 {
                self.blocked_since = None;
                break;
            }

            let index = self.index(head);
            if matches!(&self.slots[index], Some(frame) if frame.sequence == head) {
                if let Some(frame) = self.slots[index].take() {
                    drained.frames.push(frame);
                }
                self.buffered -= 1;
                self.stats.delivered += 1;
                self.head = Some(head.wrapping_add(1));
                self.blocked_since = None;
                continue;
            }

            let hole = self.hole_at(head);
            let span = self.newest.map(|newest| seq_diff(head, newest)).unwrap_or(0);
            let since = *self.blocked_since.get_or_insert(now);
            let timed_out = now.saturating_duration_since(since) >= self.config.gap_timeout;

            if timed_out || span >= self.config.max_gap_span as i32 {
                debug!(
                    "Skipping {} missing packets from seq {} (span {}, timed out {})",
                    hole.count, hole.first, span, timed_out
                );
                self.stats.lost += hole.count as u64;
                self.head = Some(head.wrapping_add(hole.count));
                self.blocked_since = None;
                continue;
            }

            drained.missing = Some(hole);
            break;
        }

        self.retire_watermark();
        drained
    }

    /// Run of empty slots starting at `head`, up to the next buffered frame.
    fn hole_at(&self, head: u16) -> SequenceRange {
        let mut count: u16 = 0;
        let mut seq = head;
        loop {
            let index = self.index(seq);
            if matches!(&self.slots[index], Some(frame) if frame.sequence == seq) {
                break;
            }
            count += 1;
            seq = seq.wrapping_add(1);
            if count as usize >= self.capacity() {
                break;
            }
        }
        SequenceRange::new(head, count)
    }

    /// The hole blocking delivery, if any.
    pub fn missing(&self) -> Option<SequenceRange> {
        let head = self.head?;
        if self.buffered == 0 {
            return None;
        }
        let hole = self.hole_at(head);
        (!hole.is_empty()).then_some(hole)
    }

    /// Once the head is far past the watermark the comparison would become
    /// ambiguous after a wrap.
    fn retire_watermark(&mut self) {
        if let (Some(mark), Some(head)) = (self.watermark, self.head) {
            if seq_diff(mark, head) > self.capacity() as i32 {
                trace!("Retiring flush watermark {}", mark);
                self.watermark = None;
            }
        }
    }

    /// Apply a flush. Returns false when the flush was older than the current
    /// watermark, or older than the head once a previous watermark has been
    /// retired, and had no effect.
    pub fn flush(&mut self, target: FlushTarget) -> bool {
        match target {
            FlushTarget::All => {
                self.stats.stale += self.buffered as u64;
                self.clear();
                true
            }
            FlushTarget::Sequence(next) => {
                match (self.watermark, self.last_flush, self.head) {
                    (Some(mark), _, _) if seq_is_older(next, mark) => {
                        debug!("Ignoring flush to {} behind watermark {}", next, mark);
                        return false;
                    }
                    (None, Some(last), Some(head)) if seq_is_older(next, head) => {
                        debug!(
                            "Ignoring flush to {} behind head {} (last flush {})",
                            next, head, last
                        );
                        return false;
                    }
                    _ => {}
                }

                let mut dropped = 0usize;
                for slot in self.slots.iter_mut() {
                    if matches!(slot, Some(frame) if seq_is_older(frame.sequence, next)) {
                        *slot = None;
                        dropped += 1;
                    }
                }
                self.buffered -= dropped;
                self.stats.stale += dropped as u64;

                self.watermark = Some(next);
                self.last_flush = Some(next);
                self.head = Some(match self.head {
                    Some(head) => seq_max(head, next),
                    None => next,
                });
                if self.buffered == 0 {
                    self.newest = None;
                }
                self.blocked_since = None;
                debug!("Flushed to seq {}, dropped {} packets", next, dropped);
                true
            }
        }
    }

    /// Drop all frames and forget the stream position and watermark.
    /// Counters are kept.
    pub fn clear(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
        self.buffered = 0;
        self.head = None;
        self.newest = None;
        self.watermark = None;
        self.last_flush = None;
        self.blocked_since = None;
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new(BufferConfig::default())
    }
}
