//! RTP sequence number arithmetic.
//!
//! Sequence numbers are 16 bits and wrap. Ordering is defined by the signed
//! modular distance: `b` is newer than `a` when `b - a (mod 2^16)` lies in
//! `1..=32767`. The exact half-way distance (32768) counts as older.

/// Signed distance from `from` to `to`, in `-32768..=32767`.
///
/// Positive when `to` is newer than `from`.
pub fn seq_diff(from: u16, to: u16) -> i32 {
    to.wrapping_sub(from) as i16 as i32
}

/// True when `seq` comes strictly before `reference`.
pub fn seq_is_older(seq: u16, reference: u16) -> bool {
    seq_diff(reference, seq) < 0
}

/// The newer of two sequence numbers.
pub fn seq_max(a: u16, b: u16) -> u16 {
    if seq_diff(a, b) > 0 {
        b
    } else {
        a
    }
}

/// A contiguous run of sequence numbers, possibly crossing the wrap point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceRange {
    pub first: u16,
    pub count: u16,
}

impl SequenceRange {
    pub fn new(first: u16, count: u16) -> Self {
        Self { first, count }
    }

    /// Last sequence number in the run. Equal to `first` for an empty run.
    pub fn last(&self) -> u16 {
        self.first.wrapping_add(self.count.saturating_sub(1))
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn contains(&self, seq: u16) -> bool {
        let offset = seq.wrapping_sub(self.first);
        offset < self.count
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        let first = self.first;
        (0..self.count).map(move |i| first.wrapping_add(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod diff {
        use super::*;

        #[test]
        fn simple_distances() {
            assert_eq!(seq_diff(100, 101), 1);
            assert_eq!(seq_diff(101, 100), -1);
            assert_eq!(seq_diff(7, 7), 0);
        }

        #[test]
        fn across_wrap() {
            assert_eq!(seq_diff(65535, 0), 1);
            assert_eq!(seq_diff(0, 65535), -1);
            assert_eq!(seq_diff(65530, 5), 11);
            assert_eq!(seq_diff(5, 65530), -11);
        }

        #[test]
        fn half_way_counts_as_older() {
            assert_eq!(seq_diff(0, 32768), -32768);
            assert!(seq_is_older(32768, 0));
            assert_eq!(seq_diff(0, 32767), 32767);
            assert!(!seq_is_older(32767, 0));
        }

        #[test]
        fn exhaustive_against_reference_points() {
            // Every sequence value against references at and around the wrap.
            for reference in [0u16, 1, 1000, 32767, 32768, 65534, 65535] {
                for seq in 0..=u16::MAX {
                    let diff = seq_diff(reference, seq);
                    assert!((-32768..=32767).contains(&diff));
                    // Moving forward by the distance lands back on seq.
                    assert_eq!(reference.wrapping_add(diff as u16), seq);
                    assert_eq!(seq_is_older(seq, reference), diff < 0);
                }
            }
        }

        #[test]
        fn antisymmetric_except_half_way() {
            let mut a: u16 = 0;
            for _ in 0..20_000 {
                // Walk a coprime stride so pairs cover the whole ring.
                a = a.wrapping_add(7919);
                for offset in [1u16, 2, 511, 512, 30000, 32767, 32769, 65535] {
                    let b = a.wrapping_add(offset);
                    assert_eq!(seq_diff(a, b), -seq_diff(b, a), "a={} b={}", a, b);
                    assert_ne!(seq_is_older(a, b), seq_is_older(b, a));
                }
            }
        }

        #[test]
        fn max_is_wrap_aware() {
            assert_eq!(seq_max(65535, 2), 2);
            assert_eq!(seq_max(2, 65535), 2);
            assert_eq!(seq_max(10, 9), 10);
            assert_eq!(seq_max(4, 4), 4);
        }
    }

    mod range {
        use super::*;

        #[test]
        fn last_and_contains() {
            let range = SequenceRange::new(100, 3);
            assert_eq!(range.last(), 102);
            assert!(range.contains(100));
            assert!(range.contains(102));
            assert!(!range.contains(103));
            assert!(!range.contains(99));
        }

        #[test]
        fn wraps() {
            let range = SequenceRange::new(65534, 4);
            assert_eq!(range.last(), 1);
            assert_eq!(range.iter().collect::<Vec<_>>(), vec![65534, 65535, 0, 1]);
            assert!(range.contains(0));
            assert!(!range.contains(2));
        }

        #[test]
        fn empty() {
            let range = SequenceRange::new(5, 0);
            assert!(range.is_empty());
            assert!(!range.contains(5));
            assert_eq!(range.iter().count(), 0);
        }
    }
}
