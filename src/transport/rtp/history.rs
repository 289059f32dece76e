//! Inbound sequence number tracking
//!
//! Classifies each arriving RTP sequence number against the highest seen so
//! far, using wrapping 16-bit arithmetic and a 64-entry bitmap of recently
//! received numbers.

/// Width of the duplicate detection window
const WINDOW: u16 = 64;

/// Classification of an arriving sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// First packet of the stream
    First,
    /// Exactly one past the highest seen
    InOrder,
    /// Ahead of the highest seen, `missing` packets skipped
    Gap {
        /// Number of sequence numbers skipped
        missing: u16,
    },
    /// Already received
    Duplicate,
    /// Older than the highest seen and not yet received
    Late,
}

impl SequenceOutcome {
    /// Whether the packet carrying this number should be processed
    #[must_use]
    pub const fn is_fresh(self) -> bool {
        matches!(self, Self::First | Self::InOrder | Self::Gap { .. })
    }
}

/// Tracks the highest sequence number received from one peer.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    highest: Option<u16>,
    /// Bit `n` set when `highest - n` has been received
    window: u64,
}

impl SequenceTracker {
    /// Tracker that has seen nothing
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence number received
    #[must_use]
    pub const fn highest(&self) -> Option<u16> {
        self.highest
    }

    /// Record an arriving sequence number
    pub fn record(&mut self, sequence: u16) -> SequenceOutcome {
        let Some(highest) = self.highest else {
            self.highest = Some(sequence);
            self.window = 1;
            return SequenceOutcome::First;
        };

        #[allow(clippy::cast_possible_wrap)]
        let diff = sequence.wrapping_sub(highest) as i16;

        if diff > 0 {
            let advance = diff.unsigned_abs();
            self.window = if advance >= WINDOW {
                1
            } else {
                (self.window << advance) | 1
            };
            self.highest = Some(sequence);
            return match advance {
                1 => SequenceOutcome::InOrder,
                _ => SequenceOutcome::Gap {
                    missing: advance - 1,
                },
            };
        }

        let behind = diff.unsigned_abs();
        if behind >= WINDOW {
            return SequenceOutcome::Late;
        }
        let bit = 1u64 << behind;
        if self.window & bit != 0 {
            return SequenceOutcome::Duplicate;
        }
        self.window |= bit;
        SequenceOutcome::Late
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order_then_gap() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.record(1), SequenceOutcome::First);
        assert_eq!(tracker.record(2), SequenceOutcome::InOrder);
        assert_eq!(tracker.record(4), SequenceOutcome::Gap { missing: 1 });
        assert_eq!(tracker.record(5), SequenceOutcome::InOrder);
        assert_eq!(tracker.highest(), Some(5));
    }

    #[test]
    fn test_duplicate_and_late() {
        let mut tracker = SequenceTracker::new();
        tracker.record(10);
        tracker.record(12);
        assert_eq!(tracker.record(12), SequenceOutcome::Duplicate);
        assert_eq!(tracker.record(10), SequenceOutcome::Duplicate);
        assert_eq!(tracker.record(11), SequenceOutcome::Late);
        assert_eq!(tracker.record(11), SequenceOutcome::Duplicate);
        assert!(!SequenceOutcome::Late.is_fresh());
    }

    #[test]
    fn test_wraparound_is_in_order() {
        let mut tracker = SequenceTracker::new();
        tracker.record(u16::MAX);
        assert_eq!(tracker.record(0), SequenceOutcome::InOrder);
        assert_eq!(tracker.record(u16::MAX), SequenceOutcome::Duplicate);
    }

    #[test]
    fn test_far_behind_is_late() {
        let mut tracker = SequenceTracker::new();
        tracker.record(1000);
        assert_eq!(tracker.record(900), SequenceOutcome::Late);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_replayed_sequence_never_fresh(start in any::<u16>(), steps in proptest::collection::vec(1u16..8, 1..40)) {
                let mut tracker = SequenceTracker::new();
                let mut seen = vec![start];
                tracker.record(start);
                let mut current = start;
                for step in steps {
                    current = current.wrapping_add(step);
                    prop_assert!(tracker.record(current).is_fresh());
                    seen.push(current);
                }
                let recent = seen
                    .iter()
                    .filter(|sequence| current.wrapping_sub(**sequence) < WINDOW);
                for sequence in recent {
                    prop_assert_eq!(tracker.record(*sequence), SequenceOutcome::Duplicate);
                }
            }
        }
    }
}
