//! Per-direction receive sequencing.
//!
//! Sequence numbers are monotone per direction and wrap with 32-bit
//! arithmetic. The window accepts the expected number, buffers up to
//! [SEQUENCE_WINDOW] frames ahead, drops stale duplicates, and reports when
//! a gap has been outstanding long enough to warrant a `Service/Resend`.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// How far ahead of the expected sequence a frame may be buffered
pub const SEQUENCE_WINDOW: u32 = 256;

/// What to do with an offered frame
#[derive(Debug, Eq, PartialEq)]
pub enum SequenceDecision<T> {
    /// In order; process now, then drain [SequenceWindow::pop_ready]
    Deliver(T),
    /// Ahead of the expected number; buffered until the gap fills
    Buffered,
    /// Already seen; dropped silently
    Duplicate,
    /// Beyond the window; a protocol violation
    TooFar,
}

/// Reorder window over wrapping `u32` sequence numbers
pub struct SequenceWindow<T> {
    expected: u32,
    buffered: BTreeMap<u32, T>,
    gap_since: Option<Instant>,
}

impl<T> SequenceWindow<T> {
    pub fn new(initial: u32) -> Self {
        Self {
            expected: initial,
            buffered: BTreeMap::new(),
            gap_since: None,
        }
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    /// Classifies `seq`. `Deliver` hands the item back and advances the
    /// window; the caller should then drain [Self::pop_ready]. `Buffered`
    /// keeps the item until its gap fills.
    pub fn offer(&mut self, seq: u32, item: T) -> SequenceDecision<T> {
        let distance = seq.wrapping_sub(self.expected);

        if distance == 0 {
            self.expected = self.expected.wrapping_add(1);
            if self.buffered.is_empty() {
                self.gap_since = None;
            }
            return SequenceDecision::Deliver(item);
        }

        if distance <= SEQUENCE_WINDOW {
            if self.buffered.insert(seq, item).is_none() && self.gap_since.is_none() {
                self.gap_since = Some(Instant::now());
            }
            return SequenceDecision::Buffered;
        }

        // wrap-aware: anything in the trailing half-range is history
        if distance > u32::MAX / 2 {
            return SequenceDecision::Duplicate;
        }

        SequenceDecision::TooFar
    }

    /// Pops the next in-order buffered item, if the gap has been filled
    pub fn pop_ready(&mut self) -> Option<T> {
        let item = self.buffered.remove(&self.expected)?;
        self.expected = self.expected.wrapping_add(1);
        if self.buffered.is_empty() {
            self.gap_since = None;
        }
        Some(item)
    }

    /// The sequence number to request when a gap has been outstanding
    /// longer than `rtt_max`
    pub fn needs_resend(&self, rtt_max: Duration) -> Option<u32> {
        let since = self.gap_since?;
        (since.elapsed() > rtt_max).then_some(self.expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_order_delivery_advances() {
        let mut window: SequenceWindow<&str> = SequenceWindow::new(0);
        assert_eq!(window.offer(0, "a"), SequenceDecision::Deliver("a"));
        assert_eq!(window.offer(1, "b"), SequenceDecision::Deliver("b"));
        assert_eq!(window.expected(), 2);
        assert!(window.pop_ready().is_none());
    }

    #[test]
    fn out_of_order_frames_buffer_and_drain_in_order() {
        let mut window: SequenceWindow<u8> = SequenceWindow::new(10);
        assert_eq!(window.offer(12, 12), SequenceDecision::Buffered);
        assert_eq!(window.offer(11, 11), SequenceDecision::Buffered);
        assert_eq!(window.offer(10, 10), SequenceDecision::Deliver(10));
        assert_eq!(window.pop_ready(), Some(11));
        assert_eq!(window.pop_ready(), Some(12));
        assert_eq!(window.pop_ready(), None);
        assert_eq!(window.expected(), 13);
    }

    #[test]
    fn duplicates_are_dropped() {
        let mut window: SequenceWindow<()> = SequenceWindow::new(5);
        assert_eq!(window.offer(5, ()), SequenceDecision::Deliver(()));
        assert_eq!(window.offer(5, ()), SequenceDecision::Duplicate);
        assert_eq!(window.offer(4, ()), SequenceDecision::Duplicate);
    }

    #[test]
    fn window_bound_is_enforced() {
        let mut window: SequenceWindow<()> = SequenceWindow::new(0);
        assert_eq!(window.offer(SEQUENCE_WINDOW, ()), SequenceDecision::Buffered);
        assert_eq!(window.offer(SEQUENCE_WINDOW + 1, ()), SequenceDecision::TooFar);
    }

    #[test]
    fn sequence_wraps_cleanly() {
        let mut window: SequenceWindow<&str> = SequenceWindow::new(u32::MAX);
        assert_eq!(window.offer(u32::MAX, "last"), SequenceDecision::Deliver("last"));
        assert_eq!(window.expected(), 0);
        assert_eq!(window.offer(1, "ahead"), SequenceDecision::Buffered);
        assert_eq!(window.offer(0, "now"), SequenceDecision::Deliver("now"));
        assert_eq!(window.pop_ready(), Some("ahead"));
    }

    #[test]
    fn resend_is_requested_only_after_the_gap_ages() {
        let mut window: SequenceWindow<()> = SequenceWindow::new(0);
        assert!(window.needs_resend(Duration::ZERO).is_none());
        assert_eq!(window.offer(2, ()), SequenceDecision::Buffered);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(window.needs_resend(Duration::from_millis(1)), Some(0));
        assert!(window.needs_resend(Duration::from_secs(60)).is_none());
    }
}
