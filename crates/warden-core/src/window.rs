//! Sliding-window request counter.
//!
//! The counter is generic over the instant type so the runtime can drive it
//! with `tokio::time::Instant` (pausable in tests) while plain callers use
//! `std::time::Instant`.

use std::collections::VecDeque;
use std::ops::Sub;
use std::time::Duration;

/// Outcome of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowDecision {
    pub allowed: bool,

    /// Time until the oldest counted event leaves the window (zero when allowed)
    pub retry_after: Duration,

    /// Requests left in the window after this one (`u32::MAX` when unlimited)
    pub remaining: u32,
}

impl WindowDecision {
    /// Retry delay rounded up to whole seconds; at least 1 when denied.
    pub fn retry_after_secs(&self) -> u64 {
        if self.allowed {
            return 0;
        }
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 { secs + 1 } else { secs };
        rounded.max(1)
    }
}

/// Timestamps of recent events inside a trailing window.
///
/// The deque never holds more than `limit` entries, since an event is only
/// recorded when it is allowed.
#[derive(Debug, Clone)]
pub struct SlidingWindow<I> {
    window: Duration,
    events: VecDeque<I>,
}

impl<I> SlidingWindow<I>
where
    I: Copy + Ord + Sub<I, Output = Duration>,
{
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            events: VecDeque::new(),
        }
    }

    /// Drop events that have left the window.
    pub fn prune(&mut self, now: I) {
        while let Some(&oldest) = self.events.front() {
            if now - oldest >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Check and, if allowed, record an event at `now`.
    ///
    /// `limit` of `None` is unlimited; nothing is recorded for it.
    pub fn check(&mut self, now: I, limit: Option<u32>) -> WindowDecision {
        self.prune(now);

        let Some(limit) = limit else {
            return WindowDecision {
                allowed: true,
                retry_after: Duration::ZERO,
                remaining: u32::MAX,
            };
        };

        let count = self.events.len() as u32;
        if count < limit {
            self.events.push_back(now);
            return WindowDecision {
                allowed: true,
                retry_after: Duration::ZERO,
                remaining: limit - count - 1,
            };
        }

        // After a lower limit takes effect the window can hold more than
        // `limit` events; a slot frees once all but `limit - 1` have aged out.
        let retry_after = self
            .events
            .get(self.events.len() - limit as usize)
            .map(|&blocking| self.window.saturating_sub(now - blocking))
            .unwrap_or(self.window);

        WindowDecision {
            allowed: false,
            retry_after,
            remaining: 0,
        }
    }

    /// Number of events currently counted (without pruning).
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Instant;

    #[test]
    fn test_guest_eleventh_call_rejected() {
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        let start = Instant::now();

        for i in 0..10 {
            let decision = window.check(start + Duration::from_secs(i), Some(10));
            assert!(decision.allowed, "call {} should be allowed", i + 1);
        }

        let decision = window.check(start + Duration::from_secs(30), Some(10));
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Duration::from_secs(30));
        assert_eq!(decision.retry_after_secs(), 30);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_allowed_after_window_elapses() {
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..10 {
            window.check(start, Some(10));
        }
        assert!(!window.check(start + Duration::from_secs(59), Some(10)).allowed);

        let decision = window.check(start + Duration::from_secs(60), Some(10));
        assert!(decision.allowed);
        assert_eq!(window.len(), 1);
    }

    #[test]
    fn test_unlimited_records_nothing() {
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(window.check(now, None).allowed);
        }
        assert!(window.is_empty());
    }

    #[test]
    fn test_retry_after_when_limit_lowered() {
        let mut window = SlidingWindow::new(Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..5 {
            assert!(window.check(start + Duration::from_secs(i), Some(5)).allowed);
        }

        // Limit drops to 2: events at 0s..3s must all age out first
        let decision = window.check(start + Duration::from_secs(10), Some(2));
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Duration::from_secs(53));

        assert!(!window.check(start + Duration::from_secs(62), Some(2)).allowed);
        assert!(window.check(start + Duration::from_secs(63), Some(2)).allowed);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let decision = WindowDecision {
            allowed: false,
            retry_after: Duration::from_millis(1),
            remaining: 0,
        };
        assert_eq!(decision.retry_after_secs(), 1);
    }

    proptest! {
        #[test]
        fn prop_never_exceeds_limit_within_window(
            gaps in proptest::collection::vec(0u64..5_000, 1..200),
            limit in 1u32..20,
        ) {
            let mut window = SlidingWindow::new(Duration::from_secs(60));
            let start = Instant::now();
            let mut offset = 0u64;
            let mut allowed_at: Vec<u64> = Vec::new();

            for gap in gaps {
                offset += gap;
                let now = start + Duration::from_millis(offset);
                let decision = window.check(now, Some(limit));
                if decision.allowed {
                    allowed_at.push(offset);
                } else {
                    prop_assert!(decision.retry_after_secs() > 0);
                }
                let in_window = allowed_at
                    .iter()
                    .filter(|&&t| offset - t < 60_000)
                    .count();
                prop_assert!(in_window as u32 <= limit);
                prop_assert!(window.len() as u32 <= limit);
            }
        }
    }
}
