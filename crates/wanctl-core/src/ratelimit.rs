//! Sliding-window limiter on router-write frequency.
//!
//! Generalized from the cadence-gating idiom in the teacher's bitrate
//! adapter (a single `min_interval` gap check) into a proper sliding
//! window of recent event timestamps, since router writes need a hard
//! cap on count-per-window rather than just a minimum spacing.

use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::Instant;

pub struct SlidingWindowLimiter {
    max_events: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl SlidingWindowLimiter {
    pub fn new(max_events: usize, window: Duration) -> Self {
        Self {
            max_events,
            window,
            events: VecDeque::new(),
        }
    }

    /// Drops timestamps older than `now - window`, then admits the new
    /// event if the remaining count is still under the cap.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.events.front() {
            if now.duration_since(front) > self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }

        if self.events.len() < self.max_events {
            self.events.push_back(now);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};

    #[test]
    fn admits_up_to_max_events_per_window() {
        let clock = ManualClock::new();
        let mut lim = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        assert!(lim.try_acquire(clock.now()));
        assert!(lim.try_acquire(clock.now()));
        assert!(lim.try_acquire(clock.now()));
        assert!(!lim.try_acquire(clock.now()));
    }

    #[test]
    fn expired_events_free_capacity() {
        let clock = ManualClock::new();
        let mut lim = SlidingWindowLimiter::new(1, Duration::from_secs(10));
        assert!(lim.try_acquire(clock.now()));
        assert!(!lim.try_acquire(clock.now()));
        clock.advance(Duration::from_secs(11));
        assert!(lim.try_acquire(clock.now()));
    }

    /// Mirrors scenario 5 of the spec: 10 writes admitted, 5 denied
    /// inside a 60s window when 15 are attempted within 10s.
    #[test]
    fn scenario_fifteen_writes_ten_seconds() {
        let clock = ManualClock::new();
        let mut lim = SlidingWindowLimiter::new(10, Duration::from_secs(60));
        let mut admitted = 0;
        let mut denied = 0;
        for _ in 0..15 {
            if lim.try_acquire(clock.now()) {
                admitted += 1;
            } else {
                denied += 1;
            }
            clock.advance(Duration::from_millis(700));
        }
        assert_eq!(admitted, 10);
        assert_eq!(denied, 5);
    }
}
