//! Monotonic time source, isolated for testability.
//!
//! Control-loop gating (cycle cadence, rate-limiter windows, lock
//! staleness) is built against `quanta::Instant` rather than
//! `std::time::Instant`, following the teacher's use of `quanta` for
//! cadence gating in its bitrate adapter.

use std::time::Duration;

/// Abstracts "now" so loop and rate-limiter tests can drive time
/// deterministically instead of sleeping in real wall time.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Thin wrapper over `quanta::Instant` so callers never import `quanta`
/// directly; keeps the clock source swappable without touching call
/// sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(quanta::Instant);

impl Instant {
    pub fn duration_since(&self, earlier: Instant) -> Duration {
        self.0.saturating_duration_since(earlier.0)
    }

    pub fn checked_add(&self, d: Duration) -> Option<Instant> {
        self.0.checked_add(d).map(Instant)
    }
}

/// Real monotonic clock backed by `quanta::Clock`.
#[derive(Clone, Default)]
pub struct SystemClock {
    inner: quanta::Clock,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            inner: quanta::Clock::new(),
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant(self.inner.now())
    }
}

/// Test double: time only advances when explicitly told to. Grounded in
/// the same "inject a fake clock, advance it by hand" style the pack's
/// control-loop tests use for deterministic cadence assertions.
pub struct ManualClock {
    current: std::sync::Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            current: std::sync::Mutex::new(SystemClock::new().now()),
        }
    }

    pub fn advance(&self, d: Duration) {
        let mut guard = self.current.lock().unwrap();
        *guard = guard.checked_add(d).expect("manual clock overflow");
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock().unwrap()
    }
}
