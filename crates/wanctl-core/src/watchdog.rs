//! Per-loop liveness tracking consumed by the health snapshot (spec.md
//! §4.8, SPEC_FULL.md §4.15).
//!
//! Grounded in `BondingRuntime::metrics_handle` (`runtime.rs`): an
//! `Arc<Mutex<..>>` snapshot written by the owning worker thread and
//! read by anything holding a clone of the handle, here narrowed to a
//! single last-beat timestamp plus a withheld flag instead of a whole
//! metrics map.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Copy)]
struct Beat {
    last_unix_secs: u64,
    withheld: bool,
}

/// Shared liveness handle for one control loop. Clone to hand a read
/// side to the health aggregator; the loop itself calls `heartbeat()`
/// or `withhold()` once per cycle.
#[derive(Clone)]
pub struct Watchdog {
    inner: Arc<Mutex<Beat>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Beat {
                last_unix_secs: now_unix_secs(),
                withheld: false,
            })),
        }
    }

    /// Record a successful cycle.
    pub fn heartbeat(&self) {
        let mut beat = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        beat.last_unix_secs = now_unix_secs();
        beat.withheld = false;
    }

    /// Record a cycle that hit the consecutive-failure ceiling
    /// (spec.md §4.6(a)): the timestamp still advances — the loop is
    /// alive — but `is_healthy` flips false until the next `heartbeat`.
    pub fn withhold(&self) {
        let mut beat = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        beat.last_unix_secs = now_unix_secs();
        beat.withheld = true;
    }

    pub fn last_beat_unix_secs(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).last_unix_secs
    }

    /// Healthy means a beat landed within `stale_after_secs` and it
    /// wasn't a withheld one.
    pub fn is_healthy(&self, stale_after_secs: u64) -> bool {
        let beat = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        !beat.withheld && now_unix_secs().saturating_sub(beat.last_unix_secs) <= stale_after_secs
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_watchdog_is_healthy() {
        let wd = Watchdog::new();
        assert!(wd.is_healthy(30));
    }

    #[test]
    fn withhold_marks_unhealthy_until_next_heartbeat() {
        let wd = Watchdog::new();
        wd.withhold();
        assert!(!wd.is_healthy(30));
        wd.heartbeat();
        assert!(wd.is_healthy(30));
    }

    #[test]
    fn stale_beat_is_unhealthy() {
        let wd = Watchdog::new();
        {
            let mut beat = wd.inner.lock().unwrap();
            beat.last_unix_secs = 0;
        }
        assert!(!wd.is_healthy(30));
    }

    #[test]
    fn clone_shares_the_same_beat() {
        let wd = Watchdog::new();
        let reader = wd.clone();
        wd.withhold();
        assert!(!reader.is_healthy(30));
    }
}
