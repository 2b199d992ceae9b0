//! The external router transport, reduced to the capability set the
//! control core consumes (spec.md §6, §9 "inheritance-like
//! polymorphism").
//!
//! Grounded directly in the teacher's `LinkSender` trait
//! (`net::interface::LinkSender`): an object-safe, `Send + Sync`
//! capability-set trait selected at construction, with default no-op
//! methods for capabilities a given transport doesn't need. Concrete
//! REST/SSH implementations are out of scope; only the trait and a test
//! double live here.

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueStats {
    pub shaped_rate_bps: i64,
    pub drops_cumulative: u64,
    pub backlog_packets: u64,
    pub backlog_bytes: u64,
}

/// Abstract read/write access to one router's queues and steering rule.
///
/// Implementations may back this with an HTTP client, an SSH session,
/// or (in tests) an in-memory double — the control loops are polymorphic
/// only over this trait, never over a concrete transport.
pub trait RouterSession: Send + Sync {
    fn read_queue_stats(&self, queue_name: &str) -> Result<QueueStats, RouterError>;

    /// Sets the shaper rate for `queue_name`. Idempotent: calling with
    /// the value already in effect must succeed and have no side
    /// effect beyond acknowledging it.
    fn set_queue_rate(&self, queue_name: &str, bps: i64) -> Result<(), RouterError>;

    /// Enables or disables a named steering rule. Only the steering
    /// loop calls this. Idempotent.
    fn set_rule_enabled(&self, _rule_identifier: &str, _enabled: bool) -> Result<(), RouterError> {
        Ok(())
    }
}

/// In-memory double for tests: records every write, optionally scripted
/// to fail, and serves back whatever stats were last configured.
pub struct MockRouterSession {
    pub stats: std::sync::Mutex<QueueStats>,
    pub rate_writes: std::sync::Mutex<Vec<i64>>,
    pub rule_state: std::sync::Mutex<Option<bool>>,
    pub fail_next_write: std::sync::atomic::AtomicBool,
}

impl MockRouterSession {
    pub fn new(initial: QueueStats) -> Self {
        Self {
            stats: std::sync::Mutex::new(initial),
            rate_writes: std::sync::Mutex::new(Vec::new()),
            rule_state: std::sync::Mutex::new(None),
            fail_next_write: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn set_stats(&self, stats: QueueStats) {
        *self.stats.lock().unwrap() = stats;
    }

    pub fn write_count(&self) -> usize {
        self.rate_writes.lock().unwrap().len()
    }
}

impl RouterSession for MockRouterSession {
    fn read_queue_stats(&self, _queue_name: &str) -> Result<QueueStats, RouterError> {
        Ok(*self.stats.lock().unwrap())
    }

    fn set_queue_rate(&self, _queue_name: &str, bps: i64) -> Result<(), RouterError> {
        use std::sync::atomic::Ordering;
        if self.fail_next_write.swap(false, Ordering::SeqCst) {
            return Err(RouterError::Transient("scripted failure".into()));
        }
        self.rate_writes.lock().unwrap().push(bps);
        let mut stats = self.stats.lock().unwrap();
        stats.shaped_rate_bps = bps;
        Ok(())
    }

    fn set_rule_enabled(&self, _rule_identifier: &str, enabled: bool) -> Result<(), RouterError> {
        *self.rule_state.lock().unwrap() = Some(enabled);
        Ok(())
    }
}
