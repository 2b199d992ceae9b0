//! Concrete [`RouterSession`] shipped with the binary.
//!
//! A real HTTP/SSH router transport is an explicit non-goal (spec.md §1);
//! this implementation logs every read/write at `info` level and
//! otherwise behaves as a no-op success, so the daemon is runnable
//! end-to-end (observable decisions, no applied changes) without one.
//! Production deployments are expected to provide their own
//! [`RouterSession`] impl against their router's actual control plane.

use wanctl_core::error::RouterError;
use wanctl_core::router::{QueueStats, RouterSession};

pub struct LoggingRouterSession;

impl RouterSession for LoggingRouterSession {
    fn read_queue_stats(&self, queue_name: &str) -> Result<QueueStats, RouterError> {
        tracing::debug!(queue_name, "read_queue_stats (no-op transport, zeroed stats)");
        Ok(QueueStats::default())
    }

    fn set_queue_rate(&self, queue_name: &str, bps: i64) -> Result<(), RouterError> {
        tracing::info!(queue_name, bps, "set_queue_rate (no-op transport, not applied)");
        Ok(())
    }

    fn set_rule_enabled(&self, rule_identifier: &str, enabled: bool) -> Result<(), RouterError> {
        tracing::info!(rule_identifier, enabled, "set_rule_enabled (no-op transport, not applied)");
        Ok(())
    }
}
