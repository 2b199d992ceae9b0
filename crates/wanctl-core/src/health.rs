//! In-process health snapshot aggregator (spec.md §4.8).
//!
//! Grounded in `BondingRuntime::get_metrics`/`metrics_handle`
//! (`runtime.rs`): a shared snapshot written by each worker loop and
//! cloned out for external readers, here one entry per WAN plus an
//! optional steering summary rather than a `HashMap<usize, LinkMetrics>`.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::state::{DownlinkState, UplinkState, WanState};
use crate::steering::{SteeringRecord, SteeringState};
use crate::watchdog::Watchdog;

#[derive(Debug, Clone, Serialize)]
pub struct WanHealthRecord {
    pub name: String,
    pub baseline_rtt_ewma_ms: f64,
    pub loaded_rtt_ewma_ms: f64,
    pub last_delta_ms: f64,
    pub downlink_state: DownlinkState,
    pub uplink_state: UplinkState,
    pub downlink_rate_bps: i64,
    pub uplink_rate_bps: i64,
    pub consecutive_failures: u64,
    pub cycle_count: u64,
    pub downlink_throttled_count: u64,
    pub uplink_throttled_count: u64,
    pub healthy: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SteeringHealthRecord {
    pub state: SteeringState,
    pub consecutive_bad: u64,
    pub consecutive_good: u64,
    pub active_duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_seconds: u64,
    pub consecutive_failures: u64,
    pub wans: Vec<WanHealthRecord>,
    pub steering: Option<SteeringHealthRecord>,
}

/// One named WAN entry the aggregator polls each request: the most
/// recently published [`WanState`] snapshot (read-only, written by the
/// owning autorate thread into a shared `Arc<Mutex<WanState>>` each
/// cycle — the same "worker thread publishes, external readers clone
/// out" shape as `BondingRuntime::metrics_handle`) alongside the
/// watchdog that same thread updates every cycle.
pub struct WanHandle<'a> {
    pub name: &'a str,
    pub state: &'a WanState,
    pub watchdog: &'a Watchdog,
}

/// Read-only fan-in over every running loop's state, queried fresh on
/// every health request rather than cached (spec.md §4.8 "read-only;
/// no reader can influence control").
pub struct HealthAggregator {
    start_unix_secs: u64,
    stale_after_secs: u64,
}

impl HealthAggregator {
    pub fn new(stale_after_secs: u64) -> Self {
        Self {
            start_unix_secs: now_unix_secs(),
            stale_after_secs,
        }
    }

    pub fn snapshot(&self, wans: &[WanHandle<'_>], steering: Option<&SteeringRecord>) -> HealthSnapshot {
        let mut records = Vec::with_capacity(wans.len());
        let mut any_unhealthy = false;
        let mut total_consecutive_failures = 0;

        for wan in wans {
            let healthy = wan.watchdog.is_healthy(self.stale_after_secs);
            any_unhealthy |= !healthy;
            let state = wan.state;
            total_consecutive_failures += state.consecutive_failures;
            records.push(WanHealthRecord {
                name: wan.name.to_string(),
                baseline_rtt_ewma_ms: state.baseline_rtt_ewma_ms,
                loaded_rtt_ewma_ms: state.loaded_rtt_ewma_ms,
                last_delta_ms: state.loaded_rtt_ewma_ms - state.baseline_rtt_ewma_ms,
                downlink_state: state.downlink.state,
                uplink_state: state.uplink.state,
                downlink_rate_bps: state.downlink.common.current_rate_bps,
                uplink_rate_bps: state.uplink.common.current_rate_bps,
                consecutive_failures: state.consecutive_failures,
                cycle_count: state.cycle_count,
                downlink_throttled_count: state.downlink_throttled_count,
                uplink_throttled_count: state.uplink_throttled_count,
                healthy,
            });
        }

        let steering_record = steering.map(|record| {
            let active_duration_secs = if record.state == SteeringState::PrimaryDegraded {
                (now_unix_secs() as f64 - record.last_transition_secs).max(0.0)
            } else {
                0.0
            };
            SteeringHealthRecord {
                state: record.state,
                consecutive_bad: record.consecutive_bad,
                consecutive_good: record.consecutive_good,
                active_duration_secs,
            }
        });

        HealthSnapshot {
            status: if any_unhealthy { "degraded" } else { "healthy" },
            uptime_seconds: now_unix_secs().saturating_sub(self.start_unix_secs),
            consecutive_failures: total_consecutive_failures,
            wans: records,
            steering: steering_record,
        }
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
