//! Steering controller: multi-signal composite verdict driving a binary
//! routing-policy toggle with asymmetric hysteresis (spec.md §4.7).
//!
//! The hysteresis state machine — separate activation/deactivation
//! thresholds, counters reset on any contrary classification — is
//! grounded directly in the teacher's `ModemSupervisor::check_link_status`
//! (`modem::supervisor`), generalized from a per-link health score to a
//! three-signal (RTT, drops, queue backlog) composite and from a
//! health-event list to a single router rule enable/disable call.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::{SteeringConfig, Thresholds};
use crate::ewma::Ewma;
use crate::probe::{Measurement, ProbeKind};
use crate::router::{QueueStats, RouterSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SteeringState {
    PrimaryGood,
    PrimaryDegraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringRecord {
    pub state: SteeringState,
    pub consecutive_bad: u64,
    pub consecutive_good: u64,
    pub last_transition_secs: f64,
    /// Bounded recent-activation history for flap detection, serialized
    /// as seconds-since-epoch timestamps.
    pub activation_history_unix_secs: VecDeque<u64>,
}

impl SteeringRecord {
    pub fn initial() -> Self {
        Self {
            state: SteeringState::PrimaryGood,
            consecutive_bad: 0,
            consecutive_good: 0,
            last_transition_secs: 0.0,
            activation_history_unix_secs: VecDeque::new(),
        }
    }
}

/// One cycle's classification of each of the three signals, severity
/// ordered so the composite rule can take `max` where appropriate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SignalVerdict {
    Green,
    Yellow,
    Red,
}

fn rtt_verdict(delta_ms: f64, t: &Thresholds) -> SignalVerdict {
    if delta_ms <= t.target_bloat_ms {
        SignalVerdict::Green
    } else if delta_ms <= t.warn_bloat_ms {
        SignalVerdict::Yellow
    } else if delta_ms > t.hard_red_bloat_ms {
        SignalVerdict::Red
    } else {
        SignalVerdict::Yellow
    }
}

/// Composite verdict: RED only if RTT says RED *and* at least one of
/// (drops, queue) corroborates; YELLOW if any single signal is
/// YELLOW-or-worse; otherwise GREEN (spec.md §4.7 step 4, P8). Steering
/// never fires on RTT alone.
fn composite_verdict(rtt: SignalVerdict, drops_bad: bool, queue_bad: bool) -> SignalVerdict {
    if rtt == SignalVerdict::Red && (drops_bad || queue_bad) {
        return SignalVerdict::Red;
    }
    if rtt >= SignalVerdict::Yellow || drops_bad || queue_bad {
        return SignalVerdict::Yellow;
    }
    SignalVerdict::Green
}

/// Tracks drop-count deltas across cycles to decide the "rate of
/// increase over the last several cycles" drops verdict.
struct DropsTracker {
    history: VecDeque<u64>,
    window: usize,
    threshold_per_cycle: f64,
}

impl DropsTracker {
    fn new(window: usize, threshold_per_cycle: f64) -> Self {
        Self {
            history: VecDeque::with_capacity(window + 1),
            window,
            threshold_per_cycle,
        }
    }

    fn push_and_verdict(&mut self, cumulative_drops: u64) -> bool {
        self.history.push_back(cumulative_drops);
        while self.history.len() > self.window + 1 {
            self.history.pop_front();
        }
        if self.history.len() < 2 {
            return false;
        }
        let first = *self.history.front().unwrap();
        let last = *self.history.back().unwrap();
        let cycles = (self.history.len() - 1) as f64;
        let rate = (last.saturating_sub(first)) as f64 / cycles;
        rate > self.threshold_per_cycle
    }
}

/// Tracks consecutive cycles with queue backlog above threshold.
struct QueueTracker {
    consecutive_over: u32,
    required: u32,
    threshold_packets: u64,
}

impl QueueTracker {
    fn new(required: u32, threshold_packets: u64) -> Self {
        Self {
            consecutive_over: 0,
            required,
            threshold_packets,
        }
    }

    fn push_and_verdict(&mut self, backlog_packets: u64) -> bool {
        if backlog_packets > self.threshold_packets {
            self.consecutive_over += 1;
        } else {
            self.consecutive_over = 0;
        }
        self.consecutive_over >= self.required.max(1)
    }
}

pub struct SteeringController {
    config: SteeringConfig,
    loaded_ewma: Ewma,
    drops: DropsTracker,
    queue: QueueTracker,
    pub record: SteeringRecord,
}

#[derive(Debug, Default)]
pub struct SteeringCycleReport {
    pub probe_failed: bool,
    pub composite: Option<SignalVerdict>,
    pub transitioned: bool,
    pub flap_held: bool,
}

impl SteeringController {
    pub fn new(config: SteeringConfig, record: SteeringRecord) -> Self {
        let loaded_ewma = Ewma::new(config.ewma.alpha_load, config.ewma.max_rtt_ms);
        let drops = DropsTracker::new(config.drops_window_cycles as usize, config.drops_rate_threshold_per_cycle);
        let queue = QueueTracker::new(config.queue_backlog_window_cycles, config.queue_backlog_threshold_packets);
        Self {
            config,
            loaded_ewma,
            drops,
            queue,
            record,
        }
    }

    /// Runs one cycle given a probe measurement, the current queue
    /// stats, and the baseline RTT read (never written) from the
    /// primary WAN's autorate state (spec.md §4.7 step 3, P9).
    pub fn on_cycle(
        &mut self,
        m: &Measurement,
        stats: &QueueStats,
        primary_baseline_ms: f64,
        now_unix_secs: u64,
        router: &dyn RouterSession,
    ) -> SteeringCycleReport {
        let mut report = SteeringCycleReport::default();

        if m.kind == ProbeKind::Fail {
            report.probe_failed = true;
            return report;
        }

        let loaded = match self.loaded_ewma.update(m.rtt_ms) {
            Ok(v) => v,
            Err(_) => {
                report.probe_failed = true;
                return report;
            }
        };
        let delta = loaded - primary_baseline_ms;

        let rtt = rtt_verdict(delta, &self.config.thresholds);
        let drops_bad = self.drops.push_and_verdict(stats.drops_cumulative);
        let queue_bad = self.queue.push_and_verdict(stats.backlog_packets);
        let composite = composite_verdict(rtt, drops_bad, queue_bad);
        report.composite = Some(composite);

        match self.record.state {
            SteeringState::PrimaryGood => {
                if composite == SignalVerdict::Red {
                    self.record.consecutive_bad += 1;
                } else {
                    self.record.consecutive_bad = 0;
                }
                if self.record.consecutive_bad >= self.config.bad_samples_to_activate {
                    if self.flap_would_exceed_cap(now_unix_secs) {
                        report.flap_held = true;
                        tracing::warn!(
                            wan = %self.config.primary_wan,
                            "steering activation suppressed by flap protection"
                        );
                    } else {
                        self.activate(now_unix_secs, router, &mut report);
                    }
                }
            }
            SteeringState::PrimaryDegraded => {
                if composite == SignalVerdict::Green {
                    self.record.consecutive_good += 1;
                } else {
                    self.record.consecutive_good = 0;
                }
                if self.record.consecutive_good >= self.config.good_samples_to_deactivate {
                    self.deactivate(now_unix_secs, router, &mut report);
                }
            }
        }

        report
    }

    fn flap_would_exceed_cap(&self, now_unix_secs: u64) -> bool {
        let window_start = now_unix_secs.saturating_sub(self.config.flap_window_seconds);
        let recent = self
            .record
            .activation_history_unix_secs
            .iter()
            .filter(|&&t| t >= window_start)
            .count();
        recent >= self.config.flap_max_activations
    }

    fn activate(&mut self, now_unix_secs: u64, router: &dyn RouterSession, report: &mut SteeringCycleReport) {
        if router.set_rule_enabled(&self.config.rule_identifier, true).is_ok() {
            self.record.state = SteeringState::PrimaryDegraded;
            self.record.consecutive_bad = 0;
            self.record.consecutive_good = 0;
            self.record.activation_history_unix_secs.push_back(now_unix_secs);
            while self.record.activation_history_unix_secs.len() > self.config.flap_history_len {
                self.record.activation_history_unix_secs.pop_front();
            }
            self.record.last_transition_secs = now_unix_secs as f64;
            report.transitioned = true;
            tracing::info!(wan = %self.config.primary_wan, "steering rule enabled: primary degraded");
        } else {
            tracing::warn!(wan = %self.config.primary_wan, "failed to enable steering rule, will retry next cycle");
        }
    }

    fn deactivate(&mut self, now_unix_secs: u64, router: &dyn RouterSession, report: &mut SteeringCycleReport) {
        if router.set_rule_enabled(&self.config.rule_identifier, false).is_ok() {
            self.record.state = SteeringState::PrimaryGood;
            self.record.consecutive_bad = 0;
            self.record.consecutive_good = 0;
            self.record.last_transition_secs = now_unix_secs as f64;
            report.transitioned = true;
            tracing::info!(wan = %self.config.primary_wan, "steering rule disabled: primary recovered");
        } else {
            tracing::warn!(wan = %self.config.primary_wan, "failed to disable steering rule, will retry next cycle");
        }
    }
}

/// Drives a [`SteeringController`] on a fixed cadence, independent of
/// any autorate loop's clock or thread (spec.md §9 "cyclic references":
/// steering reads the primary WAN's persisted baseline, never a live
/// handle into autorate). Thread shape matches [`crate::autorate::AutorateLoop`].
pub struct SteeringLoop {
    shutdown: std::sync::Arc<std::sync::atomic::AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl SteeringLoop {
    /// `primary_state_reader` re-reads the primary WAN's persisted
    /// baseline each cycle (a one-way snapshot read, per spec.md §9) —
    /// typically a closure over the primary autorate loop's
    /// `StateStore::load`.
    pub fn spawn(
        mut controller: SteeringController,
        clock: std::sync::Arc<dyn crate::clock::Clock>,
        probe: crate::probe::Probe,
        router: std::sync::Arc<dyn RouterSession>,
        steering_store: crate::state::SteeringStateStore,
        primary_state_reader: impl Fn() -> f64 + Send + 'static,
        queue_name: String,
        single_cycle: bool,
    ) -> std::io::Result<Self> {
        use std::sync::atomic::{AtomicBool, Ordering};

        let shutdown = std::sync::Arc::new(AtomicBool::new(false));
        let shutdown_flag = shutdown.clone();
        let period = controller.config.cycle_period();

        let handle = std::thread::Builder::new()
            .name("steering".into())
            .spawn(move || loop {
                if shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }

                let _now = clock.now();
                let now_unix_secs = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let measurement = probe.sample();
                let stats = router.read_queue_stats(&queue_name).unwrap_or_default();
                let baseline = primary_state_reader();

                controller.on_cycle(&measurement, &stats, baseline, now_unix_secs, router.as_ref());

                if let Err(e) = steering_store.save(&controller.record) {
                    tracing::warn!(error = %e, "steering state save failed");
                }

                if single_cycle || shutdown_flag.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::sleep(period);
            })?;

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    pub fn shutdown(&mut self) {
        self.shutdown.store(true, std::sync::atomic::Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

impl Drop for SteeringLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}
