//! Prometheus text-exposition rendering for the health snapshot (spec.md
//! §6, SPEC_FULL.md §4.11).
//!
//! Grounded directly in `strata-bonding::metrics::render_prometheus`:
//! the same `# HELP` / `# TYPE` / labeled-gauge-per-entity shape, swapped
//! from one `HashMap<usize, LinkMetrics>` to the health snapshot's
//! per-WAN record list.

use std::fmt::Write;

use crate::health::HealthSnapshot;
use crate::state::{DownlinkState, UplinkState};

fn downlink_state_code(s: DownlinkState) -> u8 {
    match s {
        DownlinkState::Green => 1,
        DownlinkState::Yellow => 2,
        DownlinkState::SoftRed => 3,
        DownlinkState::Red => 4,
    }
}

fn uplink_state_code(s: UplinkState) -> u8 {
    match s {
        UplinkState::Green => 1,
        UplinkState::Yellow => 2,
        UplinkState::Red => 4,
    }
}

/// Render a health snapshot as Prometheus text exposition format.
pub fn render_prometheus(snapshot: &HealthSnapshot) -> String {
    let mut out = String::with_capacity(2048);

    writeln!(out, "# HELP wanctl_shaper_rate_bps Current shaper rate in bits per second.").unwrap();
    writeln!(out, "# TYPE wanctl_shaper_rate_bps gauge").unwrap();
    for wan in &snapshot.wans {
        writeln!(
            out,
            "wanctl_shaper_rate_bps{{wan=\"{}\",direction=\"down\"}} {}",
            wan.name, wan.downlink_rate_bps
        )
        .unwrap();
        writeln!(
            out,
            "wanctl_shaper_rate_bps{{wan=\"{}\",direction=\"up\"}} {}",
            wan.name, wan.uplink_rate_bps
        )
        .unwrap();
    }

    writeln!(out, "# HELP wanctl_baseline_rtt_ms Frozen-baseline smoothed RTT in milliseconds.").unwrap();
    writeln!(out, "# TYPE wanctl_baseline_rtt_ms gauge").unwrap();
    for wan in &snapshot.wans {
        writeln!(out, "wanctl_baseline_rtt_ms{{wan=\"{}\"}} {:.3}", wan.name, wan.baseline_rtt_ewma_ms).unwrap();
    }

    writeln!(out, "# HELP wanctl_loaded_rtt_ms Loaded smoothed RTT in milliseconds.").unwrap();
    writeln!(out, "# TYPE wanctl_loaded_rtt_ms gauge").unwrap();
    for wan in &snapshot.wans {
        writeln!(out, "wanctl_loaded_rtt_ms{{wan=\"{}\"}} {:.3}", wan.name, wan.loaded_rtt_ewma_ms).unwrap();
    }

    writeln!(out, "# HELP wanctl_rtt_delta_ms Loaded minus baseline RTT in milliseconds.").unwrap();
    writeln!(out, "# TYPE wanctl_rtt_delta_ms gauge").unwrap();
    for wan in &snapshot.wans {
        writeln!(out, "wanctl_rtt_delta_ms{{wan=\"{}\"}} {:.3}", wan.name, wan.last_delta_ms).unwrap();
    }

    writeln!(out, "# HELP wanctl_direction_state Congestion state per direction (1=GREEN 2=YELLOW 3=SOFT_RED 4=RED).").unwrap();
    writeln!(out, "# TYPE wanctl_direction_state gauge").unwrap();
    for wan in &snapshot.wans {
        writeln!(
            out,
            "wanctl_direction_state{{wan=\"{}\",direction=\"down\"}} {}",
            wan.name,
            downlink_state_code(wan.downlink_state)
        )
        .unwrap();
        writeln!(
            out,
            "wanctl_direction_state{{wan=\"{}\",direction=\"up\"}} {}",
            wan.name,
            uplink_state_code(wan.uplink_state)
        )
        .unwrap();
    }

    writeln!(out, "# HELP wanctl_cycle_count_total Cumulative control cycles run.").unwrap();
    writeln!(out, "# TYPE wanctl_cycle_count_total counter").unwrap();
    for wan in &snapshot.wans {
        writeln!(out, "wanctl_cycle_count_total{{wan=\"{}\"}} {}", wan.name, wan.cycle_count).unwrap();
    }

    writeln!(out, "# HELP wanctl_consecutive_failures Current consecutive probe failure count.").unwrap();
    writeln!(out, "# TYPE wanctl_consecutive_failures gauge").unwrap();
    for wan in &snapshot.wans {
        writeln!(out, "wanctl_consecutive_failures{{wan=\"{}\"}} {}", wan.name, wan.consecutive_failures).unwrap();
    }

    writeln!(out, "# HELP wanctl_throttled_writes_total Cumulative router writes withheld by the rate limiter.").unwrap();
    writeln!(out, "# TYPE wanctl_throttled_writes_total counter").unwrap();
    for wan in &snapshot.wans {
        writeln!(
            out,
            "wanctl_throttled_writes_total{{wan=\"{}\",direction=\"down\"}} {}",
            wan.name, wan.downlink_throttled_count
        )
        .unwrap();
        writeln!(
            out,
            "wanctl_throttled_writes_total{{wan=\"{}\",direction=\"up\"}} {}",
            wan.name, wan.uplink_throttled_count
        )
        .unwrap();
    }

    if let Some(steering) = &snapshot.steering {
        writeln!(out, "# HELP wanctl_steering_active Whether the steering rule is currently enabled (1=active).").unwrap();
        writeln!(out, "# TYPE wanctl_steering_active gauge").unwrap();
        let active = matches!(steering.state, crate::steering::SteeringState::PrimaryDegraded);
        writeln!(out, "wanctl_steering_active {}", active as u8).unwrap();

        writeln!(out, "# HELP wanctl_steering_active_duration_seconds Seconds the steering rule has been continuously active.").unwrap();
        writeln!(out, "# TYPE wanctl_steering_active_duration_seconds gauge").unwrap();
        writeln!(out, "wanctl_steering_active_duration_seconds {:.0}", steering.active_duration_secs).unwrap();
    }

    out
}
