//! Closed, validated configuration records (spec.md §3–§6, §9 "dynamic
//! configuration → explicit options").
//!
//! The source this was distilled from consumes free-form structured
//! configuration; here every knob is an explicit field with validation
//! run once at load time, in the style the pack's other config-bearing
//! crates (e.g. the teacher's `AdaptationConfig`) use named,
//! validated structs rather than stringly-typed maps.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Per-direction floors, ordered from most to least severe (spec.md
/// §3 invariant: `floor_red ≤ floor_soft_red ≤ floor_yellow ≤
/// floor_green ≤ ceiling`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Floors {
    pub red_bps: i64,
    /// Downlink only; ignored (and unvalidated) for uplink configs.
    #[serde(default)]
    pub soft_red_bps: i64,
    pub yellow_bps: i64,
    pub green_bps: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionConfig {
    pub floors: Floors,
    pub ceiling_bps: i64,
    pub initial_rate_bps: i64,
    pub step_up_bps: i64,
    pub factor_down: f64,
    /// Wall-clock hold time before a step-up is taken; derived sample
    /// count is `ceil(green_hold_ms / cycle_period_ms)` (see DESIGN.md
    /// open question 1).
    pub green_hold_ms: u64,
    /// Downlink only.
    #[serde(default)]
    pub soft_red_entry_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub target_bloat_ms: f64,
    pub warn_bloat_ms: f64,
    /// 4-state (downlink) only.
    #[serde(default)]
    pub hard_red_bloat_ms: f64,
}

/// Probe targets are stored as the operator wrote them — IPv4/IPv6
/// literal or RFC1123 hostname — and validated in
/// [`WanConfig::validate`]/[`SteeringConfig::validate`]; resolution to
/// the `IpAddr` the ICMP layer needs happens once, at
/// [`ProbeConfig`](crate::probe::ProbeConfig) construction time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeTargetsConfig {
    pub primary_icmp_targets: Vec<String>,
    pub gateway_icmp_target: Option<String>,
    pub tcp_fallback: Option<SocketAddr>,
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub median_of_three: bool,
}

fn default_probe_timeout_ms() -> u64 {
    300
}

/// RFC1123 label: 1-63 chars, alphanumeric plus hyphen, no leading or
/// trailing hyphen.
fn is_rfc1123_label(label: &str) -> bool {
    !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_valid_probe_target(s: &str) -> bool {
    if s.parse::<IpAddr>().is_ok() {
        return true;
    }
    !s.is_empty() && s.len() <= 253 && s.split('.').all(is_rfc1123_label)
}

fn validate_probe_targets(p: &ProbeTargetsConfig) -> Result<(), ConfigError> {
    for target in &p.primary_icmp_targets {
        if !is_valid_probe_target(target) {
            return Err(ConfigError::InvalidProbeTarget(target.clone()));
        }
    }
    if let Some(target) = &p.gateway_icmp_target {
        if !is_valid_probe_target(target) {
            return Err(ConfigError::InvalidProbeTarget(target.clone()));
        }
    }
    Ok(())
}

/// Resolves a validated probe target to an address. IP literals parse
/// directly; hostnames go through the system resolver via the `:0`
/// dummy-port `ToSocketAddrs` idiom, using the first address returned.
fn resolve_probe_target(target: &str) -> Option<IpAddr> {
    if let Ok(ip) = target.parse::<IpAddr>() {
        return Some(ip);
    }
    (target, 0u16).to_socket_addrs().ok()?.next().map(|addr| addr.ip())
}

impl From<&ProbeTargetsConfig> for crate::probe::ProbeConfig {
    fn from(p: &ProbeTargetsConfig) -> Self {
        let primary_targets = p
            .primary_icmp_targets
            .iter()
            .filter_map(|t| {
                let resolved = resolve_probe_target(t);
                if resolved.is_none() {
                    tracing::warn!(target = %t, "probe target did not resolve, dropping from rotation");
                }
                resolved
            })
            .collect();
        let gateway_target = p.gateway_icmp_target.as_deref().and_then(|t| {
            let resolved = resolve_probe_target(t);
            if resolved.is_none() {
                tracing::warn!(target = %t, "gateway probe target did not resolve");
            }
            resolved
        });

        crate::probe::ProbeConfig {
            primary_targets,
            gateway_target,
            tcp_fallback: p.tcp_fallback,
            per_probe_timeout: Duration::from_millis(p.timeout_ms),
            median_of_three: p.median_of_three,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EwmaConfig {
    pub alpha_baseline: f64,
    pub alpha_load: f64,
    pub baseline_update_threshold_ms: f64,
    pub max_rtt_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub max_events: usize,
    pub window_seconds: u64,
}

/// One WAN's full configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WanConfig {
    pub name: String,
    pub queue_name: String,
    pub cycle_period_ms: u64,
    pub downlink: DirectionConfig,
    pub uplink: DirectionConfig,
    pub downlink_thresholds: Thresholds,
    pub uplink_thresholds: Thresholds,
    pub ewma: EwmaConfig,
    pub rate_limiter: RateLimiterConfig,
    pub probe: ProbeTargetsConfig,
    pub max_consecutive_failures: u64,
    pub baseline_hint_ms: f64,
    pub state_dir: String,
    pub lock_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SteeringConfig {
    pub primary_wan: String,
    pub rule_identifier: String,
    pub cycle_period_ms: u64,
    pub thresholds: Thresholds,
    pub ewma: EwmaConfig,
    pub probe: ProbeTargetsConfig,
    pub drops_rate_threshold_per_cycle: f64,
    pub drops_window_cycles: u32,
    pub queue_backlog_threshold_packets: u64,
    pub queue_backlog_window_cycles: u32,
    pub bad_samples_to_activate: u64,
    pub good_samples_to_deactivate: u64,
    #[serde(default = "default_flap_history_len")]
    pub flap_history_len: usize,
    pub flap_max_activations: usize,
    pub flap_window_seconds: u64,
    pub state_dir: String,
    pub lock_dir: String,
}

fn default_flap_history_len() -> usize {
    20
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub wans: Vec<WanConfig>,
    pub steering: Option<SteeringConfig>,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

fn default_health_port() -> u16 {
    9101
}

/// Conservative router-safe identifier charset (spec.md §6): letters,
/// digits, underscore, hyphen, dot, colon, space.
fn is_router_safe(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.: ".contains(c))
}

fn validate_direction(dir: &DirectionConfig, four_state: bool) -> Result<(), ConfigError> {
    let f = &dir.floors;
    if four_state {
        if !(f.red_bps <= f.soft_red_bps
            && f.soft_red_bps <= f.yellow_bps
            && f.yellow_bps <= f.green_bps
            && f.green_bps <= dir.ceiling_bps)
        {
            return Err(ConfigError::InvariantViolated(
                "floors must satisfy red <= soft_red <= yellow <= green <= ceiling".into(),
            ));
        }
    } else if !(f.red_bps <= f.yellow_bps
        && f.yellow_bps <= f.green_bps
        && f.green_bps <= dir.ceiling_bps)
    {
        return Err(ConfigError::InvariantViolated(
            "floors must satisfy red <= yellow <= green <= ceiling".into(),
        ));
    }
    if !(0.0 < dir.factor_down && dir.factor_down < 1.0) {
        return Err(ConfigError::InvariantViolated(
            "factor_down must be in (0, 1)".into(),
        ));
    }
    Ok(())
}

fn validate_thresholds(t: &Thresholds, four_state: bool) -> Result<(), ConfigError> {
    if four_state {
        if !(0.0 < t.target_bloat_ms && t.target_bloat_ms < t.warn_bloat_ms && t.warn_bloat_ms < t.hard_red_bloat_ms)
        {
            return Err(ConfigError::InvariantViolated(
                "thresholds must satisfy 0 < target < warn < hard_red".into(),
            ));
        }
    } else if !(0.0 < t.target_bloat_ms && t.target_bloat_ms < t.warn_bloat_ms) {
        return Err(ConfigError::InvariantViolated(
            "thresholds must satisfy 0 < target < warn".into(),
        ));
    }
    Ok(())
}

fn validate_ewma(e: &EwmaConfig) -> Result<(), ConfigError> {
    if !(0.0 < e.alpha_baseline && e.alpha_baseline < e.alpha_load && e.alpha_load < 1.0) {
        return Err(ConfigError::InvariantViolated(
            "ewma alphas must satisfy 0 < alpha_baseline < alpha_load < 1".into(),
        ));
    }
    Ok(())
}

impl WanConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_router_safe(&self.queue_name) {
            return Err(ConfigError::InvalidIdentifier(self.queue_name.clone()));
        }
        validate_direction(&self.downlink, true)?;
        validate_direction(&self.uplink, false)?;
        validate_thresholds(&self.downlink_thresholds, true)?;
        validate_thresholds(&self.uplink_thresholds, false)?;
        validate_ewma(&self.ewma)?;
        validate_probe_targets(&self.probe)?;
        Ok(())
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }

    /// `ceil(green_hold_ms / cycle_period_ms)`, per DESIGN.md open
    /// question 1.
    pub fn green_samples_required(&self, dir: &DirectionConfig) -> u64 {
        ceil_div(dir.green_hold_ms, self.cycle_period_ms)
    }

    pub fn soft_red_samples_required(&self) -> u64 {
        ceil_div(self.downlink.soft_red_entry_ms, self.cycle_period_ms)
    }
}

impl SteeringConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_router_safe(&self.rule_identifier) {
            return Err(ConfigError::InvalidIdentifier(self.rule_identifier.clone()));
        }
        validate_thresholds(&self.thresholds, true)?;
        validate_ewma(&self.ewma)?;
        validate_probe_targets(&self.probe)?;
        if self.good_samples_to_deactivate <= self.bad_samples_to_activate {
            return Err(ConfigError::InvariantViolated(
                "good_samples_to_deactivate must exceed bad_samples_to_activate (asymmetric hysteresis)".into(),
            ));
        }
        Ok(())
    }

    pub fn cycle_period(&self) -> Duration {
        Duration::from_millis(self.cycle_period_ms)
    }
}

impl Config {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for wan in &self.wans {
            wan.validate()?;
        }
        if let Some(steering) = &self.steering {
            steering.validate()?;
            if !self.wans.iter().any(|w| w.name == steering.primary_wan) {
                return Err(ConfigError::InvariantViolated(format!(
                    "steering.primary_wan {:?} does not match any configured wan",
                    steering.primary_wan
                )));
            }
        }
        Ok(())
    }
}

fn ceil_div(a: u64, b: u64) -> u64 {
    if b == 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_direction() -> DirectionConfig {
        DirectionConfig {
            floors: Floors {
                red_bps: 200_000_000,
                soft_red_bps: 275_000_000,
                yellow_bps: 400_000_000,
                green_bps: 550_000_000,
            },
            ceiling_bps: 940_000_000,
            initial_rate_bps: 550_000_000,
            step_up_bps: 1_000_000,
            factor_down: 0.92,
            green_hold_ms: 250,
            soft_red_entry_ms: 150,
        }
    }

    #[test]
    fn floor_ordering_violation_is_rejected() {
        let mut dir = sample_direction();
        dir.floors.green_bps = dir.floors.yellow_bps - 1;
        assert!(validate_direction(&dir, true).is_err());
    }

    #[test]
    fn green_samples_required_derives_from_wall_clock_and_period() {
        let wan = WanConfig {
            name: "wan0".into(),
            queue_name: "wan0_shaper".into(),
            cycle_period_ms: 50,
            downlink: sample_direction(),
            uplink: sample_direction(),
            downlink_thresholds: Thresholds {
                target_bloat_ms: 15.0,
                warn_bloat_ms: 45.0,
                hard_red_bloat_ms: 80.0,
            },
            uplink_thresholds: Thresholds {
                target_bloat_ms: 15.0,
                warn_bloat_ms: 45.0,
                hard_red_bloat_ms: 0.0,
            },
            ewma: EwmaConfig {
                alpha_baseline: 0.05,
                alpha_load: 0.3,
                baseline_update_threshold_ms: 5.0,
                max_rtt_ms: 5000.0,
            },
            rate_limiter: RateLimiterConfig {
                max_events: 10,
                window_seconds: 60,
            },
            probe: ProbeTargetsConfig {
                primary_icmp_targets: vec!["1.1.1.1".into()],
                gateway_icmp_target: Some("192.168.1.1".into()),
                tcp_fallback: None,
                timeout_ms: 300,
                median_of_three: false,
            },
            max_consecutive_failures: 3,
            baseline_hint_ms: 20.0,
            state_dir: "/tmp".into(),
            lock_dir: "/tmp".into(),
        };
        assert_eq!(wan.green_samples_required(&wan.downlink), 5);
        assert_eq!(wan.soft_red_samples_required(), 3);
        assert!(wan.validate().is_ok());
    }

    #[test]
    fn rejects_identifiers_outside_the_safe_character_set() {
        assert!(is_router_safe("wan0_shaper"));
        assert!(is_router_safe("wan-0.main: eth0"));
        assert!(!is_router_safe("wan0; rm -rf /"));
        assert!(!is_router_safe(""));
    }

    #[test]
    fn probe_targets_accept_ip_literals_and_rfc1123_hostnames() {
        assert!(is_valid_probe_target("1.1.1.1"));
        assert!(is_valid_probe_target("2606:4700:4700::1111"));
        assert!(is_valid_probe_target("probe.example.com"));
        assert!(is_valid_probe_target("router"));
    }

    #[test]
    fn probe_targets_reject_malformed_hostnames() {
        assert!(!is_valid_probe_target(""));
        assert!(!is_valid_probe_target("-leading-hyphen.example.com"));
        assert!(!is_valid_probe_target("bad_label!.example.com"));
        assert!(!is_valid_probe_target(&"a".repeat(64)));
    }

    #[test]
    fn validate_rejects_invalid_probe_target() {
        let probe = ProbeTargetsConfig {
            primary_icmp_targets: vec!["not a hostname!!".into()],
            gateway_icmp_target: None,
            tcp_fallback: None,
            timeout_ms: 300,
            median_of_three: false,
        };
        assert!(matches!(validate_probe_targets(&probe), Err(ConfigError::InvalidProbeTarget(_))));
    }
}
