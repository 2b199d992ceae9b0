//! Atomic per-WAN state persistence with backup recovery and corruption
//! quarantine.
//!
//! No single teacher file does atomic-JSON-with-backup; this composes
//! the temp-file-plus-rename idiom used throughout the pack for durable
//! writes with the teacher's habit of logging once and carrying on
//! rather than treating a persistence failure as fatal (state.rs §4.5,
//! §4.6(f), §7.3 of the controller this implements).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StateStoreError;

pub const SCHEMA_VERSION: &str = "1.0";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DownlinkState {
    Green,
    Yellow,
    SoftRed,
    Red,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum UplinkState {
    Green,
    Yellow,
    Red,
}

/// Per-direction controller record (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectionRecord {
    pub current_rate_bps: i64,
    /// `-1` sentinel: never written to the router.
    pub last_written_rate_bps: i64,
    pub consecutive_green: u64,
    pub consecutive_soft_red: u64,
    pub last_transition_secs: f64,
}

impl DirectionRecord {
    pub fn new(initial_rate_bps: i64) -> Self {
        Self {
            current_rate_bps: initial_rate_bps,
            last_written_rate_bps: -1,
            consecutive_green: 0,
            consecutive_soft_red: 0,
            last_transition_secs: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownlinkRecord {
    #[serde(flatten)]
    pub common: DirectionRecord,
    pub state: DownlinkState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkRecord {
    #[serde(flatten)]
    pub common: DirectionRecord,
    pub state: UplinkState,
}

/// Per-WAN shared record, the unit of persistence (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanState {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub baseline_rtt_ewma_ms: f64,
    pub loaded_rtt_ewma_ms: f64,
    pub last_instantaneous_rtt_ms: f64,
    pub cycle_count: u64,
    pub consecutive_failures: u64,
    /// Cumulative count of cycles where a downlink write was withheld by
    /// the rate limiter (spec.md §6 "throttled write" gauge).
    #[serde(default)]
    pub downlink_throttled_count: u64,
    #[serde(default)]
    pub uplink_throttled_count: u64,
    pub downlink: DownlinkRecord,
    pub uplink: UplinkRecord,
}

fn default_schema_version() -> String {
    SCHEMA_VERSION.to_string()
}

impl WanState {
    pub fn initial(baseline_hint_ms: f64, downlink_ceiling_bps: i64, uplink_ceiling_bps: i64) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            baseline_rtt_ewma_ms: baseline_hint_ms,
            loaded_rtt_ewma_ms: baseline_hint_ms,
            last_instantaneous_rtt_ms: baseline_hint_ms,
            cycle_count: 0,
            consecutive_failures: 0,
            downlink_throttled_count: 0,
            uplink_throttled_count: 0,
            downlink: DownlinkRecord {
                common: DirectionRecord::new(downlink_ceiling_bps),
                state: DownlinkState::Green,
            },
            uplink: UplinkRecord {
                common: DirectionRecord::new(uplink_ceiling_bps),
                state: UplinkState::Green,
            },
        }
    }
}

/// Loads, saves, and recovers a single WAN's state from
/// `<dir>/<name>_state.json` plus its `.backup` and `.corrupt` siblings.
pub struct StateStore {
    primary: PathBuf,
    backup: PathBuf,
    dir: PathBuf,
    name: String,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>, wan_name: &str) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            primary: dir.join(format!("{wan_name}_state.json")),
            backup: dir.join(format!("{wan_name}_state.json.backup")),
            dir,
            name: wan_name.to_string(),
        }
    }

    /// Save protocol (spec.md §4.5): serialize, rotate primary to
    /// backup atomically, then write the new primary via temp file +
    /// rename at mode 0600.
    pub fn save(&self, state: &WanState) -> Result<(), StateStoreError> {
        let json = serde_json::to_vec_pretty(state)?;

        if self.primary.exists() {
            let _ = std::fs::rename(&self.primary, &self.backup);
        }

        let tmp = self.dir.join(format!("{}_state.json.tmp", self.name));
        std::fs::write(&tmp, &json)?;
        set_permissions_0600(&tmp)?;
        std::fs::rename(&tmp, &self.primary)?;
        Ok(())
    }

    /// Load protocol (spec.md §4.5): primary, else quarantine-and-try
    /// backup, else the default snapshot with a single warning.
    pub fn load(&self, default_baseline_hint_ms: f64, downlink_ceiling_bps: i64, uplink_ceiling_bps: i64) -> WanState {
        match self.try_load(&self.primary) {
            Ok(state) => return state,
            Err(e) if self.primary.exists() => {
                tracing::warn!(wan = %self.name, error = %e, "primary state file unreadable, quarantining");
                self.quarantine(&self.primary);
            }
            Err(_) => {}
        }

        match self.try_load(&self.backup) {
            Ok(state) => {
                tracing::info!(wan = %self.name, "recovered state from backup");
                return state;
            }
            Err(e) if self.backup.exists() => {
                tracing::warn!(wan = %self.name, error = %e, "backup state file unreadable, quarantining");
                self.quarantine(&self.backup);
            }
            Err(_) => {}
        }

        tracing::warn!(wan = %self.name, "no usable state file, starting from default snapshot");
        WanState::initial(default_baseline_hint_ms, downlink_ceiling_bps, uplink_ceiling_bps)
    }

    fn try_load(&self, path: &Path) -> Result<WanState, StateStoreError> {
        let bytes = std::fs::read(path)?;
        let state: WanState = serde_json::from_slice(&bytes)?;
        if state.schema_version != SCHEMA_VERSION {
            tracing::info!(
                wan = %self.name,
                found = %state.schema_version,
                expected = SCHEMA_VERSION,
                "state file schema version differs, proceeding (forward-compatible fields assumed additive)"
            );
        }
        Ok(state)
    }

    fn quarantine(&self, path: &Path) {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let dest = path.with_extension(format!("corrupt.{ts}"));
        if let Err(e) = std::fs::rename(path, &dest) {
            tracing::warn!(error = %e, "failed to quarantine corrupt state file");
        }
    }

    /// Administrative reset (spec.md §3 "Lifecycle"): removes the state
    /// file and its backup.
    pub fn reset(&self) -> Result<(), StateStoreError> {
        for p in [&self.primary, &self.backup] {
            if let Err(e) = std::fs::remove_file(p) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_permissions_0600(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_permissions_0600(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Same atomic-save / backup-then-default-load protocol as
/// [`StateStore`], applied to the separate steering record (spec.md §3
/// "Steering record (separate file)"). Kept as its own small type
/// rather than a shared generic: the two records have different
/// defaulting rules (a WAN's default needs ceiling/baseline hints; a
/// steering record's default is always `PRIMARY_GOOD` with zeroed
/// counters).
pub struct SteeringStateStore {
    primary: PathBuf,
    backup: PathBuf,
    dir: PathBuf,
}

impl SteeringStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        Self {
            primary: dir.join("steering_state.json"),
            backup: dir.join("steering_state.json.backup"),
            dir,
        }
    }

    pub fn save(&self, record: &crate::steering::SteeringRecord) -> Result<(), StateStoreError> {
        let json = serde_json::to_vec_pretty(record)?;
        if self.primary.exists() {
            let _ = std::fs::rename(&self.primary, &self.backup);
        }
        let tmp = self.dir.join("steering_state.json.tmp");
        std::fs::write(&tmp, &json)?;
        set_permissions_0600(&tmp)?;
        std::fs::rename(&tmp, &self.primary)?;
        Ok(())
    }

    pub fn load(&self) -> crate::steering::SteeringRecord {
        for path in [&self.primary, &self.backup] {
            if let Ok(bytes) = std::fs::read(path) {
                if let Ok(record) = serde_json::from_slice(&bytes) {
                    return record;
                }
                if path.exists() {
                    let ts = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .unwrap_or_default()
                        .as_secs();
                    let dest = path.with_extension(format!("corrupt.{ts}"));
                    let _ = std::fs::rename(path, dest);
                }
            }
        }
        tracing::warn!("no usable steering state file, starting from default snapshot");
        crate::steering::SteeringRecord::initial()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_load_round_trips_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "wan0");
        let mut state = WanState::initial(20.0, 940_000_000, 50_000_000);
        state.cycle_count = 42;
        state.downlink.common.current_rate_bps = 551_000_000;
        store.save(&state).unwrap();

        let loaded = store.load(0.0, 0, 0);
        assert_eq!(loaded.cycle_count, 42);
        assert_eq!(loaded.downlink.common.current_rate_bps, 551_000_000);
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn corrupt_primary_falls_back_to_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "wan0");
        let state = WanState::initial(20.0, 940_000_000, 50_000_000);
        store.save(&state).unwrap();
        // Second save rotates the valid snapshot into .backup.
        store.save(&state).unwrap();

        std::fs::write(dir.path().join("wan0_state.json"), b"{not json").unwrap();
        let loaded = store.load(0.0, 0, 0);
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
        assert!(dir
            .path()
            .read_dir()
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().contains("corrupt")));
    }

    #[test]
    fn both_corrupt_returns_default_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "wan0");
        std::fs::write(dir.path().join("wan0_state.json"), b"not json").unwrap();
        std::fs::write(dir.path().join("wan0_state.json.backup"), b"also not json").unwrap();

        let loaded = store.load(15.0, 940_000_000, 50_000_000);
        assert_eq!(loaded.baseline_rtt_ewma_ms, 15.0);
        assert_eq!(loaded.downlink.common.current_rate_bps, 940_000_000);
    }

    #[test]
    fn reset_removes_primary_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path(), "wan0");
        let state = WanState::initial(20.0, 940_000_000, 50_000_000);
        store.save(&state).unwrap();
        store.save(&state).unwrap();
        store.reset().unwrap();
        assert!(!dir.path().join("wan0_state.json").exists());
        assert!(!dir.path().join("wan0_state.json.backup").exists());
    }

    #[test]
    fn steering_store_round_trips_and_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SteeringStateStore::new(dir.path());

        let default = store.load();
        assert_eq!(default.state, crate::steering::SteeringState::PrimaryGood);

        let mut record = default;
        record.consecutive_bad = 3;
        record.activation_history_unix_secs.push_back(1_000);
        store.save(&record).unwrap();

        let loaded = store.load();
        assert_eq!(loaded.consecutive_bad, 3);
        assert_eq!(loaded.activation_history_unix_secs.len(), 1);
    }

    #[test]
    fn steering_store_quarantines_corrupt_primary_and_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SteeringStateStore::new(dir.path());
        let mut record = crate::steering::SteeringRecord::initial();
        record.consecutive_good = 7;
        store.save(&record).unwrap();
        store.save(&record).unwrap(); // rotate good snapshot into .backup

        std::fs::write(dir.path().join("steering_state.json"), b"not json").unwrap();
        let loaded = store.load();
        assert_eq!(loaded.consecutive_good, 7);
        assert!(dir
            .path()
            .read_dir()
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().contains("corrupt")));
    }
}
