//! Error types for every component, one enum per concern.
//!
//! Mirrors the library-crate convention of typed, `thiserror`-derived
//! errors at component boundaries; the daemon aggregates these behind
//! `anyhow` at the process boundary.

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum EwmaError {
    #[error("invalid sample: {0}")]
    InvalidInput(String),
    #[error("ewma overflow: update produced a non-finite value")]
    Overflow,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock already held by a live process (pid {0})")]
    AlreadyHeld(i32),
    #[error("lock io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("lock file content malformed: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,
    #[error("probe io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure kind a `RouterSession` implementation reports, per the
/// distinction the autorate and steering loops need: a `Transient`
/// failure is retried next cycle with no state mutation; `Fatal` ends
/// the process.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("transient router error: {0}")]
    Transient(String),
    #[error("fatal router error: {0}")]
    Fatal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invariant violated: {0}")]
    InvariantViolated(String),
    #[error("invalid identifier {0:?}: must match the conservative router-safe character set")]
    InvalidIdentifier(String),
    #[error("invalid probe target {0:?}: not RFC1123 hostname or IP literal")]
    InvalidProbeTarget(String),
    #[error("toml parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("io error reading config: {0}")]
    Io(#[from] std::io::Error),
}
