//! Core control logic for the bufferbloat autorate and link-steering
//! daemon: classification, rate selection, persistence, and the
//! transport-agnostic interfaces the binary crate wires to a router.

pub mod autorate;
pub mod clock;
pub mod config;
pub mod error;
pub mod ewma;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod probe;
pub mod ratelimit;
pub mod router;
pub mod state;
pub mod steering;
pub mod watchdog;
