//! Admin command-line surface (SPEC_FULL.md §4.14).
//!
//! Grounded in `strata-agent::main::Cli`: a `clap::Parser`-derived flat
//! struct of long-only flags with `default_value`/`Option` fields, no
//! subcommands.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wanctl", about = "CAKE bufferbloat autorate and link-steering daemon")]
pub struct Cli {
    /// Path to the TOML configuration document.
    #[arg(long, default_value = "/etc/wanctl/config.toml")]
    pub config: PathBuf,

    /// Run exactly one control cycle per loop, then exit. For tests and
    /// manual inspection.
    #[arg(long, default_value_t = false)]
    pub once: bool,

    /// Delete persisted state and lock files for every configured WAN
    /// and steering, then exit without starting any loop.
    #[arg(long, default_value_t = false)]
    pub reset: bool,

    /// Parse and validate the configuration, print the outcome, and
    /// exit without starting any loop.
    #[arg(long, default_value_t = false)]
    pub validate: bool,

    /// Override the health endpoint's listen port.
    #[arg(long)]
    pub health_port: Option<u16>,

    /// Override the metrics endpoint's listen port (enables it if the
    /// config left it disabled).
    #[arg(long)]
    pub metrics_port: Option<u16>,
}
