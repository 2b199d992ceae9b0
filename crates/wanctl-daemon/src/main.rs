//! Process entry point: parses the CLI, loads configuration, starts one
//! autorate loop per WAN plus an optional steering loop, and serves the
//! health/metrics HTTP surfaces until a termination signal arrives
//! (SPEC_FULL.md §4.14).

mod cli;
mod http;
mod logging_router;
mod signal;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::Parser;

use wanctl_core::autorate::{AutorateController, AutorateLoop};
use wanctl_core::clock::SystemClock;
use wanctl_core::config::Config;
use wanctl_core::error::LockError;
use wanctl_core::health::{HealthAggregator, WanHandle};
use wanctl_core::lock::FileLock;
use wanctl_core::probe::{Probe, ProbeConfig, RawIcmpPinger};
use wanctl_core::router::RouterSession;
use wanctl_core::state::{StateStore, WanState};
use wanctl_core::steering::{SteeringController, SteeringLoop, SteeringRecord};
use wanctl_core::watchdog::Watchdog;

use crate::logging_router::LoggingRouterSession;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let args = cli::Cli::parse();

    let config = match Config::load(&args.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, path = %args.config.display(), "failed to load configuration");
            std::process::exit(1);
        }
    };

    if args.validate {
        tracing::info!(wans = config.wans.len(), steering = config.steering.is_some(), "configuration is valid");
        return Ok(());
    }

    if args.reset {
        reset_all(&config);
        return Ok(());
    }

    run(config, &args)
}

fn lock_path(dir: &str, name: &str) -> PathBuf {
    PathBuf::from(dir).join(format!("{name}.lock"))
}

fn reset_all(config: &Config) {
    for wan in &config.wans {
        let store = StateStore::new(&wan.state_dir, &wan.name);
        if let Err(e) = store.reset() {
            tracing::warn!(wan = %wan.name, error = %e, "failed to reset state");
        }
        let _ = std::fs::remove_file(lock_path(&wan.lock_dir, &wan.name));
        tracing::info!(wan = %wan.name, "state and lock reset");
    }
    if let Some(steering) = &config.steering {
        let _ = std::fs::remove_file(steering_state_path(&steering.state_dir));
        let _ = std::fs::remove_file(lock_path(&steering.lock_dir, "steering"));
        tracing::info!("steering state and lock reset");
    }
}

fn steering_state_path(dir: &str) -> PathBuf {
    PathBuf::from(dir).join("steering_state.json")
}

/// Acquires the lock at `path`, exiting the process with code 2 (spec.md
/// §6: "2 reserved for lock contention") if a live owner already holds
/// it. Other lock errors (I/O, malformed contents) propagate as a
/// general failure.
fn acquire_lock_or_exit(path: PathBuf, wan: &str) -> anyhow::Result<FileLock> {
    match FileLock::acquire(&path) {
        Ok(lock) => Ok(lock),
        Err(LockError::AlreadyHeld(pid)) => {
            tracing::error!(wan, pid, path = %path.display(), "lock already held by a live process");
            std::process::exit(2);
        }
        Err(e) => Err(e.into()),
    }
}

/// A running WAN's liveness handles, read by the health/metrics servers.
/// Holds no lock and no thread handle — those live in `run()`'s own
/// `wan_locks`/`wan_loops`, outside the `Arc` shared with the HTTP
/// threads, so they are guaranteed to drop (and release the lock file)
/// when `run()` returns regardless of whether those threads ever exit.
struct RunningWan {
    name: String,
    state_handle: Arc<Mutex<WanState>>,
    watchdog: Watchdog,
}

fn run(config: Config, args: &cli::Cli) -> anyhow::Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    signal::install(shutdown.clone());

    let router: Arc<dyn RouterSession> = Arc::new(LoggingRouterSession);

    let mut wans = Vec::with_capacity(config.wans.len());
    let mut wan_loops = Vec::with_capacity(config.wans.len());
    let mut wan_locks = Vec::with_capacity(config.wans.len());
    for wan_config in &config.wans {
        let lock = acquire_lock_or_exit(lock_path(&wan_config.lock_dir, &wan_config.name), &wan_config.name)?;
        let store = StateStore::new(&wan_config.state_dir, &wan_config.name);
        let state = store.load(wan_config.baseline_hint_ms, wan_config.downlink.ceiling_bps, wan_config.uplink.ceiling_bps);
        let state_handle = Arc::new(Mutex::new(state.clone()));
        let watchdog = Watchdog::new();

        let probe_config: ProbeConfig = (&wan_config.probe).into();
        let probe = Probe::new(probe_config, Box::new(RawIcmpPinger));
        let controller = AutorateController::new(wan_config.clone(), state);

        let autorate_loop = AutorateLoop::spawn(
            wan_config.name.clone(),
            controller,
            Arc::new(SystemClock::new()),
            probe,
            router.clone(),
            store,
            watchdog.clone(),
            state_handle.clone(),
            args.once,
        )?;

        wans.push(RunningWan {
            name: wan_config.name.clone(),
            state_handle,
            watchdog,
        });
        wan_loops.push(autorate_loop);
        wan_locks.push(lock);
    }

    let mut steering_loop: Option<SteeringLoop> = None;
    let mut steering_lock: Option<FileLock> = None;
    let steering_ctx = if let Some(steering_config) = config.steering.clone() {
        let lock = acquire_lock_or_exit(lock_path(&steering_config.lock_dir, "steering"), "steering")?;
        steering_lock = Some(lock);
        let steering_store = wanctl_core::state::SteeringStateStore::new(&steering_config.state_dir);
        let record = steering_store.load();
        let controller = SteeringController::new(steering_config.clone(), record);

        let primary_wan_config = config
            .wans
            .iter()
            .find(|w| w.name == steering_config.primary_wan)
            .expect("config validation guarantees primary_wan matches a configured wan")
            .clone();
        let queue_name = primary_wan_config.queue_name.clone();
        let primary_store = StateStore::new(&primary_wan_config.state_dir, &primary_wan_config.name);
        let primary_state_reader = move || {
            primary_store
                .load(primary_wan_config.baseline_hint_ms, primary_wan_config.downlink.ceiling_bps, primary_wan_config.uplink.ceiling_bps)
                .baseline_rtt_ewma_ms
        };

        let probe_config: ProbeConfig = (&steering_config.probe).into();
        let probe = Probe::new(probe_config, Box::new(RawIcmpPinger));

        steering_loop = Some(SteeringLoop::spawn(
            controller,
            Arc::new(SystemClock::new()),
            probe,
            router.clone(),
            wanctl_core::state::SteeringStateStore::new(&steering_config.state_dir),
            primary_state_reader,
            queue_name,
            args.once,
        )?);

        Some(steering_config.state_dir.clone())
    } else {
        None
    };

    let health_port = args.health_port.unwrap_or(config.health_port);
    let metrics_port = args.metrics_port.or(config.metrics_port);

    let aggregator = Arc::new(HealthAggregator::new(30));
    let wans = Arc::new(wans);
    let steering_state_dir = steering_ctx;

    {
        let aggregator = aggregator.clone();
        let wans = wans.clone();
        let steering_state_dir = steering_state_dir.clone();
        std::thread::Builder::new()
            .name("health-http".into())
            .spawn(move || {
                let bind = format!("127.0.0.1:{health_port}");
                if let Err(e) = http::run_health_server(&bind, move || build_snapshot(&aggregator, &wans, steering_state_dir.as_deref())) {
                    tracing::error!(error = %e, "health server failed");
                }
            })?;
    }

    if let Some(metrics_port) = metrics_port {
        let aggregator = aggregator.clone();
        let wans = wans.clone();
        let steering_state_dir = steering_state_dir.clone();
        std::thread::Builder::new()
            .name("metrics-http".into())
            .spawn(move || {
                let bind = format!("127.0.0.1:{metrics_port}");
                if let Err(e) = http::run_metrics_server(&bind, move || build_snapshot(&aggregator, &wans, steering_state_dir.as_deref())) {
                    tracing::error!(error = %e, "metrics server failed");
                }
            })?;
    }

    if args.once {
        // Single-cycle mode: each loop already ran its one cycle inside
        // its spawn closure and is on its way to exiting on its own;
        // `shutdown()` joins rather than guessing how long that takes.
        // `wan_locks`/`steering_lock` are not shared with the HTTP
        // threads, so they drop here regardless of whether those
        // threads ever return from `listener.incoming()`.
        for autorate_loop in &mut wan_loops {
            autorate_loop.shutdown();
        }
        if let Some(loop_) = &mut steering_loop {
            loop_.shutdown();
        }
        return Ok(());
    }

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(std::time::Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    for autorate_loop in &mut wan_loops {
        autorate_loop.shutdown();
    }
    if let Some(loop_) = &mut steering_loop {
        loop_.shutdown();
    }
    drop(wan_locks);
    drop(steering_lock);
    Ok(())
}

fn build_snapshot(
    aggregator: &HealthAggregator,
    wans: &[RunningWan],
    steering_state_dir: Option<&str>,
) -> wanctl_core::health::HealthSnapshot {
    let states: Vec<WanState> = wans.iter().map(|w| w.state_handle.lock().unwrap_or_else(|e| e.into_inner()).clone()).collect();
    let handles: Vec<WanHandle<'_>> = wans
        .iter()
        .zip(states.iter())
        .map(|(w, state)| WanHandle {
            name: &w.name,
            state,
            watchdog: &w.watchdog,
        })
        .collect();

    let steering_record: Option<SteeringRecord> =
        steering_state_dir.map(|dir| wanctl_core::state::SteeringStateStore::new(dir).load());

    aggregator.snapshot(&handles, steering_record.as_ref())
}
