//! OS termination signal handling (SPEC_FULL.md §4.14, §5).
//!
//! Grounded directly in `strata_receiver.rs`'s local `ctrlc` shim: a
//! dedicated thread blocked in `sigwait` on SIGINT/SIGTERM rather than
//! pulling in the `ctrlc` crate, since the only consumer is a single
//! shared `AtomicBool` flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

static HANDLER_SET: AtomicBool = AtomicBool::new(false);

/// Spawns a background thread that waits for SIGINT/SIGTERM and then
/// sets `shutdown` to `true`. Idempotent: a second call is a no-op.
pub fn install(shutdown: Arc<AtomicBool>) {
    if HANDLER_SET.swap(true, Ordering::SeqCst) {
        return;
    }
    let _ = std::thread::Builder::new().name("signal".into()).spawn(move || {
        wait_for_signal();
        tracing::info!("shutdown signal received");
        shutdown.store(true, Ordering::Relaxed);
    });
}

#[cfg(unix)]
fn wait_for_signal() {
    unsafe {
        let mut mask: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut mask);
        libc::sigaddset(&mut mask, libc::SIGINT);
        libc::sigaddset(&mut mask, libc::SIGTERM);
        let mut sig: libc::c_int = 0;
        libc::sigwait(&mask, &mut sig);
    }
}

#[cfg(not(unix))]
fn wait_for_signal() {
    loop {
        std::thread::sleep(std::time::Duration::from_millis(100));
    }
}
