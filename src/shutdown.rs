// Cooperative shutdown on SIGINT/SIGTERM
//
// A signal only flips an atomic flag. Work that is already running is never
// interrupted; the coordinator reads the flag before starting each item.
//
// Handlers are installed once per process. While at least one run is
// registered, a signal is forwarded to every registered run; a second signal
// while shutdown is already requested exits with code 1. With no run
// registered, the signal gets its default action again.

use crate::utils::lock_mutex_recover;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Shared shutdown flag, cheap to clone across worker threads
#[derive(Clone, Debug, Default)]
pub struct ShutdownState {
    shutdown_requested: Arc<AtomicBool>,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a shutdown (same effect as receiving SIGINT)
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
        log::info!("Shutdown requested");
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Clear the flag before a new run
    pub fn reset(&self) {
        self.shutdown_requested.store(false, Ordering::SeqCst);
    }
}

/// Runs currently receiving signals
static ACTIVE_RUNS: Mutex<Vec<(u64, ShutdownState)>> = Mutex::new(Vec::new());
static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(0);
static HANDLER_INSTALLED: OnceLock<Result<(), String>> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SignalAction {
    /// Shutdown requested on every active run
    Forwarded,
    /// Second signal during a shutdown
    Exit,
    /// No active run
    Default,
}

fn route_signal() -> SignalAction {
    let active = lock_mutex_recover(&ACTIVE_RUNS);
    if active.is_empty() {
        return SignalAction::Default;
    }
    if active.iter().any(|(_, state)| state.is_shutdown_requested()) {
        return SignalAction::Exit;
    }
    for (_, state) in active.iter() {
        state.request_shutdown();
    }
    SignalAction::Forwarded
}

/// Keeps a run registered for signals; deregisters it on drop
pub struct SignalGuard {
    id: u64,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        lock_mutex_recover(&ACTIVE_RUNS).retain(|(id, _)| *id != self.id);
        log::debug!("Run {} no longer receives signals", self.id);
    }
}

/// Forward SIGINT/SIGTERM (Ctrl+C on Windows) to `state` until the guard drops.
///
/// The first signal only requests shutdown. A second signal while the flag is
/// already set terminates the process with exit code 1.
pub fn register_signal_handlers(state: &ShutdownState) -> Result<SignalGuard> {
    if let Err(e) = HANDLER_INSTALLED.get_or_init(install_handler) {
        return Err(anyhow!("Failed to register signal handlers: {}", e));
    }

    let id = NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed);
    lock_mutex_recover(&ACTIVE_RUNS).push((id, state.clone()));
    log::debug!("Run {} receives signals", id);
    Ok(SignalGuard { id })
}

#[cfg(unix)]
fn install_handler() -> Result<(), String> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(|e| e.to_string())?;
    std::thread::Builder::new()
        .name("ralph-signals".to_string())
        .spawn(move || {
            for signal in signals.forever() {
                handle_signal(signal);
            }
        })
        .map_err(|e| e.to_string())?;

    log::info!("Signal handlers registered (SIGINT, SIGTERM)");
    Ok(())
}

#[cfg(unix)]
fn handle_signal(signal: i32) {
    match route_signal() {
        SignalAction::Forwarded => {
            log::info!("Received signal {}, finishing in-flight items", signal)
        }
        SignalAction::Exit => {
            log::warn!("Received signal {} during shutdown, exiting", signal);
            std::process::exit(1);
        }
        SignalAction::Default => {
            if let Err(e) = signal_hook::low_level::emulate_default_handler(signal) {
                log::error!("Failed to apply default action for signal {}: {}", signal, e);
            }
        }
    }
}

#[cfg(windows)]
fn install_handler() -> Result<(), String> {
    ctrlc::set_handler(|| match route_signal() {
        SignalAction::Forwarded => log::info!("Received Ctrl+C, finishing in-flight items"),
        SignalAction::Exit => {
            log::warn!("Received Ctrl+C during shutdown, exiting");
            std::process::exit(1);
        }
        // STATUS_CONTROL_C_EXIT, what the default handler reports
        SignalAction::Default => std::process::exit(0xC000013A_u32 as i32),
    })
    .map_err(|e| e.to_string())?;

    log::info!("Signal handler registered (Ctrl+C)");
    Ok(())
}
