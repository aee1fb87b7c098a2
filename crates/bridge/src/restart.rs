//! Supervised process restart
//!
//! A replacement job that finishes (or fails in a way only a fresh start can
//! resolve) schedules a restart here. The restart re-executes the current
//! binary with the same arguments; if that fails the process exits non-zero
//! and the service manager brings it back.

use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::service;

/// Schedules a whole-process restart
pub trait Restarter: Send + Sync {
    /// Restart after `delay`; later requests while one is pending are ignored
    fn schedule_restart(&self, delay: Duration, reason: &str);
}

/// Restarts the running process by re-executing it
#[derive(Debug, Default)]
pub struct ProcessRestarter {
    scheduled: AtomicBool,
}

impl ProcessRestarter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Restarter for ProcessRestarter {
    fn schedule_restart(&self, delay: Duration, reason: &str) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            info!("Restart already pending, ignoring: {}", reason);
            return;
        }
        warn!("Restarting in {}ms: {}", delay.as_millis(), reason);

        let spawned = std::thread::Builder::new()
            .name("restart".to_string())
            .spawn(move || {
                std::thread::sleep(delay);
                restart_now()
            });
        if let Err(e) = spawned {
            error!("Failed to spawn restart thread: {}", e);
            restart_now();
        }
    }
}

/// Replace the process image with a fresh copy of itself
fn restart_now() -> ! {
    if let Err(e) = service::notify_stopping() {
        warn!("{:#}", e);
    }

    match std::env::current_exe() {
        Ok(exe) => {
            info!("Re-executing {}", exe.display());
            let err = Command::new(&exe)
                .args(std::env::args_os().skip(1))
                .exec();
            error!("Re-exec of {} failed: {}", exe.display(), err);
        }
        Err(e) => error!("Cannot locate current executable: {}", e),
    }
    std::process::exit(1)
}
