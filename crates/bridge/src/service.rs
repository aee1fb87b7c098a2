//! Systemd service integration
//!
//! Speaks the sd-notify datagram protocol directly: readiness, status line,
//! watchdog keepalives and the stopping notice sent before a restart. Every
//! call is a no-op when `NOTIFY_SOCKET` is unset.

use anyhow::{Context, Result};
use std::env;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn notify(message: &str) -> Result<bool> {
    let Ok(socket_path) = env::var("NOTIFY_SOCKET") else {
        return Ok(false);
    };
    send_notify(&socket_path, message)?;
    Ok(true)
}

fn send_notify(socket_path: &str, message: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    Ok(())
}

/// Tell systemd the bridge is serving
pub fn notify_ready() -> Result<()> {
    if notify("READY=1")? {
        info!("Notified systemd: service ready");
    }
    Ok(())
}

/// Tell systemd the process is about to stop or re-exec
pub fn notify_stopping() -> Result<()> {
    if notify("STOPPING=1")? {
        info!("Notified systemd: service stopping");
    }
    Ok(())
}

/// One watchdog keepalive
pub fn notify_watchdog() -> Result<()> {
    notify("WATCHDOG=1").map(|_| ())
}

/// Free-form status shown by `systemctl status`
pub fn notify_status(status: &str) -> Result<()> {
    if notify(&format!("STATUS={}", status))? {
        debug!("Notified systemd: status = {}", status);
    }
    Ok(())
}

/// Whether the process was started with a notify socket
pub fn is_systemd() -> bool {
    env::var("NOTIFY_SOCKET").is_ok()
}

/// Keepalive period for a `WATCHDOG_USEC` value: half the timeout, at least 1s
fn watchdog_interval(watchdog_usec: Option<&str>) -> Option<Duration> {
    let usec: u64 = watchdog_usec?.trim().parse().ok()?;
    if usec == 0 {
        return None;
    }
    Some(Duration::from_micros(usec / 2).max(Duration::from_secs(1)))
}

/// Send watchdog keepalives while the process runs
///
/// Returns `None` when the watchdog is not enabled.
pub fn spawn_watchdog_task() -> Option<JoinHandle<()>> {
    let interval = watchdog_interval(env::var("WATCHDOG_USEC").ok().as_deref())?;
    info!("Systemd watchdog enabled, interval: {}s", interval.as_secs());

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if let Err(e) = notify_watchdog() {
                warn!("Failed to send watchdog keepalive: {:#}", e);
            }
        }
    }))
}
