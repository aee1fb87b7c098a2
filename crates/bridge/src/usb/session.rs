//! Peripheral session state
//!
//! Exactly one [`PeripheralSession`] exists per process. Its connection
//! state is changed only by the session worker (see [`super::worker`]); any
//! other task may read the status or call [`PeripheralSession::write`].
//!
//! The device handle never leaves this module. `write` clones the handle
//! reference under the lock and performs the transfer after releasing it,
//! so a write racing a disconnect fails cleanly with a device error.

use protocol::StatusSnapshot;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backlog::Backlog;
use super::device::{DeviceError, SerialDevice};

/// Receives session events on the worker thread
///
/// Handlers run synchronously before the worker resumes reading, so they
/// must not block: hand slow work to another task.
pub trait SessionObserver: Send + Sync {
    /// Connection opened (`true`) or closed (`false`)
    fn on_connection_changed(&self, connected: bool);

    /// One inbound chunk, in arrival order
    fn on_data(&self, data: &[u8]);
}

struct SessionState {
    /// `Some` iff connected
    device: Option<Arc<dyn SerialDevice>>,
    /// Failed opens since the last successful one
    reconnect_attempt: u64,
    backlog: Backlog,
}

/// Process-wide peripheral session
pub struct PeripheralSession {
    state: Mutex<SessionState>,
    observer: OnceLock<Arc<dyn SessionObserver>>,
    write_timeout: Duration,
}

impl PeripheralSession {
    /// Create a disconnected session
    pub fn new(backlog_bytes: usize, write_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SessionState {
                device: None,
                reconnect_attempt: 0,
                backlog: Backlog::new(backlog_bytes),
            }),
            observer: OnceLock::new(),
            write_timeout,
        })
    }

    /// Register the single event handler
    ///
    /// Returns `false` if a handler was already registered.
    pub fn register_observer(&self, observer: Arc<dyn SessionObserver>) -> bool {
        self.observer.set(observer).is_ok()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a device is currently open
    pub fn is_connected(&self) -> bool {
        self.state().device.is_some()
    }

    /// Status as reported to clients
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            connected: self.is_connected(),
        }
    }

    /// Failed open attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u64 {
        self.state().reconnect_attempt
    }

    /// Most recent inbound bytes
    pub fn backlog(&self) -> Vec<u8> {
        self.state().backlog.snapshot()
    }

    /// Forward bytes to the open device
    ///
    /// Fails with [`DeviceError::NotConnected`] when no device is open.
    /// Nothing is queued or retried beyond completing a partial write.
    pub fn write(&self, data: &[u8]) -> Result<usize, DeviceError> {
        let device = self
            .state()
            .device
            .clone()
            .ok_or(DeviceError::NotConnected)?;

        let mut written = 0;
        while written < data.len() {
            match device.write(&data[written..], self.write_timeout)? {
                0 => return Err(DeviceError::Timeout),
                n => written += n,
            }
        }
        debug!("Wrote {} bytes to {}", written, device.describe());
        Ok(written)
    }

    /// Install a freshly opened device (worker only)
    pub(crate) fn attach(&self, device: Arc<dyn SerialDevice>) {
        let label = device.describe();
        {
            let mut state = self.state();
            state.device = Some(device);
            state.reconnect_attempt = 0;
        }
        info!("Peripheral connected: {}", label);
        if let Some(observer) = self.observer.get() {
            observer.on_connection_changed(true);
        }
    }

    /// Release the device handle (worker only)
    pub(crate) fn detach(&self) {
        let previous = {
            let mut state = self.state();
            state.backlog.clear();
            state.device.take()
        };
        let Some(device) = previous else {
            return;
        };
        info!("Peripheral disconnected: {}", device.describe());
        drop(device);
        if let Some(observer) = self.observer.get() {
            observer.on_connection_changed(false);
        }
    }

    /// Record one failed open (worker only); returns the running count
    pub(crate) fn record_failed_attempt(&self) -> u64 {
        let mut state = self.state();
        state.reconnect_attempt += 1;
        state.reconnect_attempt
    }

    /// Deliver one inbound chunk (worker only)
    pub(crate) fn deliver(&self, data: &[u8]) {
        self.state().backlog.push(data);
        match self.observer.get() {
            Some(observer) => observer.on_data(data),
            None => warn!("Dropping {} inbound bytes: no observer", data.len()),
        }
    }
}
