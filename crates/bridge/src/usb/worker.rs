//! Peripheral session worker
//!
//! Dedicated thread that owns the open/retry loop and the inbound event
//! pump. USB transfers are blocking, so this runs outside the Tokio runtime
//! and is controlled through an async channel.
//!
//! The loop is an explicit state machine:
//!
//! ```text
//! Opening ──ok──> Connected ──device gone──> Opening
//!    │                                          ^
//!    └──fail──> Backoff ──fixed interval────────┘
//! ```
//!
//! Backoff is a fixed interval, not exponential, and retries never give up.

use async_channel::{Receiver, Sender, TryRecvError, bounded};
use protocol::LineCoding;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::device::{DeviceError, DeviceOpener, SerialDevice};
use super::session::PeripheralSession;

/// Largest inbound chunk read in one transfer
pub const READ_CHUNK_SIZE: usize = 512;

/// Granularity at which sleeps check for shutdown
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Timing contract of the open/retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// How long one open attempt waits for a device
    pub connect_timeout: Duration,
    /// Fixed pause between failed attempts
    pub retry_interval: Duration,
    /// Read timeout of the event pump; bounds shutdown latency
    pub read_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(5000),
            retry_interval: Duration::from_millis(1000),
            read_timeout: Duration::from_millis(100),
        }
    }
}

/// Commands from the Tokio runtime to the session worker
#[derive(Debug)]
pub enum SessionCommand {
    /// Release the device and stop the worker
    Shutdown,
}

/// Async-side handle to the session worker
#[derive(Clone)]
pub struct SessionControl {
    cmd_tx: Sender<SessionCommand>,
}

impl SessionControl {
    /// Ask the worker to stop
    pub async fn shutdown(&self) -> common::Result<()> {
        self.cmd_tx
            .send(SessionCommand::Shutdown)
            .await
            .map_err(|e| common::Error::Channel(e.to_string()))
    }

    /// Ask the worker to stop from synchronous code
    pub fn shutdown_blocking(&self) -> common::Result<()> {
        self.cmd_tx
            .send_blocking(SessionCommand::Shutdown)
            .map_err(|e| common::Error::Channel(e.to_string()))
    }
}

/// Worker loop phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening { attempt: u64 },
    Backoff { attempt: u64 },
}

/// Session worker state
pub struct SessionWorker<O: DeviceOpener> {
    opener: O,
    session: Arc<PeripheralSession>,
    coding: LineCoding,
    policy: RetryPolicy,
    cmd_rx: Receiver<SessionCommand>,
}

impl<O: DeviceOpener> SessionWorker<O> {
    /// Run until shutdown is requested or the control handle is dropped
    pub fn run(mut self) {
        info!(
            "Session worker started (connect timeout {}ms, retry every {}ms)",
            self.policy.connect_timeout.as_millis(),
            self.policy.retry_interval.as_millis()
        );

        let mut phase = Phase::Opening { attempt: 1 };
        while !self.shutdown_requested() {
            phase = match phase {
                Phase::Opening { attempt } => match self.try_open(attempt) {
                    Some(device) => {
                        self.session.attach(device.clone());
                        let keep_running = self.pump(device.as_ref());
                        self.session.detach();
                        if !keep_running {
                            break;
                        }
                        Phase::Opening { attempt: 1 }
                    }
                    None => Phase::Backoff { attempt },
                },
                Phase::Backoff { attempt } => {
                    if !self.sleep(self.policy.retry_interval) {
                        break;
                    }
                    Phase::Opening {
                        attempt: attempt + 1,
                    }
                }
            };
        }

        self.session.detach();
        info!("Session worker stopped");
    }

    /// One open attempt including line configuration
    fn try_open(&mut self, attempt: u64) -> Option<Arc<dyn SerialDevice>> {
        debug!("Opening peripheral (attempt {})", attempt);
        let device: Arc<dyn SerialDevice> = match self.opener.open(self.policy.connect_timeout) {
            Ok(device) => Arc::from(device),
            Err(e) => {
                let failures = self.session.record_failed_attempt();
                if failures == 1 || failures % 60 == 0 {
                    info!("No peripheral yet ({}), retrying (attempt {})", e, attempt);
                } else {
                    debug!("Open failed: {}", e);
                }
                return None;
            }
        };

        if let Err(e) = device.apply_line_coding(&self.coding) {
            warn!(
                "Failed to configure {}: {}, releasing",
                device.describe(),
                e
            );
            self.session.record_failed_attempt();
            return None;
        }

        debug!(
            "Line coding applied: {} baud, {} data bits, {:?} parity, {:?} stop",
            self.coding.baud_rate, self.coding.data_bits, self.coding.parity, self.coding.stop_bits
        );
        Some(device)
    }

    /// Pump inbound data until the device goes away
    ///
    /// Returns `false` if shutdown was requested.
    fn pump(&mut self, device: &dyn SerialDevice) -> bool {
        let mut buf = [0u8; READ_CHUNK_SIZE];
        loop {
            if self.shutdown_requested() {
                return false;
            }
            match device.read(&mut buf, self.policy.read_timeout) {
                Ok(0) => {}
                Ok(n) => self.session.deliver(&buf[..n]),
                Err(e) if e.is_transient() => {}
                Err(DeviceError::Disconnected) => {
                    info!("Device removal signalled");
                    return true;
                }
                Err(e) => {
                    warn!("Read failed, dropping session: {}", e);
                    return true;
                }
            }
        }
    }

    fn shutdown_requested(&self) -> bool {
        match self.cmd_rx.try_recv() {
            Ok(SessionCommand::Shutdown) => {
                info!("Session worker shutting down");
                true
            }
            Err(TryRecvError::Closed) => true,
            Err(TryRecvError::Empty) => false,
        }
    }

    /// Sleep for `duration`; returns `false` if shutdown arrived meanwhile
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SHUTDOWN_POLL.min(deadline - now));
            if self.shutdown_requested() {
                return false;
            }
        }
    }
}

/// Spawn the session worker thread
pub fn spawn_session_worker<O>(
    opener: O,
    session: Arc<PeripheralSession>,
    coding: LineCoding,
    policy: RetryPolicy,
) -> std::io::Result<(SessionControl, JoinHandle<()>)>
where
    O: DeviceOpener + 'static,
{
    let (cmd_tx, cmd_rx) = bounded(8);
    let worker = SessionWorker {
        opener,
        session,
        coding,
        policy,
        cmd_rx,
    };

    let handle = std::thread::Builder::new()
        .name("usb-session".to_string())
        .spawn(move || worker.run())?;

    Ok((SessionControl { cmd_tx }, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{ScriptedOpener, wait_until};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            connect_timeout: Duration::from_millis(5),
            retry_interval: Duration::from_millis(10),
            read_timeout: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_retries_until_device_appears() {
        let session = PeripheralSession::new(64, Duration::from_millis(50));
        let (opener, script) = ScriptedOpener::new();
        script.fail_next(3);
        let device = script.push_device("late");

        let (control, handle) =
            spawn_session_worker(opener, session.clone(), LineCoding::default(), fast_policy())
                .unwrap();

        assert!(wait_until(Duration::from_secs(5), || session.is_connected()));
        assert!(script.open_calls() >= 4);
        assert_eq!(device.line_coding(), Some(LineCoding::default()));

        control.shutdown_blocking().unwrap();
        handle.join().unwrap();
        assert!(!session.is_connected());
    }

    #[test]
    fn test_reconnects_after_removal() {
        let session = PeripheralSession::new(64, Duration::from_millis(50));
        let (opener, script) = ScriptedOpener::new();
        let first = script.push_device("first");
        let second = script.push_device("second");

        let (control, handle) =
            spawn_session_worker(opener, session.clone(), LineCoding::default(), fast_policy())
                .unwrap();

        assert!(wait_until(Duration::from_secs(5), || session.is_connected()));
        first.unplug();
        assert!(wait_until(Duration::from_secs(5), || second.is_open()));
        assert!(wait_until(Duration::from_secs(5), || session.is_connected()));

        session.write(b"ping").unwrap();
        assert_eq!(second.written(), b"ping");
        assert!(first.written().is_empty());

        control.shutdown_blocking().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_configuration_failure_counts_as_failed_open() {
        let session = PeripheralSession::new(64, Duration::from_millis(50));
        let (opener, script) = ScriptedOpener::new();
        let broken = script.push_device("broken");
        broken.fail_line_coding();
        let good = script.push_device("good");

        let (control, handle) =
            spawn_session_worker(opener, session.clone(), LineCoding::default(), fast_policy())
                .unwrap();

        assert!(wait_until(Duration::from_secs(5), || good.is_open()
            && session.is_connected()));

        control.shutdown_blocking().unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_dropping_control_stops_worker() {
        let session = PeripheralSession::new(64, Duration::from_millis(50));
        let (opener, _script) = ScriptedOpener::new();
        let (control, handle) =
            spawn_session_worker(opener, session, LineCoding::default(), fast_policy()).unwrap();
        drop(control);
        handle.join().unwrap();
    }
}
