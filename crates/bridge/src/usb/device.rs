//! Peripheral device abstraction
//!
//! The session manager only needs "open succeeds with a byte-stream handle"
//! and "device went away". [`DeviceOpener`] and [`SerialDevice`] are that
//! seam; the rusb implementation lives in [`super::serial`].

use protocol::LineCoding;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a peripheral handle
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    /// Transfer did not complete in time; retry locally
    #[error("transfer timed out")]
    Timeout,

    /// Device was removed or the handle is no longer usable
    #[error("device disconnected")]
    Disconnected,

    /// No device is currently open
    #[error("no device connected")]
    NotConnected,

    /// No matching device was found within the connection timeout
    #[error("no matching device found")]
    NotFound,

    /// Any other USB failure
    #[error("USB I/O error: {0}")]
    Io(String),
}

impl DeviceError {
    /// Whether the error should be retried without tearing the session down
    pub fn is_transient(&self) -> bool {
        matches!(self, DeviceError::Timeout)
    }
}

/// Byte-stream handle to an open peripheral
///
/// Reads are only issued by the session worker. Writes may come from any
/// thread concurrently with a read, so implementations must tolerate both.
pub trait SerialDevice: Send + Sync {
    /// Apply the fixed line configuration and assert the control lines
    fn apply_line_coding(&self, coding: &LineCoding) -> Result<(), DeviceError>;

    /// Read one inbound chunk; `Ok(0)` means nothing arrived
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, DeviceError>;

    /// Write a prefix of `data`, returning how many bytes were accepted
    fn write(&self, data: &[u8], timeout: Duration) -> Result<usize, DeviceError>;

    /// Human-readable identity for logs
    fn describe(&self) -> String;
}

/// Acquires peripheral handles
pub trait DeviceOpener: Send {
    /// Wait up to `timeout` for a device and open it
    fn open(&mut self, timeout: Duration) -> Result<Box<dyn SerialDevice>, DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_transient() {
        assert!(DeviceError::Timeout.is_transient());
        assert!(!DeviceError::Disconnected.is_transient());
        assert!(!DeviceError::NotConnected.is_transient());
        assert!(!DeviceError::Io("pipe".into()).is_transient());
    }
}
