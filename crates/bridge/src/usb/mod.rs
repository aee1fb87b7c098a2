//! Peripheral session subsystem
//!
//! Owns the lifecycle of the one USB serial connection:
//! - open with a fixed connection timeout, retry forever at a fixed interval
//! - apply the fixed line coding after every open
//! - pump inbound chunks to the registered observer in arrival order
//! - accept outbound writes from any task
//!
//! Blocking USB work runs on a dedicated thread (see [`worker`]) to keep the
//! Tokio runtime free, mirroring the sync/async split used throughout.

pub mod backlog;
pub mod device;
pub mod serial;
pub mod session;
pub mod worker;

pub use device::{DeviceError, DeviceOpener, SerialDevice};
pub use serial::{DeviceFilter, UsbSerialOpener};
pub use session::{PeripheralSession, SessionObserver};
pub use worker::{RetryPolicy, SessionControl, spawn_session_worker};
