//! Protocol library for usb-ws-bridge
//!
//! This crate defines the data shared between the bridge's layers and its
//! network clients: the peripheral status snapshot, the text frames pushed
//! to relay subscribers, the serial line coding, and the endpoint paths.
//!
//! # Example
//!
//! ```
//! use protocol::{HubFrame, StatusSnapshot};
//!
//! let frame = HubFrame::Status(StatusSnapshot { connected: true });
//! let text = frame.to_text().unwrap();
//! assert_eq!(text, r#"{"type":"status","connected":true}"#);
//! ```

pub mod endpoints;
pub mod error;
pub mod types;

pub use error::{ProtocolError, Result};
pub use types::{HubFrame, LineCoding, Parity, StatusSnapshot, StopBits};
