//! Common utilities for usb-ws-bridge
//!
//! This crate provides the ambient pieces shared by the bridge crates:
//! error handling and logging setup.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
pub use logging::setup_logging;
