//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Data bits outside the range a serial line supports
    #[error("Invalid data bits: {0} (expected 5..=8)")]
    InvalidDataBits(u8),

    /// Baud rate of zero
    #[error("Invalid baud rate: {0}")]
    InvalidBaudRate(u32),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::InvalidDataBits(9);
        let msg = format!("{}", err);
        assert!(msg.contains("Invalid data bits"));
        assert!(msg.contains('9'));
    }
}
