//! Shared data types

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Serial parity setting
///
/// Discriminants match the CDC `bParityType` field and the CP210x line
/// control encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None = 0,
    Odd = 1,
    Even = 2,
    Mark = 3,
    Space = 4,
}

/// Serial stop bits setting
///
/// Discriminants match the CDC `bCharFormat` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopBits {
    #[default]
    One = 0,
    OnePointFive = 1,
    Two = 2,
}

/// Fixed line configuration applied to the peripheral after every open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineCoding {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
}

impl Default for LineCoding {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
        }
    }
}

impl LineCoding {
    /// Check that the coding can be expressed on the wire
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::InvalidBaudRate(self.baud_rate));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(ProtocolError::InvalidDataBits(self.data_bits));
        }
        Ok(())
    }

    /// CDC-ACM `SET_LINE_CODING` payload (7 bytes, little-endian rate)
    pub fn to_cdc_bytes(&self) -> [u8; 7] {
        let rate = self.baud_rate.to_le_bytes();
        [
            rate[0],
            rate[1],
            rate[2],
            rate[3],
            self.stop_bits as u8,
            self.parity as u8,
            self.data_bits,
        ]
    }

    /// CP210x `SET_LINE_CTL` wValue
    pub fn to_cp210x_line_ctl(&self) -> u16 {
        (self.stop_bits as u16) | ((self.parity as u16) << 4) | ((self.data_bits as u16) << 8)
    }
}

/// Peripheral connection status as reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub connected: bool,
}

/// Text frames pushed to relay subscribers
///
/// Peripheral data travels as binary messages; only control information is
/// sent as text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum HubFrame {
    Status(StatusSnapshot),
}

impl HubFrame {
    /// Encode as JSON text
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON text
    pub fn from_text(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
