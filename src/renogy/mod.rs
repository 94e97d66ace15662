//! Modbus-over-GATT client for Renogy-family battery devices: request/
//! response framing with CRC (delegated to [`crate::wire::modbus`]),
//! multi-device (Modbus unit id) iteration, timeout and retry handling, and
//! parser dispatch by register section (`SPEC_FULL.md` §4.5).

pub mod client;
pub mod parsers;
pub mod sections;

use std::collections::HashMap;

use thiserror::Error;

/// A decoded register value. Most fields are numeric; the device-info
/// section also yields a short text field (the reported model string).
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Number(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            FieldValue::Text(_) => None,
        }
    }
}

pub type FieldMap = HashMap<String, FieldValue>;

/// A single device's accumulated readings for one read cycle, keyed by
/// Modbus unit id.
pub type Reading = FieldMap;

#[derive(Debug, Error)]
pub enum Error {
    #[error("BLE error: {0}")]
    Ble(#[from] crate::ble::Error),
    #[error("Modbus framing error: {0}")]
    Modbus(#[from] crate::wire::modbus::ModbusError),
    #[error("read timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("cycle cancelled")]
    Cancelled,
    #[error("transport error: {0}")]
    Transport(String),
}
