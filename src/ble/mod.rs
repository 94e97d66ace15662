//! Abstraction over the OS BLE stack: passive scan with a detection
//! callback, GATT connect / notify / write, and adapter power cycling.
//!
//! [`bluez`] is the only implementation shipped — a single primary adapter
//! backed by BlueZ over D-Bus via the `bluer` crate — but the [`BleAdapter`]
//! trait exists so the [`crate::airtime::AirtimeCoordinator`] and
//! [`crate::renogy::client::ModbusGattClient`] never talk to `bluer` types
//! directly, matching the "queue-based adapter between the OS callback and
//! the reactor" design note in `SPEC_FULL.md` §9.

pub mod bluez;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

/// 48-bit BLE device address, stored big-endian-printable (`AA:BB:CC:DD:EE:FF`
/// order) for display but compared case-insensitively.
pub type MacAddress = [u8; 6];

/// Wire-level address type. The native-API wire value is `0` for public and
/// `1` for random — the spec's resolution of the "random vs 1" open question
/// (`SPEC_FULL.md` §9) — so this enum's `as u8` must never be reordered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AddressType {
    Public = 0,
    Random = 1,
}

impl AddressType {
    pub fn wire_value(self) -> u8 {
        self as u8
    }
}

/// A single BLE advertisement observed by the radio.
#[derive(Clone, Debug, PartialEq)]
pub struct AdvertisementEvent {
    pub address: MacAddress,
    pub address_type: AddressType,
    pub rssi: i8,
    pub local_name: Option<String>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<String, Vec<u8>>,
    pub service_uuids: Vec<String>,
    pub tx_power: Option<i8>,
    pub flags: Option<u8>,
}

impl AdvertisementEvent {
    pub fn address_string(&self) -> String {
        format_mac(&self.address)
    }

    /// True if this advertisement originates from the host's own adapter —
    /// BlueZ surfaces the controller itself as a device named
    /// `hciN (AA:BB:CC:DD:EE:FF)` while it is in discoverable mode. Such
    /// self-advertisements must never reach the fan-out path.
    pub fn is_from_own_adapter(&self) -> bool {
        self.local_name
            .as_deref()
            .map(is_own_adapter_name)
            .unwrap_or(false)
    }
}

static OWN_ADAPTER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hci\d+ \([0-9A-F:]+\)$").expect("static regex is valid"));

pub fn is_own_adapter_name(name: &str) -> bool {
    OWN_ADAPTER_NAME.is_match(name)
}

pub fn format_mac(mac: &MacAddress) -> String {
    mac.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn parse_mac(s: &str) -> Option<MacAddress> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, part) in parts.iter().enumerate() {
        out[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(out)
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("adapter not ready")]
    NotReady,
    #[error("an operation is already in progress")]
    InProgress,
    #[error("D-Bus call to bluetoothd hung: {0}")]
    DbusHung(String),
    #[error("discovery exhausted after {attempts} attempts")]
    DiscoveryExhausted { attempts: u32 },
    #[error("failed to connect to {address}: {source}")]
    ConnectFailed {
        address: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("GATT write to {characteristic} failed: {source}")]
    WriteFailed {
        characteristic: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("device {address} disconnected")]
    Disconnected { address: String },
    #[error("D-Bus error: {0}")]
    Dbus(#[source] anyhow::Error),
}

/// A resolved GATT characteristic this service can write to or subscribe on.
#[async_trait]
pub trait GattSession: Send {
    async fn write(&self, characteristic_uuid: &str, data: &[u8]) -> Result<(), Error>;
    async fn start_notify(&self, characteristic_uuid: &str) -> Result<(), Error>;
    /// Waits for the next notification on a characteristic previously armed
    /// with [`GattSession::start_notify`], or `None` if `timeout` elapses
    /// first.
    async fn next_notification(&mut self, timeout: Duration) -> Option<Vec<u8>>;
    async fn disconnect(&self) -> Result<(), Error>;
}

/// The radio abstraction shared by the scanner and the Renogy GATT client.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Starts (or is a no-op if already started) passive scanning with
    /// duplicate-data enabled, pushing every observed advertisement to
    /// `sink`. Filtering of this host's own adapter is the caller's
    /// responsibility ([`AdvertisementEvent::is_from_own_adapter`]).
    async fn start_scan(&self) -> Result<(), Error>;
    async fn stop_scan(&self) -> Result<(), Error>;
    async fn is_scanning(&self) -> Result<bool, Error>;

    /// Discovers and connects to a device matched by MAC (case-insensitive)
    /// or by exact name against `alias`, retrying with exponential backoff
    /// up to `retries` times, each bounded by `discovery_timeout`.
    async fn connect_gatt(
        &self,
        mac_address: Option<MacAddress>,
        alias: &str,
        discovery_timeout: Duration,
        retries: u32,
    ) -> Result<Box<dyn GattSession>, Error>;

    /// Turns the adapter off, waits briefly, then turns it back on. Subject
    /// to the caller's own rate limiting (see
    /// [`crate::airtime::AirtimeCoordinator`]'s reset bookkeeping).
    async fn power_cycle(&self) -> Result<(), Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_adapter_names_are_recognised() {
        assert!(is_own_adapter_name("hci0 (AA:BB:CC:DD:EE:FF)"));
        assert!(is_own_adapter_name("hci12 (00:11:22:33:44:55)"));
        assert!(!is_own_adapter_name("BT-TH-66A6EEBE"));
        assert!(!is_own_adapter_name("hci0"));
    }

    #[test]
    fn mac_round_trips_through_format_and_parse() {
        let mac: MacAddress = [0xAA, 0xBB, 0xCC, 0x00, 0x11, 0xFF];
        let s = format_mac(&mac);
        assert_eq!(s, "AA:BB:CC:00:11:FF");
        assert_eq!(parse_mac(&s), Some(mac));
    }

    #[test]
    fn address_type_wire_values_match_spec() {
        assert_eq!(AddressType::Public.wire_value(), 0);
        assert_eq!(AddressType::Random.wire_value(), 1);
    }
}
