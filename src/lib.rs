//! `renogy-ble-proxy` — impersonates an ESPHome Bluetooth proxy on a Linux
//! host with a BlueZ-backed BLE radio, while periodically polling one or more
//! Renogy Modbus-over-BLE devices and republishing their readings as ESPHome
//! sensor entities on the same connection.
//!
//! The crate is organised leaf-first, matching the component table in
//! `SPEC_FULL.md` §2:
//!
//! - [`wire`] — byte-exact framing for the two wire formats this service
//!   speaks: the ESPHome native API and Modbus RTU over GATT.
//! - [`ble`] — the radio abstraction and its BlueZ implementation.
//! - [`airtime`] — serialises scanner and GATT-central use of the one radio.
//! - [`renogy`] — register parsers and the Modbus-over-GATT client.
//! - [`scheduler`] — decides when the next Renogy read cycle runs.
//! - [`sensors`] — entity registry, stable keys, combined metrics.
//! - [`energy`] — persisted energy-total accumulators.
//! - [`api`] — the ESPHome native API TCP server and per-connection sessions.
//! - [`mdns`] — LAN service announcement.
//! - [`config`] — `.ini`-style configuration file structures and reader.
//! - [`service`] — top-level lifecycle wiring all of the above together.

pub mod error;

pub mod config;
pub mod wire;

pub mod ble;
pub mod airtime;

pub mod renogy;
pub mod scheduler;

pub mod sensors;
pub mod energy;

pub mod api;
pub mod mdns;

pub mod service;

pub use error::{ProxyError, ProxyResult};
