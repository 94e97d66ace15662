//! One controller TCP connection: receive buffer, subscription flags, and
//! the `Greet -> Authed -> Listed -> Active -> Closing` state machine from
//! `SPEC_FULL.md` §4.8.

use std::collections::HashSet;
use std::net::SocketAddr;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::io::{AsyncWriteExt, WriteHalf};
use tokio::net::TcpStream;

use crate::sensors::registry::SensorEntity;
use crate::wire::native::encode as encode_frame;

use super::messages::{
    self, type_id, AuthenticationRequest, AuthenticationResponse, BluetoothConnectionsFreeResponse,
    BluetoothLeAdvertisementResponse, BluetoothLeRawAdvertisementsResponse,
    BluetoothScannerSetModeRequest, BluetoothScannerStateResponse, DeviceInfoResponse,
    HelloResponse, ListEntitiesSensorResponse, NoiseEncryptionSetKeyResponse, ScannerMode,
    ScannerState, SensorStateResponse, SubscribeBluetoothLeAdvertisementsRequest,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SessionState {
    Greet,
    Authed,
    Listed,
    Active,
    Closing,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("framing error: {0}")]
    Framing(#[from] crate::wire::native::FrameError),
    #[error("socket closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct DeviceIdentity {
    pub name: String,
    pub mac_address: String,
    pub esphome_version: String,
    pub model: String,
    pub manufacturer: String,
    pub project_name: String,
    pub project_version: String,
}

/// A single accepted connection. Owns its write half directly; the read
/// loop lives in [`crate::api::server`] and calls back into
/// [`Session::handle_frame`] for each decoded message. Callers hold this
/// behind a single `Arc<Mutex<Session>>` per connection, so every method
/// here takes `&mut self` rather than managing its own interior locking.
pub struct Session {
    pub id: u64,
    pub peer_addr: SocketAddr,
    state: SessionState,
    writer: WriteHalf<TcpStream>,
    pub subscribed_advertisements: bool,
    pub subscribed_raw_advertisements: bool,
    pub subscribed_states: bool,
    pub subscribed_connections_free: bool,
    pub requested_scanner_mode: ScannerMode,
    pub scanner_state: ScannerState,
    close_after_send: bool,
    enumerated_keys: HashSet<u32>,
    identity: DeviceIdentity,
}

impl Session {
    pub fn new(id: u64, peer_addr: SocketAddr, writer: WriteHalf<TcpStream>, identity: DeviceIdentity) -> Self {
        Self {
            id,
            peer_addr,
            state: SessionState::Greet,
            writer,
            subscribed_advertisements: false,
            subscribed_raw_advertisements: false,
            subscribed_states: false,
            subscribed_connections_free: false,
            requested_scanner_mode: ScannerMode::Passive,
            scanner_state: ScannerState::Idle,
            close_after_send: false,
            enumerated_keys: HashSet::new(),
            identity,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn should_close(&self) -> bool {
        self.close_after_send || self.state == SessionState::Closing
    }

    pub fn wants_advertisements(&self) -> bool {
        self.subscribed_advertisements || self.subscribed_raw_advertisements
    }

    async fn send(&mut self, msg_type: u32, payload: &[u8]) -> Result<(), SessionError> {
        let frame = encode_frame(msg_type, payload);
        self.writer.write_all(&frame).await?;
        Ok(())
    }

    pub async fn send_advertisement(
        &mut self,
        event: &crate::ble::AdvertisementEvent,
    ) -> Result<(), SessionError> {
        if self.subscribed_advertisements {
            let resp = BluetoothLeAdvertisementResponse {
                address: mac_to_u64(&event.address),
                rssi: event.rssi as i32,
                address_type: event.address_type.wire_value() as u32,
                name: event.local_name.clone().unwrap_or_default().into_bytes(),
                service_uuids: event.service_uuids.clone(),
                service_data: event.service_data.clone().into_iter().collect(),
                manufacturer_data: event
                    .manufacturer_data
                    .iter()
                    .map(|(id, data)| (*id as u32, data.clone()))
                    .collect(),
            };
            self.send(type_id::BLE_ADVERTISEMENT_RESPONSE, &resp.encode())
                .await?;
        }
        if self.subscribed_raw_advertisements {
            let raw = super::server::synthesize_raw_advertisement(event);
            let resp = BluetoothLeRawAdvertisementsResponse {
                advertisements: vec![raw],
            };
            self.send(
                type_id::BLE_RAW_ADVERTISEMENTS_RESPONSE,
                &resp.encode(),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn send_sensor_state(&mut self, key: u32, value: f32, missing: bool) -> Result<(), SessionError> {
        if !self.subscribed_states {
            return Ok(());
        }
        // Newly introduced entities force re-enumeration (§4.7): if this key
        // was never listed to this session, it cannot be meaningfully
        // consumed by a controller that only knows the entities from its
        // last ListEntities pass, so we sever instead of sending orphan
        // state.
        if !self.enumerated_keys.contains(&key) {
            warn!(
                "session {} never enumerated key {key}, forcing reconnect",
                self.id
            );
            self.state = SessionState::Closing;
            self.close_after_send = true;
            return Ok(());
        }
        let resp = SensorStateResponse {
            key,
            state: value,
            missing_state: missing,
        };
        self.send(type_id::SENSOR_STATE_RESPONSE, &resp.encode())
            .await
    }

    /// Processes one decoded frame, possibly producing outbound frames and
    /// state transitions. Returns `Err` only on a framing-level problem
    /// that should close the connection (§4.8's "any framing error ->
    /// Closing" rule is enforced by the caller around frame decoding, not
    /// here).
    pub async fn handle_frame(
        &mut self,
        msg_type: u32,
        payload: &[u8],
        entities: &[SensorEntity],
    ) -> Result<(), SessionError> {
        use type_id::*;
        match msg_type {
            HELLO_REQUEST => {
                let resp = HelloResponse {
                    api_version_major: 1,
                    api_version_minor: 13,
                    name: self.identity.name.clone(),
                    server_info: format!("renogy-ble-proxy/{}", self.identity.esphome_version),
                };
                self.send(HELLO_RESPONSE, &resp.encode()).await?;
                self.state = SessionState::Authed;
            }
            AUTHENTICATION_REQUEST => {
                let _req = AuthenticationRequest::decode(payload);
                let resp = AuthenticationResponse {
                    invalid_password: false,
                };
                self.send(AUTHENTICATION_RESPONSE, &resp.encode()).await?;
                info!("session {} authenticated", self.id);
            }
            PING_REQUEST => {
                self.send(PING_RESPONSE, &[]).await?;
            }
            DEVICE_INFO_REQUEST => {
                let resp = DeviceInfoResponse {
                    uses_password: false,
                    name: self.identity.name.clone(),
                    mac_address: self.identity.mac_address.clone(),
                    esphome_version: self.identity.esphome_version.clone(),
                    model: self.identity.model.clone(),
                    manufacturer: self.identity.manufacturer.clone(),
                    project_name: self.identity.project_name.clone(),
                    project_version: self.identity.project_version.clone(),
                    bluetooth_proxy_feature_flags: messages::BLUETOOTH_PROXY_FEATURES,
                    bluetooth_mac_address: self.identity.mac_address.clone(),
                };
                self.send(DEVICE_INFO_RESPONSE, &resp.encode()).await?;
            }
            LIST_ENTITIES_REQUEST => {
                for entity in entities {
                    let resp = ListEntitiesSensorResponse {
                        object_id: entity.object_id.clone(),
                        key: entity.key,
                        name: entity.name.clone(),
                        unit_of_measurement: entity.unit.clone(),
                        accuracy_decimals: entity.accuracy_decimals as u32,
                        force_update: entity.force_update,
                        device_class: entity.device_class.clone(),
                        state_class: entity.state_class as u32,
                    };
                    self.send(LIST_ENTITIES_SENSOR_RESPONSE, &resp.encode())
                        .await?;
                    self.enumerated_keys.insert(entity.key);
                }
                self.send(LIST_ENTITIES_DONE_RESPONSE, &[]).await?;
                self.state = SessionState::Listed;
            }
            SUBSCRIBE_STATES_REQUEST => {
                self.subscribed_states = true;
                self.state = SessionState::Active;
            }
            SUBSCRIBE_BLE_ADVERTISEMENTS_REQUEST => {
                let first_subscription = !self.wants_advertisements();
                let req = SubscribeBluetoothLeAdvertisementsRequest::decode(payload);
                if req.wants_raw() {
                    self.subscribed_raw_advertisements = true;
                } else {
                    self.subscribed_advertisements = true;
                }
                self.scanner_state = ScannerState::Running;
                self.send_scanner_state().await?;
                self.state = SessionState::Active;
                if first_subscription {
                    self.send_synthetic_seed().await?;
                }
            }
            UNSUBSCRIBE_BLE_ADVERTISEMENTS_REQUEST => {
                self.subscribed_advertisements = false;
                self.subscribed_raw_advertisements = false;
                self.scanner_state = ScannerState::Idle;
                self.send_scanner_state().await?;
            }
            SUBSCRIBE_CONNECTIONS_FREE_REQUEST => {
                self.subscribed_connections_free = true;
                let resp = BluetoothConnectionsFreeResponse { free: 0, limit: 0 };
                self.send(CONNECTIONS_FREE_RESPONSE, &resp.encode())
                    .await?;
                if self.scanner_state == ScannerState::Idle {
                    self.scanner_state = ScannerState::Running;
                }
                self.send_scanner_state().await?;
                self.state = SessionState::Active;
            }
            SCANNER_SET_MODE_REQUEST => {
                let req = BluetoothScannerSetModeRequest::decode(payload);
                self.requested_scanner_mode = req.mode;
                self.send_scanner_state().await?;
            }
            NOISE_ENCRYPTION_SET_KEY_REQUEST => {
                let resp = NoiseEncryptionSetKeyResponse { success: false };
                self.send(NOISE_ENCRYPTION_SET_KEY_RESPONSE, &resp.encode())
                    .await?;
            }
            DISCONNECT_REQUEST => {
                self.send(DISCONNECT_RESPONSE, &[]).await?;
                self.close_after_send = true;
                self.state = SessionState::Closing;
            }
            other => {
                debug!("session {} ignoring unknown message type {other}", self.id);
            }
        }
        Ok(())
    }

    async fn send_scanner_state(&mut self) -> Result<(), SessionError> {
        let resp = BluetoothScannerStateResponse {
            state: self.scanner_state,
            mode: self.requested_scanner_mode,
        };
        self.send(type_id::SCANNER_STATE_RESPONSE, &resp.encode())
            .await
    }

    async fn send_synthetic_seed(&mut self) -> Result<(), SessionError> {
        let resp = BluetoothLeAdvertisementResponse {
            address: self
                .identity
                .mac_address
                .split(':')
                .try_fold(0u64, |acc, part| {
                    u8::from_str_radix(part, 16).map(|b| (acc << 8) | b as u64)
                })
                .unwrap_or(0),
            rssi: 0,
            address_type: 0,
            name: self.identity.name.clone().into_bytes(),
            service_uuids: Vec::new(),
            service_data: Vec::new(),
            manufacturer_data: Vec::new(),
        };
        self.send(type_id::BLE_ADVERTISEMENT_RESPONSE, &resp.encode())
            .await
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}

fn mac_to_u64(mac: &[u8; 6]) -> u64 {
    mac.iter().fold(0u64, |acc, &b| (acc << 8) | b as u64)
}
