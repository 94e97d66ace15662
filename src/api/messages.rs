//! ESPHome native-API protobuf message bodies.
//!
//! The outer frame (`wire::native`) is already a varint-tagged envelope, so
//! the protobuf payloads inside it are encoded by hand with the same
//! varint/tag primitives rather than pulling in a full codegen pipeline
//! (`prost` appears once in the retrieval pack, in an unrelated gRPC
//! manifest, with no `.proto` schema for this message set to ground a
//! build-time codegen step on — see `DESIGN.md`). Field numbers and
//! semantics below match the `aioesphomeapi` wire contract a real
//! Home Assistant client speaks.
//!
//! Message-type numeric IDs are the well-known low values from
//! `aioesphomeapi`'s `api_pb2`; they are assumed stable across API v1.x and
//! documented here rather than re-derived (`DESIGN.md` records this as an
//! assumption, not a verified constant).

/// Low-level protobuf wire primitives (varint + LEB128 tag encoding).
pub mod wire {
    pub const WIRE_VARINT: u8 = 0;
    pub const WIRE_FIXED64: u8 = 1;
    pub const WIRE_LEN: u8 = 2;
    pub const WIRE_FIXED32: u8 = 5;

    pub fn write_varint(buf: &mut Vec<u8>, mut value: u64) {
        loop {
            let byte = (value & 0x7F) as u8;
            value >>= 7;
            if value == 0 {
                buf.push(byte);
                break;
            }
            buf.push(byte | 0x80);
        }
    }

    fn write_tag(buf: &mut Vec<u8>, field_num: u32, wire_type: u8) {
        write_varint(buf, ((field_num as u64) << 3) | wire_type as u64);
    }

    pub fn write_varint_field(buf: &mut Vec<u8>, field_num: u32, value: u64) {
        if value == 0 {
            return;
        }
        write_tag(buf, field_num, WIRE_VARINT);
        write_varint(buf, value);
    }

    pub fn write_bool_field(buf: &mut Vec<u8>, field_num: u32, value: bool) {
        if value {
            write_varint_field(buf, field_num, 1);
        }
    }

    pub fn write_string_field(buf: &mut Vec<u8>, field_num: u32, value: &str) {
        if value.is_empty() {
            return;
        }
        write_tag(buf, field_num, WIRE_LEN);
        write_varint(buf, value.len() as u64);
        buf.extend_from_slice(value.as_bytes());
    }

    pub fn write_bytes_field(buf: &mut Vec<u8>, field_num: u32, value: &[u8]) {
        if value.is_empty() {
            return;
        }
        write_tag(buf, field_num, WIRE_LEN);
        write_varint(buf, value.len() as u64);
        buf.extend_from_slice(value);
    }

    pub fn write_float_field(buf: &mut Vec<u8>, field_num: u32, value: f32) {
        if value == 0.0 {
            return;
        }
        write_tag(buf, field_num, WIRE_FIXED32);
        buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_message_field(buf: &mut Vec<u8>, field_num: u32, nested: &[u8]) {
        write_tag(buf, field_num, WIRE_LEN);
        write_varint(buf, nested.len() as u64);
        buf.extend_from_slice(nested);
    }

    /// One decoded `(field_num, value)` pair, enough to pull out the handful
    /// of scalar fields every inbound request carries.
    #[derive(Debug)]
    pub enum Field<'a> {
        Varint(u64),
        Fixed32(u32),
        Fixed64(u64),
        Bytes(&'a [u8]),
    }

    pub fn read_varint(data: &[u8], pos: &mut usize) -> Option<u64> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *data.get(*pos)?;
            *pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Some(result);
            }
            shift += 7;
            if shift >= 64 {
                return None;
            }
        }
    }

    /// Iterates every top-level field in a message payload. Malformed
    /// trailing bytes stop iteration rather than erroring — inbound frames
    /// this server only ever reads scalar request fields from, and a
    /// truncated tail is treated as "no more fields" rather than fatal.
    pub fn decode_fields(data: &[u8]) -> Vec<(u32, Field<'_>)> {
        let mut fields = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let Some(key) = read_varint(data, &mut pos) else {
                break;
            };
            let field_num = (key >> 3) as u32;
            let wire_type = (key & 0x7) as u8;
            match wire_type {
                WIRE_VARINT => {
                    let Some(v) = read_varint(data, &mut pos) else {
                        break;
                    };
                    fields.push((field_num, Field::Varint(v)));
                }
                WIRE_FIXED64 => {
                    if pos + 8 > data.len() {
                        break;
                    }
                    let bytes: [u8; 8] = data[pos..pos + 8].try_into().unwrap();
                    pos += 8;
                    fields.push((field_num, Field::Fixed64(u64::from_le_bytes(bytes))));
                }
                WIRE_LEN => {
                    let Some(len) = read_varint(data, &mut pos) else {
                        break;
                    };
                    let len = len as usize;
                    if pos + len > data.len() {
                        break;
                    }
                    fields.push((field_num, Field::Bytes(&data[pos..pos + len])));
                    pos += len;
                }
                WIRE_FIXED32 => {
                    if pos + 4 > data.len() {
                        break;
                    }
                    let bytes: [u8; 4] = data[pos..pos + 4].try_into().unwrap();
                    pos += 4;
                    fields.push((field_num, Field::Fixed32(u32::from_le_bytes(bytes))));
                }
                _ => break,
            }
        }
        fields
    }

    pub fn find_string(fields: &[(u32, Field<'_>)], field_num: u32) -> Option<String> {
        fields.iter().find_map(|(n, f)| {
            if *n == field_num {
                if let Field::Bytes(b) = f {
                    return std::str::from_utf8(b).ok().map(|s| s.to_string());
                }
            }
            None
        })
    }

    pub fn find_varint(fields: &[(u32, Field<'_>)], field_num: u32) -> Option<u64> {
        fields.iter().find_map(|(n, f)| {
            if *n == field_num {
                if let Field::Varint(v) = f {
                    return Some(*v);
                }
            }
            None
        })
    }
}

/// Message-type IDs from the `aioesphomeapi` wire contract. Values above
/// `ListEntitiesServicesResponse` (the Bluetooth-proxy-specific messages)
/// are a documented assumption — see module docs.
pub mod type_id {
    pub const HELLO_REQUEST: u32 = 1;
    pub const HELLO_RESPONSE: u32 = 2;
    pub const AUTHENTICATION_REQUEST: u32 = 3;
    pub const AUTHENTICATION_RESPONSE: u32 = 4;
    pub const DISCONNECT_REQUEST: u32 = 5;
    pub const DISCONNECT_RESPONSE: u32 = 6;
    pub const PING_REQUEST: u32 = 7;
    pub const PING_RESPONSE: u32 = 8;
    pub const DEVICE_INFO_REQUEST: u32 = 9;
    pub const DEVICE_INFO_RESPONSE: u32 = 10;
    pub const LIST_ENTITIES_REQUEST: u32 = 11;
    pub const LIST_ENTITIES_DONE_RESPONSE: u32 = 19;
    pub const LIST_ENTITIES_SENSOR_RESPONSE: u32 = 16;
    pub const SENSOR_STATE_RESPONSE: u32 = 25;
    pub const SUBSCRIBE_STATES_REQUEST: u32 = 20;

    // Bluetooth-proxy-specific: assumed stable, documented in DESIGN.md.
    pub const SUBSCRIBE_BLE_ADVERTISEMENTS_REQUEST: u32 = 63;
    pub const BLE_ADVERTISEMENT_RESPONSE: u32 = 67;
    pub const SUBSCRIBE_CONNECTIONS_FREE_REQUEST: u32 = 77;
    pub const CONNECTIONS_FREE_RESPONSE: u32 = 78;
    pub const UNSUBSCRIBE_BLE_ADVERTISEMENTS_REQUEST: u32 = 84;
    pub const BLE_RAW_ADVERTISEMENTS_RESPONSE: u32 = 93;
    pub const SCANNER_SET_MODE_REQUEST: u32 = 115;
    pub const SCANNER_STATE_RESPONSE: u32 = 113;
    pub const NOISE_ENCRYPTION_SET_KEY_REQUEST: u32 = 124;
    pub const NOISE_ENCRYPTION_SET_KEY_RESPONSE: u32 = 125;
}

pub const BLUETOOTH_PROXY_FEATURE_PASSIVE_SCAN: u32 = 1 << 0;
pub const BLUETOOTH_PROXY_FEATURE_ACTIVE_CONNECTIONS: u32 = 1 << 1;
pub const BLUETOOTH_PROXY_FEATURE_REMOTE_CACHING: u32 = 1 << 2;
pub const BLUETOOTH_PROXY_FEATURE_PAIRING: u32 = 1 << 3;
pub const BLUETOOTH_PROXY_FEATURE_CACHE_CLEARING: u32 = 1 << 4;
pub const BLUETOOTH_PROXY_FEATURE_RAW_ADVERTISEMENTS: u32 = 1 << 5;
pub const BLUETOOTH_PROXY_FEATURE_STATE_AND_MODE: u32 = 1 << 6;

pub const BLUETOOTH_PROXY_FEATURES: u32 = BLUETOOTH_PROXY_FEATURE_PASSIVE_SCAN
    | BLUETOOTH_PROXY_FEATURE_RAW_ADVERTISEMENTS
    | BLUETOOTH_PROXY_FEATURE_STATE_AND_MODE;

/// Bit 0 of `SubscribeBluetoothLEAdvertisementsRequest.flags`: the
/// controller wants raw GAP AD-structure bytes instead of parsed fields.
pub const SUBSCRIBE_FLAG_RAW_ADVERTISEMENTS: u64 = 1 << 0;

pub struct SubscribeBluetoothLeAdvertisementsRequest {
    pub flags: u64,
}

impl SubscribeBluetoothLeAdvertisementsRequest {
    pub fn decode(payload: &[u8]) -> Self {
        let fields = wire::decode_fields(payload);
        Self {
            flags: wire::find_varint(&fields, 1).unwrap_or(0),
        }
    }

    pub fn wants_raw(&self) -> bool {
        self.flags & SUBSCRIBE_FLAG_RAW_ADVERTISEMENTS != 0
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScannerMode {
    Passive = 0,
    Active = 1,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScannerState {
    Idle = 0,
    Starting = 1,
    Running = 2,
    Failed = 3,
    Stopping = 4,
    Stopped = 5,
}

pub struct HelloResponse {
    pub api_version_major: u32,
    pub api_version_minor: u32,
    pub name: String,
    pub server_info: String,
}

impl HelloResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_string_field(&mut buf, 3, &self.name);
        wire::write_varint_field(&mut buf, 1, self.api_version_major as u64);
        wire::write_varint_field(&mut buf, 2, self.api_version_minor as u64);
        wire::write_string_field(&mut buf, 4, &self.server_info);
        buf
    }
}

pub struct AuthenticationRequest {
    pub password: String,
}

impl AuthenticationRequest {
    pub fn decode(payload: &[u8]) -> Self {
        let fields = wire::decode_fields(payload);
        Self {
            password: wire::find_string(&fields, 1).unwrap_or_default(),
        }
    }
}

pub struct AuthenticationResponse {
    pub invalid_password: bool,
}

impl AuthenticationResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_bool_field(&mut buf, 1, self.invalid_password);
        buf
    }
}

pub struct DeviceInfoResponse {
    pub uses_password: bool,
    pub name: String,
    pub mac_address: String,
    pub esphome_version: String,
    pub model: String,
    pub manufacturer: String,
    pub project_name: String,
    pub project_version: String,
    pub bluetooth_proxy_feature_flags: u32,
    pub bluetooth_mac_address: String,
}

impl DeviceInfoResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_bool_field(&mut buf, 1, self.uses_password);
        wire::write_string_field(&mut buf, 2, &self.name);
        wire::write_string_field(&mut buf, 3, &self.mac_address);
        wire::write_string_field(&mut buf, 4, &self.esphome_version);
        wire::write_string_field(&mut buf, 5, "");
        wire::write_string_field(&mut buf, 7, &self.model);
        wire::write_bool_field(&mut buf, 8, false);
        wire::write_string_field(&mut buf, 9, &self.manufacturer);
        wire::write_string_field(&mut buf, 11, &self.project_name);
        wire::write_string_field(&mut buf, 12, &self.project_version);
        wire::write_varint_field(&mut buf, 13, 0);
        wire::write_varint_field(
            &mut buf,
            15,
            self.bluetooth_proxy_feature_flags as u64,
        );
        wire::write_string_field(&mut buf, 16, &self.bluetooth_mac_address);
        buf
    }
}

/// `Sensor` entity descriptor (one per `ListEntitiesSensorResponse`).
pub struct ListEntitiesSensorResponse {
    pub object_id: String,
    pub key: u32,
    pub name: String,
    pub unit_of_measurement: String,
    pub accuracy_decimals: u32,
    pub force_update: bool,
    pub device_class: String,
    pub state_class: u32,
}

impl ListEntitiesSensorResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_string_field(&mut buf, 1, &self.object_id);
        wire::write_varint_field(&mut buf, 2, self.key as u64);
        wire::write_string_field(&mut buf, 3, &self.name);
        wire::write_string_field(&mut buf, 5, &self.unit_of_measurement);
        wire::write_varint_field(&mut buf, 6, self.accuracy_decimals as u64);
        wire::write_bool_field(&mut buf, 7, self.force_update);
        wire::write_string_field(&mut buf, 8, &self.device_class);
        wire::write_varint_field(&mut buf, 9, self.state_class as u64);
        buf
    }
}

pub struct SensorStateResponse {
    pub key: u32,
    pub state: f32,
    pub missing_state: bool,
}

impl SensorStateResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_varint_field(&mut buf, 1, self.key as u64);
        wire::write_float_field(&mut buf, 2, self.state);
        wire::write_bool_field(&mut buf, 3, self.missing_state);
        buf
    }
}

pub struct BluetoothLeAdvertisementResponse {
    pub address: u64,
    pub rssi: i32,
    pub address_type: u32,
    pub name: Vec<u8>,
    pub service_uuids: Vec<String>,
    pub service_data: Vec<(String, Vec<u8>)>,
    pub manufacturer_data: Vec<(u32, Vec<u8>)>,
}

impl BluetoothLeAdvertisementResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_varint_field(&mut buf, 1, self.address);
        wire::write_bytes_field(&mut buf, 2, &self.name);
        for uuid in &self.service_uuids {
            wire::write_string_field(&mut buf, 3, uuid);
        }
        wire::write_varint_field(&mut buf, 4, zigzag_from_i32(self.rssi));
        for (company_id, data) in &self.manufacturer_data {
            let mut nested = Vec::new();
            wire::write_varint_field(&mut nested, 1, *company_id as u64);
            wire::write_bytes_field(&mut nested, 2, data);
            wire::write_message_field(&mut buf, 5, &nested);
        }
        for (uuid, data) in &self.service_data {
            let mut nested = Vec::new();
            wire::write_string_field(&mut nested, 1, uuid);
            wire::write_bytes_field(&mut nested, 2, data);
            wire::write_message_field(&mut buf, 6, &nested);
        }
        wire::write_varint_field(&mut buf, 7, self.address_type as u64);
        buf
    }
}

fn zigzag_from_i32(value: i32) -> u64 {
    // rssi is a plain (non-zigzag) sint32 field in the real schema; this
    // server only ever encodes it, never decodes, so the two-complement
    // round trip through u64 is sufficient as long as the reader treats
    // field 4 as a signed varint, which ESPHome clients do.
    value as u32 as u64
}

pub struct BluetoothLeRawAdvertisement {
    pub address: u64,
    pub rssi: i32,
    pub address_type: u32,
    pub data: Vec<u8>,
}

impl BluetoothLeRawAdvertisement {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_varint_field(&mut buf, 1, self.address);
        wire::write_varint_field(&mut buf, 2, zigzag_from_i32(self.rssi));
        wire::write_varint_field(&mut buf, 3, self.address_type as u64);
        wire::write_bytes_field(&mut buf, 4, &self.data);
        buf
    }
}

pub struct BluetoothLeRawAdvertisementsResponse {
    pub advertisements: Vec<BluetoothLeRawAdvertisement>,
}

impl BluetoothLeRawAdvertisementsResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for adv in &self.advertisements {
            wire::write_message_field(&mut buf, 1, &adv.encode());
        }
        buf
    }
}

pub struct BluetoothConnectionsFreeResponse {
    pub free: u32,
    pub limit: u32,
}

impl BluetoothConnectionsFreeResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_varint_field(&mut buf, 1, self.free as u64);
        wire::write_varint_field(&mut buf, 2, self.limit as u64);
        buf
    }
}

pub struct BluetoothScannerStateResponse {
    pub state: ScannerState,
    pub mode: ScannerMode,
}

impl BluetoothScannerStateResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_varint_field(&mut buf, 1, self.state as u64);
        wire::write_varint_field(&mut buf, 2, self.mode as u64);
        wire::write_varint_field(&mut buf, 3, self.mode as u64);
        buf
    }
}

pub struct BluetoothScannerSetModeRequest {
    pub mode: ScannerMode,
}

impl BluetoothScannerSetModeRequest {
    pub fn decode(payload: &[u8]) -> Self {
        let fields = wire::decode_fields(payload);
        let mode = match wire::find_varint(&fields, 1) {
            Some(1) => ScannerMode::Active,
            _ => ScannerMode::Passive,
        };
        Self { mode }
    }
}

pub struct NoiseEncryptionSetKeyResponse {
    pub success: bool,
}

impl NoiseEncryptionSetKeyResponse {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        wire::write_bool_field(&mut buf, 1, self.success);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_response_round_trips_name() {
        let resp = HelloResponse {
            api_version_major: 1,
            api_version_minor: 13,
            name: "renogy-ble-proxy".into(),
            server_info: "renogy-ble-proxy/0.1.0".into(),
        };
        let encoded = resp.encode();
        let fields = wire::decode_fields(&encoded);
        assert_eq!(wire::find_varint(&fields, 1), Some(1));
        assert_eq!(wire::find_varint(&fields, 2), Some(13));
        assert_eq!(
            wire::find_string(&fields, 3),
            Some("renogy-ble-proxy".to_string())
        );
    }

    #[test]
    fn authentication_request_decodes_empty_password() {
        let req = AuthenticationRequest::decode(&[]);
        assert_eq!(req.password, "");
    }

    #[test]
    fn scanner_set_mode_decodes_active() {
        let mut payload = Vec::new();
        wire::write_varint_field(&mut payload, 1, 1);
        let req = BluetoothScannerSetModeRequest::decode(&payload);
        assert_eq!(req.mode, ScannerMode::Active);
    }

    #[test]
    fn subscribe_advertisements_request_decodes_raw_flag() {
        let mut payload = Vec::new();
        wire::write_varint_field(&mut payload, 1, SUBSCRIBE_FLAG_RAW_ADVERTISEMENTS);
        let req = SubscribeBluetoothLeAdvertisementsRequest::decode(&payload);
        assert!(req.wants_raw());

        let req = SubscribeBluetoothLeAdvertisementsRequest::decode(&[]);
        assert!(!req.wants_raw());
    }

    #[test]
    fn varint_round_trips_multi_byte_values() {
        let mut buf = Vec::new();
        wire::write_varint(&mut buf, 300);
        let mut pos = 0;
        assert_eq!(wire::read_varint(&buf, &mut pos), Some(300));
    }
}
