//! Byte-exact framing for the two wire formats this service speaks.
//!
//! [`native`] implements the ESPHome native-API frame format (varint length
//! + varint message type + payload). [`modbus`] implements Modbus RTU
//! request/response framing with a CRC-16/Modbus trailer, as carried over a
//! Renogy BT-2's write/notify GATT characteristics.

pub mod modbus;
pub mod native;
