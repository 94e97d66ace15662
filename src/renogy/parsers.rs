//! Decodes Renogy register sections into [`FieldMap`]s.
//!
//! Field layout and scale factors are carried over from
//! `examples/original_source/renogybt/unified_proxy.py`'s `_on_renogy_data`,
//! adjusted for the fact that [`crate::wire::modbus::parse_read_response`]
//! already strips the `[unit_id][fn][byte_count]` header the Python code
//! indexes around (so every offset here is 3 less than the corresponding
//! `bytes_to_int(bs, N, ...)` call there).

use super::{FieldMap, FieldValue};

fn be_int(data: &[u8], offset: usize, len: usize, signed: bool) -> i64 {
    let bytes = &data[offset..offset + len];
    let mut value: i64 = 0;
    for &b in bytes {
        value = (value << 8) | b as i64;
    }
    if signed && len < 8 {
        let sign_bit = 1i64 << (len * 8 - 1);
        if value & sign_bit != 0 {
            value -= 1i64 << (len * 8);
        }
    }
    value
}

fn scaled(data: &[u8], offset: usize, len: usize, signed: bool, scale: f64) -> f64 {
    be_int(data, offset, len, signed) as f64 * scale
}

/// Cell voltages: `[cell_count: implicit from byte_count][cell_mv; N]`. We
/// only keep the derived min/max/delta and count, matching the spec's data
/// model (`SensorRegistry` has no per-cell entities).
pub fn parse_cell_voltage(data: &[u8]) -> FieldMap {
    let mut fields = FieldMap::new();
    let num_cells = data.len() / 2;
    if num_cells == 0 {
        return fields;
    }
    let cells: Vec<f64> = (0..num_cells)
        .map(|i| be_int(data, i * 2, 2, false) as f64 * 0.001)
        .collect();
    let min = cells.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = cells.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    fields.insert("cell_count".into(), FieldValue::Number(num_cells as f64));
    fields.insert("cell_voltage_min".into(), FieldValue::Number(min));
    fields.insert("cell_voltage_max".into(), FieldValue::Number(max));
    fields.insert("cell_voltage_delta".into(), FieldValue::Number(max - min));
    fields
}

/// Temperature sensors, analogous layout to cell voltages but signed
/// tenths-of-a-degree Celsius.
pub fn parse_cell_temperature(data: &[u8]) -> FieldMap {
    let mut fields = FieldMap::new();
    let num_sensors = data.len() / 2;
    if num_sensors == 0 {
        return fields;
    }
    let temps: Vec<f64> = (0..num_sensors)
        .map(|i| scaled(data, i * 2, 2, true, 0.1))
        .collect();
    let min = temps.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = temps.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    fields.insert(
        "temp_sensor_count".into(),
        FieldValue::Number(num_sensors as f64),
    );
    fields.insert("temperature_min".into(), FieldValue::Number(min));
    fields.insert("temperature_max".into(), FieldValue::Number(max));
    fields.insert("temperature_delta".into(), FieldValue::Number(max - min));
    fields
}

/// `[current: i16 x0.01][voltage: u16 x0.1][remaining_charge: u32 x0.001]
/// [capacity: u32 x0.001]`. `soc` is derived unconditionally when
/// `capacity > 0`, matching the unconditional-derivation rule in spec §4.7.
pub fn parse_battery_info(data: &[u8]) -> FieldMap {
    let mut fields = FieldMap::new();
    if data.len() < 12 {
        return fields;
    }
    let current = scaled(data, 0, 2, true, 0.01);
    let voltage = scaled(data, 2, 2, false, 0.1);
    let remaining_charge = scaled(data, 4, 4, false, 0.001);
    let capacity = scaled(data, 8, 4, false, 0.001);

    fields.insert("current".into(), FieldValue::Number(current));
    fields.insert("voltage".into(), FieldValue::Number(voltage));
    fields.insert(
        "remaining_charge".into(),
        FieldValue::Number(remaining_charge),
    );
    fields.insert("capacity".into(), FieldValue::Number(capacity));
    fields.insert("power".into(), FieldValue::Number(voltage * current));
    if capacity > 0.0 {
        fields.insert(
            "soc".into(),
            FieldValue::Number(remaining_charge / capacity * 100.0),
        );
    }
    fields
}

/// Model string, null-padded ASCII/UTF-8 starting at byte 0 of the section.
pub fn parse_device_info(data: &[u8]) -> FieldMap {
    let mut fields = FieldMap::new();
    let end = data.len().min(16);
    if let Ok(text) = std::str::from_utf8(&data[..end]) {
        let model = text.trim_end_matches('\0').to_string();
        if !model.is_empty() {
            fields.insert("model".into(), FieldValue::Text(model));
        }
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_info_derives_soc_and_power() {
        // current=10.00A, voltage=13.1V, remaining=50.000Ah, capacity=100.000Ah
        let mut data = Vec::new();
        data.extend_from_slice(&1000i16.to_be_bytes()); // current x0.01
        data.extend_from_slice(&131u16.to_be_bytes()); // voltage x0.1
        data.extend_from_slice(&50000u32.to_be_bytes()); // remaining x0.001
        data.extend_from_slice(&100000u32.to_be_bytes()); // capacity x0.001

        let fields = parse_battery_info(&data);
        assert_eq!(fields["current"].as_f64(), Some(10.0));
        assert_eq!(fields["voltage"].as_f64(), Some(13.1));
        assert_eq!(fields["capacity"].as_f64(), Some(100.0));
        assert!((fields["soc"].as_f64().unwrap() - 50.0).abs() < 1e-9);
        assert!((fields["power"].as_f64().unwrap() - 131.0).abs() < 1e-9);
    }

    #[test]
    fn battery_info_omits_soc_when_capacity_zero() {
        let mut data = Vec::new();
        data.extend_from_slice(&0i16.to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        data.extend_from_slice(&0u32.to_be_bytes());
        let fields = parse_battery_info(&data);
        assert!(!fields.contains_key("soc"));
    }

    #[test]
    fn cell_voltage_min_max_delta() {
        let mut data = Vec::new();
        for mv in [3300u16, 3320, 3290, 3310] {
            data.extend_from_slice(&mv.to_be_bytes());
        }
        let fields = parse_cell_voltage(&data);
        assert_eq!(fields["cell_count"].as_f64(), Some(4.0));
        assert!((fields["cell_voltage_min"].as_f64().unwrap() - 3.29).abs() < 1e-9);
        assert!((fields["cell_voltage_max"].as_f64().unwrap() - 3.32).abs() < 1e-9);
        assert!((fields["cell_voltage_delta"].as_f64().unwrap() - 0.03).abs() < 1e-9);
    }

    #[test]
    fn device_info_trims_null_padding() {
        let mut data = vec![0u8; 16];
        data[..6].copy_from_slice(b"RBT100");
        let fields = parse_device_info(&data);
        assert_eq!(
            fields["model"],
            FieldValue::Text("RBT100".to_string())
        );
    }
}
