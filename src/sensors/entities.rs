//! Field-name -> entity-attribute heuristic, carried in from
//! `examples/original_source/renogybt/sensor_definitions.py`'s per-field
//! `unit`/`device_class`/`decimals` table (`SPEC_FULL.md` §3).

/// `state_class` wire values, matching the aioesphomeapi enum ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateClass {
    None = 0,
    Measurement = 1,
    TotalIncreasing = 2,
}

pub struct Attributes {
    pub unit: &'static str,
    pub device_class: &'static str,
    pub accuracy_decimals: u8,
    pub state_class: StateClass,
}

/// Maps a decoded field name (as produced by `renogy::parsers`) to its
/// display unit, device class, and accuracy. Temperature's unit string
/// follows the configured display unit but the underlying value stays in
/// Celsius — `sensor_definitions.py` never actually converts the stored
/// value, only the label, and this rewrite keeps that behavior rather than
/// silently fixing it (an Open Question resolution recorded in
/// `DESIGN.md`).
pub fn guess_attributes(field_name: &str, temperature_fahrenheit: bool) -> Attributes {
    match field_name {
        "temperature_min" | "temperature_max" | "temperature_delta" => Attributes {
            unit: if temperature_fahrenheit { "°F" } else { "°C" },
            device_class: "temperature",
            accuracy_decimals: 1,
            state_class: StateClass::Measurement,
        },
        "voltage" | "cell_voltage_min" | "cell_voltage_max" | "cell_voltage_delta" => Attributes {
            unit: "V",
            device_class: "voltage",
            accuracy_decimals: 1,
            state_class: StateClass::Measurement,
        },
        "current" => Attributes {
            unit: "A",
            device_class: "current",
            accuracy_decimals: 2,
            state_class: StateClass::Measurement,
        },
        "power" => Attributes {
            unit: "W",
            device_class: "power",
            accuracy_decimals: 0,
            state_class: StateClass::Measurement,
        },
        "soc" => Attributes {
            unit: "%",
            device_class: "battery",
            accuracy_decimals: 0,
            state_class: StateClass::Measurement,
        },
        "capacity" | "remaining_charge" => Attributes {
            unit: "Ah",
            device_class: "",
            accuracy_decimals: 2,
            state_class: StateClass::Measurement,
        },
        "cell_count" | "temp_sensor_count" => Attributes {
            unit: "",
            device_class: "",
            accuracy_decimals: 0,
            state_class: StateClass::None,
        },
        _ => Attributes {
            unit: "",
            device_class: "",
            accuracy_decimals: 2,
            state_class: StateClass::Measurement,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_label_follows_configured_unit_but_is_always_celsius_accuracy() {
        let celsius = guess_attributes("temperature_max", false);
        assert_eq!(celsius.unit, "°C");
        let fahrenheit = guess_attributes("temperature_max", true);
        assert_eq!(fahrenheit.unit, "°F");
        assert_eq!(celsius.accuracy_decimals, fahrenheit.accuracy_decimals);
    }

    #[test]
    fn soc_maps_to_battery_device_class_percent() {
        let attrs = guess_attributes("soc", false);
        assert_eq!(attrs.unit, "%");
        assert_eq!(attrs.device_class, "battery");
        assert_eq!(attrs.accuracy_decimals, 0);
    }

    #[test]
    fn dimensionless_counts_have_no_unit() {
        let attrs = guess_attributes("cell_count", false);
        assert_eq!(attrs.unit, "");
        assert_eq!(attrs.state_class, StateClass::None);
    }
}
