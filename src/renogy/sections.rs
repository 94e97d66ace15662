//! Static register-section descriptors driving one Renogy read cycle.
//!
//! Addresses match the scenario in `spec.md` §8 (S3): unit ids iterate
//! `[(5000, 8), (5042, 6)]` per cycle. Two further sections
//! (`cell_temperature`, `device_info`) are carried in from
//! `examples/original_source/renogybt/unified_proxy.py`'s
//! `cell_temperature_raw`/`device_info_raw` handling, which the distilled
//! spec dropped but a faithful rewrite still reads every cycle.

use super::parsers;
use super::FieldMap;

/// A static descriptor driving one read-cycle pass: which holding registers
/// to request, how many words, and which parser to hand the response to.
#[derive(Clone, Copy)]
pub struct ModbusSection {
    pub name: &'static str,
    pub register_base: u16,
    pub word_count: u8,
    pub parser: fn(&[u8]) -> FieldMap,
}

impl std::fmt::Debug for ModbusSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusSection")
            .field("name", &self.name)
            .field("register_base", &self.register_base)
            .field("word_count", &self.word_count)
            .finish()
    }
}

/// The default section list for a Renogy battery (BT-2 bridged) device.
pub fn battery_sections() -> Vec<ModbusSection> {
    vec![
        ModbusSection {
            name: "cell_voltage",
            register_base: 5000,
            word_count: 8,
            parser: parsers::parse_cell_voltage,
        },
        ModbusSection {
            name: "battery_info",
            register_base: 5042,
            word_count: 6,
            parser: parsers::parse_battery_info,
        },
        ModbusSection {
            name: "cell_temperature",
            register_base: 5017,
            word_count: 8,
            parser: parsers::parse_cell_temperature,
        },
        ModbusSection {
            name: "device_info",
            register_base: 5223,
            word_count: 8,
            parser: parsers::parse_device_info,
        },
    ]
}
