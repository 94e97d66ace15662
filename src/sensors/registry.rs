//! Stable entity keys, per-device and combined entity definitions, and last
//! published values (`SPEC_FULL.md` §4.7).

use std::collections::HashMap;

use log::info;
use tokio::sync::Mutex;

use crate::renogy::{FieldValue, Reading};

use super::entities::{guess_attributes, StateClass};

/// Base key block for the cross-device combined entities.
const COMBINED_BASE: u32 = 5000;

/// `base = 1000 + (unit_id - 48) * 1000` per §4.7. Unit id 48 (`'0'` in
/// Modbus RTU terms) is the first addressable slave id in the Renogy
/// BT-2 address space the original implementation targets.
fn device_base(unit_id: u8) -> u32 {
    1000 + (unit_id as i32 - 48).max(0) as u32 * 1000
}

#[derive(Clone, Debug)]
pub struct SensorEntity {
    pub key: u32,
    pub object_id: String,
    pub name: String,
    pub unit: String,
    pub device_class: String,
    pub state_class: StateClass,
    pub accuracy_decimals: u8,
    pub force_update: bool,
}

struct KeyAllocator {
    next_offset: HashMap<u32, u32>,
    assigned: HashMap<(u32, String), u32>,
}

impl KeyAllocator {
    fn new() -> Self {
        Self {
            next_offset: HashMap::new(),
            assigned: HashMap::new(),
        }
    }

    /// Returns the stable key for `(base, field)`, allocating the next
    /// sequential offset under `base` the first time this pair is seen.
    /// Allocation order is first-observed order, which is why keys stay
    /// stable only within one process lifetime (§3's invariant).
    fn key_for(&mut self, base: u32, field: &str) -> u32 {
        if let Some(&key) = self.assigned.get(&(base, field.to_string())) {
            return key;
        }
        let offset = self.next_offset.entry(base).or_insert(1);
        let key = base + *offset;
        *offset += 1;
        self.assigned.insert((base, field.to_string()), key);
        key
    }
}

/// Result of folding one device's reading into the registry: every
/// `(key, value, missing)` that changed and should be published, plus
/// whether any entity was created for the first time this call (callers
/// use this to decide whether enumerated sessions need to be severed, per
/// §4.7's "adding new entities mid-session" policy).
pub struct IngestResult {
    pub changes: Vec<(u32, f32, bool)>,
    pub new_entities: bool,
}

pub struct SensorRegistry {
    allocator: Mutex<KeyAllocator>,
    entities: Mutex<HashMap<u32, SensorEntity>>,
    last_values: Mutex<HashMap<u32, (f32, bool)>>,
    latest_per_device: Mutex<HashMap<u8, Reading>>,
    configured_unit_ids: Vec<u8>,
    temperature_fahrenheit: bool,
}

impl SensorRegistry {
    pub fn new(configured_unit_ids: Vec<u8>, temperature_fahrenheit: bool) -> Self {
        Self {
            allocator: Mutex::new(KeyAllocator::new()),
            entities: Mutex::new(HashMap::new()),
            last_values: Mutex::new(HashMap::new()),
            latest_per_device: Mutex::new(HashMap::new()),
            configured_unit_ids,
            temperature_fahrenheit,
        }
    }

    /// Snapshot of every entity known so far, in registry (allocation)
    /// order — the order `ListEntitiesRequest` emits them in.
    pub async fn entities_snapshot(&self) -> Vec<SensorEntity> {
        let entities = self.entities.lock().await;
        let mut list: Vec<SensorEntity> = entities.values().cloned().collect();
        list.sort_by_key(|e| e.key);
        list
    }

    /// Folds `reading` for `unit_id` into the registry, allocating any new
    /// entities, and — once every configured unit id has contributed a
    /// reading this cycle — computing and folding in the combined reading.
    pub async fn ingest(&self, unit_id: u8, reading: Reading) -> IngestResult {
        let base = device_base(unit_id);
        let mut result = self.fold_fields(base, &reading).await;

        self.latest_per_device
            .lock()
            .await
            .insert(unit_id, reading);

        let devices = self.latest_per_device.lock().await;
        let all_reported = self
            .configured_unit_ids
            .iter()
            .all(|id| devices.contains_key(id));
        if all_reported {
            let combined = combined_metrics(&devices);
            drop(devices);
            let combined_fields: Reading = combined
                .into_iter()
                .map(|(k, v)| (k, FieldValue::Number(v)))
                .collect();
            let combined_result = self.fold_fields(COMBINED_BASE, &combined_fields).await;
            result.changes.extend(combined_result.changes);
            result.new_entities |= combined_result.new_entities;
        }

        result
    }

    async fn fold_fields(&self, base: u32, fields: &Reading) -> IngestResult {
        let mut changes = Vec::new();
        let mut new_entities = false;

        for (field, value) in fields {
            let Some(numeric) = value.as_f64() else {
                continue;
            };
            let numeric = numeric as f32;

            let key = self.allocator.lock().await.key_for(base, field);

            let mut entities = self.entities.lock().await;
            if !entities.contains_key(&key) {
                let attrs = guess_attributes(field, self.temperature_fahrenheit);
                let object_id = if base == COMBINED_BASE {
                    format!("combined_{field}")
                } else {
                    format!("unit_{base}_{field}")
                };
                entities.insert(
                    key,
                    SensorEntity {
                        key,
                        object_id: object_id.clone(),
                        name: object_id.replace('_', " "),
                        unit: attrs.unit.to_string(),
                        device_class: attrs.device_class.to_string(),
                        state_class: attrs.state_class,
                        accuracy_decimals: attrs.accuracy_decimals,
                        force_update: false,
                    },
                );
                new_entities = true;
                info!("registered sensor entity {key} ({object_id})");
            }
            drop(entities);

            let mut last_values = self.last_values.lock().await;
            let previous = last_values.get(&key).copied();
            if previous != Some((numeric, false)) {
                last_values.insert(key, (numeric, false));
                changes.push((key, numeric, false));
            }
        }

        IngestResult {
            changes,
            new_entities,
        }
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sum(values: &[f64]) -> f64 {
    values.iter().sum()
}

fn combined_metrics(devices: &HashMap<u8, Reading>) -> HashMap<String, f64> {
    let nums = |field: &str| -> Vec<f64> {
        devices
            .values()
            .filter_map(|r| r.get(field).and_then(FieldValue::as_f64))
            .collect()
    };

    let mut out = HashMap::new();

    let voltages = nums("voltage");
    if !voltages.is_empty() {
        out.insert("voltage".to_string(), mean(&voltages));
    }
    let currents = nums("current");
    if !currents.is_empty() {
        out.insert("current".to_string(), sum(&currents));
    }
    if let (Some(&v), Some(&i)) = (out.get("voltage"), out.get("current")) {
        out.insert("power".to_string(), v * i);
    }
    let capacities = nums("capacity");
    if !capacities.is_empty() {
        out.insert("capacity".to_string(), sum(&capacities));
    }
    let remaining = nums("remaining_charge");
    if !remaining.is_empty() {
        out.insert("remaining_charge".to_string(), sum(&remaining));
    }
    let socs = nums("soc");
    if !socs.is_empty() {
        out.insert("soc".to_string(), mean(&socs));
    }

    let cell_min = nums("cell_voltage_min");
    let cell_max = nums("cell_voltage_max");
    if let (Some(mn), Some(mx)) = (
        cell_min.iter().cloned().reduce(f64::min),
        cell_max.iter().cloned().reduce(f64::max),
    ) {
        out.insert("cell_voltage_min".to_string(), mn);
        out.insert("cell_voltage_max".to_string(), mx);
        out.insert("cell_voltage_delta".to_string(), mx - mn);
    }

    let temp_min = nums("temperature_min");
    let temp_max = nums("temperature_max");
    if let (Some(mn), Some(mx)) = (
        temp_min.iter().cloned().reduce(f64::min),
        temp_max.iter().cloned().reduce(f64::max),
    ) {
        out.insert("temperature_min".to_string(), mn);
        out.insert("temperature_max".to_string(), mx);
        out.insert("temperature_delta".to_string(), mx - mn);
    }

    let cell_counts = nums("cell_count");
    if !cell_counts.is_empty() {
        out.insert("cell_count".to_string(), sum(&cell_counts));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(pairs: &[(&str, f64)]) -> Reading {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Number(*v)))
            .collect()
    }

    #[tokio::test]
    async fn combined_metrics_computed_once_all_devices_report() {
        let registry = SensorRegistry::new(vec![48, 49], false);

        let r1 = registry
            .ingest(48, reading(&[("voltage", 13.1), ("current", 10.0), ("capacity", 100.0)]))
            .await;
        assert!(r1.changes.iter().all(|(k, _, _)| *k < COMBINED_BASE));

        let r2 = registry
            .ingest(49, reading(&[("voltage", 13.2), ("current", 5.0), ("capacity", 100.0)]))
            .await;

        let combined_voltage = r2
            .changes
            .iter()
            .find(|(k, _, _)| *k == COMBINED_BASE + 1)
            .map(|(_, v, _)| *v);
        assert!(combined_voltage.is_some());
    }

    /// Property #6 from `spec.md` §8: the exact combined-metric algebra for
    /// the two-device fixture given there.
    #[test]
    fn combined_metric_algebra_matches_spec_example() {
        let mut devices = HashMap::new();
        devices.insert(
            48u8,
            reading(&[("voltage", 13.1), ("current", 10.0), ("capacity", 100.0)]),
        );
        devices.insert(
            49u8,
            reading(&[("voltage", 13.2), ("current", 5.0), ("capacity", 100.0)]),
        );
        let combined = combined_metrics(&devices);
        assert!((combined["voltage"] - 13.15).abs() < 1e-9);
        assert!((combined["current"] - 15.0).abs() < 1e-9);
        assert!((combined["capacity"] - 200.0).abs() < 1e-9);
        assert!((combined["power"] - 197.25).abs() < 1e-9);
    }

    #[test]
    fn device_base_matches_formula() {
        assert_eq!(device_base(48), 1000);
        assert_eq!(device_base(49), 2000);
    }

    #[test]
    fn combined_metrics_combine_as_specified() {
        let mut devices = HashMap::new();
        devices.insert(
            48u8,
            reading(&[
                ("voltage", 13.1),
                ("current", 10.0),
                ("capacity", 100.0),
                ("cell_voltage_min", 3.28),
                ("cell_voltage_max", 3.32),
            ]),
        );
        devices.insert(
            49u8,
            reading(&[
                ("voltage", 13.3),
                ("current", 5.0),
                ("capacity", 100.0),
                ("cell_voltage_min", 3.30),
                ("cell_voltage_max", 3.35),
            ]),
        );
        let combined = combined_metrics(&devices);
        assert!((combined["voltage"] - 13.2).abs() < 1e-9);
        assert!((combined["current"] - 15.0).abs() < 1e-9);
        assert!((combined["capacity"] - 200.0).abs() < 1e-9);
        assert!((combined["cell_voltage_min"] - 3.28).abs() < 1e-9);
        assert!((combined["cell_voltage_max"] - 3.35).abs() < 1e-9);
    }
}
