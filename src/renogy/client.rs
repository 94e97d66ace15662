//! Drives one polling cycle across a set of Renogy BT-2 devices: connect,
//! subscribe, write each section's read request, await the matching
//! notification, parse, and merge into a per-device [`Reading`].
//!
//! Mirrors the connect/retry/timeout shape of
//! `examples/original_source/renogybt/BaseClient.py`, rebuilt around
//! [`crate::ble::BleAdapter`] instead of `bleak`, and around the airtime
//! coordinator instead of a bare asyncio lock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::sleep;

use crate::airtime::AirtimeCoordinator;
use crate::ble::{BleAdapter, GattSession, MacAddress};
use crate::wire::modbus::{build_read_request, parse_read_response};

use super::sections::ModbusSection;
use super::{Error, Reading};

const CONNECT_RETRIES: u32 = 3;
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);
const INTER_DEVICE_DWELL: Duration = Duration::from_millis(500);
const CONSECUTIVE_TIMEOUT_RESET_THRESHOLD: u32 = 3;

/// One configured Renogy device: its Modbus unit id and how to find it over
/// BLE (MAC address if known, else an alias to match on advertised name).
#[derive(Clone, Debug)]
pub struct DeviceTarget {
    pub unit_id: u8,
    pub mac_address: Option<MacAddress>,
    pub alias: String,
    pub read_timeout: Duration,
}

/// Outcome of one full poll cycle: per-device readings (devices that failed
/// entirely are simply absent), keyed by unit id.
pub type CycleResult = HashMap<u8, Reading>;

pub struct ModbusGattClient {
    adapter: Arc<dyn BleAdapter>,
    airtime: Arc<AirtimeCoordinator>,
    targets: Vec<DeviceTarget>,
    sections: Vec<ModbusSection>,
    consecutive_timeouts: std::sync::atomic::AtomicU32,
    pause_during_renogy: bool,
}

impl ModbusGattClient {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        airtime: Arc<AirtimeCoordinator>,
        targets: Vec<DeviceTarget>,
        sections: Vec<ModbusSection>,
        pause_during_renogy: bool,
    ) -> Self {
        Self {
            adapter,
            airtime,
            targets,
            sections,
            consecutive_timeouts: std::sync::atomic::AtomicU32::new(0),
            pause_during_renogy,
        }
    }

    /// Runs one cycle across every configured device, in order, with a dwell
    /// between devices. Holds a single airtime pause token for the whole
    /// cycle (unless `pause_during_renogy` is `false`) and always signals
    /// cycle completion on the way out, even if a device fails or the cycle
    /// is cancelled.
    pub async fn run_cycle(&self) -> CycleResult {
        let token = if self.pause_during_renogy {
            Some(self.airtime.pause("renogy-poll-cycle").await)
        } else {
            None
        };
        let mut results = CycleResult::new();

        for (i, target) in self.targets.iter().enumerate() {
            if i > 0 {
                sleep(INTER_DEVICE_DWELL).await;
            }
            match self.poll_device(target).await {
                Ok(reading) => {
                    self.consecutive_timeouts
                        .store(0, std::sync::atomic::Ordering::SeqCst);
                    results.insert(target.unit_id, reading);
                }
                Err(Error::Timeout(_)) => {
                    let count = self
                        .consecutive_timeouts
                        .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
                        + 1;
                    warn!(
                        "unit {} timed out ({} consecutive)",
                        target.unit_id, count
                    );
                    if count >= CONSECUTIVE_TIMEOUT_RESET_THRESHOLD {
                        warn!("power-cycling adapter after repeated Renogy timeouts");
                        if let Err(e) = self.adapter.power_cycle().await {
                            warn!("adapter power cycle failed: {e}");
                        }
                        self.consecutive_timeouts
                            .store(0, std::sync::atomic::Ordering::SeqCst);
                    }
                }
                Err(e) => {
                    warn!("unit {} poll failed: {e}", target.unit_id);
                }
            }
        }

        drop(token);
        self.airtime.on_modbus_cycle_done();
        results
    }

    async fn poll_device(&self, target: &DeviceTarget) -> Result<Reading, Error> {
        let mut session = self
            .adapter
            .connect_gatt(
                target.mac_address,
                &target.alias,
                DISCOVERY_TIMEOUT,
                CONNECT_RETRIES,
            )
            .await?;
        info!("connected to unit {} ({})", target.unit_id, target.alias);

        let result = self.read_all_sections(session.as_mut(), target).await;

        if let Err(e) = session.disconnect().await {
            debug!("disconnect for unit {} failed: {e}", target.unit_id);
        }

        result
    }

    async fn read_all_sections(
        &self,
        session: &mut dyn GattSession,
        target: &DeviceTarget,
    ) -> Result<Reading, Error> {
        session
            .start_notify(crate::ble::bluez::RENOGY_NOTIFY_CHAR_UUID)
            .await?;

        let mut reading = Reading::new();
        for section in &self.sections {
            let request = build_read_request(target.unit_id, section.register_base, section.word_count as u16);
            session
                .write(crate::ble::bluez::RENOGY_WRITE_CHAR_UUID, &request)
                .await?;

            let response = session
                .next_notification(target.read_timeout)
                .await
                .ok_or(Error::Timeout(target.read_timeout))?;

            match parse_read_response(&response, target.unit_id, section.word_count) {
                Ok(data) => {
                    let fields = (section.parser)(data);
                    reading.extend(fields);
                }
                Err(e) => {
                    warn!(
                        "unit {} section {} failed to parse: {e}",
                        target.unit_id, section.name
                    );
                }
            }
        }

        Ok(reading)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::airtime::AirtimeConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingAdapter {
        start_count: AtomicU32,
        stop_count: AtomicU32,
    }

    #[async_trait]
    impl BleAdapter for CountingAdapter {
        async fn start_scan(&self) -> Result<(), crate::ble::Error> {
            self.start_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn stop_scan(&self) -> Result<(), crate::ble::Error> {
            self.stop_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn is_scanning(&self) -> Result<bool, crate::ble::Error> {
            Ok(true)
        }
        async fn connect_gatt(
            &self,
            _mac_address: Option<MacAddress>,
            _alias: &str,
            _discovery_timeout: Duration,
            _retries: u32,
        ) -> Result<Box<dyn GattSession>, crate::ble::Error> {
            unimplemented!("not exercised: run_cycle is called with no targets")
        }
        async fn power_cycle(&self) -> Result<(), crate::ble::Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn pause_during_renogy_false_never_touches_the_scanner() {
        let adapter = Arc::new(CountingAdapter {
            start_count: AtomicU32::new(0),
            stop_count: AtomicU32::new(0),
        });
        let coordinator = AirtimeCoordinator::new(adapter.clone(), AirtimeConfig::default());
        coordinator.start().await;
        assert_eq!(adapter.start_count.load(Ordering::SeqCst), 1);

        let client = ModbusGattClient::new(adapter.clone(), coordinator, Vec::new(), Vec::new(), false);
        client.run_cycle().await;

        assert_eq!(adapter.stop_count.load(Ordering::SeqCst), 0);
        assert_eq!(adapter.start_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pause_during_renogy_true_pauses_and_resumes_the_scanner() {
        let adapter = Arc::new(CountingAdapter {
            start_count: AtomicU32::new(0),
            stop_count: AtomicU32::new(0),
        });
        let coordinator = AirtimeCoordinator::new(adapter.clone(), AirtimeConfig::default());
        coordinator.start().await;
        assert_eq!(adapter.start_count.load(Ordering::SeqCst), 1);

        let client = ModbusGattClient::new(adapter.clone(), coordinator, Vec::new(), Vec::new(), true);
        client.run_cycle().await;
        // The pause token is dropped synchronously at the end of `run_cycle`,
        // which resumes scanning from a spawned task; give it a tick to land.
        tokio::task::yield_now().await;

        assert_eq!(adapter.stop_count.load(Ordering::SeqCst), 1);
        assert_eq!(adapter.start_count.load(Ordering::SeqCst), 2);
    }
}
