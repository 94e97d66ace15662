//! BlueZ-backed [`BleAdapter`] implementation, built on the `bluer` crate
//! (the same D-Bus bindings used throughout the `bluez-bluer` examples in the
//! retrieval pack).
//!
//! Two concerns are kept deliberately separate, matching the design note in
//! `SPEC_FULL.md` §9 about bridging an OS callback onto the single-threaded
//! reactor:
//!
//! - [`BlueZAdapter::start_scan`]/[`stop_scan`] own exactly one pump task
//!   that drains `bluer`'s discovery stream into a bounded
//!   [`tokio::sync::mpsc`] channel, dropping the oldest advertisement on
//!   overflow rather than blocking BlueZ's D-Bus dispatch loop.
//! - [`BlueZAdapter::connect_gatt`] is a leaf operation: it resolves one
//!   device, connects, and finds the Renogy write/notify characteristics,
//!   returning a [`GattSession`] the Modbus client drives directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bluer::{AdapterEvent, Address, AddressType as BluerAddressType, DiscoveryFilter};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use super::{AddressType, AdvertisementEvent, BleAdapter, Error, GattSession, MacAddress};

/// Renogy BT-2 GATT UUIDs (spec §4.3).
pub const RENOGY_WRITE_SERVICE_UUID: &str = "0000ffd0-0000-1000-8000-00805f9b34fb";
pub const RENOGY_NOTIFY_CHAR_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";
pub const RENOGY_WRITE_CHAR_UUID: &str = "0000ffd1-0000-1000-8000-00805f9b34fb";

/// Bounded queue depth between the BlueZ event stream and the reactor;
/// overflow drops the oldest advertisement rather than backpressuring BlueZ.
const ADVERTISEMENT_QUEUE_DEPTH: usize = 256;

pub struct BlueZAdapter {
    adapter: bluer::Adapter,
    events_tx: mpsc::Sender<AdvertisementEvent>,
    scan_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
    reset_log: Mutex<Vec<Instant>>,
    max_resets_per_hour: u32,
}

impl BlueZAdapter {
    /// Powers on `adapter_name` (e.g. `"hci0"`) and returns an adapter whose
    /// observed advertisements are pushed onto `events_tx`. `max_resets_per_hour`
    /// is the configured `health_reset_limit` (`SPEC_FULL.md` §4.3/§6).
    pub async fn new(
        adapter_name: &str,
        events_tx: mpsc::Sender<AdvertisementEvent>,
        max_resets_per_hour: u32,
    ) -> Result<Self, Error> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| Error::Dbus(e.into()))?;
        let adapter = session
            .adapter(adapter_name)
            .map_err(|e| Error::Dbus(e.into()))?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| Error::Dbus(e.into()))?;

        Ok(Self {
            adapter,
            events_tx,
            scan_task: Mutex::new(None),
            reset_log: Mutex::new(Vec::new()),
            max_resets_per_hour,
        })
    }

    async fn device_to_advertisement(device: &bluer::Device) -> Option<AdvertisementEvent> {
        let address = device.address().0;
        let rssi = device.rssi().await.ok().flatten().unwrap_or(0) as i8;
        let local_name = device.name().await.ok().flatten();
        let address_type = match device.address_type().await.ok() {
            Some(BluerAddressType::Random) => AddressType::Random,
            _ => AddressType::Public,
        };
        let manufacturer_data = device
            .manufacturer_data()
            .await
            .ok()
            .flatten()
            .unwrap_or_default();
        let service_data: HashMap<String, Vec<u8>> = device
            .service_data()
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .map(|(uuid, data)| (uuid.to_string(), data))
            .collect();
        let service_uuids = device
            .uuids()
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
            .into_iter()
            .map(|u| u.to_string())
            .collect();
        let tx_power = device.tx_power().await.ok().flatten().map(|p| p as i8);

        Some(AdvertisementEvent {
            address,
            address_type,
            rssi,
            local_name,
            manufacturer_data,
            service_data,
            service_uuids,
            tx_power,
            flags: None,
        })
    }

    async fn record_reset(&self) -> Result<(), Error> {
        let mut log = self.reset_log.lock().await;
        let cutoff = Instant::now() - Duration::from_secs(3600);
        log.retain(|&t| t > cutoff);
        if log.len() as u32 >= self.max_resets_per_hour {
            return Err(Error::InProgress);
        }
        log.push(Instant::now());
        Ok(())
    }

    async fn resolve_device(
        &self,
        mac_address: Option<MacAddress>,
        alias: &str,
        discovery_timeout: Duration,
    ) -> Result<bluer::Device, Error> {
        if let Some(mac) = mac_address {
            let addr = Address(mac);
            if let Ok(device) = self.adapter.device(addr) {
                return Ok(device);
            }
        }

        let filter = DiscoveryFilter {
            duplicate_data: true,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(|e| Error::Dbus(e.into()))?;
        let mut events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| Error::Dbus(e.into()))?;

        let deadline = tokio::time::sleep(discovery_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(Error::DiscoveryExhausted { attempts: 1 });
                }
                event = events.next() => {
                    let Some(AdapterEvent::DeviceAdded(addr)) = event else { continue };
                    let Ok(device) = self.adapter.device(addr) else { continue };
                    if let Some(mac) = mac_address {
                        if addr.0 == mac {
                            return Ok(device);
                        }
                        continue;
                    }
                    if let Ok(Some(name)) = device.name().await {
                        if name == alias {
                            return Ok(device);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl BleAdapter for BlueZAdapter {
    async fn start_scan(&self) -> Result<(), Error> {
        let mut guard = self.scan_task.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let filter = DiscoveryFilter {
            duplicate_data: true,
            ..Default::default()
        };
        self.adapter
            .set_discovery_filter(filter)
            .await
            .map_err(|e| Error::Dbus(e.into()))?;
        let mut events = self
            .adapter
            .discover_devices()
            .await
            .map_err(|e| Error::Dbus(e.into()))?;

        let adapter = self.adapter.clone();
        let tx = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let AdapterEvent::DeviceAdded(addr) = event else {
                    continue;
                };
                let Ok(device) = adapter.device(addr) else {
                    continue;
                };
                let Some(advertisement) = BlueZAdapter::device_to_advertisement(&device).await
                else {
                    continue;
                };
                if advertisement.is_from_own_adapter() {
                    continue;
                }
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(advertisement) {
                    warn!("advertisement queue full, dropping oldest detection");
                }
            }
        });

        *guard = Some(handle);
        info!("BLE scan started on {}", self.adapter.name());
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), Error> {
        let mut guard = self.scan_task.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
            info!("BLE scan stopped on {}", self.adapter.name());
        }
        Ok(())
    }

    async fn is_scanning(&self) -> Result<bool, Error> {
        Ok(self.scan_task.lock().await.is_some())
    }

    async fn connect_gatt(
        &self,
        mac_address: Option<MacAddress>,
        alias: &str,
        discovery_timeout: Duration,
        retries: u32,
    ) -> Result<Box<dyn GattSession>, Error> {
        let mut attempt = 0;
        let mut backoff = Duration::from_secs(1);
        loop {
            attempt += 1;
            let result = self
                .resolve_device(mac_address, alias, discovery_timeout)
                .await;
            match result {
                Ok(device) => {
                    device.connect().await.map_err(|e| Error::ConnectFailed {
                        address: alias.to_string(),
                        source: e.into(),
                    })?;
                    return BlueZGattSession::new(device).await;
                }
                Err(_) if attempt < retries => {
                    warn!(
                        "discovery attempt {attempt}/{retries} for {alias} failed, backing off {backoff:?}"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn power_cycle(&self) -> Result<(), Error> {
        self.record_reset().await?;
        info!("power-cycling adapter {}", self.adapter.name());
        self.adapter
            .set_powered(false)
            .await
            .map_err(|e| Error::Dbus(e.into()))?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.adapter
            .set_powered(true)
            .await
            .map_err(|e| Error::Dbus(e.into()))?;
        Ok(())
    }
}

/// One connected GATT conversation with a Renogy BT-2. Owns the notification
/// pump task for the lifetime of the connection.
struct BlueZGattSession {
    device: bluer::Device,
    service: Arc<bluer::gatt::remote::Service>,
    notify_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    notify_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl BlueZGattSession {
    async fn new(device: bluer::Device) -> Result<Box<dyn GattSession>, Error> {
        let services = device.services().await.map_err(|e| Error::ConnectFailed {
            address: format!("{:?}", device.address()),
            source: e.into(),
        })?;

        let mut target = None;
        for service in services {
            if let Ok(uuid) = service.uuid().await {
                if uuid.to_string().eq_ignore_ascii_case(RENOGY_WRITE_SERVICE_UUID) {
                    target = Some(service);
                    break;
                }
            }
        }
        let service = target.ok_or_else(|| Error::ConnectFailed {
            address: format!("{:?}", device.address()),
            source: anyhow::anyhow!("Renogy write service not found"),
        })?;

        Ok(Box::new(Self {
            device,
            service: Arc::new(service),
            notify_rx: Mutex::new(None),
            notify_task: Mutex::new(None),
        }))
    }

    async fn find_characteristic(
        &self,
        uuid: &str,
    ) -> Result<bluer::gatt::remote::Characteristic, Error> {
        let chars = self
            .service
            .characteristics()
            .await
            .map_err(|e| Error::Dbus(e.into()))?;
        for characteristic in chars {
            if let Ok(char_uuid) = characteristic.uuid().await {
                if char_uuid.to_string().eq_ignore_ascii_case(uuid) {
                    return Ok(characteristic);
                }
            }
        }
        Err(Error::WriteFailed {
            characteristic: uuid.to_string(),
            source: anyhow::anyhow!("characteristic not found"),
        })
    }
}

#[async_trait]
impl GattSession for BlueZGattSession {
    async fn write(&self, characteristic_uuid: &str, data: &[u8]) -> Result<(), Error> {
        let characteristic = self.find_characteristic(characteristic_uuid).await?;
        characteristic
            .write(data)
            .await
            .map_err(|e| Error::WriteFailed {
                characteristic: characteristic_uuid.to_string(),
                source: e.into(),
            })
    }

    async fn start_notify(&self, characteristic_uuid: &str) -> Result<(), Error> {
        let characteristic = self.find_characteristic(characteristic_uuid).await?;
        let mut stream = characteristic
            .notify()
            .await
            .map_err(|e| Error::Dbus(e.into()))?;

        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(async move {
            while let Some(value) = stream.next().await {
                if tx.send(value).await.is_err() {
                    break;
                }
            }
        });

        *self.notify_rx.lock().await = Some(rx);
        *self.notify_task.lock().await = Some(handle);
        debug!("subscribed to notifications on {characteristic_uuid}");
        Ok(())
    }

    async fn next_notification(&mut self, wait: Duration) -> Option<Vec<u8>> {
        let mut guard = self.notify_rx.lock().await;
        let rx = guard.as_mut()?;
        timeout(wait, rx.recv()).await.ok().flatten()
    }

    async fn disconnect(&self) -> Result<(), Error> {
        if let Some(handle) = self.notify_task.lock().await.take() {
            handle.abort();
        }
        self.device
            .disconnect()
            .await
            .map_err(|e| Error::Dbus(e.into()))
    }
}
