//! Top-level lifecycle: start/stop order, signal handling, and wiring
//! Airtime -> ModbusGatt -> Registry -> NativeApi together (`SPEC_FULL.md`
//! §4.9).
//!
//! Startup order: [`SensorRegistry`] -> [`NativeApiServer`] -> mDNS
//! announce -> [`AirtimeCoordinator`] (scanner on) -> [`PollScheduler`]
//! (which may run an initial cycle in `Once`/`Continuous` mode). Shutdown
//! is the reverse, each step bounded by [`SHUTDOWN_TIMEOUT`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::Notify;

use crate::airtime::{AirtimeConfig, AirtimeCoordinator};
use crate::api::messages::BLUETOOTH_PROXY_FEATURES;
use crate::api::server::NativeApiServer;
use crate::api::session::DeviceIdentity;
use crate::ble::bluez::BlueZAdapter;
use crate::ble::{parse_mac, BleAdapter};
use crate::config::{Config, ConfiguredScanMode, RenogyPollMode};
use crate::energy::EnergyTotals;
use crate::error::{ProxyError, ProxyResult};
use crate::mdns::{AnnounceTxt, MdnsAnnouncer};
use crate::renogy::client::{DeviceTarget, ModbusGattClient};
use crate::renogy::sections::battery_sections;
use crate::scheduler::{PollMode, PollScheduler};
use crate::sensors::registry::SensorRegistry;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const ESPHOME_VERSION: &str = "2024.12.0";
const PROJECT_NAME: &str = "renogy-ble-proxy";
const PROJECT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Everything [`ProxyService::start`] needs that isn't already in
/// [`Config`] — just the energy-totals file location, since that path is
/// an environment detail (`SPEC_FULL.md` §6) rather than something read
/// from the `.ini` file itself.
pub struct StartOptions {
    pub config: Config,
    pub energy_totals_path: PathBuf,
}

pub struct ProxyService {
    registry: Arc<SensorRegistry>,
    api_server: Arc<NativeApiServer>,
    airtime: Arc<AirtimeCoordinator>,
    mdns: Arc<MdnsAnnouncer>,
    energy: Arc<EnergyTotals>,
    shutdown_notify: Arc<Notify>,
    stopped: AtomicBool,
}

impl ProxyService {
    /// Builds and starts every component in the order mandated by §4.9,
    /// returning once the native-API listener is bound and the scanner has
    /// been asked to start (not necessarily once it has actually started —
    /// that happens asynchronously under the airtime mutex).
    pub async fn start(opts: StartOptions) -> ProxyResult<Arc<Self>> {
        let StartOptions {
            config,
            energy_totals_path,
        } = opts;

        let proxy_config = config
            .home_assistant_proxy
            .clone()
            .unwrap_or_else(default_proxy_config);

        let configured_unit_ids = config
            .device
            .as_ref()
            .map(|d| d.device_ids.clone())
            .unwrap_or_default();
        let temperature_fahrenheit = config
            .data
            .as_ref()
            .map(|d| d.temperature_fahrenheit)
            .unwrap_or(false);

        // SensorRegistry first: every other component only ever hands it
        // readings or reads its entity snapshot.
        let registry = Arc::new(SensorRegistry::new(
            configured_unit_ids.clone(),
            temperature_fahrenheit,
        ));

        let mac_address = proxy_config
            .mac
            .clone()
            .or_else(|| config.device.as_ref().and_then(|d| d.mac_addr.clone()))
            .unwrap_or_else(|| "00:00:00:00:00:00".to_string());

        let identity = DeviceIdentity {
            name: proxy_config.device_name.clone(),
            mac_address: mac_address.clone(),
            esphome_version: ESPHOME_VERSION.to_string(),
            model: "renogy-ble-proxy".to_string(),
            manufacturer: "esphome-compatible".to_string(),
            project_name: PROJECT_NAME.to_string(),
            project_version: PROJECT_VERSION.to_string(),
        };

        // NativeApiServer second: it must be ready to accept connections
        // before anything else starts producing advertisements or states.
        let api_server = NativeApiServer::new(registry.clone(), identity);
        let bind_addr: SocketAddr = format!("0.0.0.0:{}", proxy_config.native_api_port)
            .parse()
            .expect("formatted from a valid u16 port");
        api_server
            .serve(bind_addr)
            .await
            .map_err(ProxyError::Api)?;

        // mDNS third.
        let mdns = Arc::new(MdnsAnnouncer::new().map_err(|e| ProxyError::Mdns(e.to_string()))?);
        let announce_addr = proxy_config
            .mdns_ip
            .as_deref()
            .and_then(|ip| ip.parse().ok());
        mdns.announce(
            &proxy_config.device_name,
            proxy_config.native_api_port,
            announce_addr,
            &AnnounceTxt {
                mac: mac_address.clone(),
                version: PROJECT_VERSION.to_string(),
                network: "ethernet",
                api_version: "1.13",
                bluetooth_proxy_feature_flags: BLUETOOTH_PROXY_FEATURES,
                project_name: PROJECT_NAME.to_string(),
                project_version: PROJECT_VERSION.to_string(),
            },
        )
        .map_err(|e| ProxyError::Mdns(e.to_string()))?;

        // AirtimeCoordinator fourth: the adapter starts powered on and the
        // scanner is requested to run immediately (subject to pause
        // tokens, of which there are none yet).
        let (advertisement_tx, mut advertisement_rx) = tokio::sync::mpsc::channel(256);
        let adapter: Arc<dyn BleAdapter> = Arc::new(
            BlueZAdapter::new(
                &proxy_config.adapter,
                advertisement_tx,
                proxy_config.health_reset_limit,
            )
            .await
            .map_err(ProxyError::Ble)?,
        );

        let duty_cycle = if proxy_config.scan_active_seconds > Duration::ZERO
            && proxy_config.scan_idle_seconds > Duration::ZERO
        {
            Some((
                proxy_config.scan_active_seconds,
                proxy_config.scan_idle_seconds,
            ))
        } else {
            None
        };
        let airtime = AirtimeCoordinator::new(
            adapter.clone(),
            AirtimeConfig {
                duty_cycle,
                settle_time: proxy_config.airtime_settle_seconds,
                resume_window: proxy_config.airtime_window_seconds,
                health_check_interval: proxy_config.health_check_interval,
                health_check_threshold: proxy_config.health_check_threshold,
                health_reset_adapter: proxy_config.health_reset_adapter,
            },
        );
        airtime.start().await;

        let shutdown_notify = Arc::new(Notify::new());

        // Every observed advertisement both feeds the health watchdog's
        // idle timer and fans out to subscribed sessions.
        let fan_out_server = api_server.clone();
        let fan_out_airtime = airtime.clone();
        let fan_out_shutdown = shutdown_notify.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = fan_out_shutdown.notified() => return,
                    event = advertisement_rx.recv() => {
                        let Some(event) = event else { return };
                        fan_out_airtime.record_advertisement().await;
                        fan_out_server.fan_out_advertisement(&event).await;
                    }
                }
            }
        });

        let energy = Arc::new(
            EnergyTotals::load(energy_totals_path)
                .await
                .map_err(ProxyError::Energy)?,
        );

        let service = Arc::new(Self {
            registry: registry.clone(),
            api_server: api_server.clone(),
            airtime: airtime.clone(),
            mdns,
            energy: energy.clone(),
            shutdown_notify: shutdown_notify.clone(),
            stopped: AtomicBool::new(false),
        });

        // PollScheduler last, only when a Renogy client is configured.
        if proxy_config.with_renogy_client {
            let Some(device) = config.device.clone() else {
                warn!("with_renogy_client=true but no [device] section; Renogy polling disabled");
                return Ok(service);
            };
            let read_timeout = config
                .data
                .as_ref()
                .map(|d| d.renogy_read_timeout)
                .unwrap_or(Duration::from_secs(15));
            let targets: Vec<DeviceTarget> = device
                .device_ids
                .iter()
                .map(|&unit_id| DeviceTarget {
                    unit_id,
                    mac_address: device.mac_addr.as_deref().and_then(parse_mac),
                    alias: device.alias.clone(),
                    read_timeout,
                })
                .collect();
            let client = Arc::new(ModbusGattClient::new(
                adapter.clone(),
                airtime.clone(),
                targets,
                battery_sections(),
                proxy_config.pause_during_renogy,
            ));

            let poll_mode = resolve_poll_mode(&config, &proxy_config);
            let scheduler = PollScheduler::new(
                client,
                airtime.clone(),
                poll_mode,
                shutdown_notify.clone(),
            );

            let registry_for_cycles = registry.clone();
            let api_for_cycles = api_server.clone();
            let energy_for_cycles = energy.clone();
            tokio::spawn(async move {
                scheduler
                    .run(move |cycle_result| {
                        let registry = registry_for_cycles.clone();
                        let api = api_for_cycles.clone();
                        let energy = energy_for_cycles.clone();
                        tokio::spawn(async move {
                            publish_cycle_result(&registry, &api, &energy, cycle_result).await;
                        });
                    })
                    .await;
            });
        } else {
            info!("Renogy client disabled (with_renogy_client=false)");
        }

        Ok(service)
    }

    /// Installs SIGINT/SIGTERM handlers and blocks until one fires, then
    /// calls [`Self::stop`]. Handlers are idempotent: a second signal while
    /// shutdown is already underway is a no-op.
    pub async fn run_until_shutdown(self: &Arc<Self>) {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received shutdown signal");
        }
        self.stop().await;
    }

    /// Idempotent shutdown in the reverse of startup order. Each step is
    /// bounded by [`SHUTDOWN_TIMEOUT`]; a step that doesn't finish in time
    /// is logged and the service moves on rather than hanging forever.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down");
        self.shutdown_notify.notify_waiters();

        with_timeout("airtime coordinator", self.airtime.shutdown()).await;
        self.api_server.shutdown();
        self.mdns.withdraw();
        if let Err(e) = self.energy.flush().await {
            warn!("failed to flush energy totals during shutdown: {e}");
        }
        info!("shutdown complete");
    }

    pub fn registry(&self) -> &Arc<SensorRegistry> {
        &self.registry
    }

    pub fn api_server(&self) -> &Arc<NativeApiServer> {
        &self.api_server
    }
}

async fn with_timeout(component: &'static str, fut: impl std::future::Future<Output = ()>) {
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, fut).await.is_err() {
        error!("component {component} failed to shut down within {SHUTDOWN_TIMEOUT:?}, dropped");
    }
}

/// Folds a completed Renogy cycle into the registry, accumulates energy
/// totals for `total_increasing`-shaped fields, and fans out every changed
/// sensor state, severing enumerated sessions first if new entities were
/// allocated (§4.7).
async fn publish_cycle_result(
    registry: &Arc<SensorRegistry>,
    api: &Arc<NativeApiServer>,
    energy: &Arc<EnergyTotals>,
    cycle_result: crate::renogy::client::CycleResult,
) {
    for (unit_id, reading) in cycle_result {
        if let Some(crate::renogy::FieldValue::Number(charge)) = reading.get("remaining_charge") {
            energy
                .accumulate(
                    &unit_id.to_string(),
                    "remaining_charge",
                    *charge,
                    std::time::SystemTime::now(),
                )
                .await;
        }

        let result = registry.ingest(unit_id, reading).await;
        if result.new_entities {
            api.disconnect_all_for_new_entities().await;
        }
        for (key, value, missing) in result.changes {
            api.publish_sensor_state(key, value, missing).await;
        }
    }
}

fn resolve_poll_mode(
    config: &Config,
    proxy_config: &crate::config::HomeAssistantProxyConfig,
) -> PollMode {
    let enable_polling = config.data.as_ref().map(|d| d.enable_polling).unwrap_or(true);
    if !enable_polling {
        // §9 Open Question: `enable_polling=false` collapses to running
        // exactly one cycle at start-up rather than a separate knob.
        return PollMode::Once;
    }
    match proxy_config.renogy_poll_mode {
        RenogyPollMode::Continuous => PollMode::Continuous {
            poll_interval: config
                .data
                .as_ref()
                .map(|d| d.poll_interval)
                .unwrap_or(Duration::from_secs(10)),
        },
        RenogyPollMode::Scheduled => PollMode::Scheduled {
            renogy_read_interval: proxy_config.renogy_read_interval,
            poll_after_proxy_cycle: config
                .data
                .as_ref()
                .map(|d| d.poll_after_proxy_cycle)
                .unwrap_or(false),
        },
    }
}

fn default_proxy_config() -> crate::config::HomeAssistantProxyConfig {
    crate::config::HomeAssistantProxyConfig {
        enabled: true,
        device_name: "renogy.proxy".to_string(),
        adapter: "hci0".to_string(),
        native_api_port: 6053,
        with_renogy_client: false,
        renogy_poll_mode: RenogyPollMode::Scheduled,
        renogy_read_interval: Duration::from_secs(60),
        scan_mode: ConfiguredScanMode::Passive,
        scan_active_seconds: Duration::ZERO,
        scan_idle_seconds: Duration::ZERO,
        airtime_settle_seconds: Duration::from_millis(400),
        airtime_window_seconds: Duration::from_secs(3),
        health_check_interval: Duration::from_secs(10),
        health_check_threshold: Duration::from_secs(45),
        health_reset_adapter: true,
        health_reset_limit: 10,
        pause_during_renogy: true,
        mac: None,
        mdns_ip: None,
        esphome_sensors: Vec::new(),
    }
}
