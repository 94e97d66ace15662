//! LAN service announcement (`SPEC_FULL.md` §4.9/§6).
//!
//! The core only ever calls [`MdnsAnnouncer::announce`] and
//! [`MdnsAnnouncer::withdraw`] — everything else about mDNS is this
//! external collaborator's concern, per spec.md §1/§2. Built on `mdns-sd`,
//! the same pattern the Python original uses `zeroconf`'s `AsyncServiceInfo`
//! for in `examples/original_source/renogybt/esphome_discovery.py`.

use std::net::Ipv4Addr;

use log::{info, warn};
use mdns_sd::{ServiceDaemon, ServiceInfo};
use thiserror::Error;

const SERVICE_TYPE: &str = "_esphomelib._tcp.local.";

#[derive(Debug, Error)]
pub enum MdnsError {
    #[error("failed to start mDNS daemon: {0}")]
    DaemonStart(String),
    #[error("failed to build service record: {0}")]
    ServiceInfo(String),
    #[error("failed to register service: {0}")]
    Register(String),
    #[error("failed to unregister service: {0}")]
    Unregister(String),
}

/// The TXT records §6 requires on every announcement.
pub struct AnnounceTxt {
    pub mac: String,
    pub version: String,
    pub network: &'static str,
    pub api_version: &'static str,
    pub bluetooth_proxy_feature_flags: u32,
    pub project_name: String,
    pub project_version: String,
}

/// Advertises this proxy on the LAN as `_esphomelib._tcp.local.`, matching
/// the instance-name rule in §6 (device name, lowercased, spaces -> hyphens).
pub struct MdnsAnnouncer {
    daemon: ServiceDaemon,
    fullname: std::sync::Mutex<Option<String>>,
}

impl MdnsAnnouncer {
    pub fn new() -> Result<Self, MdnsError> {
        let daemon = ServiceDaemon::new().map_err(|e| MdnsError::DaemonStart(e.to_string()))?;
        Ok(Self {
            daemon,
            fullname: std::sync::Mutex::new(None),
        })
    }

    /// Registers (or re-registers, withdrawing any prior announcement
    /// first) the service. `addr` is the host's LAN address; `None` falls
    /// back to `mdns-sd`'s own interface enumeration.
    pub fn announce(
        &self,
        name: &str,
        port: u16,
        addr: Option<Ipv4Addr>,
        txt: &AnnounceTxt,
    ) -> Result<(), MdnsError> {
        self.withdraw();

        let instance_name = name.to_ascii_lowercase().replace(' ', "-");
        let host_name = format!("{instance_name}.local.");

        let feature_flags = txt.bluetooth_proxy_feature_flags.to_string();
        let properties: Vec<(&str, &str)> = vec![
            ("mac", txt.mac.as_str()),
            ("version", txt.version.as_str()),
            ("platform", "linux"),
            ("network", txt.network),
            ("api_version", txt.api_version),
            ("use_password", "false"),
            ("bluetooth_proxy", "true"),
            ("bluetooth_proxy_version", "5"),
            ("bluetooth_proxy_feature_flags", feature_flags.as_str()),
            ("project_name", txt.project_name.as_str()),
            ("project_version", txt.project_version.as_str()),
        ];

        let host_ip = addr.map(|a| a.to_string()).unwrap_or_default();
        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &instance_name,
            &host_name,
            host_ip.as_str(),
            port,
            &properties[..],
        )
        .map_err(|e| MdnsError::ServiceInfo(e.to_string()))?;

        let fullname = service.get_fullname().to_string();
        self.daemon
            .register(service)
            .map_err(|e| MdnsError::Register(e.to_string()))?;
        *self.fullname.lock().unwrap() = Some(fullname.clone());
        info!("mDNS: announced {instance_name} on port {port} ({fullname})");
        Ok(())
    }

    /// Withdraws the current announcement, if any. Idempotent.
    pub fn withdraw(&self) {
        let mut guard = self.fullname.lock().unwrap();
        if let Some(fullname) = guard.take() {
            if let Err(e) = self.daemon.unregister(&fullname) {
                warn!("mDNS: failed to withdraw {fullname}: {e}");
            } else {
                info!("mDNS: withdrew {fullname}");
            }
        }
    }
}

impl Drop for MdnsAnnouncer {
    fn drop(&mut self) {
        self.withdraw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_name_is_lowercased_with_hyphens() {
        let name = "Renogy Proxy".to_ascii_lowercase().replace(' ', "-");
        assert_eq!(name, "renogy-proxy");
    }
}
