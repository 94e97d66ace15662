//! `.ini`-style configuration file structures and reader (`SPEC_FULL.md` §6).
//!
//! Sections: `[device]`, `[data]`, `[home_assistant_proxy]`. A missing
//! optional section is not an error — it means that section's feature is
//! disabled, matching the behavior of the Python original's
//! `configparser.ConfigParser` with `fallback=...` everywhere it reads a
//! key. This reader is hand-rolled rather than built on an external crate:
//! the retrieval pack carries no `.ini`/config-file crate to ground a
//! dependency choice on for a format this small (recorded in `DESIGN.md`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected 'key = value' or '[section]', got: {text}")]
    Syntax { line: usize, text: String },
    #[error("missing required key '{key}' in [{section}]")]
    MissingKey {
        section: &'static str,
        key: &'static str,
    },
    #[error("invalid value for '{key}' in [{section}]: '{value}'")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
}

/// A parsed `.ini` document: section name -> (key -> value), insertion
/// order is not preserved since the reader only ever does keyed lookups.
struct RawIni {
    sections: HashMap<String, HashMap<String, String>>,
}

impl RawIni {
    fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current: Option<String> = None;

        for (idx, raw_line) in text.lines().enumerate() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Syntax {
                    line: idx + 1,
                    text: line.to_string(),
                });
            };
            let Some(section) = current.as_ref() else {
                return Err(ConfigError::Syntax {
                    line: idx + 1,
                    text: line.to_string(),
                });
            };
            sections
                .get_mut(section)
                .expect("section was inserted when its header was parsed")
                .insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self { sections })
    }

    fn section(&self, name: &str) -> Option<&HashMap<String, String>> {
        self.sections.get(name)
    }
}

/// Strips a trailing `#`-prefixed comment, honouring neither quoting nor
/// escaping — the configuration format has no use for a literal `#`.
fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn get_str<'a>(
    section: &'a HashMap<String, String>,
    key: &str,
) -> Option<&'a str> {
    section.get(key).map(|s| s.as_str())
}

fn get_bool(
    section: &HashMap<String, String>,
    section_name: &'static str,
    key: &'static str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get_str(section, key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                section: section_name,
                key,
                value: v.to_string(),
            }),
        },
    }
}

fn get_u16(
    section: &HashMap<String, String>,
    section_name: &'static str,
    key: &'static str,
    default: u16,
) -> Result<u16, ConfigError> {
    match get_str(section, key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            section: section_name,
            key,
            value: v.to_string(),
        }),
    }
}

fn get_u32(
    section: &HashMap<String, String>,
    section_name: &'static str,
    key: &'static str,
    default: u32,
) -> Result<u32, ConfigError> {
    match get_str(section, key) {
        None => Ok(default),
        Some(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            section: section_name,
            key,
            value: v.to_string(),
        }),
    }
}

fn get_secs(
    section: &HashMap<String, String>,
    section_name: &'static str,
    key: &'static str,
    default: f64,
) -> Result<Duration, ConfigError> {
    match get_str(section, key) {
        None => Ok(Duration::from_secs_f64(default)),
        Some(v) => v
            .parse::<f64>()
            .map(Duration::from_secs_f64)
            .map_err(|_| ConfigError::InvalidValue {
                section: section_name,
                key,
                value: v.to_string(),
            }),
    }
}

fn get_string(
    section: &HashMap<String, String>,
    key: &str,
    default: &str,
) -> String {
    get_str(section, key).unwrap_or(default).to_string()
}

fn get_opt_string(section: &HashMap<String, String>, key: &str) -> Option<String> {
    get_str(section, key)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    RngCtrl,
    RngCtrlHist,
    RngBatt,
    RngInvt,
    RngDcc,
}

impl DeviceType {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "RNG_CTRL" => Ok(Self::RngCtrl),
            "RNG_CTRL_HIST" => Ok(Self::RngCtrlHist),
            "RNG_BATT" => Ok(Self::RngBatt),
            "RNG_INVT" => Ok(Self::RngInvt),
            "RNG_DCC" => Ok(Self::RngDcc),
            other => Err(ConfigError::InvalidValue {
                section: "device",
                key: "type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DeviceConfig {
    pub device_type: DeviceType,
    pub mac_addr: Option<String>,
    pub alias: String,
    pub device_ids: Vec<u8>,
    pub adapter: String,
}

#[derive(Clone, Debug)]
pub struct DataConfig {
    pub poll_interval: Duration,
    pub enable_polling: bool,
    pub fields: Vec<String>,
    pub temperature_fahrenheit: bool,
    pub poll_after_proxy_cycle: bool,
    pub poll_cycle_dwell: Duration,
    pub poll_cycle_timeout: Duration,
    pub renogy_read_timeout: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenogyPollMode {
    Continuous,
    Scheduled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfiguredScanMode {
    Active,
    Passive,
}

#[derive(Clone, Debug)]
pub struct HomeAssistantProxyConfig {
    pub enabled: bool,
    pub device_name: String,
    pub adapter: String,
    pub native_api_port: u16,
    pub with_renogy_client: bool,
    pub renogy_poll_mode: RenogyPollMode,
    pub renogy_read_interval: Duration,
    pub scan_mode: ConfiguredScanMode,
    pub scan_active_seconds: Duration,
    pub scan_idle_seconds: Duration,
    pub airtime_settle_seconds: Duration,
    pub airtime_window_seconds: Duration,
    pub health_check_interval: Duration,
    pub health_check_threshold: Duration,
    pub health_reset_adapter: bool,
    pub health_reset_limit: u32,
    pub pause_during_renogy: bool,
    pub mac: Option<String>,
    pub mdns_ip: Option<String>,
    pub esphome_sensors: Vec<String>,
}

/// The fully parsed configuration file. `data` and `home_assistant_proxy`
/// are `None` when the file omits the section entirely — "missing optional
/// sections default to disabled" (§6) — while `device` is required only
/// when `home_assistant_proxy.with_renogy_client` is set, which
/// [`crate::service::ProxyService`] checks at startup rather than this
/// reader (a config with no `[device]` section and no Renogy client is
/// valid: proxy-only mode).
#[derive(Clone, Debug, Default)]
pub struct Config {
    pub device: Option<DeviceConfig>,
    pub data: Option<DataConfig>,
    pub home_assistant_proxy: Option<HomeAssistantProxyConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_type: DeviceType::RngBatt,
            mac_addr: None,
            alias: String::new(),
            device_ids: Vec::new(),
            adapter: "hci0".to_string(),
        }
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = RawIni::parse(text)?;

        let device = match ini.section("device") {
            None => None,
            Some(section) => {
                let device_type = match get_str(section, "type") {
                    Some(v) => DeviceType::parse(v)?,
                    None => {
                        return Err(ConfigError::MissingKey {
                            section: "device",
                            key: "type",
                        })
                    }
                };
                let device_ids = get_str(section, "device_id")
                    .unwrap_or("48")
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| {
                        s.parse::<u8>().map_err(|_| ConfigError::InvalidValue {
                            section: "device",
                            key: "device_id",
                            value: s.to_string(),
                        })
                    })
                    .collect::<Result<Vec<u8>, _>>()?;
                Some(DeviceConfig {
                    device_type,
                    mac_addr: get_opt_string(section, "mac_addr"),
                    alias: get_string(section, "alias", ""),
                    device_ids,
                    adapter: get_string(section, "adapter", "hci0"),
                })
            }
        };

        let data = match ini.section("data") {
            None => None,
            Some(section) => Some(DataConfig {
                poll_interval: get_secs(section, "data", "poll_interval", 10.0)?,
                enable_polling: get_bool(section, "data", "enable_polling", true)?,
                fields: get_str(section, "fields")
                    .unwrap_or("")
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
                temperature_fahrenheit: get_str(section, "temperature_unit")
                    .map(|v| v.eq_ignore_ascii_case("f") || v.eq_ignore_ascii_case("fahrenheit"))
                    .unwrap_or(false),
                poll_after_proxy_cycle: get_bool(section, "data", "poll_after_proxy_cycle", false)?,
                poll_cycle_dwell: get_secs(section, "data", "poll_cycle_dwell_seconds", 0.5)?,
                poll_cycle_timeout: get_secs(section, "data", "poll_cycle_timeout_seconds", 30.0)?,
                renogy_read_timeout: get_secs(section, "data", "renogy_read_timeout_seconds", 15.0)?,
            }),
        };

        let home_assistant_proxy = match ini.section("home_assistant_proxy") {
            None => None,
            Some(section) => {
                let enabled = get_bool(section, "home_assistant_proxy", "enabled", false)?;
                if !enabled {
                    None
                } else {
                    let scan_mode = match get_str(section, "scan_mode") {
                        Some("active") => ConfiguredScanMode::Active,
                        _ => ConfiguredScanMode::Passive,
                    };
                    let renogy_poll_mode = match get_str(section, "renogy_poll_mode") {
                        Some("continuous") => RenogyPollMode::Continuous,
                        _ => RenogyPollMode::Scheduled,
                    };
                    Some(HomeAssistantProxyConfig {
                        enabled,
                        device_name: get_string(section, "device_name", "renogy.proxy"),
                        adapter: get_string(section, "adapter", "hci0"),
                        native_api_port: get_u16(
                            section,
                            "home_assistant_proxy",
                            "native_api_port",
                            6053,
                        )?,
                        with_renogy_client: get_bool(
                            section,
                            "home_assistant_proxy",
                            "with_renogy_client",
                            false,
                        )?,
                        renogy_poll_mode,
                        renogy_read_interval: get_secs(
                            section,
                            "home_assistant_proxy",
                            "renogy_read_interval",
                            60.0,
                        )?,
                        scan_mode,
                        scan_active_seconds: get_secs(
                            section,
                            "home_assistant_proxy",
                            "scan_active_seconds",
                            0.0,
                        )?,
                        scan_idle_seconds: get_secs(
                            section,
                            "home_assistant_proxy",
                            "scan_idle_seconds",
                            0.0,
                        )?,
                        airtime_settle_seconds: get_secs(
                            section,
                            "home_assistant_proxy",
                            "airtime_settle_seconds",
                            0.4,
                        )?,
                        airtime_window_seconds: get_secs(
                            section,
                            "home_assistant_proxy",
                            "airtime_window_seconds",
                            3.0,
                        )?,
                        health_check_interval: get_secs(
                            section,
                            "home_assistant_proxy",
                            "health_check_interval",
                            10.0,
                        )?,
                        health_check_threshold: get_secs(
                            section,
                            "home_assistant_proxy",
                            "health_check_threshold",
                            45.0,
                        )?,
                        health_reset_adapter: get_bool(
                            section,
                            "home_assistant_proxy",
                            "health_reset_adapter",
                            true,
                        )?,
                        health_reset_limit: get_u32(
                            section,
                            "home_assistant_proxy",
                            "health_reset_limit",
                            10,
                        )?,
                        pause_during_renogy: get_bool(
                            section,
                            "home_assistant_proxy",
                            "pause_during_renogy",
                            true,
                        )?,
                        mac: get_opt_string(section, "mac"),
                        mdns_ip: get_opt_string(section, "mdns_ip"),
                        esphome_sensors: get_str(section, "esphome_sensors")
                            .unwrap_or("")
                            .split(',')
                            .map(str::trim)
                            .filter(|s| !s.is_empty())
                            .map(str::to_string)
                            .collect(),
                    })
                }
            }
        };

        Ok(Self {
            device,
            data,
            home_assistant_proxy,
        })
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = include_str!("../tests/fixtures/proxy.ini");

    #[test]
    fn parses_fixture_into_expected_config() {
        let config = Config::parse(FIXTURE).unwrap();

        let device = config.device.expect("device section present");
        assert_eq!(device.device_type, DeviceType::RngBatt);
        assert_eq!(device.mac_addr.as_deref(), Some("C2:1F:55:AA:BB:CC"));
        assert_eq!(device.device_ids, vec![48, 49]);

        let data = config.data.expect("data section present");
        assert_eq!(data.poll_interval, Duration::from_secs(10));
        assert!(data.enable_polling);

        let proxy = config
            .home_assistant_proxy
            .expect("home_assistant_proxy section present");
        assert!(proxy.enabled);
        assert_eq!(proxy.device_name, "renogy-proxy");
        assert_eq!(proxy.native_api_port, 6053);
        assert!(proxy.with_renogy_client);
        assert_eq!(proxy.renogy_poll_mode, RenogyPollMode::Scheduled);
        assert_eq!(proxy.renogy_read_interval, Duration::from_secs(60));
        assert_eq!(proxy.scan_mode, ConfiguredScanMode::Passive);
    }

    #[test]
    fn missing_optional_sections_default_to_disabled() {
        let config = Config::parse("[device]\ntype = RNG_BATT\n").unwrap();
        assert!(config.data.is_none());
        assert!(config.home_assistant_proxy.is_none());
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let text = "# a leading comment\n\n[device]\n# another comment\ntype = RNG_BATT  # trailing\n";
        let config = Config::parse(text).unwrap();
        assert_eq!(config.device.unwrap().device_type, DeviceType::RngBatt);
    }

    #[test]
    fn rejects_unknown_device_type() {
        let err = Config::parse("[device]\ntype = NOT_A_TYPE\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }
}
