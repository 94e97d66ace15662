//! Binary entry point: load the `.ini` configuration, start logging, run
//! [`ProxyService`] until a shutdown signal arrives, and translate the
//! outcome into the process exit code from `SPEC_FULL.md` §6.

use std::path::PathBuf;
use std::process::ExitCode;

use log::error;
use renogy_ble_proxy::config::Config;
use renogy_ble_proxy::service::{ProxyService, StartOptions};

const DEFAULT_CONFIG_PATH: &str = "/etc/renogy-ble-proxy/config.ini";
const DEFAULT_ENERGY_TOTALS_PATH: &str = "/var/lib/renogy-ble-proxy/energy_totals.json";

const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_SIGNAL: u8 = 130;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let energy_totals_path = std::env::var("RENOGY_ENERGY_TOTALS_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_ENERGY_TOTALS_PATH));

    let config = match Config::load(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load {}: {e}", config_path.display());
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let service = match ProxyService::start(StartOptions {
        config,
        energy_totals_path,
    })
    .await
    {
        Ok(service) => service,
        Err(e) => {
            error!("failed to start: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    // `run_until_shutdown` only returns once SIGINT/SIGTERM has been
    // received and the service has torn down cleanly in response.
    service.run_until_shutdown().await;
    ExitCode::from(EXIT_SIGNAL)
}
