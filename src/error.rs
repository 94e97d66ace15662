//! Top-level error type for the proxy service.
//!
//! Individual components expose their own narrow error enum (see
//! [`crate::ble::Error`], [`crate::renogy::Error`], [`crate::wire::native::FrameError`],
//! [`crate::wire::modbus::ModbusError`], [`crate::config::ConfigError`]); this
//! type only exists to let [`crate::service::ProxyService`] report a single
//! failure cause up to `main`.

use thiserror::Error;

/// Convenience alias used throughout the crate's public APIs.
pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("BLE radio error: {0}")]
    Ble(#[from] crate::ble::Error),

    #[error("Renogy Modbus client error: {0}")]
    Renogy(#[from] crate::renogy::Error),

    #[error("native API server error: {0}")]
    Api(#[source] std::io::Error),

    #[error("energy totals persistence error: {0}")]
    Energy(#[from] crate::energy::EnergyError),

    #[error("mDNS announcement error: {0}")]
    Mdns(String),

    #[error("component {component} failed to shut down within {timeout_secs}s and was dropped")]
    ShutdownTimeout {
        component: &'static str,
        timeout_secs: u64,
    },
}
