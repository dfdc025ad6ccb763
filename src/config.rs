//! Host configuration structure.
//!
//! Everything the engine needs to run against one boiler: how to reach it,
//! what it is (model, firmware version, installed equipment), which access
//! level applies and how to pace the poll loop. The structure is plain
//! `serde`; the binary deserializes it from a YAML file.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::catalog::{CatalogRequest, EquipmentCounts};
use crate::protocol::AccessLevel;

/// Where the device is reachable.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum Endpoint {
    Tcp {
        host: String,
        #[serde(default = "default_port")]
        port: u16,
    },
    Rtu {
        device: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
    },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{host}:{port}"),
            Endpoint::Rtu { device, baud_rate } => write!(f, "{device}@{baud_rate}"),
        }
    }
}

/// Heartbeat register settings, data defined per installation.
#[derive(Debug, Clone, Deserialize)]
pub struct LifetickConfig {
    /// Register the incrementing counter is written to.
    pub address: u16,
    #[serde(default = "default_lifetick_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive write failures tolerated before a forced reconnect.
    #[serde(default = "default_lifetick_failures")]
    pub max_failures: u32,
}

/// Modbus connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ModbusConfig {
    #[serde(flatten)]
    pub endpoint: Endpoint,
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,
    /// Per-request response timeout.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Retries per request on timeout or malformed response.
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_reconnect_initial", with = "humantime_serde")]
    pub reconnect_initial: Duration,
    #[serde(default = "default_reconnect_max", with = "humantime_serde")]
    pub reconnect_max: Duration,
    #[serde(default)]
    pub lifetick: Option<LifetickConfig>,
}

impl Default for ModbusConfig {
    fn default() -> Self {
        ModbusConfig {
            endpoint: Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: default_port(),
            },
            unit_id: default_unit_id(),
            timeout: default_timeout(),
            retries: default_retries(),
            reconnect_initial: default_reconnect_initial(),
            reconnect_max: default_reconnect_max(),
            lifetick: None,
        }
    }
}

/// What is installed: model, firmware and equipment of the boiler.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Device model name, e.g. "KWB CF 2".
    pub model: String,
    /// Declared firmware version, e.g. "22.7.1". An unsupported version is a
    /// configuration error; there is no fallback.
    pub firmware_version: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub equipment: EquipmentCounts,
    #[serde(default = "default_access_level")]
    pub access_level: AccessLevel,
}

impl DeviceConfig {
    pub fn catalog_request(&self) -> CatalogRequest {
        CatalogRequest {
            model: self.model.clone(),
            firmware_version: self.firmware_version.clone(),
            language: self.language.clone(),
            equipment: self.equipment,
            access_level: self.access_level,
        }
    }
}

/// Read-batching tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_block_size")]
    pub max_block_size: u16,
    #[serde(default = "default_gap_tolerance")]
    pub gap_tolerance: u16,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_block_size: default_max_block_size(),
            gap_tolerance: default_gap_tolerance(),
        }
    }
}

/// Top-level configuration for one polled device.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub modbus: ModbusConfig,
    pub device: DeviceConfig,
    #[serde(default = "default_poll_interval", with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Root of the register definition document tree.
    #[serde(default = "default_definitions_dir")]
    pub definitions_dir: PathBuf,
}

fn default_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    19200
}

fn default_unit_id() -> u8 {
    1
}

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_retries() -> u32 {
    2
}

fn default_reconnect_initial() -> Duration {
    Duration::from_secs(1)
}

fn default_reconnect_max() -> Duration {
    Duration::from_secs(60)
}

fn default_lifetick_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_lifetick_failures() -> u32 {
    3
}

fn default_language() -> String {
    "en".to_string()
}

fn default_access_level() -> AccessLevel {
    AccessLevel::User
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_block_size() -> u16 {
    crate::batch::PROTOCOL_MAX_BLOCK
}

fn default_gap_tolerance() -> u16 {
    crate::batch::DEFAULT_GAP_TOLERANCE
}

fn default_definitions_dir() -> PathBuf {
    PathBuf::from("config")
}
