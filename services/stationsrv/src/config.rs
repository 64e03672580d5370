//! stationsrv configuration
//!
//! Built-in defaults, then the YAML file, then `STATIONSRV_` environment
//! variables (`__` separates nested keys, e.g. `STATIONSRV_LOGGING__LEVEL`).

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::connector::RendezvousSettings;
use crate::error::{Result, StationError};
use crate::protocols::modbus::constants::MODBUS_MAX_READ_REGISTERS;
use crate::protocols::modbus::RetryPolicy;
use crate::station::DeviceSettings;

pub const DEFAULT_CONFIG_PATH: &str = "config/stationsrv.yaml";
pub const ENV_PREFIX: &str = "STATIONSRV_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub polling_interval_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "stationsrv".to_string(),
            polling_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 6000,
            response_timeout_ms: 2000,
            max_attempts: 3,
            base_backoff_ms: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    pub ttl_ms: u64,
    pub max_registers_per_read: u16,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 1000,
            max_registers_per_read: 124,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    pub enabled: bool,
    pub bind: String,
    pub greeting_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "0.0.0.0:9502".to_string(),
            greeting_timeout_ms: 2000,
            handshake_timeout_ms: 5000,
        }
    }
}

impl RendezvousConfig {
    pub fn settings(&self) -> RendezvousSettings {
        RendezvousSettings {
            greeting_timeout: Duration::from_millis(self.greeting_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,
    /// `host:port` or a hardware address for rendezvous
    pub address: String,
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,
    /// Overrides `service.polling_interval_ms`
    #[serde(default)]
    pub polling_interval_ms: Option<u64>,
}

fn default_slave_id() -> u8 {
    1
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StationsrvConfig {
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
    pub transport: TransportConfig,
    pub realtime: RealtimeConfig,
    pub rendezvous: RendezvousConfig,
    pub devices: Vec<DeviceConfig>,
}

impl StationsrvConfig {
    /// Load from `path` (missing file is fine) plus the environment
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::figment(path.as_ref()).extract().map_err(StationError::from)
    }

    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.polling_interval_ms == 0 {
            return Err(StationError::config("service.polling_interval_ms must be > 0"));
        }
        if self.transport.max_attempts == 0 {
            return Err(StationError::config("transport.max_attempts must be > 0"));
        }
        let max = self.realtime.max_registers_per_read;
        if max == 0 || max > MODBUS_MAX_READ_REGISTERS {
            return Err(StationError::config(format!(
                "realtime.max_registers_per_read must be within 1..={MODBUS_MAX_READ_REGISTERS}, got {max}"
            )));
        }

        let mut names = HashSet::new();
        for device in &self.devices {
            if device.name.trim().is_empty() {
                return Err(StationError::config("Device name cannot be empty"));
            }
            if !names.insert(device.name.as_str()) {
                return Err(StationError::config(format!(
                    "Duplicate device name '{}'",
                    device.name
                )));
            }
            if device.polling_interval_ms == Some(0) {
                return Err(StationError::config(format!(
                    "Device '{}': polling_interval_ms must be > 0",
                    device.name
                )));
            }
            if device.address.trim().is_empty() {
                return Err(StationError::config(format!(
                    "Device '{}': address cannot be empty",
                    device.name
                )));
            }
        }
        Ok(())
    }

    pub fn device_settings(&self) -> DeviceSettings {
        DeviceSettings {
            connect_timeout: Duration::from_millis(self.transport.connect_timeout_ms),
            response_timeout: Duration::from_millis(self.transport.response_timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.transport.max_attempts,
                base_backoff: Duration::from_millis(self.transport.base_backoff_ms),
            },
            realtime_ttl: Duration::from_millis(self.realtime.ttl_ms),
            max_registers_per_read: self.realtime.max_registers_per_read,
        }
    }

    pub fn polling_interval(&self, device: &DeviceConfig) -> Duration {
        Duration::from_millis(
            device
                .polling_interval_ms
                .unwrap_or(self.service.polling_interval_ms),
        )
    }
}
