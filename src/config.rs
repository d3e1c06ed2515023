use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for the wattlog daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Output settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Meter identity and address.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Stream connection behavior.
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Output settings.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Directory that receives one JSON file per aggregate record.
    #[serde(default)]
    pub data_dir: PathBuf,
}

/// Meter identity and address.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    /// Advertised device name. Default: "WATT CHECKER".
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Transport address of the meter.
    #[serde(default)]
    pub address: String,

    /// Stream service port. 0 resolves it through `services`.
    #[serde(default)]
    pub port: u16,

    /// Known stream service ports keyed by address.
    #[serde(default)]
    pub services: HashMap<String, u16>,
}

/// Stream connection behavior.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// Wait between connection attempts. Default: 60s.
    #[serde(default = "default_connect_backoff", with = "humantime_serde")]
    pub connect_backoff: Duration,

    /// Read timeout applied to every established connection. Default: 3s.
    #[serde(default = "default_read_timeout", with = "humantime_serde")]
    pub read_timeout: Duration,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_device_name() -> String {
    "WATT CHECKER".to_string()
}

fn default_connect_backoff() -> Duration {
    Duration::from_secs(60)
}

fn default_read_timeout() -> Duration {
    Duration::from_secs(3)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            general: GeneralConfig::default(),
            device: DeviceConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            address: String::new(),
            port: 0,
            services: HashMap::new(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_backoff: default_connect_backoff(),
            read_timeout: default_read_timeout(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.general.data_dir.as_os_str().is_empty() {
            bail!("general.data_dir is required");
        }

        if self.device.address.is_empty() {
            bail!("device.address is required");
        }

        if self.transport.connect_backoff.is_zero() {
            bail!("transport.connect_backoff must be positive");
        }

        if self.transport.read_timeout.is_zero() {
            bail!("transport.read_timeout must be positive");
        }

        Ok(())
    }
}
