use std::collections::HashMap;

use thiserror::Error;
use tracing::info;

use crate::config::DeviceConfig;
use crate::transport::Endpoint;

/// Errors raised when the meter cannot be located.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("failed to find address of {name}")]
    DeviceNotFound { name: String },

    #[error("failed to find stream service on {address}")]
    ServiceNotFound { address: String },
}

/// Meter discovery trait.
pub trait Discovery: Send + Sync {
    /// Locate the meter and return its transport address.
    fn discover(&self) -> Result<String, DiscoveryError>;

    /// Resolve the stream service port offered at `address`.
    fn resolve_port(&self, address: &str) -> Result<u16, DiscoveryError>;
}

/// Discovery backed by the addresses and service table in the config.
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    name: String,
    address: String,
    port: u16,
    services: HashMap<String, u16>,
}

impl StaticDiscovery {
    /// Create a discovery from the device config section.
    pub fn new(cfg: &DeviceConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            address: cfg.address.clone(),
            port: cfg.port,
            services: cfg.services.clone(),
        }
    }
}

impl Discovery for StaticDiscovery {
    fn discover(&self) -> Result<String, DiscoveryError> {
        if self.address.is_empty() {
            return Err(DiscoveryError::DeviceNotFound {
                name: self.name.clone(),
            });
        }
        Ok(self.address.clone())
    }

    fn resolve_port(&self, address: &str) -> Result<u16, DiscoveryError> {
        if self.port != 0 && address == self.address {
            return Ok(self.port);
        }

        self.services
            .get(address)
            .copied()
            .filter(|&port| port != 0)
            .ok_or_else(|| DiscoveryError::ServiceNotFound {
                address: address.to_string(),
            })
    }
}

/// Discover the meter and resolve its stream endpoint.
pub fn search<D: Discovery + ?Sized>(discovery: &D) -> Result<Endpoint, DiscoveryError> {
    info!("discovering meter...");
    let address = discovery.discover()?;

    info!(%address, "searching stream service...");
    let port = discovery.resolve_port(&address)?;

    Ok(Endpoint::new(address, port))
}
