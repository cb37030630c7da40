//! Settings handed over by the host
use std::{
    net::{IpAddr, Ipv4Addr},
    time::Duration,
};

use crate::{
    error::Result,
    uri::{CoapUri, DEFAULT_PORT},
};

/// All-CoAP-nodes IPv4 multicast group
pub const ALL_COAP_NODES: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);
pub const RESOURCE_PATH: &str = "/oic/res";
pub const RESOURCE_TYPE: &str = "core.light";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub multicast_address: IpAddr,
    pub port: u16,
    pub resource_type: String,
    pub interval_secs: u64,
    pub window_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_address: IpAddr::V4(ALL_COAP_NODES),
            port: DEFAULT_PORT,
            resource_type: String::from(RESOURCE_TYPE),
            interval_secs: 10,
            window_ms: 3000,
        }
    }
}

impl DiscoveryConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// `coap://<group>:<port>/oic/res?rt=<resource type>`
    pub fn target(&self) -> CoapUri {
        CoapUri::new(
            &self.multicast_address.to_string(),
            self.port,
            RESOURCE_PATH,
            Some(&format!("rt={}", self.resource_type)),
        )
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

fn default_refresh_secs() -> u64 {
    5
}

fn default_timeout_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerConfig {
    pub uri: String,
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl HandlerConfig {
    pub fn new(uri: &str) -> Self {
        Self {
            uri: uri.to_string(),
            refresh_secs: default_refresh_secs(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn target(&self) -> Result<CoapUri> {
        self.uri.parse()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_secs.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
