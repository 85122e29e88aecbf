//! DHT node configuration.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use lib_core::{DhtError, Id, KeyPair, NodeInfo};

fn default_port() -> u16 {
    39001
}

fn default_database_uri() -> String {
    lib_storage::IN_MEMORY_URI.to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".boson")
}

fn default_true() -> bool {
    true
}

/// A configured entry point into the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapNode {
    /// Node id, hex encoded.
    pub id: String,
    /// Numeric IP address.
    pub host: String,
    pub port: u16,
}

impl BootstrapNode {
    /// Resolve into a typed [`NodeInfo`]; malformed entries are reported
    /// as protocol errors and skipped by the caller.
    pub fn to_node_info(&self) -> Result<NodeInfo, DhtError> {
        let id: Id = self
            .id
            .parse()
            .map_err(|_| DhtError::Protocol(format!("bad bootstrap id: {}", self.id)))?;
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|_| DhtError::Protocol(format!("bad bootstrap host: {}", self.host)))?;
        Ok(NodeInfo::new(id, SocketAddr::new(ip, self.port)))
    }
}

/// Recognised node options; everything has a sensible default so a bare
/// `[dht]` section runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// IPv4 bind address; `None` disables the IPv4 instance.
    #[serde(default)]
    pub host4: Option<String>,
    /// IPv6 bind address; `None` disables the IPv6 instance.
    #[serde(default)]
    pub host6: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Ed25519 seed, hex or base58; generated fresh when absent.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_database_uri")]
    pub database_uri: String,
    #[serde(default)]
    pub bootstrap_nodes: Vec<BootstrapNode>,
    #[serde(default = "default_true")]
    pub enable_spam_throttling: bool,
    #[serde(default = "default_true")]
    pub enable_suspicious_node_detector: bool,
    #[serde(default)]
    pub enable_metrics: bool,
    /// Accept non-global-unicast peers; local testing only.
    #[serde(default)]
    pub enable_developer_mode: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        DhtConfig {
            host4: Some("0.0.0.0".to_string()),
            host6: None,
            port: default_port(),
            private_key: None,
            data_dir: default_data_dir(),
            database_uri: default_database_uri(),
            bootstrap_nodes: Vec::new(),
            enable_spam_throttling: true,
            enable_suspicious_node_detector: true,
            enable_metrics: false,
            enable_developer_mode: false,
        }
    }
}

impl DhtConfig {
    /// Startup validation; failures here terminate deployment.
    pub fn validate(&self) -> Result<(), DhtError> {
        if self.host4.is_none() && self.host6.is_none() {
            return Err(DhtError::Generic(
                "at least one of host4/host6 must be configured".into(),
            ));
        }
        if self.port == 0 {
            return Err(DhtError::Generic("port must be non-zero".into()));
        }
        for (name, host) in [("host4", &self.host4), ("host6", &self.host6)] {
            if let Some(host) = host {
                let ip: IpAddr = host
                    .parse()
                    .map_err(|_| DhtError::Generic(format!("{} is not an IP address", name)))?;
                match name {
                    "host4" if !ip.is_ipv4() => {
                        return Err(DhtError::Generic("host4 must be IPv4".into()))
                    }
                    "host6" if !ip.is_ipv6() => {
                        return Err(DhtError::Generic("host6 must be IPv6".into()))
                    }
                    _ => {}
                }
            }
        }
        if let Some(key) = &self.private_key {
            KeyPair::from_encoded_private_key(key)?;
        }
        Ok(())
    }

    /// The node keypair: decoded from configuration or freshly generated.
    pub fn keypair(&self) -> Result<KeyPair, DhtError> {
        match &self.private_key {
            Some(text) => KeyPair::from_encoded_private_key(text),
            None => Ok(KeyPair::generate()),
        }
    }

    /// Bind address for the given family, when enabled.
    pub fn bind_addr(&self, ipv4: bool) -> Option<SocketAddr> {
        let host = if ipv4 { &self.host4 } else { &self.host6 };
        let ip: IpAddr = host.as_ref()?.parse().ok()?;
        Some(SocketAddr::new(ip, self.port))
    }

    /// Typed bootstrap contacts for one address family; malformed entries
    /// are logged and skipped.
    pub fn bootstrap_contacts(&self, ipv4: bool) -> Vec<NodeInfo> {
        self.bootstrap_nodes
            .iter()
            .filter_map(|b| match b.to_node_info() {
                Ok(node) if node.is_ipv4() == ipv4 => Some(node),
                Ok(_) => None,
                Err(e) => {
                    warn!(host = %b.host, error = %e, "skipping malformed bootstrap node");
                    None
                }
            })
            .collect()
    }
}
