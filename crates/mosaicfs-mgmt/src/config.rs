use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

use mosaicfs_meta::{LockBackend, LockConfig};
use mosaicfs_transport::TcpNodeConfig;

/// Default chunk size: 32 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Manager service configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Address the control service listens on.
    pub bind_addr: SocketAddr,
    /// Bytes per planned chunk.
    pub chunk_size: u64,
    /// Lock polling and expiry.
    pub lock: LockConfig,
    /// Lock-store backend.
    pub lock_backend: LockBackend,
    /// Node connect timeout.
    pub node_connect_timeout_ms: u64,
    /// Bound on a whole node request; unbounded if absent.
    pub request_timeout_ms: Option<u64>,
    /// Run a full sync when the manager starts.
    pub sync_on_start: bool,
    /// Delay before retrying a requeued cluster during sync.
    pub sync_retry_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 7600)),
            chunk_size: DEFAULT_CHUNK_SIZE,
            lock: LockConfig::default(),
            lock_backend: LockBackend::default(),
            node_connect_timeout_ms: 5000,
            request_timeout_ms: None,
            sync_on_start: false,
            sync_retry_delay_ms: 1000,
        }
    }
}

impl ManagerConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ManagerConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        if config.chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        Ok(config)
    }

    /// Storage-node client settings.
    pub fn node_client(&self) -> TcpNodeConfig {
        TcpNodeConfig {
            connect_timeout_ms: self.node_connect_timeout_ms,
            request_timeout_ms: self.request_timeout_ms,
            ..TcpNodeConfig::default()
        }
    }
}
