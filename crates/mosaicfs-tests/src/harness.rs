//! Test harness: a manager, a head and a fleet of simulated storage nodes
//! sharing one in-memory document store and lock store.

use std::sync::Arc;

use mosaicfs_head::{Dfs, DfsConfig, FsError};
use mosaicfs_meta::{File, KvStore, LockStore, MemoryKvStore, MemoryLockStore, TreeStore};
use mosaicfs_mgmt::{Cluster, ClusterCoordinator, ManagerConfig, ManagerError};
use mosaicfs_transport::{SimNetwork, SimNode};

/// Errors a harness step can hit.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Path engine failure
    #[error(transparent)]
    Fs(#[from] FsError),
    /// Coordinator failure
    #[error(transparent)]
    Manager(#[from] ManagerError),
    /// Unknown cluster
    #[error("cluster {0} is not registered")]
    NoCluster(String),
}

/// One complete deployment in memory.
pub struct TestEnv {
    net: SimNetwork,
    coordinator: Arc<ClusterCoordinator>,
    dfs: Dfs,
}

impl TestEnv {
    /// A deployment planning chunks of `chunk_size` bytes.
    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self::new(ManagerConfig {
            chunk_size,
            sync_retry_delay_ms: 10,
            ..ManagerConfig::default()
        })
    }

    /// A deployment with the given manager settings.
    pub fn new(config: ManagerConfig) -> Self {
        let net = SimNetwork::new();
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let coordinator = Arc::new(ClusterCoordinator::new(
            kv.clone(),
            locks.clone(),
            Arc::new(net.clone()),
            &config,
        ));
        let tree = TreeStore::new(kv, locks, config.lock.clone());
        let dfs = Dfs::new(
            tree,
            coordinator.clone(),
            Arc::new(net.clone()),
            DfsConfig {
                compensation_attempts: 3,
                compensation_delay_ms: 1,
            },
        );
        Self {
            net,
            coordinator,
            dfs,
        }
    }

    /// The simulated fleet.
    pub fn net(&self) -> &SimNetwork {
        &self.net
    }

    /// The manager's coordinator.
    pub fn coordinator(&self) -> &Arc<ClusterCoordinator> {
        &self.coordinator
    }

    /// The head's path engine.
    pub fn dfs(&self) -> &Dfs {
        &self.dfs
    }

    /// Adds a simulated node.
    pub fn add_node(&self, addr: &str, capacity: u64) -> Arc<SimNode> {
        self.net.add_node(addr, capacity)
    }

    /// Adds nodes of equal capacity and registers them as one cluster.
    pub async fn cluster(&self, addrs: &[&str], capacity: u64) -> Result<Cluster, HarnessError> {
        for addr in addrs {
            self.add_node(addr, capacity);
        }
        let addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        let cluster = self.coordinator.register(&addrs).await?;
        tracing::debug!(cluster = %cluster.id, nodes = addrs.len(), capacity, "test cluster up");
        Ok(cluster)
    }

    /// Current `used` of a cluster.
    pub fn used(&self, cluster_id: &str) -> Result<u64, HarnessError> {
        self.coordinator
            .registry()
            .get(cluster_id)?
            .map(|c| c.used)
            .ok_or_else(|| HarnessError::NoCluster(cluster_id.to_string()))
    }

    /// Writes `data` to `path`, failing if it exists.
    pub async fn write(&self, path: &str, data: &[u8]) -> Result<File, HarnessError> {
        let mut reader = data;
        Ok(self
            .dfs
            .create_file(path, "application/octet-stream", data.len() as u64, &mut reader, false)
            .await?)
    }

    /// Reads a whole file back.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>, HarnessError> {
        let mut out = Vec::new();
        self.dfs.read_file(path, &mut out).await?;
        Ok(out)
    }

    /// Total create payloads received by every node in `addrs`.
    pub fn payloads(&self, addrs: &[&str]) -> u64 {
        addrs
            .iter()
            .filter_map(|a| self.net.node(a))
            .map(|n| n.payloads_received())
            .sum()
    }
}

/// Deterministic, non-repeating test content.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u32).wrapping_mul(31).wrapping_add(seed as u32 * 7 + (i as u32 >> 8)) as u8)
        .collect()
}
