//! Chunk placement on storage clusters.
//!
//! `ChunkStore::upload` splits a stream along a reservation map, places each
//! chunk from its own task and, if any chunk fails, waits for the rest and
//! drops every reference it created. The same store dereferences persisted
//! chunks on delete, adds shadow references for copies and reads chunks back.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinSet;

use mosaicfs_meta::{ChunkHash, DataChunk};
use mosaicfs_mgmt::{ClusterCoordinator, ManagerError, MapEntry, ReservationMap, Target};
use mosaicfs_transport::node::verify;
use mosaicfs_transport::{NodeClient, NodeError, WriteOutcome};

use crate::config::DfsConfig;
use crate::error::{FsError, Result};

/// One reference a write or copy added to a cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// Cluster holding the content.
    pub cluster_id: String,
    /// The chunk as it will be recorded in the file.
    pub chunk: DataChunk,
    /// True if the payload was transferred, false for a shadow reference.
    pub created: bool,
}

/// Result of a successful upload.
#[derive(Clone, Debug, Default)]
pub struct Upload {
    /// Chunks in sequence order.
    pub chunks: Vec<DataChunk>,
    /// Bytes newly stored per cluster. Shadow references count zero.
    pub used: BTreeMap<String, u64>,
    /// Every reference the upload added, for `revert`.
    pub placements: Vec<Placement>,
}

#[derive(Default)]
struct Ledger {
    placements: Vec<Placement>,
    failure: Option<FsError>,
}

impl Ledger {
    fn record(&mut self, sequence: u32, result: Result<Placement>) {
        match result {
            Ok(p) => self.placements.push(p),
            Err(e) if self.failure.is_none() => self.failure = Some(e),
            Err(e) => tracing::debug!(sequence, error = %e, "further chunk failure"),
        }
    }

    fn failed(&self) -> bool {
        self.failure.is_some()
    }
}

fn lock(ledger: &Mutex<Ledger>) -> MutexGuard<'_, Ledger> {
    ledger.lock().unwrap_or_else(|e| e.into_inner())
}

/// Places, shares, releases and fetches chunks through the coordinator.
#[derive(Clone)]
pub struct ChunkStore {
    coordinator: Arc<ClusterCoordinator>,
    nodes: Arc<dyn NodeClient>,
    config: DfsConfig,
}

impl ChunkStore {
    /// Creates a store over a coordinator and the node client it shares.
    pub fn new(coordinator: Arc<ClusterCoordinator>, nodes: Arc<dyn NodeClient>, config: DfsConfig) -> Self {
        Self {
            coordinator,
            nodes,
            config,
        }
    }

    /// Reads `map`'s chunks from `reader` and places them in parallel.
    ///
    /// On any failure the remaining tasks run to completion, every reference
    /// already added is dropped again, and the first error is returned.
    pub async fn upload<R>(&self, map: &ReservationMap, reader: &mut R) -> Result<Upload>
    where
        R: AsyncRead + Unpin,
    {
        let ledger = Arc::new(Mutex::new(Ledger::default()));
        let mut tasks = JoinSet::new();

        for entry in &map.entries {
            if lock(&ledger).failed() {
                break;
            }
            let len = usize::try_from(entry.size)
                .map_err(|_| FsError::Invalid(format!("chunk of {} bytes", entry.size)))?;
            let mut buf = vec![0u8; len];
            if let Err(e) = reader.read_exact(&mut buf).await {
                lock(&ledger).record(entry.sequence, Err(e.into()));
                break;
            }
            let this = self.clone();
            let entry = entry.clone();
            let ledger = ledger.clone();
            tasks.spawn(async move {
                let result = this.place(&entry, Bytes::from(buf)).await;
                lock(&ledger).record(entry.sequence, result);
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                lock(&ledger).record(u32::MAX, Err(FsError::Task(e.to_string())));
            }
        }

        let Ledger { mut placements, failure } = std::mem::take(&mut *lock(&ledger));
        if let Some(e) = failure {
            tracing::warn!(reservation = %map.id, placed = placements.len(), error = %e, "upload failed, reverting");
            self.revert(&placements).await;
            return Err(e);
        }

        placements.sort_by_key(|p| p.chunk.sequence);
        let mut used = BTreeMap::new();
        for p in placements.iter().filter(|p| p.created) {
            *used.entry(p.cluster_id.clone()).or_insert(0) += p.chunk.size;
        }
        Ok(Upload {
            chunks: placements.iter().map(|p| p.chunk).collect(),
            used,
            placements,
        })
    }

    async fn place(&self, entry: &MapEntry, data: Bytes) -> Result<Placement> {
        let hash = ChunkHash::of(&data);
        let chunk = DataChunk {
            sequence: entry.sequence,
            size: data.len() as u64,
            hash,
        };
        if let Some(cluster_id) = self.shadow_existing(&hash).await? {
            tracing::debug!(sequence = entry.sequence, cluster = %cluster_id, hash = %hash, "dedup hit");
            return Ok(Placement {
                cluster_id,
                chunk,
                created: false,
            });
        }

        let target = match self.coordinator.master_of(&entry.cluster_id).await {
            Ok(target) => target,
            Err(ManagerError::NoAvailableNode) | Err(ManagerError::NotFound(_)) => {
                tracing::warn!(sequence = entry.sequence, cluster = %entry.cluster_id, "planned cluster unavailable, falling back");
                self.coordinator.any_writable(chunk.size).await?
            }
            Err(e) => return Err(e.into()),
        };
        let outcome = {
            let _ticket = self.coordinator.load().track(&target.address);
            self.nodes.create(&target.address, &hash, data).await?
        };
        let placement = Placement {
            cluster_id: target.cluster_id,
            chunk,
            created: outcome == WriteOutcome::Created,
        };
        if let Err(e) = self.coordinator.index(&placement.cluster_id, &hash).await {
            self.revert(std::slice::from_ref(&placement)).await;
            return Err(e.into());
        }
        Ok(placement)
    }

    /// Adds a reference on the cluster the index says holds `hash`.
    /// `None` means the content has to be written.
    async fn shadow_existing(&self, hash: &ChunkHash) -> Result<Option<String>> {
        let holder = match self.coordinator.find(hash, false).await {
            Ok(t) => t.cluster_id,
            Err(ManagerError::NotFound(_)) | Err(ManagerError::NoAvailableNode) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let master = match self.coordinator.master_of(&holder).await {
            Ok(t) => t,
            Err(ManagerError::NoAvailableNode) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.create_shadow(&master, hash).await {
            Ok(()) => Ok(Some(holder)),
            Err(FsError::Node(NodeError::BlobNotFound { .. })) => {
                tracing::debug!(cluster = %holder, hash = %hash, "stale index entry dropped");
                self.coordinator.forget(&holder, hash).await?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn create_shadow(&self, target: &Target, hash: &ChunkHash) -> Result<()> {
        let _ticket = self.coordinator.load().track(&target.address);
        self.nodes.create_shadow(&target.address, hash).await?;
        Ok(())
    }

    /// Adds one shadow reference per chunk on the cluster holding it.
    /// Content is not transferred. On failure the references already added
    /// are dropped again.
    pub async fn share(&self, chunks: &[DataChunk]) -> Result<Vec<Placement>> {
        let mut placements = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let shared = async {
                let holder = self.coordinator.find(&chunk.hash, false).await?;
                let master = self.coordinator.master_of(&holder.cluster_id).await?;
                self.create_shadow(&master, &chunk.hash).await?;
                Ok::<_, FsError>(holder.cluster_id)
            };
            match shared.await {
                Ok(cluster_id) => placements.push(Placement {
                    cluster_id,
                    chunk: *chunk,
                    created: false,
                }),
                Err(e) => {
                    self.revert(&placements).await;
                    return Err(e);
                }
            }
        }
        Ok(placements)
    }

    /// Drops every reference in `placements`, retrying each one. Failures
    /// that outlast the retries are logged and left behind. Content created
    /// by these placements is still under reservation, so removing it frees
    /// no capacity here.
    pub async fn revert(&self, placements: &[Placement]) {
        let created: HashSet<ChunkHash> = placements.iter().filter(|p| p.created).map(|p| p.chunk.hash).collect();
        for p in placements {
            let freed = if created.contains(&p.chunk.hash) { 0 } else { p.chunk.size };
            if let Err(e) = self.drop_ref_retrying(&p.cluster_id, &p.chunk.hash, freed).await {
                tracing::error!(cluster = %p.cluster_id, hash = %p.chunk.hash, error = %e, "chunk left behind");
            }
        }
    }

    /// Drops the reference each persisted chunk holds, returning capacity
    /// for content no longer referenced. Content the index no longer knows
    /// is treated as already gone.
    pub async fn release(&self, chunks: &[DataChunk]) -> Result<()> {
        for chunk in chunks {
            let holder = match self.coordinator.find(&chunk.hash, false).await {
                Ok(t) => t.cluster_id,
                Err(ManagerError::NotFound(_)) => {
                    tracing::debug!(hash = %chunk.hash, "chunk already gone");
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            self.drop_ref_retrying(&holder, &chunk.hash, chunk.size).await?;
        }
        Ok(())
    }

    async fn drop_ref_retrying(&self, cluster_id: &str, hash: &ChunkHash, freed: u64) -> Result<()> {
        let attempts = self.config.compensation_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.drop_ref(cluster_id, hash, freed).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    tracing::warn!(cluster = cluster_id, hash = %hash, attempt, error = %e, "chunk delete failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(self.config.compensation_delay_ms)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn drop_ref(&self, cluster_id: &str, hash: &ChunkHash, freed: u64) -> Result<()> {
        let master = self.coordinator.master_of(cluster_id).await?;
        let removed = {
            let _ticket = self.coordinator.load().track(&master.address);
            match self.nodes.delete(&master.address, hash).await {
                Ok(outcome) => outcome.removed(),
                Err(NodeError::BlobNotFound { .. }) => true,
                Err(e) => return Err(e.into()),
            }
        };
        if removed {
            self.coordinator.forget(cluster_id, hash).await?;
            self.coordinator.release_bytes(cluster_id, freed).await?;
        }
        Ok(())
    }

    /// Reads one chunk from a reachable node of the cluster holding it.
    pub async fn fetch(&self, chunk: &DataChunk) -> Result<Bytes> {
        let target = self.coordinator.find(&chunk.hash, false).await?;
        let data = {
            let _ticket = self.coordinator.load().track(&target.address);
            self.nodes.read(&target.address, &chunk.hash).await?
        };
        verify(&chunk.hash, &data)?;
        if data.len() as u64 != chunk.size {
            return Err(FsError::Invalid(format!(
                "chunk {} is {} bytes, expected {}",
                chunk.sequence,
                data.len(),
                chunk.size
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mosaicfs_meta::{KvStore, LockStore, MemoryKvStore, MemoryLockStore};
    use mosaicfs_mgmt::ManagerConfig;
    use mosaicfs_transport::SimNetwork;

    fn store(net: &SimNetwork, chunk_size: u64) -> ChunkStore {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let config = ManagerConfig {
            chunk_size,
            ..ManagerConfig::default()
        };
        let coordinator = ClusterCoordinator::new(kv, locks, Arc::new(net.clone()), &config);
        let dfs = DfsConfig {
            compensation_attempts: 2,
            compensation_delay_ms: 1,
        };
        ChunkStore::new(Arc::new(coordinator), Arc::new(net.clone()), dfs)
    }

    async fn register(store: &ChunkStore, addrs: &[&str]) -> String {
        let addrs: Vec<String> = addrs.iter().map(|a| a.to_string()).collect();
        store.coordinator.register(&addrs).await.unwrap().id
    }

    #[tokio::test]
    async fn test_upload_orders_chunks_and_counts_usage() {
        let net = SimNetwork::new();
        let node = net.add_node("m", 1024);
        let store = store(&net, 8);
        let cluster = register(&store, &["m"]).await;

        let data = b"0123456789abcdefghij".to_vec();
        let map = store.coordinator.reserve(data.len() as u64).await.unwrap();
        let up = store.upload(&map, &mut data.as_slice()).await.unwrap();

        assert_eq!(up.chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(up.chunks.iter().map(|c| c.size).collect::<Vec<_>>(), vec![8, 8, 4]);
        assert_eq!(up.chunks[0].hash, ChunkHash::of(b"01234567"));
        assert_eq!(up.used.get(&cluster), Some(&20));
        assert_eq!(node.payloads_received(), 3);
        assert_eq!(store.coordinator.dedup().len(&cluster).unwrap(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_chunks_cost_nothing() {
        let net = SimNetwork::new();
        let node = net.add_node("m", 1024);
        let store = store(&net, 4);
        register(&store, &["m"]).await;

        let first = store.coordinator.reserve(4).await.unwrap();
        store.upload(&first, &mut &b"same"[..]).await.unwrap();

        let second = store.coordinator.reserve(4).await.unwrap();
        let up = store.upload(&second, &mut &b"same"[..]).await.unwrap();
        assert!(up.used.is_empty());
        assert!(!up.placements[0].created);
        assert_eq!(node.payloads_received(), 1);
        assert_eq!(node.refs(&ChunkHash::of(b"same")), 2);
    }

    #[tokio::test]
    async fn test_falls_back_when_planned_master_is_down() {
        let net = SimNetwork::new();
        net.add_node("a", 1024);
        net.add_node("b", 1024);
        let store = store(&net, 1024);
        let ca = register(&store, &["a"]).await;
        let cb = register(&store, &["b"]).await;

        let map = store.coordinator.reserve(5).await.unwrap();
        let planned = map.entries[0].clone();
        let (other_cluster, other_addr) = if planned.cluster_id == ca { (cb, "b") } else { (ca, "a") };
        net.node(&planned.address).unwrap().set_down(true);

        let up = store.upload(&map, &mut &b"hello"[..]).await.unwrap();
        assert_eq!(up.placements[0].cluster_id, other_cluster);
        assert_eq!(up.used.get(&other_cluster), Some(&5));
        assert!(net.node(other_addr).unwrap().has(&ChunkHash::of(b"hello")));
    }

    #[tokio::test]
    async fn test_failed_upload_drops_what_it_wrote() {
        let net = SimNetwork::new();
        let node = net.add_node("m", 64);
        let store = store(&net, 8);
        let cluster = register(&store, &["m"]).await;
        // the node is physically fuller than the registry believes
        node.preload(&[7u8; 50]);

        let data = b"abcdefghijklmnopqrst".to_vec();
        let map = store.coordinator.reserve(data.len() as u64).await.unwrap();
        let err = store.upload(&map, &mut data.as_slice()).await.unwrap_err();
        assert!(matches!(err, FsError::Node(NodeError::Refused { .. })));
        assert_eq!(node.blob_count(), 1);
        assert_eq!(store.coordinator.dedup().len(&cluster).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_short_stream_fails() {
        let net = SimNetwork::new();
        let node = net.add_node("m", 1024);
        let store = store(&net, 4);
        register(&store, &["m"]).await;

        let map = store.coordinator.reserve(12).await.unwrap();
        let err = store.upload(&map, &mut &b"only six"[..]).await.unwrap_err();
        assert!(matches!(err, FsError::Io(_)));
        assert_eq!(node.blob_count(), 0);
    }

    #[tokio::test]
    async fn test_share_fetch_and_release() {
        let net = SimNetwork::new();
        let node = net.add_node("m", 1024);
        let store = store(&net, 1024);
        let cluster = register(&store, &["m"]).await;

        let map = store.coordinator.reserve(4).await.unwrap();
        let up = store.upload(&map, &mut &b"data"[..]).await.unwrap();
        let chunk = up.chunks[0];

        let shared = store.share(&up.chunks).await.unwrap();
        assert_eq!(shared[0].cluster_id, cluster);
        assert_eq!(node.refs(&chunk.hash), 2);
        assert_eq!(node.payloads_received(), 1);
        assert_eq!(&store.fetch(&chunk).await.unwrap()[..], b"data");

        store.release(&up.chunks).await.unwrap();
        assert!(node.has(&chunk.hash));
        store.release(&up.chunks).await.unwrap();
        assert!(!node.has(&chunk.hash));
        assert_eq!(store.coordinator.dedup().len(&cluster).unwrap(), 0);
        // already gone
        store.release(&up.chunks).await.unwrap();
    }

    #[tokio::test]
    async fn test_release_returns_capacity_with_last_reference() {
        let net = SimNetwork::new();
        net.add_node("m", 1024);
        let store = store(&net, 1024);
        let cluster = register(&store, &["m"]).await;
        let used = |store: &ChunkStore| store.coordinator.registry().get(&cluster).unwrap().unwrap().used;

        let map = store.coordinator.reserve(4).await.unwrap();
        let up = store.upload(&map, &mut &b"data"[..]).await.unwrap();
        store.coordinator.commit(&map.id, &up.used).await.unwrap();
        store.share(&up.chunks).await.unwrap();
        assert_eq!(used(&store), 4);

        store.release(&up.chunks).await.unwrap();
        assert_eq!(used(&store), 4);
        store.release(&up.chunks).await.unwrap();
        assert_eq!(used(&store), 0);
        store.release(&up.chunks).await.unwrap();
        assert_eq!(used(&store), 0);
    }

    #[tokio::test]
    async fn test_revert_leaves_reserved_bytes_to_discard() {
        let net = SimNetwork::new();
        let node = net.add_node("m", 1024);
        let store = store(&net, 4);
        let cluster = register(&store, &["m"]).await;
        let used = |store: &ChunkStore| store.coordinator.registry().get(&cluster).unwrap().unwrap().used;

        let map = store.coordinator.reserve(8).await.unwrap();
        let up = store.upload(&map, &mut &b"samesame"[..]).await.unwrap();
        assert_eq!(up.used.get(&cluster), Some(&4));
        store.revert(&up.placements).await;
        assert_eq!(node.blob_count(), 0);
        assert_eq!(used(&store), 8);
        store.coordinator.discard(&map.id).await.unwrap();
        assert_eq!(used(&store), 0);
    }

    #[tokio::test]
    async fn test_share_unknown_content_fails() {
        let net = SimNetwork::new();
        net.add_node("m", 1024);
        let store = store(&net, 1024);
        register(&store, &["m"]).await;
        let chunk = DataChunk {
            sequence: 0,
            size: 3,
            hash: ChunkHash::of(b"nope"),
        };
        assert!(matches!(
            store.share(&[chunk]).await,
            Err(FsError::Manager(ManagerError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_release_retries_through_transient_failures() {
        let net = SimNetwork::new();
        let node = net.add_node("m", 1024);
        let store = store(&net, 1024);
        register(&store, &["m"]).await;
        let map = store.coordinator.reserve(4).await.unwrap();
        let up = store.upload(&map, &mut &b"data"[..]).await.unwrap();

        // fails the master ping in the first delete attempt
        let placements = up.placements.clone();
        node.fail_next(1);
        store.revert(&placements).await;
        assert_eq!(node.blob_count(), 0);
    }
}
