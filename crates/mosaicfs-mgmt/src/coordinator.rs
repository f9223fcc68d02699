//! Cluster coordinator.
//!
//! Registers nodes into clusters, keeps exactly one master per cluster,
//! accounts capacity through reservations, answers content lookups from the
//! dedup index, and resynchronizes slaves from their master.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use mosaicfs_meta::{ChunkHash, KvStore, LockStore};
use mosaicfs_transport::NodeClient;

use crate::config::ManagerConfig;
use crate::dedup::DedupIndex;
use crate::error::{ManagerError, Result};
use crate::load::LoadTracker;
use crate::registry::{Cluster, Node, Registry};

/// One planned chunk of a reservation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapEntry {
    /// Position of the chunk in the stream.
    pub sequence: u32,
    /// Bytes in the chunk.
    pub size: u64,
    /// Cluster the chunk is planned on.
    pub cluster_id: String,
    /// Master of that cluster at planning time.
    pub address: String,
}

/// The placement plan returned by `reserve`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationMap {
    /// Reservation id to commit or discard.
    pub id: String,
    /// Bytes reserved.
    pub size: u64,
    /// Chunks in sequence order.
    pub entries: Vec<MapEntry>,
}

impl ReservationMap {
    /// Reserved bytes per cluster.
    pub fn per_cluster(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for e in &self.entries {
            *out.entry(e.cluster_id.clone()).or_insert(0) += e.size;
        }
        out
    }
}

/// A cluster and the node chosen to serve it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Cluster id.
    pub cluster_id: String,
    /// Node address.
    pub address: String,
}

/// Listing entry for the `clusters` action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Cluster id.
    pub id: String,
    /// Capacity in bytes.
    pub total: u64,
    /// Bytes in use, open reservations included.
    pub used: u64,
    /// Bytes available.
    pub free: u64,
    /// Bytes held by open reservations.
    pub reserved: u64,
    /// Nodes in registration order.
    pub nodes: Vec<Node>,
    /// Hashes in the dedup index.
    pub indexed: usize,
}

/// Outcome of a sync run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Clusters synced, in completion order.
    pub synced: Vec<String>,
    /// Failed attempts that were requeued.
    pub requeued: usize,
}

/// Splits `size` into chunks of at most `chunk_size` bytes.
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<u64> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut left = size;
    while left > 0 {
        let n = left.min(chunk_size);
        chunks.push(n);
        left -= n;
    }
    chunks
}

fn validate_addresses(addresses: &[String]) -> Result<Vec<String>> {
    if addresses.is_empty() {
        return Err(ManagerError::Invalid("no node addresses given".into()));
    }
    let mut seen = HashSet::new();
    for addr in addresses {
        if addr.is_empty() {
            return Err(ManagerError::Invalid("empty node address".into()));
        }
        if !seen.insert(addr.as_str()) {
            return Err(ManagerError::Invalid(format!("node {} listed twice", addr)));
        }
    }
    Ok(addresses.to_vec())
}

fn ensure_unregistered<'a, I>(clusters: I, nodes: &[Node]) -> Result<()>
where
    I: IntoIterator<Item = &'a Cluster>,
{
    for cluster in clusters {
        for node in nodes {
            if cluster.position(&node.id).is_some() {
                return Err(ManagerError::Registered {
                    node: node.address.clone(),
                    cluster: cluster.id.clone(),
                });
            }
        }
    }
    Ok(())
}

/// The manager's coordination engine.
#[derive(Clone)]
pub struct ClusterCoordinator {
    registry: Registry,
    dedup: DedupIndex,
    nodes: Arc<dyn NodeClient>,
    load: LoadTracker,
    chunk_size: u64,
    sync_retry_delay: Duration,
}

impl ClusterCoordinator {
    /// Creates a coordinator over the given stores and node client.
    pub fn new(
        kv: Arc<dyn KvStore>,
        locks: Arc<dyn LockStore>,
        nodes: Arc<dyn NodeClient>,
        config: &ManagerConfig,
    ) -> Self {
        Self {
            registry: Registry::new(kv, locks.clone(), config.lock.clone()),
            dedup: DedupIndex::new(locks, config.lock.clone()),
            nodes,
            load: LoadTracker::new(),
            chunk_size: config.chunk_size.max(1),
            sync_retry_delay: Duration::from_millis(config.sync_retry_delay_ms),
        }
    }

    /// The cluster registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The dedup index.
    pub fn dedup(&self) -> &DedupIndex {
        &self.dedup
    }

    /// Per-node in-flight counters.
    pub fn load(&self) -> &LoadTracker {
        &self.load
    }

    /// Bytes per planned chunk.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    async fn capacity_of(&self, addr: &str) -> Result<u64> {
        let _ticket = self.load.track(addr);
        self.nodes.ping(addr).await?;
        Ok(self.nodes.size(addr).await?)
    }

    async fn join(&self, addr: &str, master: &str) -> Result<()> {
        let _ticket = self.load.track(addr);
        self.nodes.join(addr, master).await?;
        Ok(())
    }

    /// Creates a cluster from `addresses`. The first node becomes master.
    pub async fn register(&self, addresses: &[String]) -> Result<Cluster> {
        let addresses = validate_addresses(addresses)?;
        let mut capacity = None;
        for addr in &addresses {
            let size = self.capacity_of(addr).await?;
            match capacity {
                Some(expected) if expected != size => {
                    return Err(ManagerError::Invalid(format!(
                        "node {} reports {} bytes, expected {}",
                        addr, size, expected
                    )))
                }
                _ => capacity = Some(size),
            }
        }
        let capacity = capacity.unwrap_or_default();
        let nodes: Vec<Node> = addresses.iter().map(|a| Node::new(a, capacity)).collect();
        ensure_unregistered(&self.registry.list()?, &nodes)?;

        let id = uuid::Uuid::new_v4().to_string();
        let mut cluster = Cluster::new(&id, capacity, nodes);
        let master = addresses[0].clone();
        self.join(&master, "").await?;
        for slave in &addresses[1..] {
            self.join(slave, &master).await?;
        }
        cluster.master_announced = true;

        let staged = cluster.clone();
        self.registry
            .save_all(move |txn| {
                ensure_unregistered(txn.clusters(), &staged.nodes)?;
                txn.put(staged);
                Ok(())
            })
            .await?;
        tracing::info!(cluster = %id, master = %master, nodes = cluster.nodes.len(), capacity, "cluster registered");
        Ok(cluster)
    }

    /// Adds `addresses` to cluster `cluster_id` as slaves of its master.
    pub async fn register_nodes_to(&self, cluster_id: &str, addresses: &[String]) -> Result<Cluster> {
        let addresses = validate_addresses(addresses)?;
        let mut txn = self.registry.begin([cluster_id]).await?;
        let mut cluster = txn
            .get(cluster_id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {}", cluster_id)))?;
        let master = cluster
            .master()
            .map(|n| n.address.clone())
            .ok_or_else(|| ManagerError::NotFound(format!("master of cluster {}", cluster_id)))?;

        for addr in &addresses {
            let size = self.capacity_of(addr).await?;
            if size != cluster.total {
                return Err(ManagerError::Invalid(format!(
                    "node {} reports {} bytes, cluster {} has {}",
                    addr, size, cluster_id, cluster.total
                )));
            }
        }
        let nodes: Vec<Node> = addresses.iter().map(|a| Node::new(a, cluster.total)).collect();
        ensure_unregistered(&self.registry.list()?, &nodes)?;
        for node in &nodes {
            self.join(&node.address, &master).await?;
        }
        cluster.nodes.extend(nodes);
        txn.put(cluster.clone());
        txn.commit()?;
        tracing::info!(cluster = cluster_id, added = addresses.len(), "nodes registered");
        Ok(cluster)
    }

    /// Removes cluster `id` or, failing that, node `id`.
    pub async fn unregister(&self, id: &str) -> Result<()> {
        if self.registry.get(id)?.is_some() {
            self.unregister_cluster(id).await
        } else {
            self.unregister_node(id).await.map(|_| ())
        }
    }

    /// Wipes the cluster's index, erases its nodes and drops its record.
    pub async fn unregister_cluster(&self, id: &str) -> Result<()> {
        let mut txn = self.registry.begin([id]).await?;
        let cluster = txn
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {}", id)))?;
        self.dedup.clear(id).await?;
        for node in &cluster.nodes {
            let _ticket = self.load.track(&node.address);
            if let Err(e) = self.nodes.erase(&node.address).await {
                tracing::warn!(cluster = id, node = %node.address, error = %e, "erase failed");
            }
        }
        txn.remove(id);
        txn.commit()?;
        tracing::info!(cluster = id, "cluster unregistered");
        Ok(())
    }

    /// Removes node `node_id`, promoting a new master if needed.
    pub async fn unregister_node(&self, node_id: &str) -> Result<Cluster> {
        let cluster_id = self
            .registry
            .cluster_id_of(node_id)?
            .ok_or_else(|| ManagerError::NotFound(format!("node {}", node_id)))?;
        let mut txn = self.registry.begin([&cluster_id]).await?;
        let mut cluster = txn
            .get(&cluster_id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {}", cluster_id)))?;
        let idx = cluster
            .position(node_id)
            .ok_or_else(|| ManagerError::NotFound(format!("node {}", node_id)))?;
        if cluster.nodes.len() == 1 {
            return Err(ManagerError::LastNode(node_id.to_string()));
        }

        let removed = cluster.nodes.remove(idx);
        if removed.master {
            cluster.promote(0);
            let master = cluster.nodes[0].address.clone();
            tracing::info!(cluster = %cluster_id, master = %master, "master promoted");
            match self.join(&master, "").await {
                Ok(()) => cluster.master_announced = true,
                Err(e) => {
                    tracing::warn!(cluster = %cluster_id, master = %master, error = %e, "master not notified")
                }
            }
            for slave in &cluster.nodes[1..] {
                if let Err(e) = self.join(&slave.address, &master).await {
                    tracing::warn!(cluster = %cluster_id, node = %slave.address, error = %e, "slave not repointed");
                }
            }
        }
        txn.put(cluster.clone());
        txn.commit()?;
        tracing::info!(cluster = %cluster_id, node = %removed.address, "node unregistered");
        Ok(cluster)
    }

    /// Plans `size` bytes onto clusters and holds the capacity.
    pub async fn reserve(&self, size: u64) -> Result<ReservationMap> {
        let free = self
            .registry
            .lock_all(|clusters| Ok(clusters.iter().map(Cluster::free).fold(0u64, u64::saturating_add)))
            .await?;
        if size > free {
            return Err(ManagerError::NoSpace { size });
        }
        let chunks = plan_chunks(size, self.chunk_size);
        let id = uuid::Uuid::new_v4().to_string();
        let (map, unannounced) = self
            .registry
            .save_all(|txn| {
                let mut pending: BTreeMap<String, u64> = BTreeMap::new();
                let mut entries = Vec::with_capacity(chunks.len());
                for (seq, chunk) in chunks.iter().enumerate() {
                    let sequence = u32::try_from(seq)
                        .map_err(|_| ManagerError::Invalid(format!("{} bytes need more than {} chunks", size, u32::MAX)))?;
                    let (cluster_id, address) = txn
                        .clusters()
                        .find_map(|c| {
                            let held = pending.get(&c.id).copied().unwrap_or(0);
                            let master = c.master()?;
                            (c.free() >= held + chunk).then(|| (c.id.clone(), master.address.clone()))
                        })
                        .ok_or(ManagerError::NoSpace { size })?;
                    *pending.entry(cluster_id.clone()).or_insert(0) += chunk;
                    entries.push(MapEntry {
                        sequence,
                        size: *chunk,
                        cluster_id,
                        address,
                    });
                }
                let mut unannounced = Vec::new();
                for (cluster_id, bytes) in &pending {
                    let cluster = txn
                        .get_mut(cluster_id)
                        .ok_or_else(|| ManagerError::NotFound(format!("cluster {}", cluster_id)))?;
                    cluster.reserve(&id, *bytes)?;
                    if !cluster.master_announced {
                        unannounced.push(cluster_id.clone());
                    }
                }
                Ok((
                    ReservationMap {
                        id: id.clone(),
                        size,
                        entries,
                    },
                    unannounced,
                ))
            })
            .await?;

        if !unannounced.is_empty() {
            let this = self.clone();
            tokio::spawn(async move { this.announce_masters(unannounced).await });
        }
        tracing::debug!(reservation = %map.id, size, chunks = map.entries.len(), "reserved");
        Ok(map)
    }

    async fn announce_masters(&self, cluster_ids: Vec<String>) {
        for id in cluster_ids {
            let master = match self.registry.get(&id) {
                Ok(Some(c)) => c.master().map(|m| m.address.clone()),
                _ => None,
            };
            let Some(master) = master else { continue };
            if let Err(e) = self.join(&master, "").await {
                tracing::warn!(cluster = %id, master = %master, error = %e, "master announcement failed");
                continue;
            }
            let marked = self
                .registry
                .save(&id, |c| {
                    if c.master().map(|m| m.address == master).unwrap_or(false) {
                        c.master_announced = true;
                    }
                    Ok(())
                })
                .await;
            if let Err(e) = marked {
                tracing::warn!(cluster = %id, error = %e, "master announcement not recorded");
            }
        }
    }

    /// Closes reservation `id`, keeping `used[cluster]` bytes on each cluster.
    pub async fn commit(&self, id: &str, used: &BTreeMap<String, u64>) -> Result<()> {
        self.registry
            .save_all(|txn| {
                let mut found = false;
                for cluster in txn.clusters_mut() {
                    let consumed = used.get(&cluster.id).copied().unwrap_or(0);
                    if cluster.commit(id, consumed) {
                        found = true;
                    } else if consumed > 0 {
                        cluster.used = (cluster.used + consumed).min(cluster.total);
                    }
                }
                if !found {
                    return Err(ManagerError::NotFound(format!("reservation {}", id)));
                }
                Ok(())
            })
            .await?;
        tracing::debug!(reservation = id, "reservation committed");
        Ok(())
    }

    /// Returns `bytes` of deleted content to cluster `cluster_id`. Bytes held
    /// by open reservations are never released here.
    pub async fn release_bytes(&self, cluster_id: &str, bytes: u64) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }
        let used = self
            .registry
            .save(cluster_id, |c| {
                c.used = c.used.saturating_sub(bytes).max(c.reserved());
                Ok(c.used)
            })
            .await?;
        tracing::debug!(cluster = cluster_id, bytes, used, "capacity released");
        Ok(())
    }

    /// Releases reservation `id` on every cluster.
    pub async fn discard(&self, id: &str) -> Result<()> {
        self.registry
            .save_all(|txn| {
                let mut found = false;
                for cluster in txn.clusters_mut() {
                    found |= cluster.discard(id);
                }
                if !found {
                    return Err(ManagerError::NotFound(format!("reservation {}", id)));
                }
                Ok(())
            })
            .await?;
        tracing::debug!(reservation = id, "reservation discarded");
        Ok(())
    }

    /// The reachable node of `cluster` with the fewest requests in flight.
    async fn responsive_node(&self, cluster: &Cluster) -> Option<Node> {
        let checks = cluster.nodes.iter().map(|n| async move {
            let _ticket = self.load.track(&n.address);
            self.nodes.ping(&n.address).await.is_ok()
        });
        let alive = join_all(checks).await;
        cluster
            .nodes
            .iter()
            .zip(alive)
            .filter(|(_, ok)| *ok)
            .map(|(n, _)| n)
            .min_by_key(|n| self.load.load(&n.address))
            .cloned()
    }

    /// One target per cluster that has a reachable node, in cluster order.
    pub async fn available(&self) -> Result<Vec<Target>> {
        let clusters = self.registry.lock_all(|c| Ok(c.to_vec())).await?;
        let mut targets = Vec::new();
        for cluster in &clusters {
            if let Some(node) = self.responsive_node(cluster).await {
                targets.push(Target {
                    cluster_id: cluster.id.clone(),
                    address: node.address,
                });
            }
        }
        Ok(targets)
    }

    async fn reachable_master(&self, cluster: &Cluster) -> Option<Node> {
        let master = cluster.master()?;
        let _ticket = self.load.track(&master.address);
        self.nodes.ping(&master.address).await.ok()?;
        Some(master.clone())
    }

    /// The master of `cluster_id`, if it answers. Blobs are created and
    /// dereferenced on masters only; slaves copy from them on sync.
    pub async fn master_of(&self, cluster_id: &str) -> Result<Target> {
        let cluster = self.registry.lock(cluster_id, |c| Ok(c.clone())).await?;
        let master = self
            .reachable_master(&cluster)
            .await
            .ok_or(ManagerError::NoAvailableNode)?;
        Ok(Target {
            cluster_id: cluster.id,
            address: master.address,
        })
    }

    /// The first cluster whose master answers and that has room for `size`
    /// more bytes.
    pub async fn any_writable(&self, size: u64) -> Result<Target> {
        let clusters = self.registry.lock_all(|c| Ok(c.to_vec())).await?;
        for cluster in clusters.iter().filter(|c| c.free() >= size) {
            if let Some(master) = self.reachable_master(cluster).await {
                return Ok(Target {
                    cluster_id: cluster.id.clone(),
                    address: master.address,
                });
            }
        }
        Err(ManagerError::NoAvailableNode)
    }

    /// A reachable node of cluster `cluster_id`.
    pub async fn responsive(&self, cluster_id: &str) -> Result<Target> {
        let cluster = self.registry.lock(cluster_id, |c| Ok(c.clone())).await?;
        let node = self
            .responsive_node(&cluster)
            .await
            .ok_or(ManagerError::NoAvailableNode)?;
        Ok(Target {
            cluster_id: cluster.id,
            address: node.address,
        })
    }

    async fn locate(&self, targets: &[Target], hash: &ChunkHash, remove: bool) -> Result<Target> {
        if targets.is_empty() {
            return Err(ManagerError::NoAvailableNode);
        }
        let ids: Vec<&str> = targets.iter().map(|t| t.cluster_id.as_str()).collect();
        let holder = self.dedup.find(&ids, hash).await?;
        if remove {
            self.dedup.remove(&holder, hash).await?;
        }
        targets
            .iter()
            .find(|t| t.cluster_id == holder)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(format!("content {}", hash)))
    }

    /// Finds a reachable node of the first cluster holding `hash`.
    pub async fn find(&self, hash: &ChunkHash, remove: bool) -> Result<Target> {
        let targets = self.available().await?;
        self.locate(&targets, hash, remove).await
    }

    /// `find` for every hash, probing node liveness once.
    pub async fn map(&self, hashes: &[ChunkHash], remove: bool) -> Result<Vec<Target>> {
        let targets = self.available().await?;
        let mut out = Vec::with_capacity(hashes.len());
        for hash in hashes {
            out.push(self.locate(&targets, hash, remove).await?);
        }
        Ok(out)
    }

    /// Records that `cluster_id` holds `hash`.
    pub async fn index(&self, cluster_id: &str, hash: &ChunkHash) -> Result<()> {
        self.dedup.add(cluster_id, hash).await
    }

    /// Forgets that `cluster_id` holds `hash`.
    pub async fn forget(&self, cluster_id: &str, hash: &ChunkHash) -> Result<()> {
        self.dedup.remove(cluster_id, hash).await
    }

    /// Lists every cluster.
    pub async fn clusters(&self) -> Result<Vec<ClusterInfo>> {
        let clusters = self.registry.lock_all(|c| Ok(c.to_vec())).await?;
        let mut out = Vec::with_capacity(clusters.len());
        for c in clusters {
            out.push(ClusterInfo {
                indexed: self.dedup.len(&c.id)?,
                free: c.free(),
                reserved: c.reserved(),
                id: c.id,
                total: c.total,
                used: c.used,
                nodes: c.nodes,
            });
        }
        Ok(out)
    }

    /// Syncs every cluster. A failing cluster is requeued until it succeeds.
    pub async fn sync_clusters(&self) -> Result<SyncReport> {
        let ids = self.registry.list()?.into_iter().map(|c| c.id).collect();
        Ok(self.sync_queue(ids).await)
    }

    /// Syncs one cluster, retrying until it succeeds.
    pub async fn sync_cluster(&self, id: &str) -> Result<SyncReport> {
        if self.registry.get(id)?.is_none() {
            return Err(ManagerError::NotFound(format!("cluster {}", id)));
        }
        Ok(self.sync_queue(vec![id.to_string()]).await)
    }

    // No retry cap: a cluster that never recovers keeps the loop running.
    async fn sync_queue(&self, ids: Vec<String>) -> SyncReport {
        let mut queue: VecDeque<String> = ids.into();
        let mut report = SyncReport::default();
        while let Some(id) = queue.pop_front() {
            match self.sync_one(&id).await {
                Ok(()) => report.synced.push(id),
                Err(ManagerError::NotFound(what)) => {
                    tracing::debug!(cluster = %id, missing = %what, "cluster gone, not synced");
                }
                Err(e) => {
                    tracing::warn!(cluster = %id, error = %e, "sync failed, requeued");
                    report.requeued += 1;
                    queue.push_back(id);
                    tokio::time::sleep(self.sync_retry_delay).await;
                }
            }
        }
        tracing::info!(synced = report.synced.len(), requeued = report.requeued, "sync finished");
        report
    }

    async fn sync_one(&self, id: &str) -> Result<()> {
        let cluster = self.registry.lock(id, |c| Ok(c.clone())).await?;
        let master = cluster
            .master()
            .cloned()
            .ok_or_else(|| ManagerError::Invalid(format!("cluster {} has no master", id)))?;
        self.join(&master.address, "").await?;
        let catalog = {
            let _ticket = self.load.track(&master.address);
            self.nodes.catalog(&master.address).await?
        };

        let lost = self.dedup.compare(id, &catalog).await?;
        if lost > 0 {
            tracing::warn!(cluster = id, lost, "indexed content missing from master");
        }
        self.dedup.replace(id, &catalog).await?;

        let master_addr = master.address.as_str();
        let slaves = cluster.nodes.iter().filter(|n| !n.master);
        let results = join_all(slaves.map(|s| async move {
            (s, self.resync_slave(&s.address, master_addr).await)
        }))
        .await;
        for (slave, res) in results {
            if let Err(e) = res {
                tracing::warn!(cluster = id, node = %slave.address, error = %e, "slave resync failed");
            }
        }

        self.registry
            .save(id, |c| {
                if c.master().map(|m| m.id == master.id).unwrap_or(false) {
                    c.master_announced = true;
                }
                Ok(())
            })
            .await?;
        tracing::info!(cluster = id, hashes = catalog.len(), "cluster synced");
        Ok(())
    }

    async fn resync_slave(&self, slave: &str, master: &str) -> Result<()> {
        self.join(slave, master).await?;
        let _ticket = self.load.track(slave);
        self.nodes.resync(slave, master).await?;
        Ok(())
    }
}
