//! Cluster, node and reservation state.
//!
//! Each cluster is one document keyed by its id. Single-cluster transactions
//! take the cluster's key; whole-registry transactions first take the
//! registry key `*`, which single-cluster transactions wait on, then every
//! cluster key.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use mosaicfs_meta::{Document, DocumentSet, KvStore, LockConfig, LockGuard, LockService, LockStore, Txn};

use crate::error::{ManagerError, Result};

const REGISTRY_KEY: &str = "*";

/// A storage node within a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Derived from address and capacity.
    pub id: String,
    /// Network address.
    pub address: String,
    /// True for the cluster's master.
    pub master: bool,
}

impl Node {
    /// A non-master node with its derived id.
    pub fn new(address: &str, capacity: u64) -> Self {
        Self {
            id: node_id(address, capacity),
            address: address.to_string(),
            master: false,
        }
    }
}

/// Deterministic node id, so registering the same node twice is detectable.
pub fn node_id(address: &str, capacity: u64) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(address.as_bytes());
    hasher.update(&capacity.to_le_bytes());
    hasher.finalize().to_hex().as_str()[..16].to_string()
}

/// Provisional capacity held against a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation id, shared across every cluster it touches.
    pub id: String,
    /// Bytes held on this cluster.
    pub size: u64,
}

/// A replica set of nodes sharing one capacity pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    /// Cluster id.
    pub id: String,
    /// Capacity in bytes.
    pub total: u64,
    /// Bytes in use, open reservations included.
    pub used: u64,
    /// Nodes in registration order.
    pub nodes: Vec<Node>,
    /// Open reservations.
    pub reservations: Vec<Reservation>,
    /// Whether the current master has acknowledged its role.
    pub master_announced: bool,
}

impl Document for Cluster {
    const COLLECTION: &'static str = "cluster";

    fn key(&self) -> String {
        self.id.clone()
    }
}

impl Cluster {
    /// A new empty cluster whose first node is master.
    pub fn new(id: &str, total: u64, mut nodes: Vec<Node>) -> Self {
        for (i, node) in nodes.iter_mut().enumerate() {
            node.master = i == 0;
        }
        Self {
            id: id.to_string(),
            total,
            used: 0,
            nodes,
            reservations: Vec::new(),
            master_announced: false,
        }
    }

    /// Bytes still available.
    pub fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Bytes held by open reservations.
    pub fn reserved(&self) -> u64 {
        self.reservations.iter().map(|r| r.size).sum()
    }

    /// The current master.
    pub fn master(&self) -> Option<&Node> {
        self.nodes.iter().find(|n| n.master)
    }

    /// Index of node `id`.
    pub fn position(&self, node_id: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.id == node_id)
    }

    /// Makes node `idx` the only master.
    pub fn promote(&mut self, idx: usize) {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.master = i == idx;
        }
        self.master_announced = false;
    }

    /// Holds `size` more bytes under reservation `id`.
    pub fn reserve(&mut self, id: &str, size: u64) -> Result<()> {
        if size > self.free() {
            return Err(ManagerError::NoSpace { size });
        }
        self.used += size;
        match self.reservations.iter_mut().find(|r| r.id == id) {
            Some(r) => r.size += size,
            None => self.reservations.push(Reservation {
                id: id.to_string(),
                size,
            }),
        }
        Ok(())
    }

    fn take_reservation(&mut self, id: &str) -> Option<Reservation> {
        let idx = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(idx))
    }

    /// Closes reservation `id`, keeping only `consumed` of it in use.
    /// Returns false if this cluster holds no such reservation.
    pub fn commit(&mut self, id: &str, consumed: u64) -> bool {
        match self.take_reservation(id) {
            Some(r) => {
                self.used = self.used - r.size + consumed.min(r.size);
                true
            }
            None => false,
        }
    }

    /// Closes reservation `id`, returning all of it.
    pub fn discard(&mut self, id: &str) -> bool {
        match self.take_reservation(id) {
            Some(r) => {
                self.used -= r.size;
                true
            }
            None => false,
        }
    }
}

/// An open registry transaction.
pub struct RegistryTxn {
    txn: Txn<Cluster>,
    _registry: Option<LockGuard>,
}

impl RegistryTxn {
    /// Every existing cluster in the transaction, in id order.
    pub fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.txn.docs().values().flatten()
    }

    /// Every existing cluster for mutation.
    pub fn clusters_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
        self.txn.docs_mut().values_mut().flatten()
    }

    /// Cluster `id`, if it exists.
    pub fn get(&self, id: &str) -> Option<&Cluster> {
        self.txn.get(id)
    }

    /// Cluster `id` for mutation, if it exists.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut Cluster> {
        self.txn.get_mut(id)
    }

    /// Stages an upsert.
    pub fn put(&mut self, cluster: Cluster) {
        self.txn.put(cluster);
    }

    /// Stages a delete.
    pub fn remove(&mut self, id: &str) -> Option<Cluster> {
        self.txn.remove(id)
    }

    /// Persists every staged change in one batch.
    pub fn commit(self) -> Result<()> {
        self.txn.commit()?;
        Ok(())
    }
}

/// Persisted cluster registry.
#[derive(Clone)]
pub struct Registry {
    clusters: DocumentSet<Cluster>,
}

impl Registry {
    /// Creates a registry over a document store and a lock store.
    pub fn new(kv: Arc<dyn KvStore>, locks: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            clusters: DocumentSet::new(kv, LockService::new(locks, config, "cluster")),
        }
    }

    fn locks(&self) -> &LockService {
        self.clusters.locks()
    }

    /// Every cluster, unlocked, in id order.
    pub fn list(&self) -> Result<Vec<Cluster>> {
        Ok(self.clusters.scan("")?)
    }

    /// Cluster `id`, unlocked.
    pub fn get(&self, id: &str) -> Result<Option<Cluster>> {
        Ok(self.clusters.load(id)?)
    }

    /// Id of the cluster holding node `node_id`.
    pub fn cluster_id_of(&self, node_id: &str) -> Result<Option<String>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|c| c.position(node_id).is_some())
            .map(|c| c.id))
    }

    /// Node id to cluster id for every registered node.
    pub fn node_index(&self) -> Result<HashMap<String, String>> {
        let mut index = HashMap::new();
        for cluster in self.list()? {
            for node in &cluster.nodes {
                index.insert(node.id.clone(), cluster.id.clone());
            }
        }
        Ok(index)
    }

    /// Opens a transaction over the whole registry.
    pub async fn begin_all(&self) -> Result<RegistryTxn> {
        let registry = self.locks().acquire_all([REGISTRY_KEY]).await?;
        let ids: Vec<String> = self.list()?.into_iter().map(|c| c.id).collect();
        let txn = self.clusters.begin(ids).await?;
        Ok(RegistryTxn {
            txn,
            _registry: Some(registry),
        })
    }

    /// Opens a transaction over clusters `ids`.
    pub async fn begin<I, S>(&self, ids: I) -> Result<RegistryTxn>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.locks().await_free(REGISTRY_KEY).await?;
        let txn = self.clusters.begin(ids).await?;
        Ok(RegistryTxn {
            txn,
            _registry: None,
        })
    }

    /// Whole-registry read-modify-write.
    pub async fn save_all<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut RegistryTxn) -> Result<T>,
    {
        let mut txn = self.begin_all().await?;
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Whole-registry read behind the shared barrier.
    pub async fn lock_all<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&[Cluster]) -> Result<T>,
    {
        self.locks().await_free(REGISTRY_KEY).await?;
        let ids: Vec<String> = self.list()?.into_iter().map(|c| c.id).collect();
        let clusters: Vec<Cluster> = self
            .clusters
            .read(ids)
            .await?
            .into_values()
            .flatten()
            .collect();
        f(&clusters)
    }

    /// Single-cluster read-modify-write. Fails `NotFound` if `id` is absent.
    pub async fn save<F, T>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Cluster) -> Result<T>,
    {
        let mut txn = self.begin([id]).await?;
        let cluster = txn
            .get_mut(id)
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {}", id)))?;
        let out = f(cluster)?;
        txn.commit()?;
        Ok(out)
    }

    /// Single-cluster read behind the shared barrier.
    pub async fn lock<F, T>(&self, id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&Cluster) -> Result<T>,
    {
        self.locks().await_free(REGISTRY_KEY).await?;
        let loaded: BTreeMap<String, Option<Cluster>> = self.clusters.read([id]).await?;
        let cluster = loaded
            .get(id)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| ManagerError::NotFound(format!("cluster {}", id)))?;
        f(cluster)
    }
}
