//! Per-cluster content index.
//!
//! Each cluster owns one hash table in the lock store, mapping the hex
//! content hash to the cluster id. Point writes only wait for the cluster key
//! to be free; bulk replace and compare hold it. The index is a cache of what
//! the cluster's master holds, rebuilt wholesale on sync.

use std::collections::HashSet;
use std::sync::Arc;

use mosaicfs_meta::{ChunkHash, LockConfig, LockService, LockStore, MetaError};

use crate::error::{ManagerError, Result};

/// Hash to cluster-id tables, one per cluster.
#[derive(Clone)]
pub struct DedupIndex {
    locks: LockService,
}

fn table(cluster_id: &str) -> String {
    format!("dedup:{}", cluster_id)
}

impl DedupIndex {
    /// Creates an index over a lock store.
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            locks: LockService::new(store, config, "dedup"),
        }
    }

    fn store(&self) -> &dyn LockStore {
        self.locks.store().as_ref()
    }

    /// Records that `cluster_id` holds `hash`.
    pub async fn add(&self, cluster_id: &str, hash: &ChunkHash) -> Result<()> {
        self.locks.await_free(cluster_id).await?;
        self.store()
            .hset(&table(cluster_id), &hash.to_hex(), cluster_id)?;
        Ok(())
    }

    /// Forgets that `cluster_id` holds `hash`.
    pub async fn remove(&self, cluster_id: &str, hash: &ChunkHash) -> Result<()> {
        self.locks.await_free(cluster_id).await?;
        self.store().hdel(&table(cluster_id), &hash.to_hex())?;
        Ok(())
    }

    /// Searches `cluster_ids` in order and returns the first cluster holding
    /// `hash`.
    pub async fn find<S: AsRef<str>>(&self, cluster_ids: &[S], hash: &ChunkHash) -> Result<String> {
        let field = hash.to_hex();
        for id in cluster_ids {
            let id = id.as_ref();
            self.locks.await_free(id).await?;
            if let Some(holder) = self.store().hget(&table(id), &field)? {
                return Ok(holder);
            }
        }
        Err(ManagerError::NotFound(format!("content {}", field)))
    }

    /// Replaces the whole table of `cluster_id` with `hashes`.
    pub async fn replace(&self, cluster_id: &str, hashes: &[ChunkHash]) -> Result<()> {
        let guard = self.locks.acquire_all([cluster_id]).await?;
        let name = table(cluster_id);
        self.store().hclear(&name)?;
        for hash in hashes {
            self.store().hset(&name, &hash.to_hex(), cluster_id)?;
        }
        guard.release()?;
        tracing::debug!(cluster = cluster_id, entries = hashes.len(), "dedup index replaced");
        Ok(())
    }

    /// Number of indexed hashes of `cluster_id` missing from `hashes`.
    pub async fn compare(&self, cluster_id: &str, hashes: &[ChunkHash]) -> Result<usize> {
        let guard = self.locks.acquire_all([cluster_id]).await?;
        let current = self.store().hgetall(&table(cluster_id))?;
        guard.release()?;
        let fresh: HashSet<String> = hashes.iter().map(|h| h.to_hex()).collect();
        Ok(current.keys().filter(|k| !fresh.contains(*k)).count())
    }

    /// Drops the whole table of `cluster_id`.
    pub async fn clear(&self, cluster_id: &str) -> Result<()> {
        let guard = self.locks.acquire_all([cluster_id]).await?;
        self.store().hclear(&table(cluster_id))?;
        guard.release()?;
        Ok(())
    }

    /// Number of hashes indexed for `cluster_id`.
    pub fn len(&self, cluster_id: &str) -> std::result::Result<usize, MetaError> {
        Ok(self.store().hgetall(&table(cluster_id))?.len())
    }
}
