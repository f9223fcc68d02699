//! Lock/key-value store collaborator.
//!
//! Two primitives are needed: string keys with an expiry and a holder token
//! (the lock service builds its mutex on them) and hash tables with field-level access (the
//! dedup index lives in them). A standalone and a clustered backend share the
//! `LockStore` trait; `LockBackend` picks one at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::types::MetaError;

/// Key/value and hash-table operations used by the lock service and the dedup index.
pub trait LockStore: Send + Sync {
    /// Sets `key` to `token` if it is absent or expired. Returns true if this
    /// call set it.
    fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, MetaError>;

    /// True if `key` is set and not expired.
    fn exists(&self, key: &str) -> Result<bool, MetaError>;

    /// Removes `key` if it still carries `token`. Returns true if removed.
    fn delete_if(&self, key: &str, token: &str) -> Result<bool, MetaError>;

    /// Reads one field of a hash table.
    fn hget(&self, table: &str, field: &str) -> Result<Option<String>, MetaError>;

    /// Writes one field of a hash table, creating the table if needed.
    fn hset(&self, table: &str, field: &str, value: &str) -> Result<(), MetaError>;

    /// Removes one field of a hash table.
    fn hdel(&self, table: &str, field: &str) -> Result<(), MetaError>;

    /// Reads a whole hash table. Missing tables are empty.
    fn hgetall(&self, table: &str) -> Result<HashMap<String, String>, MetaError>;

    /// Drops a whole hash table.
    fn hclear(&self, table: &str) -> Result<(), MetaError>;
}

/// Standalone in-process backend.
#[derive(Default)]
pub struct MemoryLockStore {
    keys: DashMap<String, (Instant, String)>,
    tables: DashMap<String, HashMap<String, String>>,
}

impl MemoryLockStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, MetaError> {
        let now = Instant::now();
        match self.keys.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().0 <= now {
                    held.insert((now + ttl, token.to_string()));
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(free) => {
                free.insert((now + ttl, token.to_string()));
                Ok(true)
            }
        }
    }

    fn exists(&self, key: &str) -> Result<bool, MetaError> {
        let now = Instant::now();
        self.keys.remove_if(key, |_, (expiry, _)| *expiry <= now);
        Ok(self.keys.contains_key(key))
    }

    fn delete_if(&self, key: &str, token: &str) -> Result<bool, MetaError> {
        Ok(self.keys.remove_if(key, |_, (_, holder)| holder == token).is_some())
    }

    fn hget(&self, table: &str, field: &str) -> Result<Option<String>, MetaError> {
        Ok(self
            .tables
            .get(table)
            .and_then(|t| t.get(field).cloned()))
    }

    fn hset(&self, table: &str, field: &str, value: &str) -> Result<(), MetaError> {
        self.tables
            .entry(table.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    fn hdel(&self, table: &str, field: &str) -> Result<(), MetaError> {
        if let Some(mut t) = self.tables.get_mut(table) {
            t.remove(field);
        }
        self.tables.remove_if(table, |_, t| t.is_empty());
        Ok(())
    }

    fn hgetall(&self, table: &str) -> Result<HashMap<String, String>, MetaError> {
        Ok(self
            .tables
            .get(table)
            .map(|t| t.clone())
            .unwrap_or_default())
    }

    fn hclear(&self, table: &str) -> Result<(), MetaError> {
        self.tables.remove(table);
        Ok(())
    }
}

/// Clustered backend: keys and tables are routed to one of several
/// independent shards by a stable hash of the key.
pub struct ShardedLockStore {
    shards: Vec<MemoryLockStore>,
}

impl ShardedLockStore {
    /// Creates a store with `shards` shards (at least one).
    pub fn new(shards: usize) -> Self {
        Self {
            shards: (0..shards.max(1)).map(|_| MemoryLockStore::new()).collect(),
        }
    }

    /// Number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index that owns `key`.
    pub fn slot(&self, key: &str) -> usize {
        let digest = blake3::hash(key.as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest.as_bytes()[..8]);
        (u64::from_le_bytes(head) % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &str) -> &MemoryLockStore {
        &self.shards[self.slot(key)]
    }
}

impl LockStore for ShardedLockStore {
    fn set_nx(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, MetaError> {
        self.shard(key).set_nx(key, token, ttl)
    }

    fn exists(&self, key: &str) -> Result<bool, MetaError> {
        self.shard(key).exists(key)
    }

    fn delete_if(&self, key: &str, token: &str) -> Result<bool, MetaError> {
        self.shard(key).delete_if(key, token)
    }

    fn hget(&self, table: &str, field: &str) -> Result<Option<String>, MetaError> {
        self.shard(table).hget(table, field)
    }

    fn hset(&self, table: &str, field: &str, value: &str) -> Result<(), MetaError> {
        self.shard(table).hset(table, field, value)
    }

    fn hdel(&self, table: &str, field: &str) -> Result<(), MetaError> {
        self.shard(table).hdel(table, field)
    }

    fn hgetall(&self, table: &str) -> Result<HashMap<String, String>, MetaError> {
        self.shard(table).hgetall(table)
    }

    fn hclear(&self, table: &str) -> Result<(), MetaError> {
        self.shard(table).hclear(table)
    }
}

/// Which lock-store backend to run with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LockBackend {
    /// Single in-process store.
    #[default]
    Standalone,
    /// Keys spread over several shards.
    Clustered {
        /// Number of shards.
        shards: usize,
    },
}

impl LockBackend {
    /// Builds the configured backend.
    pub fn build(&self) -> Arc<dyn LockStore> {
        match self {
            LockBackend::Standalone => Arc::new(MemoryLockStore::new()),
            LockBackend::Clustered { shards } => Arc::new(ShardedLockStore::new(*shards)),
        }
    }
}
