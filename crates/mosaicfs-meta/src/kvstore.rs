//! Document store collaborator.
//!
//! Folder and cluster records are stored one document per key, with the
//! collection encoded as a key prefix (`folder/<path>`, `cluster/<id>`).
//! The store only needs point lookups, prefix range scans and an atomic
//! multi-document batch; `MemoryKvStore` provides all three in-process.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::types::MetaError;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Document store trait.
///
/// Implementations must apply `write_batch` atomically: readers observe
/// either none or all of the batch.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, MetaError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), MetaError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), MetaError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, MetaError>;

    /// Atomically write a batch of operations (puts and deletes).
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError>;
}

/// A single operation in a write batch.
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Serializes a document with bincode.
pub fn encode<T: Serialize>(doc: &T) -> Result<Value, MetaError> {
    bincode::serialize(doc).map_err(|e| MetaError::KvError(e.to_string()))
}

/// Deserializes a document with bincode.
pub fn decode<T: DeserializeOwned>(raw: &[u8]) -> Result<T, MetaError> {
    bincode::deserialize(raw).map_err(|e| MetaError::KvError(e.to_string()))
}

/// Loads and decodes a single document.
pub fn get_doc<T: DeserializeOwned>(kv: &dyn KvStore, key: &[u8]) -> Result<Option<T>, MetaError> {
    kv.get(key)?.map(|raw| decode(&raw)).transpose()
}

/// Loads and decodes every document under a prefix, in key order.
pub fn scan_docs<T: DeserializeOwned>(kv: &dyn KvStore, prefix: &[u8]) -> Result<Vec<T>, MetaError> {
    kv.scan_prefix(prefix)?
        .into_iter()
        .map(|(_key, value)| decode(&value))
        .collect()
}

/// In-memory document store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Does not persist data across restarts.
#[derive(Clone)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        data.insert(key, value);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, MetaError> {
        let data = self
            .data
            .read()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        let mut result = Vec::new();
        for (k, v) in data.range::<Vec<u8>, _>(prefix.to_vec()..) {
            if !k.starts_with(prefix) {
                break;
            }
            result.push((k.clone(), v.clone()));
        }
        Ok(result)
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), MetaError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| MetaError::KvError(e.to_string()))?;
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }
}
