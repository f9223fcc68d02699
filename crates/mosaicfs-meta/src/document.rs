//! Lock-guarded document transactions.
//!
//! A `Txn` is the acquire/mutate/persist/release discipline shared by the
//! folder tree and the cluster registry: keys are acquired through the lock
//! service, the current documents are loaded (absent = `None`), the caller
//! edits the map, and `commit` writes every entry in one atomic batch
//! (`None` deletes, `Some` upserts). The keys are released when the `Txn` is
//! dropped, whether or not it was committed.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::kvstore::{self, BatchOp, KvStore};
use crate::locking::{canonical_keys, LockGuard, LockService};
use crate::types::{Folder, MetaError};

/// A record stored one-per-key in a collection of the document store.
pub trait Document: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Collection name, used as the storage key prefix.
    const COLLECTION: &'static str;

    /// The unique key of this document within its collection.
    fn key(&self) -> String;
}

impl Document for Folder {
    const COLLECTION: &'static str = "folder";

    fn key(&self) -> String {
        self.full.clone()
    }
}

/// Storage key of `key` in the collection of `D`.
pub fn storage_key<D: Document>(key: &str) -> Vec<u8> {
    format!("{}/{}", D::COLLECTION, key).into_bytes()
}

/// A collection of documents guarded by a lock service.
pub struct DocumentSet<D> {
    kv: Arc<dyn KvStore>,
    locks: LockService,
    _doc: PhantomData<fn() -> D>,
}

impl<D> Clone for DocumentSet<D> {
    fn clone(&self) -> Self {
        Self {
            kv: self.kv.clone(),
            locks: self.locks.clone(),
            _doc: PhantomData,
        }
    }
}

impl<D: Document> DocumentSet<D> {
    /// Creates a document set over a store and a lock service.
    pub fn new(kv: Arc<dyn KvStore>, locks: LockService) -> Self {
        Self {
            kv,
            locks,
            _doc: PhantomData,
        }
    }

    /// The lock service guarding this collection.
    pub fn locks(&self) -> &LockService {
        &self.locks
    }

    /// Loads one document without locking.
    pub fn load(&self, key: &str) -> Result<Option<D>, MetaError> {
        kvstore::get_doc(self.kv.as_ref(), &storage_key::<D>(key))
    }

    /// Loads every document whose key starts with `prefix`, without locking.
    pub fn scan(&self, prefix: &str) -> Result<Vec<D>, MetaError> {
        kvstore::scan_docs(self.kv.as_ref(), &storage_key::<D>(prefix))
    }

    /// Waits until each key is free (shared barrier) and loads its document.
    pub async fn read<I, S>(&self, keys: I) -> Result<BTreeMap<String, Option<D>>, MetaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut docs = BTreeMap::new();
        for key in canonical_keys(keys) {
            self.locks.await_free(&key).await?;
            let doc = self.load(&key)?;
            docs.insert(key, doc);
        }
        Ok(docs)
    }

    /// Acquires every key and loads the current documents.
    pub async fn begin<I, S>(&self, keys: I) -> Result<Txn<D>, MetaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let guard = self.locks.acquire_all(keys).await?;
        let mut docs = BTreeMap::new();
        for key in guard.keys() {
            docs.insert(key.clone(), self.load(key)?);
        }
        Ok(Txn {
            kv: self.kv.clone(),
            docs,
            _guard: guard,
        })
    }
}

/// An open transaction over a set of locked documents.
pub struct Txn<D: Document> {
    kv: Arc<dyn KvStore>,
    docs: BTreeMap<String, Option<D>>,
    _guard: LockGuard,
}

impl<D: Document> Txn<D> {
    /// Every loaded or staged entry.
    pub fn docs(&self) -> &BTreeMap<String, Option<D>> {
        &self.docs
    }

    /// Mutable access to every entry.
    pub fn docs_mut(&mut self) -> &mut BTreeMap<String, Option<D>> {
        &mut self.docs
    }

    /// The document at `key`, if it exists.
    pub fn get(&self, key: &str) -> Option<&D> {
        self.docs.get(key).and_then(|d| d.as_ref())
    }

    /// The document at `key` for mutation, if it exists.
    pub fn get_mut(&mut self, key: &str) -> Option<&mut D> {
        self.docs.get_mut(key).and_then(|d| d.as_mut())
    }

    /// Stages an upsert under the document's own key.
    pub fn put(&mut self, doc: D) {
        self.docs.insert(doc.key(), Some(doc));
    }

    /// Stages a delete and returns the current document.
    pub fn remove(&mut self, key: &str) -> Option<D> {
        self.docs.insert(key.to_string(), None).flatten()
    }

    /// Persists every entry in a single batch.
    pub fn commit(self) -> Result<(), MetaError> {
        let mut ops = Vec::with_capacity(self.docs.len());
        for (key, doc) in &self.docs {
            let key = storage_key::<D>(key);
            match doc {
                Some(doc) => ops.push(BatchOp::Put {
                    key,
                    value: kvstore::encode(doc)?,
                }),
                None => ops.push(BatchOp::Delete { key }),
            }
        }
        self.kv.write_batch(ops)
    }
}
