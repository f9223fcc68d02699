//! Advisory distributed mutual exclusion keyed by string.
//!
//! `acquire` polls the lock store until it can set the key, with a TTL so a
//! crashed holder cannot wedge the key. Every acquisition stores a holder
//! token and release only deletes a key still carrying that token, so a
//! holder whose key lapsed cannot free it from under the next one.
//! `await_free` polls until the key is observed free without taking it (a
//! read barrier). There is no fairness and no reentrancy: a holder that
//! acquires its own key again waits for the TTL to lapse.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::lockstore::LockStore;
use crate::types::MetaError;

/// Polling and expiry settings for the lock service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Delay between attempts while a key is held.
    pub poll_interval_ms: u64,
    /// Safety expiry applied to every acquired key.
    pub ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            ttl_secs: 30,
        }
    }
}

/// Distributed lock service over a `LockStore`.
#[derive(Clone)]
pub struct LockService {
    store: Arc<dyn LockStore>,
    config: LockConfig,
    namespace: String,
}

impl LockService {
    /// Creates a lock service whose keys live under `namespace`.
    pub fn new(store: Arc<dyn LockStore>, config: LockConfig, namespace: &str) -> Self {
        Self {
            store,
            config,
            namespace: namespace.to_string(),
        }
    }

    /// The store backing this service.
    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    fn key(&self, key: &str) -> String {
        format!("lock:{}:{}", self.namespace, key)
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.config.poll_interval_ms.max(1))
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.config.ttl_secs)
    }

    /// Blocks until `key` is free, then marks it held. Returns the holder
    /// token `release` needs.
    pub async fn acquire(&self, key: &str) -> Result<String, MetaError> {
        let token = new_token();
        self.acquire_as(key, &token).await?;
        Ok(token)
    }

    async fn acquire_as(&self, key: &str, token: &str) -> Result<(), MetaError> {
        let full = self.key(key);
        loop {
            if self.store.set_nx(&full, token, self.ttl())? {
                tracing::trace!(key = %full, "lock acquired");
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval()).await;
        }
    }

    /// Marks `key` held if it is free right now.
    pub fn try_acquire(&self, key: &str) -> Result<Option<String>, MetaError> {
        let token = new_token();
        Ok(self
            .store
            .set_nx(&self.key(key), &token, self.ttl())?
            .then_some(token))
    }

    /// Frees `key` if `token` still holds it. Returns false when the key
    /// lapsed and is gone or held by someone else.
    pub fn release(&self, key: &str, token: &str) -> Result<bool, MetaError> {
        let full = self.key(key);
        let released = self.store.delete_if(&full, token)?;
        if !released {
            tracing::debug!(key = %full, "lock lapsed before release");
        }
        Ok(released)
    }

    /// True if some holder has `key` right now.
    pub fn is_held(&self, key: &str) -> Result<bool, MetaError> {
        self.store.exists(&self.key(key))
    }

    /// Blocks until `key` is observed free. Never marks it held.
    pub async fn await_free(&self, key: &str) -> Result<(), MetaError> {
        let full = self.key(key);
        while self.store.exists(&full)? {
            tokio::time::sleep(self.poll_interval()).await;
        }
        Ok(())
    }

    /// Acquires every key in canonical (sorted, de-duplicated) order.
    ///
    /// On error the keys taken so far are released. The returned guard
    /// releases all keys when dropped.
    pub async fn acquire_all<I, S>(&self, keys: I) -> Result<LockGuard, MetaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let canonical = canonical_keys(keys);
        let mut guard = LockGuard {
            service: self.clone(),
            token: new_token(),
            keys: Vec::with_capacity(canonical.len()),
        };
        for key in canonical {
            self.acquire_as(&key, &guard.token).await?;
            guard.keys.push(key);
        }
        Ok(guard)
    }
}

fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Sorted, de-duplicated copy of `keys`.
pub fn canonical_keys<I, S>(keys: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out: Vec<String> = keys.into_iter().map(|k| k.as_ref().to_string()).collect();
    out.sort();
    out.dedup();
    out
}

/// Keys held on behalf of one transaction. Released on drop.
pub struct LockGuard {
    service: LockService,
    token: String,
    keys: Vec<String>,
}

impl LockGuard {
    /// Keys held, in acquisition order.
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Releases every key now, reporting the first failure.
    pub fn release(mut self) -> Result<(), MetaError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), MetaError> {
        let mut first_err = None;
        for key in self.keys.drain(..) {
            if let Err(e) = self.service.release(&key, &self.token) {
                tracing::warn!(key = %key, error = %e, "failed to release lock");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = self.release_inner();
    }
}
