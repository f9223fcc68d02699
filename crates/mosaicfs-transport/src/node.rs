//! Client-side view of a storage node.
//!
//! Blob operations (create, shadow, read, delete) carry file content; control
//! operations (ping, size, join, erase, catalog, resync) are issued by the
//! manager to place nodes into clusters and keep replicas in step. Every call
//! names the node by address so one client can serve a whole fleet.

use async_trait::async_trait;
use bytes::Bytes;

use mosaicfs_meta::ChunkHash;

use crate::error::Result;

/// Result of a blob create.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The payload was transferred and stored.
    Created,
    /// The node already held the content; nothing was transferred and the
    /// existing blob gained a reference.
    Exists,
}

/// Result of a blob delete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// References left on the node after this delete.
    pub remaining_refs: u32,
}

impl DeleteOutcome {
    /// True if the blob is gone from the node.
    pub fn removed(&self) -> bool {
        self.remaining_refs == 0
    }
}

/// Operations a storage node answers.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Liveness check.
    async fn ping(&self, addr: &str) -> Result<()>;

    /// Capacity of the node in bytes.
    async fn size(&self, addr: &str) -> Result<u64>;

    /// Joins the node to a cluster. An empty `master` makes it the master,
    /// otherwise it becomes a slave of `master`.
    async fn join(&self, addr: &str, master: &str) -> Result<()>;

    /// Erases every blob and leaves the cluster.
    async fn erase(&self, addr: &str) -> Result<()>;

    /// Every content hash the node holds.
    async fn catalog(&self, addr: &str) -> Result<Vec<ChunkHash>>;

    /// Replaces the node's content with a full copy of `master`'s.
    async fn resync(&self, addr: &str, master: &str) -> Result<()>;

    /// Stores a blob, or adds a reference if the node already has it.
    async fn create(&self, addr: &str, hash: &ChunkHash, data: Bytes) -> Result<WriteOutcome>;

    /// Adds a reference to content the node already holds. Index-only.
    async fn create_shadow(&self, addr: &str, hash: &ChunkHash) -> Result<()>;

    /// Reads a blob back. The returned bytes are verified against `hash`.
    async fn read(&self, addr: &str, hash: &ChunkHash) -> Result<Bytes>;

    /// Drops one reference to a blob.
    async fn delete(&self, addr: &str, hash: &ChunkHash) -> Result<DeleteOutcome>;
}

/// Checks read-back content against its address.
pub fn verify(hash: &ChunkHash, data: &[u8]) -> Result<()> {
    let actual = ChunkHash::of(data);
    if &actual != hash {
        return Err(crate::error::NodeError::HashMismatch {
            expected: *hash,
            actual,
        });
    }
    Ok(())
}
