#![warn(missing_docs)]

//! MosaicFS coordination primitives: advisory distributed locks, the lock/KV
//! and document store collaborators, and the path-locked folder tree.

pub mod document;
pub mod kvstore;
pub mod locking;
pub mod lockstore;
pub mod path;
pub mod tree;
pub mod types;

pub use document::{Document, DocumentSet, Txn};
pub use kvstore::{KvStore, MemoryKvStore};
pub use locking::{LockConfig, LockGuard, LockService};
pub use lockstore::{LockBackend, LockStore, MemoryLockStore, ShardedLockStore};
pub use tree::{FolderMap, TreeStore, TreeTxn};
pub use types::{ChunkHash, DataChunk, File, Folder, FolderShadow, MetaError, Timestamp};
