#![warn(missing_docs)]

//! MosaicFS head service: the folder and file path engine, parallel chunk
//! upload with compensating deletes, and chunk read-back.
//!
//! Write path: stream → reserve → chunk tasks (hash → dedup → create) → commit → settle entry
//! Read path:  entry → chunk lookup → node read → verify → stream

pub mod chunks;
pub mod config;
pub mod dfs;
pub mod error;

pub use chunks::{ChunkStore, Placement, Upload};
pub use config::DfsConfig;
pub use dfs::{Dfs, Entry};
pub use error::{FsError, Result};
