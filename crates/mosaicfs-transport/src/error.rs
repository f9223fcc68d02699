//! Errors raised while talking to storage nodes.

use thiserror::Error;

use mosaicfs_meta::ChunkHash;

/// Failures talking to a storage node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The node did not answer a liveness check.
    #[error("node {addr} is unreachable")]
    Ping {
        /// Node address.
        addr: String,
    },

    /// The join handshake could not be completed.
    #[error("join handshake with {addr} failed: {reason}")]
    Join {
        /// Node address.
        addr: String,
        /// What the node answered, or why no answer was usable.
        reason: String,
    },

    /// The node refused to switch into the requested master/slave mode.
    #[error("node {addr} refused mode change: {reason}")]
    Mode {
        /// Node address.
        addr: String,
        /// What the node answered.
        reason: String,
    },

    /// The node answered `-` to a control or blob operation.
    #[error("node {addr} refused {op}")]
    Refused {
        /// Node address.
        addr: String,
        /// Operation name.
        op: &'static str,
    },

    /// The node does not hold the requested blob.
    #[error("blob {hash} not found on {addr}")]
    BlobNotFound {
        /// Node address.
        addr: String,
        /// Content address that was asked for.
        hash: ChunkHash,
    },

    /// Read-back content does not match its address.
    #[error("blob {expected} read back with hash {actual}")]
    HashMismatch {
        /// Address the content was stored under.
        expected: ChunkHash,
        /// Digest of the bytes actually returned.
        actual: ChunkHash,
    },

    /// Unexpected byte on the wire.
    #[error("protocol error from {addr}: {reason}")]
    Protocol {
        /// Node address.
        addr: String,
        /// What was malformed.
        reason: String,
    },

    /// The operation did not finish in time.
    #[error("{op} on {addr} timed out after {timeout_ms}ms")]
    Timeout {
        /// Node address.
        addr: String,
        /// Operation name.
        op: &'static str,
        /// Budget that ran out.
        timeout_ms: u64,
    },

    /// Socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result alias for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
