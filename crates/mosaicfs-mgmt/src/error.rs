use thiserror::Error;

use mosaicfs_meta::MetaError;
use mosaicfs_transport::control::{
    STATUS_CONFLICT, STATUS_INSUFFICIENT_STORAGE, STATUS_INTERNAL, STATUS_LOCKED,
    STATUS_NOT_FOUND, STATUS_UNAVAILABLE, STATUS_UNPROCESSABLE,
};
use mosaicfs_transport::NodeError;

/// Manager-side failures.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// Unknown cluster, node, reservation or content.
    #[error("{0} not found")]
    NotFound(String),

    /// The node already belongs to a cluster.
    #[error("node {node} is already registered to cluster {cluster}")]
    Registered {
        /// Node address.
        node: String,
        /// Cluster holding it.
        cluster: String,
    },

    /// No cluster can hold the reservation.
    #[error("no cluster has room for {size} bytes")]
    NoSpace {
        /// Requested bytes.
        size: u64,
    },

    /// No cluster has a reachable node.
    #[error("no available node")]
    NoAvailableNode,

    /// The node is the only one left in its cluster.
    #[error("node {0} is the last node of its cluster")]
    LastNode(String),

    /// Malformed request.
    #[error("invalid request: {0}")]
    Invalid(String),

    /// A storage node failed or refused a call.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// The lock or document store failed.
    #[error(transparent)]
    Meta(#[from] MetaError),

    /// A response could not be encoded.
    #[error("encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ManagerError {
    /// The control-protocol status this error is reported with.
    pub fn status_code(&self) -> u16 {
        match self {
            ManagerError::NotFound(_) => STATUS_NOT_FOUND,
            ManagerError::Registered { .. } | ManagerError::LastNode(_) => STATUS_CONFLICT,
            ManagerError::NoSpace { .. } => STATUS_INSUFFICIENT_STORAGE,
            ManagerError::NoAvailableNode => STATUS_UNAVAILABLE,
            ManagerError::Invalid(_) => STATUS_UNPROCESSABLE,
            ManagerError::Node(NodeError::Ping { .. }) => STATUS_UNAVAILABLE,
            ManagerError::Node(_) => STATUS_INTERNAL,
            ManagerError::Meta(e) => match e {
                MetaError::NotExist(_) => STATUS_NOT_FOUND,
                MetaError::Exist(_) => STATUS_CONFLICT,
                MetaError::Invalid(_) => STATUS_UNPROCESSABLE,
                MetaError::Locked(_) => STATUS_LOCKED,
                MetaError::KvError(_) => STATUS_INTERNAL,
            },
            ManagerError::Encode(_) => STATUS_INTERNAL,
        }
    }
}

/// Result alias for manager operations.
pub type Result<T> = std::result::Result<T, ManagerError>;
