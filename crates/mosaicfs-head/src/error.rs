//! Error types for the head service

use mosaicfs_meta::MetaError;
use mosaicfs_mgmt::ManagerError;
use mosaicfs_transport::control::{
    STATUS_CONFLICT, STATUS_INTERNAL, STATUS_LOCKED, STATUS_NOT_FOUND, STATUS_UNAVAILABLE,
    STATUS_UNPROCESSABLE,
};
use mosaicfs_transport::NodeError;

/// All errors that can occur during path operations
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    /// No folder or file at the path
    #[error("{0} does not exist")]
    NotExist(String),
    /// The path is already taken
    #[error("{0} already exists")]
    Exist(String),
    /// Malformed path or argument
    #[error("invalid: {0}")]
    Invalid(String),
    /// A write in progress blocks the operation
    #[error("{0} is locked by a write in progress")]
    Locked(String),
    /// Metadata store failure
    #[error("store error: {0}")]
    Store(String),
    /// Coordinator failure
    #[error(transparent)]
    Manager(#[from] ManagerError),
    /// Storage node failure
    #[error(transparent)]
    Node(#[from] NodeError),
    /// I/O error on the caller's stream
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A chunk task died before reporting
    #[error("chunk task failed: {0}")]
    Task(String),
}

impl From<MetaError> for FsError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotExist(p) => FsError::NotExist(p),
            MetaError::Exist(p) => FsError::Exist(p),
            MetaError::Invalid(m) => FsError::Invalid(m),
            MetaError::Locked(p) => FsError::Locked(p),
            MetaError::KvError(m) => FsError::Store(m),
        }
    }
}

impl FsError {
    /// The status a path operation reports this error with.
    pub fn status_code(&self) -> u16 {
        match self {
            FsError::NotExist(_) => STATUS_NOT_FOUND,
            FsError::Exist(_) => STATUS_CONFLICT,
            FsError::Invalid(_) => STATUS_UNPROCESSABLE,
            FsError::Locked(_) => STATUS_LOCKED,
            FsError::Manager(e) => e.status_code(),
            FsError::Node(NodeError::Ping { .. }) => STATUS_UNAVAILABLE,
            FsError::Store(_) | FsError::Node(_) | FsError::Io(_) | FsError::Task(_) => {
                STATUS_INTERNAL
            }
        }
    }
}

/// Result alias for path operations.
pub type Result<T> = std::result::Result<T, FsError>;
