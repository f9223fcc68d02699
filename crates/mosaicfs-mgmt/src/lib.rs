#![warn(missing_docs)]

//! MosaicFS manager: cluster registry, per-cluster dedup index, cluster
//! coordinator, and the control service in front of them.

pub mod config;
pub mod control;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod load;
pub mod registry;

pub use config::ManagerConfig;
pub use control::ControlService;
pub use coordinator::{ClusterCoordinator, ClusterInfo, MapEntry, ReservationMap, SyncReport, Target};
pub use dedup::DedupIndex;
pub use error::{ManagerError, Result};
pub use load::LoadTracker;
pub use registry::{Cluster, Node, Registry, Reservation};
