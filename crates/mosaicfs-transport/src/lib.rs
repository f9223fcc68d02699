#![warn(missing_docs)]

//! MosaicFS transport: the storage-node blob and control protocol, the
//! coordinator control messages, and an in-memory node simulator.

pub mod control;
pub mod error;
pub mod node;
pub mod protocol;
pub mod sim;
pub mod tcp;

pub use control::{Action, ControlRequest, ControlResponse};
pub use error::{NodeError, Result};
pub use node::{DeleteOutcome, NodeClient, WriteOutcome};
pub use sim::{NodeRole, SimNetwork, SimNode};
pub use tcp::{NodeServer, TcpNodeClient, TcpNodeConfig};
