//! MosaicFS scenario suite
//!
//! Drives the manager and the head together against simulated storage
//! nodes (and, in `wire_scenarios`, real TCP node servers) to check the
//! system-level properties: content round trips, locked-file exclusion,
//! reservation accounting, copy without re-upload, mastership changes and
//! sync.

pub mod harness;

pub use harness::{pattern, HarnessError, TestEnv};

#[cfg(test)]
mod cluster_scenarios;
#[cfg(test)]
mod path_scenarios;
#[cfg(test)]
mod wire_scenarios;
