//! In-memory storage nodes for testing without a fleet.
//!
//! `SimNetwork` routes `NodeClient` calls by address to `SimNode`s that keep
//! reference-counted blobs in memory. Nodes can be taken down, made to fail
//! a number of upcoming calls, or made to refuse mode changes, and they count
//! how many create payloads they actually received.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;

use mosaicfs_meta::ChunkHash;

use crate::error::{NodeError, Result};
use crate::node::{verify, DeleteOutcome, NodeClient, WriteOutcome};

/// Cluster role a node has been told to take.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeRole {
    /// Not part of any cluster.
    Unjoined,
    /// Authoritative copy of its cluster.
    Master,
    /// Replica of the named master.
    Slave {
        /// Address of the master.
        master: String,
    },
}

#[derive(Clone)]
struct Blob {
    data: Bytes,
    refs: u32,
}

struct SimNodeState {
    blobs: HashMap<ChunkHash, Blob>,
    role: NodeRole,
    down: bool,
    fail_next: u32,
    refuse_mode: bool,
    payloads_received: u64,
    joins: Vec<String>,
}

/// One simulated storage node.
pub struct SimNode {
    addr: String,
    capacity: u64,
    state: Mutex<SimNodeState>,
}

impl SimNode {
    fn new(addr: &str, capacity: u64) -> Self {
        Self {
            addr: addr.to_string(),
            capacity,
            state: Mutex::new(SimNodeState {
                blobs: HashMap::new(),
                role: NodeRole::Unjoined,
                down: false,
                fail_next: 0,
                refuse_mode: false,
                payloads_received: 0,
                joins: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimNodeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Address of this node.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Capacity reported by `size`.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Takes the node down or brings it back.
    pub fn set_down(&self, down: bool) {
        self.state().down = down;
    }

    /// Makes the next `n` calls to this node fail.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Makes `join` refuse every mode change.
    pub fn refuse_mode(&self, refuse: bool) {
        self.state().refuse_mode = refuse;
    }

    /// Current role.
    pub fn role(&self) -> NodeRole {
        self.state().role.clone()
    }

    /// Master argument of every `join` received, in order.
    pub fn joins(&self) -> Vec<String> {
        self.state().joins.clone()
    }

    /// True if the node holds `hash`.
    pub fn has(&self, hash: &ChunkHash) -> bool {
        self.state().blobs.contains_key(hash)
    }

    /// Reference count of `hash` (0 if absent).
    pub fn refs(&self, hash: &ChunkHash) -> u32 {
        self.state().blobs.get(hash).map(|b| b.refs).unwrap_or(0)
    }

    /// Number of distinct blobs held.
    pub fn blob_count(&self) -> usize {
        self.state().blobs.len()
    }

    /// Number of create calls that transferred a payload.
    pub fn payloads_received(&self) -> u64 {
        self.state().payloads_received
    }

    /// Stores a blob directly, bypassing the protocol.
    pub fn preload(&self, data: &[u8]) -> ChunkHash {
        let hash = ChunkHash::of(data);
        self.state().blobs.insert(
            hash,
            Blob {
                data: Bytes::copy_from_slice(data),
                refs: 1,
            },
        );
        hash
    }

    fn check(&self, op: &'static str) -> Result<MutexGuard<'_, SimNodeState>> {
        let mut state = self.state();
        if state.down {
            return Err(refused(&self.addr, op));
        }
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(refused(&self.addr, op));
        }
        Ok(state)
    }
}

fn refused(addr: &str, op: &str) -> NodeError {
    NodeError::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        format!("{} to {} refused", op, addr),
    ))
}

/// A set of simulated nodes addressed by name.
#[derive(Clone, Default)]
pub struct SimNetwork {
    nodes: Arc<DashMap<String, Arc<SimNode>>>,
}

impl SimNetwork {
    /// Creates an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node with the given capacity.
    pub fn add_node(&self, addr: &str, capacity: u64) -> Arc<SimNode> {
        let node = Arc::new(SimNode::new(addr, capacity));
        self.nodes.insert(addr.to_string(), node.clone());
        node
    }

    /// Looks up a node.
    pub fn node(&self, addr: &str) -> Option<Arc<SimNode>> {
        self.nodes.get(addr).map(|n| n.clone())
    }

    fn lookup(&self, addr: &str, op: &'static str) -> Result<Arc<SimNode>> {
        self.node(addr).ok_or_else(|| refused(addr, op))
    }
}

#[async_trait]
impl NodeClient for SimNetwork {
    async fn ping(&self, addr: &str) -> Result<()> {
        let node = self.node(addr).ok_or_else(|| NodeError::Ping {
            addr: addr.to_string(),
        })?;
        node.check("ping").map_err(|_| NodeError::Ping {
            addr: addr.to_string(),
        })?;
        Ok(())
    }

    async fn size(&self, addr: &str) -> Result<u64> {
        let node = self.lookup(addr, "size")?;
        node.check("size")?;
        Ok(node.capacity)
    }

    async fn join(&self, addr: &str, master: &str) -> Result<()> {
        let join_err = |e: NodeError| NodeError::Join {
            addr: addr.to_string(),
            reason: e.to_string(),
        };
        let node = self.lookup(addr, "join").map_err(join_err)?;
        let mut state = node.check("join").map_err(join_err)?;
        state.joins.push(master.to_string());
        if state.refuse_mode {
            return Err(NodeError::Mode {
                addr: addr.to_string(),
                reason: "mode change refused".to_string(),
            });
        }
        state.role = if master.is_empty() {
            NodeRole::Master
        } else {
            NodeRole::Slave {
                master: master.to_string(),
            }
        };
        Ok(())
    }

    async fn erase(&self, addr: &str) -> Result<()> {
        let node = self.lookup(addr, "erase")?;
        let mut state = node.check("erase")?;
        state.blobs.clear();
        state.role = NodeRole::Unjoined;
        Ok(())
    }

    async fn catalog(&self, addr: &str) -> Result<Vec<ChunkHash>> {
        let node = self.lookup(addr, "catalog")?;
        let state = node.check("catalog")?;
        let mut hashes: Vec<ChunkHash> = state.blobs.keys().copied().collect();
        hashes.sort();
        Ok(hashes)
    }

    async fn resync(&self, addr: &str, master: &str) -> Result<()> {
        let source = self.lookup(master, "resync")?;
        let blobs = source.check("resync")?.blobs.clone();
        let node = self.lookup(addr, "resync")?;
        node.check("resync")?.blobs = blobs;
        Ok(())
    }

    async fn create(&self, addr: &str, hash: &ChunkHash, data: Bytes) -> Result<WriteOutcome> {
        let node = self.lookup(addr, "create")?;
        let mut state = node.check("create")?;
        if let Some(blob) = state.blobs.get_mut(hash) {
            blob.refs += 1;
            return Ok(WriteOutcome::Exists);
        }
        verify(hash, &data)?;
        let used: u64 = state.blobs.values().map(|b| b.data.len() as u64).sum();
        if used + data.len() as u64 > node.capacity {
            return Err(NodeError::Refused {
                addr: addr.to_string(),
                op: "create",
            });
        }
        state.payloads_received += 1;
        state.blobs.insert(*hash, Blob { data, refs: 1 });
        Ok(WriteOutcome::Created)
    }

    async fn create_shadow(&self, addr: &str, hash: &ChunkHash) -> Result<()> {
        let node = self.lookup(addr, "shadow")?;
        let mut state = node.check("shadow")?;
        match state.blobs.get_mut(hash) {
            Some(blob) => {
                blob.refs += 1;
                Ok(())
            }
            None => Err(NodeError::BlobNotFound {
                addr: addr.to_string(),
                hash: *hash,
            }),
        }
    }

    async fn read(&self, addr: &str, hash: &ChunkHash) -> Result<Bytes> {
        let node = self.lookup(addr, "read")?;
        let data = {
            let state = node.check("read")?;
            state
                .blobs
                .get(hash)
                .map(|b| b.data.clone())
                .ok_or_else(|| NodeError::BlobNotFound {
                    addr: addr.to_string(),
                    hash: *hash,
                })?
        };
        verify(hash, &data)?;
        Ok(data)
    }

    async fn delete(&self, addr: &str, hash: &ChunkHash) -> Result<DeleteOutcome> {
        let node = self.lookup(addr, "delete")?;
        let mut state = node.check("delete")?;
        let remaining_refs = match state.blobs.get_mut(hash) {
            Some(blob) => {
                blob.refs = blob.refs.saturating_sub(1);
                blob.refs
            }
            None => {
                return Err(NodeError::BlobNotFound {
                    addr: addr.to_string(),
                    hash: *hash,
                })
            }
        };
        if remaining_refs == 0 {
            state.blobs.remove(hash);
        }
        Ok(DeleteOutcome { remaining_refs })
    }
}
