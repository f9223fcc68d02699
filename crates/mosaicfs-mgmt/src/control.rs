//! Control-protocol dispatcher.
//!
//! Executes `ControlRequest`s against the coordinator and serves them over
//! TCP as length-prefixed JSON frames, one response per request.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::BufStream;
use tokio::net::{TcpListener, TcpStream};

use mosaicfs_meta::ChunkHash;
use mosaicfs_transport::control::{read_frame, write_frame};
use mosaicfs_transport::{Action, ControlRequest, ControlResponse};

use crate::coordinator::ClusterCoordinator;
use crate::error::{ManagerError, Result};

/// Answers control requests.
#[derive(Clone)]
pub struct ControlService {
    coordinator: Arc<ClusterCoordinator>,
}

fn parse_hash(s: &str) -> Result<ChunkHash> {
    ChunkHash::from_hex(s).map_err(|_| ManagerError::Invalid(format!("bad content hash '{}'", s)))
}

/// Parses `cluster=bytes` pairs.
fn parse_usage(options: &[String]) -> Result<BTreeMap<String, u64>> {
    let mut used = BTreeMap::new();
    for opt in options {
        let (cluster, bytes) = opt
            .split_once('=')
            .ok_or_else(|| ManagerError::Invalid(format!("expected cluster=bytes, got '{}'", opt)))?;
        let bytes: u64 = bytes
            .parse()
            .map_err(|_| ManagerError::Invalid(format!("bad byte count in '{}'", opt)))?;
        *used.entry(cluster.to_string()).or_insert(0) += bytes;
    }
    Ok(used)
}

fn require_id(req: &ControlRequest) -> Result<&str> {
    if req.id.is_empty() {
        return Err(ManagerError::Invalid(format!("{:?} needs an id", req.action)));
    }
    Ok(&req.id)
}

impl ControlService {
    /// Creates a dispatcher over `coordinator`.
    pub fn new(coordinator: Arc<ClusterCoordinator>) -> Self {
        Self { coordinator }
    }

    /// Executes one request.
    pub async fn handle(&self, req: ControlRequest) -> ControlResponse {
        let action = req.action;
        match self.dispatch(req).await {
            Ok(body) => ControlResponse::ok(body),
            Err(e) => {
                tracing::debug!(action = ?action, error = %e, "control request failed");
                ControlResponse::error(e.status_code(), e.to_string())
            }
        }
    }

    async fn dispatch(&self, req: ControlRequest) -> Result<Value> {
        let coord = &self.coordinator;
        match req.action {
            Action::Register => {
                let cluster = if req.id.is_empty() {
                    coord.register(&req.options).await?
                } else {
                    coord.register_nodes_to(&req.id, &req.options).await?
                };
                Ok(serde_json::to_value(cluster)?)
            }
            Action::Reserve => {
                if req.size == 0 {
                    return Err(ManagerError::Invalid("reserve needs a positive size".into()));
                }
                Ok(serde_json::to_value(coord.reserve(req.size).await?)?)
            }
            Action::ReadMap | Action::DeleteMap => {
                let hashes = req
                    .options
                    .iter()
                    .map(|h| parse_hash(h))
                    .collect::<Result<Vec<_>>>()?;
                let targets = coord.map(&hashes, req.action == Action::DeleteMap).await?;
                let entries: Vec<Value> = hashes
                    .iter()
                    .zip(targets)
                    .map(|(hash, t)| {
                        json!({ "hash": hash.to_hex(), "cluster_id": t.cluster_id, "address": t.address })
                    })
                    .collect();
                Ok(Value::Array(entries))
            }
            Action::Find => {
                let hash = parse_hash(require_id(&req)?)?;
                Ok(serde_json::to_value(coord.find(&hash, false).await?)?)
            }
            Action::Unregister => {
                coord.unregister(require_id(&req)?).await?;
                Ok(json!({ "unregistered": req.id }))
            }
            Action::Commit => {
                let used = parse_usage(&req.options)?;
                coord.commit(require_id(&req)?, &used).await?;
                Ok(json!({ "committed": req.id }))
            }
            Action::Discard => {
                coord.discard(require_id(&req)?).await?;
                Ok(json!({ "discarded": req.id }))
            }
            Action::Sync => {
                let report = if req.id.is_empty() {
                    coord.sync_clusters().await?
                } else {
                    coord.sync_cluster(&req.id).await?
                };
                Ok(serde_json::to_value(report)?)
            }
            Action::Clusters => Ok(serde_json::to_value(coord.clusters().await?)?),
        }
    }

    /// Binds `bind` and serves in a background task. Returns the bound address.
    pub async fn spawn(self, bind: &str) -> std::io::Result<String> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?.to_string();
        tokio::spawn(self.serve(listener));
        Ok(local)
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "control listener failed");
                    return;
                }
            };
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.connection(stream).await {
                    tracing::debug!(peer = %peer, error = %e, "control connection closed");
                }
            });
        }
    }

    async fn connection(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut conn = BufStream::new(stream);
        loop {
            let req: Option<ControlRequest> = match read_frame(&mut conn).await {
                Ok(req) => req,
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    let resp = ControlResponse::error(
                        mosaicfs_transport::control::STATUS_UNPROCESSABLE,
                        e.to_string(),
                    );
                    write_frame(&mut conn, &resp).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let Some(req) = req else { return Ok(()) };
            let resp = self.handle(req).await;
            write_frame(&mut conn, &resp).await?;
        }
    }
}

/// Sends one request to a control service and waits for the response.
pub async fn call(addr: &str, req: &ControlRequest) -> std::io::Result<ControlResponse> {
    let mut conn = BufStream::new(TcpStream::connect(addr).await?);
    write_frame(&mut conn, req).await?;
    read_frame(&mut conn).await?.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "control connection closed")
    })
}
