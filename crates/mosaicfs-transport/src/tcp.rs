//! TCP storage-node client and server.
//!
//! The client opens one connection per request. The server fronts any
//! `NodeClient` backend under a listening socket, which is how a storage
//! process exposes its store and how tests put the wire protocol in front of
//! simulated nodes.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

use mosaicfs_meta::ChunkHash;

use crate::error::{NodeError, Result};
use crate::node::{verify, DeleteOutcome, NodeClient, WriteOutcome};
use crate::protocol::{
    read_catalog, read_marker, read_payload, write_catalog, write_marker, write_payload, Command,
};

type Conn = BufStream<TcpStream>;

/// TCP client configuration
#[derive(Debug, Clone)]
pub struct TcpNodeConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Optional bound on a whole request once connected. Unbounded if `None`.
    pub request_timeout_ms: Option<u64>,
    /// Whether to enable TCP_NODELAY.
    pub nodelay: bool,
}

impl Default for TcpNodeConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            request_timeout_ms: None,
            nodelay: true,
        }
    }
}

/// Talks to storage nodes over TCP.
#[derive(Debug, Clone, Default)]
pub struct TcpNodeClient {
    config: TcpNodeConfig,
}

impl TcpNodeClient {
    /// Creates a client with the given configuration.
    pub fn new(config: TcpNodeConfig) -> Self {
        Self { config }
    }

    async fn connect(&self, addr: &str, op: &'static str) -> Result<Conn> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NodeError::Timeout {
                addr: addr.to_string(),
                op,
                timeout_ms: self.config.connect_timeout_ms,
            })??;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(BufStream::new(stream))
    }

    async fn call<T, F, Fut>(&self, addr: &str, cmd: Command, f: F) -> Result<T>
    where
        F: FnOnce(Conn) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let op = cmd.name();
        tracing::trace!(addr = addr, op = op, "node request");
        let mut conn = self.connect(addr, op).await?;
        let work = async move {
            cmd.write_to(&mut conn).await?;
            conn.flush().await?;
            f(conn).await
        };
        match self.config.request_timeout_ms {
            Some(ms) => tokio::time::timeout(Duration::from_millis(ms), work)
                .await
                .map_err(|_| NodeError::Timeout {
                    addr: addr.to_string(),
                    op,
                    timeout_ms: ms,
                })?,
            None => work.await,
        }
    }
}

async fn ack(conn: &mut Conn, addr: &str) -> Result<bool> {
    read_marker(conn).await.map_err(|e| match e.kind() {
        io::ErrorKind::InvalidData => NodeError::Protocol {
            addr: addr.to_string(),
            reason: e.to_string(),
        },
        _ => NodeError::Io(e),
    })
}

fn refused(addr: &str, op: &'static str) -> NodeError {
    NodeError::Refused {
        addr: addr.to_string(),
        op,
    }
}

fn not_found(addr: &str, hash: &ChunkHash) -> NodeError {
    NodeError::BlobNotFound {
        addr: addr.to_string(),
        hash: *hash,
    }
}

#[async_trait]
impl NodeClient for TcpNodeClient {
    async fn ping(&self, addr: &str) -> Result<()> {
        let alive = self
            .call(addr, Command::Ping, |mut c| async move { ack(&mut c, addr).await })
            .await
            .unwrap_or(false);
        if !alive {
            return Err(NodeError::Ping {
                addr: addr.to_string(),
            });
        }
        Ok(())
    }

    async fn size(&self, addr: &str) -> Result<u64> {
        self.call(addr, Command::Size, |mut c| async move {
            if !ack(&mut c, addr).await? {
                return Err(refused(addr, "size"));
            }
            Ok(c.read_u64_le().await?)
        })
        .await
    }

    async fn join(&self, addr: &str, master: &str) -> Result<()> {
        let joined = self
            .call(addr, Command::Join(master.to_string()), |mut c| async move {
                ack(&mut c, addr).await
            })
            .await
            .map_err(|e| NodeError::Join {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;
        if !joined {
            return Err(NodeError::Mode {
                addr: addr.to_string(),
                reason: if master.is_empty() {
                    "refused master role".to_string()
                } else {
                    format!("refused to follow {}", master)
                },
            });
        }
        Ok(())
    }

    async fn erase(&self, addr: &str) -> Result<()> {
        self.call(addr, Command::Erase, |mut c| async move {
            match ack(&mut c, addr).await? {
                true => Ok(()),
                false => Err(refused(addr, "erase")),
            }
        })
        .await
    }

    async fn catalog(&self, addr: &str) -> Result<Vec<ChunkHash>> {
        self.call(addr, Command::Catalog, |mut c| async move {
            if !ack(&mut c, addr).await? {
                return Err(refused(addr, "catalog"));
            }
            Ok(read_catalog(&mut c).await?)
        })
        .await
    }

    async fn resync(&self, addr: &str, master: &str) -> Result<()> {
        self.call(addr, Command::Resync(master.to_string()), |mut c| async move {
            match ack(&mut c, addr).await? {
                true => Ok(()),
                false => Err(refused(addr, "resync")),
            }
        })
        .await
    }

    async fn create(&self, addr: &str, hash: &ChunkHash, data: Bytes) -> Result<WriteOutcome> {
        self.call(addr, Command::Create(*hash), |mut c| async move {
            if !ack(&mut c, addr).await? {
                return Ok(WriteOutcome::Exists);
            }
            write_payload(&mut c, &data).await?;
            c.flush().await?;
            match ack(&mut c, addr).await? {
                true => Ok(WriteOutcome::Created),
                false => Err(refused(addr, "create")),
            }
        })
        .await
    }

    async fn create_shadow(&self, addr: &str, hash: &ChunkHash) -> Result<()> {
        self.call(addr, Command::Shadow(*hash), |mut c| async move {
            match ack(&mut c, addr).await? {
                true => Ok(()),
                false => Err(not_found(addr, hash)),
            }
        })
        .await
    }

    async fn read(&self, addr: &str, hash: &ChunkHash) -> Result<Bytes> {
        let data = self
            .call(addr, Command::Read(*hash), |mut c| async move {
                if !ack(&mut c, addr).await? {
                    return Err(not_found(addr, hash));
                }
                Ok(read_payload(&mut c).await?)
            })
            .await?;
        verify(hash, &data)?;
        Ok(data)
    }

    async fn delete(&self, addr: &str, hash: &ChunkHash) -> Result<DeleteOutcome> {
        self.call(addr, Command::Delete(*hash), |mut c| async move {
            if !ack(&mut c, addr).await? {
                return Err(not_found(addr, hash));
            }
            let remaining_refs = c.read_u32_le().await?;
            Ok(DeleteOutcome { remaining_refs })
        })
        .await
    }
}

/// Serves the storage-node protocol on behalf of a backend.
pub struct NodeServer {
    backend: Arc<dyn NodeClient>,
    addr: String,
}

impl NodeServer {
    /// Creates a server answering for the node `addr` of `backend`.
    pub fn new(backend: Arc<dyn NodeClient>, addr: &str) -> Self {
        Self {
            backend,
            addr: addr.to_string(),
        }
    }

    /// Binds `bind` and serves in a background task. Returns the bound
    /// address.
    pub async fn spawn(self, bind: &str) -> Result<String> {
        let listener = TcpListener::bind(bind).await?;
        let local = listener.local_addr()?.to_string();
        tokio::spawn(Arc::new(self).serve(listener));
        Ok(local)
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(node = %self.addr, error = %e, "accept failed");
                    return;
                }
            };
            let _ = stream.set_nodelay(true);
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.handle(BufStream::new(stream)).await {
                    tracing::debug!(node = %this.addr, peer = %peer, error = %e, "connection closed");
                }
            });
        }
    }

    async fn handle(&self, mut conn: Conn) -> io::Result<()> {
        while let Some(cmd) = Command::read_from(&mut conn).await? {
            self.dispatch(cmd, &mut conn).await?;
            conn.flush().await?;
        }
        Ok(())
    }

    async fn dispatch(&self, cmd: Command, conn: &mut Conn) -> io::Result<()> {
        let addr = self.addr.as_str();
        let backend = &self.backend;
        match cmd {
            Command::Ping => write_marker(conn, backend.ping(addr).await.is_ok()).await,
            Command::Size => match backend.size(addr).await {
                Ok(size) => {
                    write_marker(conn, true).await?;
                    conn.write_u64_le(size).await
                }
                Err(_) => write_marker(conn, false).await,
            },
            Command::Join(master) => {
                write_marker(conn, backend.join(addr, &master).await.is_ok()).await
            }
            Command::Erase => write_marker(conn, backend.erase(addr).await.is_ok()).await,
            Command::Resync(master) => {
                write_marker(conn, backend.resync(addr, &master).await.is_ok()).await
            }
            Command::Catalog => match backend.catalog(addr).await {
                Ok(hashes) => {
                    write_marker(conn, true).await?;
                    write_catalog(conn, &hashes).await
                }
                Err(_) => write_marker(conn, false).await,
            },
            Command::Create(hash) => {
                if backend.create_shadow(addr, &hash).await.is_ok() {
                    return write_marker(conn, false).await;
                }
                write_marker(conn, true).await?;
                conn.flush().await?;
                let data = read_payload(conn).await?;
                let stored = backend.create(addr, &hash, data).await;
                if let Err(e) = &stored {
                    tracing::debug!(node = addr, hash = %hash, error = %e, "create failed");
                }
                write_marker(conn, stored.is_ok()).await
            }
            Command::Shadow(hash) => {
                write_marker(conn, backend.create_shadow(addr, &hash).await.is_ok()).await
            }
            Command::Read(hash) => match backend.read(addr, &hash).await {
                Ok(data) => {
                    write_marker(conn, true).await?;
                    write_payload(conn, &data).await
                }
                Err(_) => write_marker(conn, false).await,
            },
            Command::Delete(hash) => match backend.delete(addr, &hash).await {
                Ok(outcome) => {
                    write_marker(conn, true).await?;
                    conn.write_u32_le(outcome.remaining_refs).await
                }
                Err(_) => write_marker(conn, false).await,
            },
        }
    }
}
