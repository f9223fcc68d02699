//! Coordinator control messages.
//!
//! Requests carry an action selector plus free-form `options`, `size` and
//! `id` fields whose meaning depends on the action. Responses carry an
//! HTTP-style status code and a JSON body. On the wire both are JSON
//! documents framed by a little-endian `u32` length.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Success.
pub const STATUS_OK: u16 = 200;
/// Unknown cluster, node, reservation or content.
pub const STATUS_NOT_FOUND: u16 = 404;
/// Already registered.
pub const STATUS_CONFLICT: u16 = 409;
/// Malformed request.
pub const STATUS_UNPROCESSABLE: u16 = 422;
/// A mid-write file blocks the operation.
pub const STATUS_LOCKED: u16 = 423;
/// Node or store failure.
pub const STATUS_INTERNAL: u16 = 500;
/// No reachable node or cluster.
pub const STATUS_UNAVAILABLE: u16 = 503;
/// No cluster can satisfy a reservation.
pub const STATUS_INSUFFICIENT_STORAGE: u16 = 507;

/// Largest control frame accepted.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Action selector of a control request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    /// Register nodes: a new cluster, or extend cluster `id`.
    Register,
    /// Reserve `size` bytes.
    Reserve,
    /// Locate content for reading.
    ReadMap,
    /// Locate content for deletion, dropping it from the index.
    DeleteMap,
    /// Remove cluster or node `id`.
    Unregister,
    /// Finalize reservation `id`.
    Commit,
    /// Release reservation `id`.
    Discard,
    /// Resynchronize all clusters, or cluster `id`.
    Sync,
    /// List clusters.
    Clusters,
    /// Locate a single hash.
    Find,
}

/// A control request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlRequest {
    /// What to do.
    pub action: Action,
    /// Action arguments (addresses, hashes, `cluster=bytes` pairs).
    #[serde(default)]
    pub options: Vec<String>,
    /// Byte count for `reserve`.
    #[serde(default)]
    pub size: u64,
    /// Target identifier.
    #[serde(default)]
    pub id: String,
}

impl ControlRequest {
    /// A request with no arguments.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            options: Vec::new(),
            size: 0,
            id: String::new(),
        }
    }

    /// Sets `options`.
    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }

    /// Sets `size`.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets `id`.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// A control response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// HTTP-style status.
    pub status: u16,
    /// Result payload, or `{"error": ...}`.
    pub body: serde_json::Value,
}

impl ControlResponse {
    /// A 200 response.
    pub fn ok(body: serde_json::Value) -> Self {
        Self {
            status: STATUS_OK,
            body,
        }
    }

    /// An error response.
    pub fn error(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({ "error": message.into() }),
        }
    }

    /// True for a 2xx status.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Writes one length-prefixed JSON frame.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if body.len() > MAX_FRAME_SIZE as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control frame of {} bytes too large", body.len()),
        ));
    }
    w.write_u32_le(body.len() as u32).await?;
    w.write_all(&body).await?;
    w.flush().await
}

/// Reads one length-prefixed JSON frame, or `None` at a clean end of stream.
pub async fn read_frame<R, T>(r: &mut R) -> io::Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let len = match r.read_u32_le().await {
        Ok(len) => len,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("control frame of {} bytes too large", len),
        ));
    }
    let mut body = vec![0u8; len as usize];
    r.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
