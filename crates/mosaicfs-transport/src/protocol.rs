//! Storage-node wire protocol.
//!
//! Every request starts with a single command byte. Blob commands follow it
//! with the 32-byte content hash; payloads are a little-endian `u32` length
//! followed by raw bytes. Each phase is acknowledged with a single `+` or `-`.
//!
//! | cmd | request              | reply                                          |
//! |-----|----------------------|------------------------------------------------|
//! | `c` | hash                 | `-` held already, or `+` then payload → `+`/`-` |
//! | `s` | hash                 | `+` reference added, `-` not held              |
//! | `r` | hash                 | `+` payload, `-` not held                      |
//! | `d` | hash                 | `+` u32 remaining refs, `-` not held           |
//! | `p` |                      | `+`                                            |
//! | `z` |                      | `+` u64 capacity                               |
//! | `j` | string master        | `+`, `-` mode refused                          |
//! | `e` |                      | `+`/`-`                                        |
//! | `l` |                      | `+` u32 count, count × hash                    |
//! | `y` | string master        | `+`/`-`                                        |

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use mosaicfs_meta::ChunkHash;

/// Positive acknowledgement.
pub const OK: u8 = b'+';
/// Negative acknowledgement.
pub const NO: u8 = b'-';

/// Largest payload accepted on the wire.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Largest string argument accepted on the wire.
pub const MAX_STRING_SIZE: u32 = 4096;

/// A request sent to a storage node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Store a blob. The payload follows only if the node asks for it.
    Create(ChunkHash),
    /// Add a reference to a held blob.
    Shadow(ChunkHash),
    /// Read a blob.
    Read(ChunkHash),
    /// Drop a reference to a blob.
    Delete(ChunkHash),
    /// Liveness check.
    Ping,
    /// Capacity query.
    Size,
    /// Join a cluster under the given master ("" = become master).
    Join(String),
    /// Erase all content.
    Erase,
    /// List held hashes.
    Catalog,
    /// Replace content with a copy of the given master's.
    Resync(String),
}

impl Command {
    /// The command byte.
    pub fn opcode(&self) -> u8 {
        match self {
            Command::Create(_) => b'c',
            Command::Shadow(_) => b's',
            Command::Read(_) => b'r',
            Command::Delete(_) => b'd',
            Command::Ping => b'p',
            Command::Size => b'z',
            Command::Join(_) => b'j',
            Command::Erase => b'e',
            Command::Catalog => b'l',
            Command::Resync(_) => b'y',
        }
    }

    /// Short name used in errors and logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Create(_) => "create",
            Command::Shadow(_) => "shadow",
            Command::Read(_) => "read",
            Command::Delete(_) => "delete",
            Command::Ping => "ping",
            Command::Size => "size",
            Command::Join(_) => "join",
            Command::Erase => "erase",
            Command::Catalog => "catalog",
            Command::Resync(_) => "resync",
        }
    }

    /// Writes the command byte and its arguments.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> io::Result<()> {
        w.write_u8(self.opcode()).await?;
        match self {
            Command::Create(hash)
            | Command::Shadow(hash)
            | Command::Read(hash)
            | Command::Delete(hash) => write_hash(w, hash).await,
            Command::Join(master) | Command::Resync(master) => write_string(w, master).await,
            Command::Ping | Command::Size | Command::Erase | Command::Catalog => Ok(()),
        }
    }

    /// Reads the next command, or `None` if the peer closed the connection
    /// between commands.
    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Option<Self>> {
        let opcode = match r.read_u8().await {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        let cmd = match opcode {
            b'c' => Command::Create(read_hash(r).await?),
            b's' => Command::Shadow(read_hash(r).await?),
            b'r' => Command::Read(read_hash(r).await?),
            b'd' => Command::Delete(read_hash(r).await?),
            b'p' => Command::Ping,
            b'z' => Command::Size,
            b'j' => Command::Join(read_string(r).await?),
            b'e' => Command::Erase,
            b'l' => Command::Catalog,
            b'y' => Command::Resync(read_string(r).await?),
            other => return Err(invalid(format!("unknown command byte {:#04x}", other))),
        };
        Ok(Some(cmd))
    }
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Writes a `+`/`-` marker.
pub async fn write_marker<W: AsyncWrite + Unpin>(w: &mut W, ok: bool) -> io::Result<()> {
    w.write_u8(if ok { OK } else { NO }).await
}

/// Reads a marker byte. Anything other than `+`/`-` is returned as an
/// `InvalidData` error carrying the byte.
pub async fn read_marker<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<bool> {
    match r.read_u8().await? {
        OK => Ok(true),
        NO => Ok(false),
        other => Err(invalid(format!("unexpected marker {:#04x}", other))),
    }
}

/// Writes a raw 32-byte hash.
pub async fn write_hash<W: AsyncWrite + Unpin>(w: &mut W, hash: &ChunkHash) -> io::Result<()> {
    w.write_all(hash.as_bytes()).await
}

/// Reads a raw 32-byte hash.
pub async fn read_hash<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<ChunkHash> {
    let mut buf = [0u8; ChunkHash::LEN];
    r.read_exact(&mut buf).await?;
    Ok(ChunkHash(buf))
}

/// Writes a length-prefixed payload.
pub async fn write_payload<W: AsyncWrite + Unpin>(w: &mut W, data: &[u8]) -> io::Result<()> {
    let len = u32::try_from(data.len())
        .ok()
        .filter(|len| *len <= MAX_PAYLOAD_SIZE)
        .ok_or_else(|| invalid(format!("payload of {} bytes too large", data.len())))?;
    w.write_u32_le(len).await?;
    w.write_all(data).await
}

/// Reads a length-prefixed payload.
pub async fn read_payload<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Bytes> {
    let len = r.read_u32_le().await?;
    if len > MAX_PAYLOAD_SIZE {
        return Err(invalid(format!("payload of {} bytes too large", len)));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

async fn write_string<W: AsyncWrite + Unpin>(w: &mut W, s: &str) -> io::Result<()> {
    if s.len() > MAX_STRING_SIZE as usize {
        return Err(invalid(format!("string of {} bytes too large", s.len())));
    }
    w.write_u32_le(s.len() as u32).await?;
    w.write_all(s.as_bytes()).await
}

async fn read_string<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<String> {
    let len = r.read_u32_le().await?;
    if len > MAX_STRING_SIZE {
        return Err(invalid(format!("string of {} bytes too large", len)));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    String::from_utf8(buf).map_err(|e| invalid(e.to_string()))
}

/// Writes a catalog listing.
pub async fn write_catalog<W: AsyncWrite + Unpin>(w: &mut W, hashes: &[ChunkHash]) -> io::Result<()> {
    w.write_u32_le(hashes.len() as u32).await?;
    for hash in hashes {
        write_hash(w, hash).await?;
    }
    Ok(())
}

/// Reads a catalog listing.
pub async fn read_catalog<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Vec<ChunkHash>> {
    let count = r.read_u32_le().await?;
    let mut hashes = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        hashes.push(read_hash(r).await?);
    }
    Ok(hashes)
}
