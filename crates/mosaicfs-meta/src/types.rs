//! Shared value types: content hashes, chunks, files, folders and the
//! metadata error.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A 32-byte BLAKE3 digest identifying a chunk's content.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkHash(pub [u8; 32]);

impl ChunkHash {
    /// Length of the raw digest in bytes.
    pub const LEN: usize = 32;

    /// Hashes `data` with BLAKE3.
    pub fn of(data: &[u8]) -> Self {
        ChunkHash(*blake3::hash(data).as_bytes())
    }

    /// Returns the hash as a lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parses a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, MetaError> {
        if s.len() != Self::LEN * 2 || !s.is_ascii() {
            return Err(MetaError::Invalid(format!("bad chunk hash '{}'", s)));
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| MetaError::Invalid(format!("bad chunk hash '{}'", s)))?;
        }
        Ok(ChunkHash(out))
    }

    /// Returns the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChunkHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Represents a point in time with second and nanosecond precision
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp {
    /// Seconds since Unix epoch
    pub secs: u64,
    /// Nanoseconds within the second
    pub nanos: u32,
}

impl Timestamp {
    /// Returns the current timestamp
    pub fn now() -> Self {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            secs: now.as_secs(),
            nanos: now.subsec_nanos(),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.secs
            .cmp(&other.secs)
            .then_with(|| self.nanos.cmp(&other.nanos))
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Error types for the lock service, the backing stores and the folder tree
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The requested folder or file does not exist.
    #[error("'{0}' does not exist")]
    NotExist(String),

    /// A folder or file already exists at the path.
    #[error("'{0}' already exists")]
    Exist(String),

    /// Malformed path, name or argument.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A file in the way is mid-write.
    #[error("'{0}' is locked by a write in progress")]
    Locked(String),

    /// An error occurred in the KV or lock store layer.
    #[error("kv store error: {0}")]
    KvError(String),
}

/// Lightweight reference to a child folder, kept in the parent's listing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderShadow {
    /// Canonical absolute path of the child.
    pub full: String,
    /// Last path component.
    pub name: String,
    /// Creation time of the referenced folder.
    pub created: Timestamp,
}

/// One content-addressed slice of a file.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChunk {
    /// Position of the chunk in the file, contiguous from 0.
    pub sequence: u32,
    /// Number of bytes covered by the chunk.
    pub size: u64,
    /// Digest of exactly `size` bytes.
    pub hash: ChunkHash,
}

/// A file entry, stored inside its parent folder document.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// File name within the parent folder.
    pub name: String,
    /// MIME type supplied by the writer.
    pub mime: String,
    /// Total size in bytes. Equals the chunk size sum once unlocked.
    pub size: u64,
    /// Creation time.
    pub created: Timestamp,
    /// Last content change.
    pub modified: Timestamp,
    /// Chunks in sequence order.
    pub chunks: Vec<DataChunk>,
    /// True while a write is in flight.
    pub locked: bool,
}

impl File {
    /// Creates an empty file entry marked as mid-write.
    pub fn new_locked(name: &str, mime: &str, size: u64) -> Self {
        let now = Timestamp::now();
        Self {
            name: name.to_string(),
            mime: mime.to_string(),
            size,
            created: now,
            modified: now,
            chunks: Vec::new(),
            locked: true,
        }
    }

    /// Sum of the chunk sizes.
    pub fn chunk_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }
}

/// A folder document. Files are embedded, sub-folders are referenced by shadow.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    /// Canonical absolute path; the unique document key.
    pub full: String,
    /// Last path component ("" for the root).
    pub name: String,
    /// Creation time.
    pub created: Timestamp,
    /// Files directly in this folder.
    pub files: Vec<File>,
    /// Child folder references.
    pub folders: Vec<FolderShadow>,
}

impl Folder {
    /// Creates an empty folder at a canonical path.
    pub fn new(full: &str) -> Self {
        Self {
            full: full.to_string(),
            name: crate::path::name(full).to_string(),
            created: Timestamp::now(),
            files: Vec::new(),
            folders: Vec::new(),
        }
    }

    /// Returns the shadow that a parent keeps for this folder.
    pub fn shadow(&self) -> FolderShadow {
        FolderShadow {
            full: self.full.clone(),
            name: self.name.clone(),
            created: self.created,
        }
    }

    /// Looks up a file by name.
    pub fn file(&self, name: &str) -> Option<&File> {
        self.files.iter().find(|f| f.name == name)
    }

    /// Looks up a file by name for mutation.
    pub fn file_mut(&mut self, name: &str) -> Option<&mut File> {
        self.files.iter_mut().find(|f| f.name == name)
    }

    /// Inserts a file, replacing any file of the same name.
    pub fn put_file(&mut self, file: File) {
        match self.files.iter_mut().find(|f| f.name == file.name) {
            Some(slot) => *slot = file,
            None => self.files.push(file),
        }
    }

    /// Removes a file by name.
    pub fn remove_file(&mut self, name: &str) -> Option<File> {
        let pos = self.files.iter().position(|f| f.name == name)?;
        Some(self.files.remove(pos))
    }

    /// Looks up a child folder reference by name.
    pub fn child(&self, name: &str) -> Option<&FolderShadow> {
        self.folders.iter().find(|s| s.name == name)
    }

    /// Adds or refreshes a child folder reference.
    pub fn put_child(&mut self, shadow: FolderShadow) {
        match self.folders.iter_mut().find(|s| s.name == shadow.name) {
            Some(slot) => *slot = shadow,
            None => self.folders.push(shadow),
        }
    }

    /// Removes a child folder reference by name.
    pub fn remove_child(&mut self, name: &str) -> Option<FolderShadow> {
        let pos = self.folders.iter().position(|s| s.name == name)?;
        Some(self.folders.remove(pos))
    }

    /// True if a file or a child folder already uses `name`.
    pub fn has_entry(&self, name: &str) -> bool {
        self.file(name).is_some() || self.child(name).is_some()
    }

    /// Name of the first mid-write file, if any.
    pub fn locked_file(&self) -> Option<&str> {
        self.files.iter().find(|f| f.locked).map(|f| f.name.as_str())
    }

    /// Bytes held by files that are not mid-write.
    pub fn settled_size(&self) -> u64 {
        self.files.iter().filter(|f| !f.locked).map(|f| f.size).sum()
    }
}
