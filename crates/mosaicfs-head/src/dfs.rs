//! Folder and file lifecycle on top of the folder tree and the chunk store.
//!
//! Every metadata change is a tree transaction over the folders it touches.
//! A file write marks the entry locked, releases the tree, moves the data,
//! then settles the entry in a second transaction. Moves, copies and deletes
//! refuse to touch a subtree that holds a locked file.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use mosaicfs_meta::path::{self, ROOT};
use mosaicfs_meta::tree::materialize;
use mosaicfs_meta::{DataChunk, File, Folder, FolderMap, MetaError, Timestamp, TreeStore, TreeTxn};
use mosaicfs_mgmt::ClusterCoordinator;
use mosaicfs_transport::NodeClient;

use crate::chunks::ChunkStore;
use crate::config::DfsConfig;
use crate::error::{FsError, Result};

/// What a path resolves to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    /// A folder document.
    Folder(Folder),
    /// A file entry.
    File(File),
}

fn folder_mut<'a>(folders: &'a mut FolderMap, full: &str) -> std::result::Result<&'a mut Folder, MetaError> {
    folders
        .get_mut(full)
        .and_then(|f| f.as_mut())
        .ok_or_else(|| MetaError::NotExist(full.to_string()))
}

/// Fails with `Locked` naming the first mid-write file.
fn ensure_settled<'a, I>(folders: I) -> std::result::Result<(), MetaError>
where
    I: IntoIterator<Item = &'a Folder>,
{
    for folder in folders {
        if let Some(name) = folder.locked_file() {
            return Err(MetaError::Locked(path::join(&folder.full, name)));
        }
    }
    Ok(())
}

fn subtree_of(txn: &TreeTxn, root: &str, descendants: &[String]) -> Result<Vec<Folder>> {
    let head = txn
        .get(root)
        .cloned()
        .ok_or_else(|| FsError::NotExist(root.to_string()))?;
    let mut out = vec![head];
    out.extend(descendants.iter().filter_map(|p| txn.get(p).cloned()));
    Ok(out)
}

/// Splits a cleaned non-root path into parent and name.
fn split(full: &str, what: &str) -> Result<(String, String)> {
    if full == ROOT {
        return Err(FsError::Invalid(format!("{} cannot be the root folder", what)));
    }
    Ok((path::parent(full).to_string(), path::name(full).to_string()))
}

/// The path engine.
#[derive(Clone)]
pub struct Dfs {
    tree: TreeStore,
    chunks: ChunkStore,
    coordinator: Arc<ClusterCoordinator>,
}

impl Dfs {
    /// Creates an engine over a folder tree and a coordinator.
    pub fn new(
        tree: TreeStore,
        coordinator: Arc<ClusterCoordinator>,
        nodes: Arc<dyn NodeClient>,
        config: DfsConfig,
    ) -> Self {
        Self {
            tree,
            chunks: ChunkStore::new(coordinator.clone(), nodes, config),
            coordinator,
        }
    }

    /// The folder tree.
    pub fn tree(&self) -> &TreeStore {
        &self.tree
    }

    /// The chunk store.
    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Creates a folder and any missing ancestors.
    pub async fn create_folder(&self, path: &str) -> Result<Folder> {
        let full = path::clean(path)?;
        let folder = self
            .tree
            .transact(path::ancestors(&full), |folders| {
                if folders.get(&full).map(Option::is_some).unwrap_or(false) {
                    return Err(MetaError::Exist(full.clone()));
                }
                materialize(folders, &full)?;
                Ok(folder_mut(folders, &full)?.clone())
            })
            .await?;
        tracing::debug!(path = %full, "folder created");
        Ok(folder)
    }

    /// Writes `size` bytes from `reader` to a file at `path`.
    ///
    /// The entry stays locked while data moves. If the upload fails the
    /// entry is removed again; if old content cannot be released on
    /// overwrite, the entry is left unlocked and empty.
    pub async fn create_file<R>(
        &self,
        path: &str,
        mime: &str,
        size: u64,
        reader: &mut R,
        overwrite: bool,
    ) -> Result<File>
    where
        R: AsyncRead + Unpin,
    {
        let full = path::clean(path)?;
        let (parent, name) = split(&full, "a file")?;

        let previous = self
            .tree
            .transact(path::ancestors(&parent), |folders| {
                materialize(folders, &parent)?;
                let dir = folder_mut(folders, &parent)?;
                if dir.child(&name).is_some() {
                    return Err(MetaError::Exist(full.clone()));
                }
                let mut file = File::new_locked(&name, mime, size);
                let previous = match dir.file(&name) {
                    Some(old) if old.locked => return Err(MetaError::Locked(full.clone())),
                    Some(_) if !overwrite => return Err(MetaError::Exist(full.clone())),
                    Some(old) => {
                        file.created = old.created;
                        old.chunks.clone()
                    }
                    None => Vec::new(),
                };
                dir.put_file(file);
                Ok(previous)
            })
            .await?;

        if !previous.is_empty() {
            if let Err(e) = self.chunks.release(&previous).await {
                tracing::warn!(path = %full, error = %e, "old content not released, leaving file empty");
                self.settle(&parent, &name, |file| {
                    file.size = 0;
                    file.chunks.clear();
                })
                .await?;
                return Err(e);
            }
        }

        let chunks = match self.store_stream(size, reader).await {
            Ok(chunks) => chunks,
            Err(e) => {
                let removed = self
                    .tree
                    .transact([parent.as_str()], |folders| {
                        folder_mut(folders, &parent)?.remove_file(&name);
                        Ok(())
                    })
                    .await;
                if let Err(meta) = removed {
                    tracing::error!(path = %full, error = %meta, "failed write left a locked entry");
                }
                return Err(e);
            }
        };

        let mime = mime.to_string();
        let file = self
            .settle(&parent, &name, move |file| {
                file.size = size;
                file.mime = mime;
                file.chunks = chunks;
            })
            .await?;
        tracing::info!(path = %full, size, chunks = file.chunks.len(), "file written");
        Ok(file)
    }

    /// Applies `f` to a file and unlocks it.
    async fn settle<F>(&self, parent: &str, name: &str, f: F) -> Result<File>
    where
        F: FnOnce(&mut File),
    {
        let full = path::join(parent, name);
        let file = self
            .tree
            .transact([parent], |folders| {
                let file = folder_mut(folders, parent)?
                    .file_mut(name)
                    .ok_or_else(|| MetaError::NotExist(full.clone()))?;
                f(&mut *file);
                file.locked = false;
                file.modified = Timestamp::now();
                Ok(file.clone())
            })
            .await?;
        Ok(file)
    }

    /// Reserves, uploads and commits. Nothing is reserved for an empty file.
    async fn store_stream<R>(&self, size: u64, reader: &mut R) -> Result<Vec<DataChunk>>
    where
        R: AsyncRead + Unpin,
    {
        if size == 0 {
            return Ok(Vec::new());
        }
        let map = self.coordinator.reserve(size).await?;
        let upload = match self.chunks.upload(&map, reader).await {
            Ok(upload) => upload,
            Err(e) => {
                if let Err(d) = self.coordinator.discard(&map.id).await {
                    tracing::warn!(reservation = %map.id, error = %d, "discard failed");
                }
                return Err(e);
            }
        };
        if let Err(e) = self.coordinator.commit(&map.id, &upload.used).await {
            self.chunks.revert(&upload.placements).await;
            if let Err(d) = self.coordinator.discard(&map.id).await {
                tracing::debug!(reservation = %map.id, error = %d, "discard after failed commit");
            }
            return Err(e.into());
        }
        Ok(upload.chunks)
    }

    /// Resolves `path` to a folder, or failing that to a file.
    pub async fn read(&self, path: &str) -> Result<Entry> {
        let full = path::clean(path)?;
        let key = full.clone();
        match self
            .tree
            .lock_read([full.as_str()], move |f| Ok(f.get(&key).cloned()))
            .await
        {
            Ok(Some(folder)) => return Ok(Entry::Folder(folder)),
            Ok(None) => {}
            Err(MetaError::NotExist(_)) if full == ROOT => return Ok(Entry::Folder(Folder::new(ROOT))),
            Err(MetaError::NotExist(_)) => {}
            Err(e) => return Err(e.into()),
        }
        self.read_file_entry(&full).await.map(Entry::File)
    }

    async fn read_file_entry(&self, full: &str) -> Result<File> {
        let (parent, name) = split(full, "a file")?;
        let found = self
            .tree
            .lock_read([parent.as_str()], |f| {
                Ok(f.get(&parent).and_then(|dir| dir.file(&name)).cloned())
            })
            .await;
        match found {
            Ok(Some(file)) => Ok(file),
            Ok(None) | Err(MetaError::NotExist(_)) => Err(FsError::NotExist(full.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    /// Streams a file's content to `writer` in chunk order. Returns the
    /// number of bytes written.
    pub async fn read_file<W>(&self, path: &str, writer: &mut W) -> Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let full = path::clean(path)?;
        let file = self.read_file_entry(&full).await?;
        if file.locked {
            return Err(FsError::Locked(full));
        }
        let mut chunks = file.chunks.clone();
        chunks.sort_by_key(|c| c.sequence);
        let mut written = 0u64;
        for chunk in &chunks {
            let data = self.chunks.fetch(chunk).await?;
            writer.write_all(&data).await?;
            written += data.len() as u64;
        }
        writer.flush().await?;
        tracing::debug!(path = %full, bytes = written, "file read");
        Ok(written)
    }

    /// Bytes held by settled files in the folder and every folder below it.
    pub async fn size(&self, path: &str) -> Result<u64> {
        let full = path::clean(path)?;
        let key = full.clone();
        let own = match self
            .tree
            .lock_read([full.as_str()], move |f| {
                Ok(f.get(&key).map(Folder::settled_size).unwrap_or(0))
            })
            .await
        {
            Ok(n) => n,
            Err(MetaError::NotExist(_)) if full == ROOT => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let nested = self
            .tree
            .lock_children_of(&full, |children| {
                Ok(children.iter().map(Folder::settled_size).sum::<u64>())
            })
            .await?;
        Ok(own + nested)
    }

    /// Locks `root`, its descendants and `extra`, rescanning until the
    /// descendant set is stable under the lock. With `relocate_to`, the
    /// paths the subtree lands on there are locked as well.
    async fn lock_subtree(
        &self,
        root: &str,
        extra: &[String],
        relocate_to: Option<&str>,
    ) -> Result<(TreeTxn, Vec<String>)> {
        loop {
            let descendants = self.tree.descendants(root)?;
            let subtree: Vec<String> = std::iter::once(root.to_string())
                .chain(descendants.iter().cloned())
                .collect();
            let relocated: Vec<String> = match relocate_to {
                Some(dst) => subtree.iter().map(|p| path::rebase(p, root, dst)).collect(),
                None => Vec::new(),
            };
            let keys = extra.iter().cloned().chain(subtree).chain(relocated);
            let txn = self.tree.begin(keys).await?;
            if self.tree.descendants(root)? == descendants {
                return Ok((txn, descendants));
            }
            tracing::debug!(root, "subtree changed while locking, retrying");
        }
    }

    /// Deletes the folder or file at `path`.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let full = path::clean(path)?;
        if full == ROOT || self.tree.get(&full)?.is_some() {
            self.delete_folder(&full).await
        } else {
            self.delete_file(&full).await
        }
    }

    /// Deletes a file and releases its content.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        let full = path::clean(path)?;
        let (parent, name) = split(&full, "a file")?;
        let mut txn = self.tree.begin([parent.as_str()]).await?;
        let file = txn
            .get(&parent)
            .and_then(|dir| dir.file(&name))
            .cloned()
            .ok_or_else(|| FsError::NotExist(full.clone()))?;
        if file.locked {
            return Err(FsError::Locked(full));
        }
        self.chunks.release(&file.chunks).await?;
        folder_mut(txn.docs_mut(), &parent)?.remove_file(&name);
        txn.commit()?;
        tracing::info!(path = %full, "file deleted");
        Ok(())
    }

    /// Deletes a folder with everything below it.
    pub async fn delete_folder(&self, path: &str) -> Result<()> {
        let full = path::clean(path)?;
        let (parent, name) = split(&full, "a deleted folder")?;
        let (mut txn, descendants) = self.lock_subtree(&full, std::slice::from_ref(&parent), None).await?;
        let subtree = subtree_of(&txn, &full, &descendants)?;
        ensure_settled(&subtree)?;

        let chunks: Vec<DataChunk> = subtree
            .iter()
            .flat_map(|f| f.files.iter())
            .flat_map(|file| file.chunks.iter().copied())
            .collect();
        self.chunks.release(&chunks).await?;

        for folder in &subtree {
            txn.remove(&folder.full);
        }
        if let Some(dir) = txn.get_mut(&parent) {
            dir.remove_child(&name);
        }
        txn.commit()?;
        tracing::info!(path = %full, folders = subtree.len(), chunks = chunks.len(), "folder deleted");
        Ok(())
    }

    /// Moves a file. An existing target is replaced only with `overwrite`.
    pub async fn move_file(&self, src: &str, dst: &str, overwrite: bool) -> Result<File> {
        self.transfer_file(src, dst, overwrite, Transfer::Move).await
    }

    /// Copies a file by adding references to its content.
    pub async fn copy_file(&self, src: &str, dst: &str, overwrite: bool) -> Result<File> {
        self.transfer_file(src, dst, overwrite, Transfer::Copy).await
    }

    /// Moves a folder and everything below it.
    pub async fn move_folder(&self, src: &str, dst: &str, overwrite: bool) -> Result<Folder> {
        self.transfer_folder(src, dst, overwrite, Transfer::Move).await
    }

    /// Copies a folder and everything below it by adding references to
    /// every file's content.
    pub async fn copy_folder(&self, src: &str, dst: &str, overwrite: bool) -> Result<Folder> {
        self.transfer_folder(src, dst, overwrite, Transfer::Copy).await
    }

    async fn transfer_file(&self, src: &str, dst: &str, overwrite: bool, mode: Transfer) -> Result<File> {
        let src = path::clean(src)?;
        let dst = path::clean(dst)?;
        let (src_parent, src_name) = split(&src, "a file")?;
        let (dst_parent, dst_name) = split(&dst, "a file")?;
        if src == dst {
            return Err(FsError::Invalid(format!("cannot {} {} onto itself", mode, src)));
        }

        for attempt in 0..2 {
            let mut keys = path::ancestors(&dst_parent);
            keys.push(src_parent.clone());
            let mut txn = self.tree.begin(keys).await?;

            let file = txn
                .get(&src_parent)
                .and_then(|dir| dir.file(&src_name))
                .cloned()
                .ok_or_else(|| FsError::NotExist(src.clone()))?;
            if file.locked {
                return Err(FsError::Locked(src));
            }
            materialize(txn.docs_mut(), &dst_parent)?;
            if folder_mut(txn.docs_mut(), &dst_parent)?.has_entry(&dst_name) {
                if !overwrite || attempt > 0 {
                    return Err(FsError::Exist(dst));
                }
                drop(txn);
                self.delete(&dst).await?;
                continue;
            }

            let mut placed = file.clone();
            placed.name = dst_name.clone();
            let shared = match mode {
                Transfer::Move => {
                    folder_mut(txn.docs_mut(), &src_parent)?.remove_file(&src_name);
                    Vec::new()
                }
                Transfer::Copy => {
                    let now = Timestamp::now();
                    placed.created = now;
                    placed.modified = now;
                    self.chunks.share(&file.chunks).await?
                }
            };
            folder_mut(txn.docs_mut(), &dst_parent)?.put_file(placed.clone());
            if let Err(e) = txn.commit() {
                self.chunks.revert(&shared).await;
                return Err(e.into());
            }
            tracing::info!(src = %src, dst = %dst, op = %mode, "file transferred");
            return Ok(placed);
        }
        Err(FsError::Exist(dst))
    }

    async fn transfer_folder(&self, src: &str, dst: &str, overwrite: bool, mode: Transfer) -> Result<Folder> {
        let src = path::clean(src)?;
        let dst = path::clean(dst)?;
        let (src_parent, src_name) = split(&src, "a moved or copied folder")?;
        let (dst_parent, dst_name) = split(&dst, "a target folder")?;
        if src == dst || path::is_descendant(&dst, &src) || path::is_descendant(&src, &dst) {
            return Err(FsError::Invalid(format!("cannot {} {} onto {}", mode, src, dst)));
        }

        for attempt in 0..2 {
            let mut extra = path::ancestors(&dst_parent);
            extra.push(src_parent.clone());
            let (mut txn, descendants) = self.lock_subtree(&src, &extra, Some(&dst)).await?;
            let subtree = subtree_of(&txn, &src, &descendants)?;
            ensure_settled(&subtree)?;

            materialize(txn.docs_mut(), &dst_parent)?;
            if folder_mut(txn.docs_mut(), &dst_parent)?.has_entry(&dst_name) {
                if !overwrite || attempt > 0 {
                    return Err(FsError::Exist(dst));
                }
                drop(txn);
                self.delete(&dst).await?;
                continue;
            }

            let created = match mode {
                Transfer::Move => None,
                Transfer::Copy => Some(Timestamp::now()),
            };
            let relocated: Vec<Folder> = subtree
                .iter()
                .map(|folder| {
                    let mut f = folder.clone();
                    f.full = path::rebase(&folder.full, &src, &dst);
                    f.name = path::name(&f.full).to_string();
                    for child in &mut f.folders {
                        child.full = path::rebase(&child.full, &src, &dst);
                    }
                    if let Some(now) = created {
                        f.created = now;
                        for child in &mut f.folders {
                            child.created = now;
                        }
                    }
                    f
                })
                .collect();

            let shared = match mode {
                Transfer::Move => {
                    for folder in &subtree {
                        txn.remove(&folder.full);
                    }
                    folder_mut(txn.docs_mut(), &src_parent)?.remove_child(&src_name);
                    Vec::new()
                }
                Transfer::Copy => {
                    let chunks: Vec<DataChunk> = subtree
                        .iter()
                        .flat_map(|f| f.files.iter())
                        .flat_map(|file| file.chunks.iter().copied())
                        .collect();
                    self.chunks.share(&chunks).await?
                }
            };

            let head = relocated[0].clone();
            for folder in relocated {
                txn.put(folder);
            }
            folder_mut(txn.docs_mut(), &dst_parent)?.put_child(head.shadow());
            if let Err(e) = txn.commit() {
                self.chunks.revert(&shared).await;
                return Err(e.into());
            }
            tracing::info!(src = %src, dst = %dst, op = %mode, folders = subtree.len(), "folder transferred");
            return Ok(head);
        }
        Err(FsError::Exist(dst))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Transfer {
    Move,
    Copy,
}

impl std::fmt::Display for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transfer::Move => write!(f, "move"),
            Transfer::Copy => write!(f, "copy"),
        }
    }
}
