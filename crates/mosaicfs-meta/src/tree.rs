//! Path-locked folder tree.
//!
//! Each folder is one document keyed by its canonical path; files live
//! inside their parent folder's document and sub-folders are referenced by
//! `FolderShadow`. Readers pass a shared barrier on every path they load,
//! writers acquire every path they touch and persist all edits in one batch.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::document::{DocumentSet, Txn};
use crate::kvstore::KvStore;
use crate::locking::{LockConfig, LockService};
use crate::lockstore::LockStore;
use crate::path;
use crate::types::{Folder, MetaError};

/// Staged folder edits: `None` means "does not exist (any more)".
pub type FolderMap = BTreeMap<String, Option<Folder>>;

/// An open folder transaction.
pub type TreeTxn = Txn<Folder>;

/// The metadata tree store.
#[derive(Clone)]
pub struct TreeStore {
    folders: DocumentSet<Folder>,
}

impl TreeStore {
    /// Creates a tree over a document store and a lock store.
    pub fn new(kv: Arc<dyn KvStore>, locks: Arc<dyn LockStore>, config: LockConfig) -> Self {
        Self {
            folders: DocumentSet::new(kv, LockService::new(locks, config, "folder")),
        }
    }

    /// Loads a folder without any locking.
    pub fn get(&self, full: &str) -> Result<Option<Folder>, MetaError> {
        self.folders.load(full)
    }

    /// Paths of every strict descendant of `full`, without locking.
    pub fn descendants(&self, full: &str) -> Result<Vec<String>, MetaError> {
        Ok(self
            .folders
            .scan(&path::descendant_prefix(full))?
            .into_iter()
            .map(|f| f.full)
            .filter(|p| path::is_descendant(p, full))
            .collect())
    }

    /// Waits for each path to be free, loads it, and hands the folders to `f`.
    ///
    /// Fails with `NotExist` if any path is absent. Nothing is persisted.
    pub async fn lock_read<I, S, F, T>(&self, paths: I, f: F) -> Result<T, MetaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce(&BTreeMap<String, Folder>) -> Result<T, MetaError>,
    {
        let loaded = self.folders.read(paths).await?;
        let mut folders = BTreeMap::new();
        for (full, folder) in loaded {
            match folder {
                Some(folder) => {
                    folders.insert(full, folder);
                }
                None => return Err(MetaError::NotExist(full)),
            }
        }
        f(&folders)
    }

    /// Loads every strict descendant of `full`, passing the barrier on each
    /// as it is discovered, and hands them to `f` in path order.
    pub async fn lock_children_of<F, T>(&self, full: &str, f: F) -> Result<T, MetaError>
    where
        F: FnOnce(&[Folder]) -> Result<T, MetaError>,
    {
        let mut children = Vec::new();
        for child in self.descendants(full)? {
            self.folders.locks().await_free(&child).await?;
            // A child removed while we waited is simply skipped.
            if let Some(folder) = self.folders.load(&child)? {
                children.push(folder);
            }
        }
        f(&children)
    }

    /// Acquires `paths`, lets `f` edit the loaded folders, and persists the
    /// result atomically. Keys are released even if `f` or the commit fails.
    pub async fn transact<I, S, F, T>(&self, paths: I, f: F) -> Result<T, MetaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        F: FnOnce(&mut FolderMap) -> Result<T, MetaError>,
    {
        let mut txn = self.begin(paths).await?;
        let out = f(txn.docs_mut())?;
        txn.commit()?;
        Ok(out)
    }

    /// Opens a transaction for callers that must await between loading and
    /// committing. Dropping it without `commit` persists nothing.
    pub async fn begin<I, S>(&self, paths: I) -> Result<TreeTxn, MetaError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.folders.begin(paths).await
    }
}

/// Creates every missing folder on the chain from the root to `full`,
/// linking each new folder into its parent. Every path on the chain must
/// already be in `folders`.
pub fn materialize(folders: &mut FolderMap, full: &str) -> Result<(), MetaError> {
    let chain = path::ancestors(full);
    for (i, p) in chain.iter().enumerate() {
        let present = folders
            .get(p)
            .ok_or_else(|| MetaError::KvError(format!("'{}' is not part of the transaction", p)))?
            .is_some();
        if present {
            continue;
        }
        let folder = Folder::new(p);
        if i > 0 {
            let parent = folders
                .get_mut(&chain[i - 1])
                .and_then(|f| f.as_mut())
                .ok_or_else(|| MetaError::NotExist(chain[i - 1].clone()))?;
            if parent.file(&folder.name).is_some() {
                return Err(MetaError::Exist(path::join(&parent.full, &folder.name)));
            }
            parent.put_child(folder.shadow());
        }
        folders.insert(p.clone(), Some(folder));
    }
    Ok(())
}
