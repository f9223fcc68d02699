//! Integration tests for the folder tree under concurrent writers, over
//! both lock-store backends.

use std::sync::Arc;
use std::time::Duration;

use mosaicfs_meta::tree::materialize;
use mosaicfs_meta::{path, File, KvStore, LockBackend, LockConfig, MemoryKvStore, TreeStore};

fn store(backend: LockBackend) -> TreeStore {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    TreeStore::new(
        kv,
        backend.build(),
        LockConfig {
            poll_interval_ms: 1,
            ttl_secs: 30,
        },
    )
}

async fn add_file(tree: &TreeStore, dir: &str, name: &str) {
    tree.transact(path::ancestors(dir), |folders| {
        materialize(folders, dir)?;
        if let Some(Some(folder)) = folders.get_mut(dir) {
            folder.put_file(File::new_locked(name, "text/plain", 0));
        }
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_concurrent_writers_lose_no_updates() {
    for backend in [LockBackend::Standalone, LockBackend::Clustered { shards: 4 }] {
        let tree = store(backend);
        let mut tasks = Vec::new();
        for i in 0..16 {
            let tree = tree.clone();
            let dir = if i % 2 == 0 { "/shared" } else { "/shared/deep/er" };
            tasks.push(tokio::spawn(async move {
                add_file(&tree, dir, &format!("f{}", i)).await;
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(tree.get("/shared").unwrap().unwrap().files.len(), 8);
        assert_eq!(tree.get("/shared/deep/er").unwrap().unwrap().files.len(), 8);
        let root = tree.get("/").unwrap().unwrap();
        assert_eq!(root.folders.len(), 1);
        assert_eq!(tree.descendants("/shared").unwrap(), vec!["/shared/deep", "/shared/deep/er"]);
    }
}

#[tokio::test]
async fn test_overlapping_transactions_do_not_deadlock() {
    let tree = store(LockBackend::Clustered { shards: 3 });
    add_file(&tree, "/a", "seed").await;
    add_file(&tree, "/b", "seed").await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let tree = tree.clone();
        let keys = if i % 2 == 0 { ["/a", "/b"] } else { ["/b", "/a"] };
        tasks.push(tokio::spawn(async move {
            tree.transact(keys, |folders| {
                for dir in ["/a", "/b"] {
                    if let Some(Some(folder)) = folders.get_mut(dir) {
                        folder.put_file(File::new_locked(&format!("t{}", i), "text/plain", 0));
                    }
                }
                Ok(())
            })
            .await
        }));
    }
    let joined = tokio::time::timeout(Duration::from_secs(10), async {
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    })
    .await;
    assert!(joined.is_ok());
    assert_eq!(tree.get("/a").unwrap().unwrap().files.len(), 11);
    assert_eq!(tree.get("/b").unwrap().unwrap().files.len(), 11);
}

#[tokio::test]
async fn test_reader_sees_committed_state_only() {
    let tree = store(LockBackend::Standalone);
    add_file(&tree, "/docs", "one").await;

    let mut txn = tree.begin(["/docs"]).await.unwrap();
    if let Some(Some(folder)) = txn.docs_mut().get_mut("/docs") {
        folder.put_file(File::new_locked("two", "text/plain", 0));
    }
    let reader = {
        let tree = tree.clone();
        tokio::spawn(async move { tree.lock_read(["/docs"], |f| Ok(f["/docs"].files.len())).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!reader.is_finished());
    txn.commit().unwrap();
    assert_eq!(reader.await.unwrap().unwrap(), 2);
}
