//! Path engine scenarios over a simulated fleet.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use mosaicfs_head::{Entry, FsError};
use mosaicfs_meta::path;
use mosaicfs_meta::tree::materialize;
use mosaicfs_meta::File;
use proptest::prelude::*;

use crate::harness::{pattern, TestEnv};

const MIB: u64 = 1024 * 1024;

#[tokio::test]
async fn test_create_folder_then_again_is_exist() {
    let env = TestEnv::with_chunk_size(32);
    for p in ["/a", "/a/b/c", "/x y/z"] {
        env.dfs().create_folder(p).await.unwrap();
        assert!(matches!(env.dfs().create_folder(p).await, Err(FsError::Exist(_))));
        assert!(matches!(env.dfs().read(p).await.unwrap(), Entry::Folder(f) if f.full == p));
    }
}

#[tokio::test]
async fn test_write_then_read_back_across_clusters() {
    let env = TestEnv::with_chunk_size(64);
    let a = env.cluster(&["a1", "a2"], 200).await.unwrap();
    let b = env.cluster(&["b1"], 200).await.unwrap();
    let data = pattern(300, 5);

    let file = env.write("/data/blob.bin", &data).await.unwrap();
    assert_eq!(file.size, 300);
    assert_eq!(file.chunk_bytes(), 300);
    let sequences: Vec<u32> = file.chunks.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
    assert_eq!(env.read("/data/blob.bin").await.unwrap(), data);

    // 300 bytes do not fit one 200-byte cluster
    assert!(env.used(&a.id).unwrap() > 0);
    assert!(env.used(&b.id).unwrap() > 0);
    assert_eq!(env.used(&a.id).unwrap() + env.used(&b.id).unwrap(), 300);
}

#[tokio::test]
async fn test_read_falls_back_to_synced_replica() {
    let env = TestEnv::with_chunk_size(64);
    let cluster = env.cluster(&["m", "s"], 1024).await.unwrap();
    let data = pattern(100, 9);
    env.write("/f", &data).await.unwrap();
    env.coordinator().sync_cluster(&cluster.id).await.unwrap();

    env.net().node("m").unwrap().set_down(true);
    assert_eq!(env.read("/f").await.unwrap(), data);
}

#[tokio::test]
async fn test_locked_file_is_invisible_to_size_and_blocks_changes() {
    let env = TestEnv::with_chunk_size(32);
    env.cluster(&["n"], 1024).await.unwrap();
    env.write("/proj/src/main.rs", &pattern(40, 1)).await.unwrap();
    env.dfs()
        .tree()
        .transact(path::ancestors("/proj/src"), |folders| {
            materialize(folders, "/proj/src")?;
            if let Some(Some(src)) = folders.get_mut("/proj/src") {
                src.put_file(File::new_locked("wip.rs", "text/x-rust", 500));
            }
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(env.dfs().size("/proj").await.unwrap(), 40);
    let locked = |e: FsError| matches!(e, FsError::Locked(_));
    assert!(locked(env.dfs().move_file("/proj/src/wip.rs", "/wip.rs", false).await.unwrap_err()));
    assert!(locked(env.dfs().copy_file("/proj/src/wip.rs", "/wip.rs", false).await.unwrap_err()));
    assert!(locked(env.dfs().delete_file("/proj/src/wip.rs").await.unwrap_err()));
    assert!(locked(env.dfs().move_folder("/proj", "/old", false).await.unwrap_err()));
    assert!(locked(env.dfs().copy_folder("/proj/src", "/bak", false).await.unwrap_err()));
    assert!(locked(env.dfs().delete_folder("/proj").await.unwrap_err()));
    assert_eq!(FsError::Locked("/x".into()).status_code(), 423);
}

#[tokio::test]
async fn test_write_in_flight_locks_entry() {
    let env = Arc::new(TestEnv::with_chunk_size(8));
    env.cluster(&["n"], 1024).await.unwrap();

    let (mut tx, mut rx) = tokio::io::duplex(64);
    let writer = {
        let env = env.clone();
        tokio::spawn(async move {
            env.dfs()
                .create_file("/slow", "text/plain", 16, &mut rx, false)
                .await
        })
    };
    tokio::io::AsyncWriteExt::write_all(&mut tx, b"first half").await.unwrap();

    let mut locked_seen = false;
    for _ in 0..200 {
        if let Ok(Entry::File(f)) = env.dfs().read("/slow").await {
            if f.locked {
                locked_seen = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(locked_seen);
    assert_eq!(env.dfs().size("/").await.unwrap(), 0);
    // sibling metadata stays writable during the upload
    env.dfs().create_folder("/sibling").await.unwrap();
    assert!(matches!(env.dfs().delete("/slow").await, Err(FsError::Locked(_))));

    tokio::io::AsyncWriteExt::write_all(&mut tx, b"!!!!!!").await.unwrap();
    let file = writer.await.unwrap().unwrap();
    assert!(!file.locked);
    assert_eq!(env.read("/slow").await.unwrap(), b"first half!!!!!!");
    assert_eq!(env.dfs().size("/").await.unwrap(), 16);
}

#[tokio::test]
async fn test_copy_sends_no_payload() {
    let env = TestEnv::with_chunk_size(16);
    env.cluster(&["n"], 1024).await.unwrap();
    let original = env.write("/a/report.pdf", &pattern(100, 2)).await.unwrap();
    let before = env.payloads(&["n"]);

    let copy = env.dfs().copy_file("/a/report.pdf", "/b/report.pdf", false).await.unwrap();
    env.dfs().copy_folder("/a", "/c", false).await.unwrap();

    assert_eq!(env.payloads(&["n"]), before);
    let hashes = |f: &File| f.chunks.iter().map(|c| c.hash).collect::<Vec<_>>();
    assert_eq!(hashes(&copy), hashes(&original));
    match env.dfs().read("/c/report.pdf").await.unwrap() {
        Entry::File(f) => assert_eq!(hashes(&f), hashes(&original)),
        other => panic!("expected file, got {:?}", other),
    }
    let node = env.net().node("n").unwrap();
    for chunk in &original.chunks {
        assert_eq!(node.refs(&chunk.hash), 3);
    }
}

#[tokio::test]
async fn test_move_folder_keeps_file_hash() {
    let env = TestEnv::with_chunk_size(32);
    env.cluster(&["n"], 1024).await.unwrap();
    let child = env.write("/a/child.txt", b"hello from a").await.unwrap();
    env.dfs().create_folder("/b").await.unwrap();

    env.dfs().move_folder("/a", "/b/a", false).await.unwrap();
    assert!(matches!(env.dfs().read("/a").await, Err(FsError::NotExist(_))));
    match env.dfs().read("/b/a/child.txt").await.unwrap() {
        Entry::File(f) => assert_eq!(f.chunks[0].hash, child.chunks[0].hash),
        other => panic!("expected file, got {:?}", other),
    }
    assert_eq!(env.read("/b/a/child.txt").await.unwrap(), b"hello from a");
}

#[tokio::test]
async fn test_delete_returns_capacity_to_nodes() {
    let env = TestEnv::with_chunk_size(16);
    let c = env.cluster(&["n"], 1024).await.unwrap();
    env.write("/t/one", &pattern(50, 1)).await.unwrap();
    env.write("/t/sub/two", &pattern(20, 2)).await.unwrap();
    env.dfs().copy_file("/t/one", "/keep", false).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 70);

    env.dfs().delete("/t").await.unwrap();
    let node = env.net().node("n").unwrap();
    // only the chunks of the copy remain
    assert_eq!(node.blob_count(), 4);
    assert_eq!(env.used(&c.id).unwrap(), 50);
    env.dfs().delete("/keep").await.unwrap();
    assert_eq!(node.blob_count(), 0);
    assert_eq!(env.used(&c.id).unwrap(), 0);
}

#[tokio::test]
async fn test_large_file_in_default_chunks() {
    let env = TestEnv::with_chunk_size(32 * MIB);
    env.cluster(&["n"], 100 * MIB).await.unwrap();
    let data = pattern((32 * MIB + 1024) as usize, 7);
    let file = env.write("/big", &data).await.unwrap();
    assert_eq!(file.chunks.len(), 2);
    assert_eq!(file.chunks[1].size, 1024);
    assert_eq!(env.read("/big").await.unwrap(), data);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_content_round_trips(
        data in prop::collection::vec(any::<u8>(), 0..200),
        chunk in 1u64..48,
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let back = rt.block_on(async {
            let env = TestEnv::with_chunk_size(chunk);
            env.cluster(&["n"], 4096).await.unwrap();
            env.write("/p/f", &data).await.unwrap();
            env.read("/p/f").await.unwrap()
        });
        prop_assert_eq!(back, data);
    }

    #[test]
    fn prop_size_counts_settled_bytes(sizes in prop::collection::vec(0usize..64, 1..6)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (total, names) = rt.block_on(async {
            let env = TestEnv::with_chunk_size(16);
            env.cluster(&["n"], 4096).await.unwrap();
            let mut names = BTreeSet::new();
            for (i, len) in sizes.iter().enumerate() {
                let p = format!("/d{}/f{}", i % 2, i);
                env.write(&p, &pattern(*len, i as u8)).await.unwrap();
                names.insert(p);
            }
            (env.dfs().size("/").await.unwrap(), names)
        });
        prop_assert_eq!(total, sizes.iter().sum::<usize>() as u64);
        prop_assert_eq!(names.len(), sizes.len());
    }
}
