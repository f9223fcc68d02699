//! Reservation, mastership and sync scenarios, driven through the path
//! engine where a head would drive them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use mosaicfs_head::FsError;
use mosaicfs_mgmt::registry::node_id;
use mosaicfs_transport::NodeRole;
use proptest::prelude::*;

use crate::harness::{pattern, TestEnv};

const MIB: u64 = 1024 * 1024;

#[tokio::test]
async fn test_reserve_then_discard_leaves_used_unchanged() {
    let env = TestEnv::with_chunk_size(32 * MIB);
    let c = env.cluster(&["n"], 100 * MIB).await.unwrap();
    env.write("/seed", &pattern(1000, 1)).await.unwrap();
    let before = env.used(&c.id).unwrap();

    let map = env.coordinator().reserve(10 * MIB).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), before + 10 * MIB);
    env.coordinator().discard(&map.id).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), before);
}

#[tokio::test]
async fn test_commit_keeps_only_consumed_bytes() {
    let env = TestEnv::with_chunk_size(32 * MIB);
    let c = env.cluster(&["n"], 100 * MIB).await.unwrap();

    let map = env.coordinator().reserve(8 * MIB).await.unwrap();
    let used = BTreeMap::from([(c.id.clone(), 3 * MIB)]);
    env.coordinator().commit(&map.id, &used).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 3 * MIB);
    assert!(env.coordinator().registry().get(&c.id).unwrap().unwrap().reservations.is_empty());
}

#[tokio::test]
async fn test_two_chunk_reservation_on_one_cluster() {
    let env = TestEnv::with_chunk_size(32 * MIB);
    let c = env.cluster(&["n"], 100 * MIB).await.unwrap();

    let map = env.coordinator().reserve(64 * MIB).await.unwrap();
    assert_eq!(map.entries.len(), 2);
    assert!(map.entries.iter().all(|e| e.cluster_id == c.id && e.size == 32 * MIB));
    assert_eq!(env.used(&c.id).unwrap(), 64 * MIB);

    env.coordinator().commit(&map.id, &map.per_cluster()).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 64 * MIB);
}

#[tokio::test]
async fn test_write_without_room_fails_cleanly() {
    let env = TestEnv::with_chunk_size(16);
    let c = env.cluster(&["n"], 64).await.unwrap();

    let err = env.write("/too/big", &pattern(100, 3)).await.unwrap_err();
    assert!(matches!(
        err,
        crate::HarnessError::Fs(FsError::Manager(mosaicfs_mgmt::ManagerError::NoSpace { .. }))
    ));
    assert_eq!(env.used(&c.id).unwrap(), 0);
    assert!(matches!(env.dfs().read("/too/big").await, Err(FsError::NotExist(_))));
}

#[tokio::test]
async fn test_failed_upload_releases_reservation() {
    let env = TestEnv::with_chunk_size(16);
    let c = env.cluster(&["n"], 1024).await.unwrap();
    env.net().node("n").unwrap().set_down(true);

    assert!(env.write("/lost", &pattern(40, 4)).await.is_err());
    assert_eq!(env.used(&c.id).unwrap(), 0);
    assert!(env.coordinator().registry().get(&c.id).unwrap().unwrap().reservations.is_empty());
    assert!(matches!(env.dfs().read("/lost").await, Err(FsError::NotExist(_))));

    env.net().node("n").unwrap().set_down(false);
    env.write("/lost", &pattern(40, 4)).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 40);
}

#[tokio::test]
async fn test_delete_frees_room_for_the_next_write() {
    let env = TestEnv::with_chunk_size(16);
    let c = env.cluster(&["n"], 100).await.unwrap();

    env.write("/first", &pattern(80, 1)).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 80);
    env.dfs().delete("/first").await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 0);

    let data = pattern(80, 2);
    env.write("/second", &data).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 80);
    assert_eq!(env.read("/second").await.unwrap(), data);
}

#[tokio::test]
async fn test_shared_content_is_freed_with_its_last_file() {
    let env = TestEnv::with_chunk_size(16);
    let c = env.cluster(&["n"], 100).await.unwrap();
    env.write("/orig", &pattern(80, 3)).await.unwrap();

    env.dfs().copy_file("/orig", "/copy", false).await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 80);
    env.dfs().delete("/orig").await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 80);
    env.dfs().delete("/copy").await.unwrap();
    assert_eq!(env.used(&c.id).unwrap(), 0);
    assert_eq!(env.net().node("n").unwrap().blob_count(), 0);
}

#[tokio::test]
async fn test_concurrent_writes_are_all_accounted() {
    let env = Arc::new(TestEnv::with_chunk_size(32));
    let a = env.cluster(&["a"], 4096).await.unwrap();
    let b = env.cluster(&["b"], 4096).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8usize {
        let env = env.clone();
        tasks.push(tokio::spawn(async move {
            let data = pattern(100 + i * 10, i as u8);
            env.write(&format!("/w/{}", i), &data).await.map(|_| data)
        }));
    }
    let mut total = 0;
    for (i, task) in tasks.into_iter().enumerate() {
        let data = task.await.unwrap().unwrap();
        total += data.len() as u64;
        assert_eq!(env.read(&format!("/w/{}", i)).await.unwrap(), data);
    }
    assert_eq!(env.used(&a.id).unwrap() + env.used(&b.id).unwrap(), total);
    assert_eq!(env.dfs().size("/w").await.unwrap(), total);
}

#[tokio::test]
async fn test_master_loss_promotes_next_node() {
    let env = TestEnv::with_chunk_size(32);
    let c = env.cluster(&["m", "s1", "s2"], 4096).await.unwrap();
    let data = pattern(90, 6);
    env.write("/kept", &data).await.unwrap();
    env.coordinator().sync_cluster(&c.id).await.unwrap();

    env.coordinator().unregister(&node_id("m", 4096)).await.unwrap();
    let cluster = env.coordinator().registry().get(&c.id).unwrap().unwrap();
    assert_eq!(cluster.nodes.len(), 2);
    assert_eq!(cluster.master().unwrap().address, "s1");
    assert!(cluster.master_announced);

    let s1 = env.net().node("s1").unwrap();
    assert_eq!(s1.role(), NodeRole::Master);
    assert_eq!(s1.joins().last().map(String::as_str), Some(""));
    assert_eq!(
        env.net().node("s2").unwrap().role(),
        NodeRole::Slave { master: "s1".into() }
    );

    // old content is served by the replicas, new content lands on the new master
    assert_eq!(env.read("/kept").await.unwrap(), data);
    let before = s1.payloads_received();
    env.write("/fresh", &pattern(20, 7)).await.unwrap();
    assert_eq!(s1.payloads_received(), before + 1);
    env.dfs().delete("/kept").await.unwrap();
    assert_eq!(s1.blob_count(), 1);
}

#[tokio::test]
async fn test_last_node_cannot_leave() {
    let env = TestEnv::with_chunk_size(32);
    env.cluster(&["only"], 4096).await.unwrap();
    let err = env.coordinator().unregister(&node_id("only", 4096)).await.unwrap_err();
    assert!(matches!(err, mosaicfs_mgmt::ManagerError::LastNode(_)));
}

#[tokio::test]
async fn test_sync_rebuilds_index_and_replicas() {
    let env = TestEnv::with_chunk_size(16);
    let c = env.cluster(&["m", "s"], 4096).await.unwrap();
    let data = pattern(64, 8);
    let file = env.write("/doc", &data).await.unwrap();

    env.coordinator().dedup().clear(&c.id).await.unwrap();
    assert_eq!(env.coordinator().dedup().len(&c.id).unwrap(), 0);
    assert!(env.read("/doc").await.is_err());

    let report = env.coordinator().sync_clusters().await.unwrap();
    assert_eq!(report.synced, vec![c.id.clone()]);
    assert_eq!(env.coordinator().dedup().len(&c.id).unwrap(), file.chunks.len());
    let slave = env.net().node("s").unwrap();
    for chunk in &file.chunks {
        assert!(slave.has(&chunk.hash));
    }
    assert_eq!(env.read("/doc").await.unwrap(), data);
}

#[tokio::test(start_paused = true)]
async fn test_sync_waits_out_an_unreachable_master() {
    let env = Arc::new(TestEnv::with_chunk_size(16));
    let c = env.cluster(&["m", "s"], 4096).await.unwrap();
    env.write("/doc", &pattern(30, 2)).await.unwrap();
    let m = env.net().node("m").unwrap();
    m.set_down(true);

    let syncing = {
        let env = env.clone();
        tokio::spawn(async move { env.coordinator().sync_clusters().await })
    };
    tokio::time::sleep(Duration::from_millis(55)).await;
    m.set_down(false);

    let report = syncing.await.unwrap().unwrap();
    assert_eq!(report.synced, vec![c.id]);
    assert!(report.requeued >= 2);
    assert_eq!(env.net().node("s").unwrap().blob_count(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_used_tracks_committed_bytes(
        ops in prop::collection::vec((1u64..300, any::<bool>(), 0u64..=100), 1..12),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let (used, expected) = rt.block_on(async {
            let env = TestEnv::with_chunk_size(64);
            let c = env.cluster(&["n"], 1 << 20).await.unwrap();
            let mut expected = 0;
            for (size, keep, percent) in &ops {
                let map = env.coordinator().reserve(*size).await.unwrap();
                if *keep {
                    let consumed = size * percent / 100;
                    let used = BTreeMap::from([(c.id.clone(), consumed)]);
                    env.coordinator().commit(&map.id, &used).await.unwrap();
                    expected += consumed;
                } else {
                    env.coordinator().discard(&map.id).await.unwrap();
                }
            }
            (env.used(&c.id).unwrap(), expected)
        });
        prop_assert_eq!(used, expected);
    }
}
