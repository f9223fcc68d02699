//! End-to-end scenarios over real sockets: storage nodes behind
//! `NodeServer`, the manager behind `ControlService`.

use std::sync::Arc;

use mosaicfs_head::{Dfs, DfsConfig, Entry};
use mosaicfs_meta::{KvStore, LockConfig, LockStore, MemoryKvStore, MemoryLockStore, TreeStore};
use mosaicfs_mgmt::control::call;
use mosaicfs_mgmt::{ClusterCoordinator, ControlService, ManagerConfig};
use mosaicfs_transport::control::{STATUS_INSUFFICIENT_STORAGE, STATUS_NOT_FOUND, STATUS_UNPROCESSABLE};
use mosaicfs_transport::{Action, ControlRequest, NodeClient, NodeServer, SimNetwork, TcpNodeClient};

use crate::harness::pattern;

const MIB: u64 = 1024 * 1024;

struct WireEnv {
    net: SimNetwork,
    coordinator: Arc<ClusterCoordinator>,
    dfs: Dfs,
}

impl WireEnv {
    fn new(chunk_size: u64) -> Self {
        let net = SimNetwork::new();
        let config = ManagerConfig {
            chunk_size,
            sync_retry_delay_ms: 10,
            ..ManagerConfig::default()
        };
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let locks: Arc<dyn LockStore> = Arc::new(MemoryLockStore::new());
        let client: Arc<dyn NodeClient> = Arc::new(TcpNodeClient::new(config.node_client()));
        let coordinator = Arc::new(ClusterCoordinator::new(
            kv.clone(),
            locks.clone(),
            client.clone(),
            &config,
        ));
        let dfs = Dfs::new(
            TreeStore::new(kv, locks, LockConfig::default()),
            coordinator.clone(),
            client,
            DfsConfig::default(),
        );
        Self {
            net,
            coordinator,
            dfs,
        }
    }

    /// Starts a server for a new simulated node and returns its socket address.
    async fn serve_node(&self, name: &str, capacity: u64) -> String {
        self.net.add_node(name, capacity);
        NodeServer::new(Arc::new(self.net.clone()), name)
            .spawn("127.0.0.1:0")
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_file_lifecycle_over_tcp() {
    let env = WireEnv::new(64);
    let a = env.serve_node("a", 4096).await;
    let b = env.serve_node("b", 4096).await;
    env.coordinator.register(&[a]).await.unwrap();
    env.coordinator.register(&[b]).await.unwrap();

    let data = pattern(500, 3);
    let mut reader = data.as_slice();
    let file = env
        .dfs
        .create_file("/docs/a.bin", "application/octet-stream", 500, &mut reader, false)
        .await
        .unwrap();
    assert_eq!(file.chunks.len(), 8);

    let mut back = Vec::new();
    assert_eq!(env.dfs.read_file("/docs/a.bin", &mut back).await.unwrap(), 500);
    assert_eq!(back, data);

    let payloads = |net: &SimNetwork| {
        ["a", "b"]
            .iter()
            .map(|n| net.node(n).unwrap().payloads_received())
            .sum::<u64>()
    };
    let before = payloads(&env.net);
    env.dfs.copy_file("/docs/a.bin", "/docs/b.bin", false).await.unwrap();
    assert_eq!(payloads(&env.net), before);

    env.dfs.delete("/docs/a.bin").await.unwrap();
    let mut copy = Vec::new();
    env.dfs.read_file("/docs/b.bin", &mut copy).await.unwrap();
    assert_eq!(copy, data);

    env.dfs.delete("/docs").await.unwrap();
    assert_eq!(env.net.node("a").unwrap().blob_count(), 0);
    assert_eq!(env.net.node("b").unwrap().blob_count(), 0);
    assert!(matches!(env.dfs.read("/").await.unwrap(), Entry::Folder(f) if f.folders.is_empty()));
}

#[tokio::test]
async fn test_unreachable_node_is_not_registered() {
    let env = WireEnv::new(64);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap().to_string();
    drop(listener);

    assert!(env.coordinator.register(&[dead]).await.is_err());
    assert!(env.coordinator.clusters().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_control_service_round_trip() {
    let env = WireEnv::new(32 * MIB);
    let node = env.serve_node("n", 100 * MIB).await;
    let control = ControlService::new(env.coordinator.clone())
        .spawn("127.0.0.1:0")
        .await
        .unwrap();

    let registered = call(&control, &ControlRequest::new(Action::Register).with_options([node.clone()]))
        .await
        .unwrap();
    assert!(registered.is_success(), "{:?}", registered);
    let cluster_id = registered.body["id"].as_str().unwrap().to_string();

    let reserved = call(&control, &ControlRequest::new(Action::Reserve).with_size(64 * MIB))
        .await
        .unwrap();
    assert!(reserved.is_success());
    assert_eq!(reserved.body["entries"].as_array().unwrap().len(), 2);
    assert_eq!(reserved.body["entries"][0]["address"], node.as_str());
    let reservation = reserved.body["id"].as_str().unwrap().to_string();

    let committed = call(
        &control,
        &ControlRequest::new(Action::Commit)
            .with_id(reservation.clone())
            .with_options([format!("{}={}", cluster_id, 40 * MIB)]),
    )
    .await
    .unwrap();
    assert!(committed.is_success());

    let listed = call(&control, &ControlRequest::new(Action::Clusters)).await.unwrap();
    assert_eq!(listed.body[0]["used"], 40 * MIB);
    assert_eq!(listed.body[0]["free"], 60 * MIB);

    let again = call(&control, &ControlRequest::new(Action::Discard).with_id(reservation))
        .await
        .unwrap();
    assert_eq!(again.status, STATUS_NOT_FOUND);
    let no_id = call(&control, &ControlRequest::new(Action::Commit)).await.unwrap();
    assert_eq!(no_id.status, STATUS_UNPROCESSABLE);
    let too_big = call(&control, &ControlRequest::new(Action::Reserve).with_size(200 * MIB))
        .await
        .unwrap();
    assert_eq!(too_big.status, STATUS_INSUFFICIENT_STORAGE);
}
