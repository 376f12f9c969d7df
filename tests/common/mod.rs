//! Helpers for running real ferrokv nodes inside a test process.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{dev::ServerHandle, web, App, HttpServer};
use openraft::{Raft, ServerState};
use tracing::Span;

use ferrokv::{
    api::{self, KvService},
    cluster::ClusterManager,
    config::{create_raft_config, ClusterConfig, RaftConfig, StorageConfig},
    network::{self, HttpNetworkFactory},
    router::LeaderRouter,
    storage::new_storage,
    ClusterMember, Consensus, DataFile, NodeId, RaftConsensus, StateMachine, TypeConfig,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub struct TestNode {
    pub id: NodeId,
    pub addr: String,
    pub raft: Raft<TypeConfig>,
    pub cluster: Arc<ClusterManager>,
    pub fsm: Arc<StateMachine>,
    server: ServerHandle,
}

fn cluster_config() -> ClusterConfig {
    ClusterConfig {
        join_warmup: Duration::ZERO,
        join_timeout: WAIT,
        apply_timeout: WAIT,
        forward_timeout: WAIT,
        ..ClusterConfig::default()
    }
}

/// Start a full node (storage, raft, HTTP server) serving on `port`
pub async fn spawn_node(id: NodeId, port: u16, dir: &Path) -> TestNode {
    let addr = format!("127.0.0.1:{port}");

    let data = DataFile::new(dir.join("data.json"), &StorageConfig::default());
    let fsm = Arc::new(StateMachine::new(data, Span::none()));
    let (log_store, state_machine) = new_storage(dir.join("raft"), fsm.clone())
        .await
        .expect("Failed to create storage");

    let config = Arc::new(
        create_raft_config(&RaftConfig::default())
            .validate()
            .unwrap(),
    );
    let network = HttpNetworkFactory::new(Duration::from_secs(5)).unwrap();
    let raft = Raft::new(id, config, network, log_store, state_machine)
        .await
        .expect("Failed to create raft");

    let consensus: Arc<dyn Consensus> = Arc::new(RaftConsensus::new(
        raft.clone(),
        id,
        WAIT,
        WAIT,
        Span::none(),
    ));
    let cluster = Arc::new(
        ClusterManager::new(
            consensus.clone(),
            cluster_config(),
            ClusterMember::new(id, addr.clone()),
            Span::none(),
        )
        .unwrap(),
    );
    let router = LeaderRouter::new(consensus.clone(), WAIT, Span::none()).unwrap();
    let service = web::Data::new(KvService::new(
        consensus,
        fsm.clone(),
        cluster.clone(),
        router,
        Span::none(),
    ));
    let raft_data = web::Data::new(raft.clone());

    let server = HttpServer::new(move || {
        App::new()
            .app_data(raft_data.clone())
            .app_data(service.clone())
            .configure(network::api::configure)
            .configure(api::configure)
    })
    .workers(2)
    .bind(&addr)
    .expect("Failed to bind test node")
    .run();
    let handle = server.handle();
    actix_web::rt::spawn(server);

    TestNode {
        id,
        addr,
        raft,
        cluster,
        fsm,
        server: handle,
    }
}

impl TestNode {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub async fn wait_for_leader(&self) {
        self.raft
            .wait(Some(WAIT))
            .state(ServerState::Leader, "node becomes leader")
            .await
            .expect("node never became leader");
    }

    pub async fn shutdown(self) {
        self.server.stop(true).await;
        self.raft.shutdown().await.expect("raft shutdown failed");
    }
}

/// Poll `GET /key/{key}` on `node` until it answers `expected`
pub async fn wait_for_value(client: &reqwest::Client, node: &TestNode, key: &str, expected: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let body = client
            .get(node.url(&format!("/key/{key}")))
            .send()
            .await
            .expect("GET failed")
            .text()
            .await
            .unwrap();
        if body == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "node {} still answers {:?} for {}",
            node.id,
            body,
            key
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
