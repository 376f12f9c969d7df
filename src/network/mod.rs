use std::time::Duration;

use openraft::{
    error::{InstallSnapshotError, NetworkError, RPCError, RaftError, RemoteError, Unreachable},
    network::{RPCOption, RaftNetwork, RaftNetworkFactory},
    raft::{
        AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
        InstallSnapshotResponse, VoteRequest, VoteResponse,
    },
};
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::config::{Node, NodeId, TypeConfig};

/// Build `http://addr/path`, keeping an explicit scheme if one is given
pub fn node_url(addr: &str, path: &str) -> String {
    let path = path.trim_start_matches('/');
    if addr.starts_with("http://") || addr.starts_with("https://") {
        format!("{}/{}", addr.trim_end_matches('/'), path)
    } else {
        format!("http://{addr}/{path}")
    }
}

/// HTTP-based network implementation for Raft
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: Client,
    target_node: NodeId,
    target_addr: String,
}

impl HttpNetwork {
    pub fn with_target(client: Client, target_node: NodeId, target_addr: String) -> Self {
        Self {
            client,
            target_node,
            target_addr,
        }
    }

    /// POST `req` to the target and decode the `Result` it answers with.
    async fn send_rpc<Req, Resp, E>(
        &self,
        uri: &str,
        req: Req,
    ) -> Result<Resp, RPCError<NodeId, Node, E>>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
        E: std::error::Error + DeserializeOwned,
    {
        let url = node_url(&self.target_addr, uri);

        debug!("Sending RPC to {}: {}", self.target_node, url);

        let response = self
            .client
            .post(&url)
            .json(&req)
            .send()
            .await
            .map_err(|e| {
                error!("Network error sending to {}: {}", url, e);
                if e.is_connect() {
                    RPCError::Unreachable(Unreachable::new(&e))
                } else {
                    RPCError::Network(NetworkError::new(&e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!("HTTP error {}: {}", status, body);

            return Err(RPCError::Network(NetworkError::new(&std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("RPC failed with status {}: {}", status, body),
            ))));
        }

        let result: Result<Resp, E> = response.json().await.map_err(|e| {
            error!("Failed to parse response from {}: {}", url, e);
            RPCError::Network(NetworkError::new(&e))
        })?;

        result.map_err(|e| RPCError::RemoteError(RemoteError::new(self.target_node, e)))
    }
}

impl RaftNetwork<TypeConfig> for HttpNetwork {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.send_rpc("raft/append-entries", req).await
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, Node, RaftError<NodeId, InstallSnapshotError>>,
    > {
        self.send_rpc("raft/install-snapshot", req).await
    }

    async fn vote(
        &mut self,
        req: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, Node, RaftError<NodeId>>> {
        self.send_rpc("raft/vote", req).await
    }
}

/// Factory for creating network instances that share one HTTP client
#[derive(Debug, Clone)]
pub struct HttpNetworkFactory {
    client: Client,
}

impl HttpNetworkFactory {
    pub fn new(timeout: Duration) -> Result<Self, crate::KvError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::KvError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

impl RaftNetworkFactory<TypeConfig> for HttpNetworkFactory {
    type Network = HttpNetwork;

    async fn new_client(&mut self, target: NodeId, node: &Node) -> Self::Network {
        HttpNetwork::with_target(self.client.clone(), target, node.addr.clone())
    }
}

/// Receiving side of the raft RPCs, mounted under `/raft/`
pub mod api {
    use super::*;
    use actix_web::{web, HttpResponse, Result};
    use openraft::Raft;

    pub async fn append_entries(
        req: web::Json<AppendEntriesRequest<TypeConfig>>,
        raft: web::Data<Raft<TypeConfig>>,
    ) -> Result<HttpResponse> {
        let res = raft.append_entries(req.into_inner()).await;
        Ok(HttpResponse::Ok().json(res))
    }

    pub async fn install_snapshot(
        req: web::Json<InstallSnapshotRequest<TypeConfig>>,
        raft: web::Data<Raft<TypeConfig>>,
    ) -> Result<HttpResponse> {
        let res = raft.install_snapshot(req.into_inner()).await;
        Ok(HttpResponse::Ok().json(res))
    }

    pub async fn vote(
        req: web::Json<VoteRequest<NodeId>>,
        raft: web::Data<Raft<TypeConfig>>,
    ) -> Result<HttpResponse> {
        let res = raft.vote(req.into_inner()).await;
        Ok(HttpResponse::Ok().json(res))
    }

    /// Register the raft RPC routes
    pub fn configure(cfg: &mut web::ServiceConfig) {
        cfg.route("/raft/append-entries", web::post().to(append_entries))
            .route("/raft/vote", web::post().to(vote))
            .route("/raft/install-snapshot", web::post().to(install_snapshot));
    }
}
