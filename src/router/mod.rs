//! Decides whether a client request is served here or proxied to the leader.

use std::sync::Arc;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{web::Bytes, HttpRequest, HttpResponse};
use reqwest::{redirect, Client, Method};
use tracing::{debug, warn, Span};

use crate::consensus::Consensus;
use crate::network::node_url;
use crate::KvError;

/// Marks a request that has already been proxied once
pub const FORWARDED_HEADER: &str = "x-ferrokv-forwarded";

/// Headers that only describe a single connection and are never relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Serve the request on this node
    Local,
    /// Proxy the request to the leader at this address
    Forward(String),
}

pub struct LeaderRouter {
    consensus: Arc<dyn Consensus>,
    client: Client,
    span: Span,
}

impl LeaderRouter {
    pub fn new(consensus: Arc<dyn Consensus>, timeout: Duration, span: Span) -> Result<Self, KvError> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| KvError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            consensus,
            client,
            span,
        })
    }

    /// Leader handles locally, a known leader gets the request, and with no
    /// leader known the request is handled locally on a best-effort basis.
    pub fn route(&self, req: &HttpRequest) -> Route {
        if req.headers().contains_key(FORWARDED_HEADER) || self.consensus.is_leader() {
            return Route::Local;
        }

        match self.consensus.leader() {
            Some(leader) if leader.id != self.consensus.node_id().to_string() => {
                Route::Forward(leader.address)
            }
            _ => Route::Local,
        }
    }

    /// Replay `req` against the leader and relay its answer unmodified
    pub async fn forward(&self, req: &HttpRequest, body: Bytes, leader: &str) -> HttpResponse {
        match self.proxy(req, body, leader).await {
            Ok(response) => response,
            Err(e) => {
                warn!(parent: &self.span, %leader, error = %e, "forwarding to leader failed");
                HttpResponse::BadGateway().json(serde_json::json!({ "error": e.to_string() }))
            }
        }
    }

    async fn proxy(
        &self,
        req: &HttpRequest,
        body: Bytes,
        leader: &str,
    ) -> Result<HttpResponse, KvError> {
        let path = req
            .uri()
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or_else(|| req.path());
        let url = node_url(leader, path);
        let method = Method::from_bytes(req.method().as_str().as_bytes())
            .map_err(|e| KvError::Network(e.to_string()))?;

        debug!(parent: &self.span, %url, %method, "forwarding to leader");

        let mut outbound = self.client.request(method, &url);
        for (name, value) in req.headers() {
            if !is_hop_by_hop(name.as_str()) {
                outbound = outbound.header(name.as_str(), value.as_bytes());
            }
        }

        let response = outbound
            .header(FORWARDED_HEADER, "1")
            .body(body)
            .send()
            .await
            .map_err(|e| KvError::Network(format!("leader {leader} unreachable: {e}")))?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .map_err(|e| KvError::Network(e.to_string()))?;
        let mut relayed = HttpResponse::build(status);
        for (name, value) in response.headers() {
            if !is_hop_by_hop(name.as_str()) {
                relayed.append_header((name.as_str(), value.as_bytes().to_vec()));
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| KvError::Network(format!("reading leader response: {e}")))?;

        Ok(relayed.body(body))
    }
}
