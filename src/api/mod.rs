//! Client-facing HTTP API.
//!
//! | route              | method | body          | response                 |
//! |--------------------|--------|---------------|--------------------------|
//! | `/`                | GET    |               | `{"hello":"world"}`      |
//! | `/key/{key}`       | POST   | raw value     | empty                    |
//! | `/key/{key}`       | GET    |               | raw value                |
//! | `/key/{key}`       | DELETE |               | `{"status":"success"}`   |
//! | `/raft/add`        | POST   | `{ID,Address}`| `{"status":"success"}`   |
//!
//! Every route first asks the [`LeaderRouter`] whether the request belongs to
//! another node. Failures answer 500 with `{"error": ...}`.

use std::sync::Arc;

use actix_web::{web, HttpRequest, HttpResponse};
use serde_json::json;
use tracing::{error, Span};

use crate::cluster::ClusterManager;
use crate::config::ClusterMember;
use crate::consensus::Consensus;
use crate::fsm::{Command, StateMachine};
use crate::router::{LeaderRouter, Route};
use crate::KvError;

/// Request handling state shared by every worker
pub struct KvService {
    consensus: Arc<dyn Consensus>,
    fsm: Arc<StateMachine>,
    cluster: Arc<ClusterManager>,
    router: LeaderRouter,
    span: Span,
}

impl KvService {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        fsm: Arc<StateMachine>,
        cluster: Arc<ClusterManager>,
        router: LeaderRouter,
        span: Span,
    ) -> Self {
        Self {
            consensus,
            fsm,
            cluster,
            router,
            span,
        }
    }

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        let value = std::str::from_utf8(value)
            .map_err(|e| KvError::Encoding(format!("value is not valid UTF-8: {e}")))?;
        self.submit(Command::set(key, value)).await
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.submit(Command::delete(key)).await
    }

    /// Local read; may lag the leader on a follower
    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let fsm = self.fsm.clone();
        let key = key.to_string();
        web::block(move || fsm.get(&key))
            .await
            .map_err(|e| KvError::Io(std::io::Error::other(e.to_string())))?
    }

    pub async fn join(&self, member: ClusterMember) -> Result<(), KvError> {
        self.cluster.add_member(member).await
    }

    async fn submit(&self, command: Command) -> Result<(), KvError> {
        if !self.consensus.is_leader() {
            return Err(KvError::NotLeader);
        }
        self.consensus.propose(command.encode()?).await
    }

    fn failure(&self, e: KvError) -> HttpResponse {
        error!(parent: &self.span, error = %e, "request failed");
        HttpResponse::InternalServerError().json(json!({ "error": e.to_string() }))
    }
}

macro_rules! forward_if_needed {
    ($svc:expr, $req:expr, $body:expr) => {
        if let Route::Forward(leader) = $svc.router.route(&$req) {
            return $svc.router.forward(&$req, $body, &leader).await;
        }
    };
}

pub async fn hello(svc: web::Data<KvService>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    forward_if_needed!(svc, req, body);
    HttpResponse::Ok().json(json!({ "hello": "world" }))
}

pub async fn set_key(
    svc: web::Data<KvService>,
    req: HttpRequest,
    key: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    forward_if_needed!(svc, req, body);
    match svc.set(&key, &body).await {
        Ok(()) => HttpResponse::Ok().finish(),
        Err(e) => svc.failure(e),
    }
}

pub async fn get_key(
    svc: web::Data<KvService>,
    req: HttpRequest,
    key: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    forward_if_needed!(svc, req, body);
    match svc.get(&key).await {
        Ok(value) => HttpResponse::Ok().body(value.unwrap_or_default()),
        Err(e) => svc.failure(e),
    }
}

pub async fn delete_key(
    svc: web::Data<KvService>,
    req: HttpRequest,
    key: web::Path<String>,
    body: web::Bytes,
) -> HttpResponse {
    forward_if_needed!(svc, req, body);
    match svc.delete(&key).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "status": "success" })),
        Err(e) => svc.failure(e),
    }
}

pub async fn join(svc: web::Data<KvService>, req: HttpRequest, body: web::Bytes) -> HttpResponse {
    forward_if_needed!(svc, req, body);
    let member: ClusterMember = match serde_json::from_slice(&body) {
        Ok(member) => member,
        Err(e) => return svc.failure(e.into()),
    };
    match svc.join(member).await {
        Ok(()) => HttpResponse::Ok().json(json!({ "status": "success" })),
        Err(e) => svc.failure(e),
    }
}

/// Register the client routes
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(hello))
        .service(
            web::resource("/key/{key}")
                .route(web::get().to(get_key))
                .route(web::post().to(set_key))
                .route(web::delete().to(delete_key)),
        )
        .route("/raft/add", web::post().to(join));
}
