use std::sync::Arc;

use rand::Rng;
use reqwest::Client;
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Span};

use crate::config::{ClusterConfig, ClusterMember};
use crate::consensus::Consensus;
use crate::network::node_url;
use crate::KvError;

/// Bootstraps or joins the cluster and reacts to leadership changes
pub struct ClusterManager {
    consensus: Arc<dyn Consensus>,
    config: ClusterConfig,
    local: ClusterMember,
    http: Client,
    span: Span,
}

impl ClusterManager {
    pub fn new(
        consensus: Arc<dyn Consensus>,
        config: ClusterConfig,
        local: ClusterMember,
        span: Span,
    ) -> Result<Self, KvError> {
        let http = Client::builder()
            .timeout(config.join_timeout)
            .build()
            .map_err(|e| KvError::Network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            consensus,
            config,
            local,
            http,
            span,
        })
    }

    pub fn local(&self) -> &ClusterMember {
        &self.local
    }

    /// Bring this node into a cluster.
    ///
    /// A leader already known to the engine wins over `leader_hint`. With no
    /// leader at all a single-voter cluster is bootstrapped; otherwise the node
    /// announces itself to the leader after the configured warmup.
    pub async fn start(&self, leader_hint: Option<String>) -> Result<JoinHandle<()>, KvError> {
        let watcher = self.watch_leadership();

        let leader = match self.consensus.leader() {
            Some(known) if known.id == self.local.id => {
                info!(parent: &self.span, "already leader, nothing to join");
                return Ok(watcher);
            }
            Some(known) => Some(known.address),
            None => leader_hint,
        };

        match leader {
            None => {
                info!(parent: &self.span, id = %self.local.id, addr = %self.local.address, "no leader known, bootstrapping");
                self.consensus.bootstrap(self.local.clone()).await?;
            }
            Some(leader) => {
                info!(
                    parent: &self.span,
                    %leader,
                    "joining cluster in {:?}",
                    self.config.join_warmup
                );
                tokio::time::sleep(self.config.join_warmup).await;
                self.announce(&leader).await?;
                info!(parent: &self.span, %leader, "joined cluster");
            }
        }

        Ok(watcher)
    }

    /// POST this node's identity to the leader's join endpoint
    pub async fn announce(&self, leader: &str) -> Result<(), KvError> {
        let join_failure = |reason: String| KvError::JoinFailure {
            leader: leader.to_string(),
            reason,
        };

        let response = self
            .http
            .post(node_url(leader, "raft/add"))
            .json(&self.local)
            .send()
            .await
            .map_err(|e| join_failure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(join_failure(format!("status {status}: {body}")));
        }

        Ok(())
    }

    /// Add a member announced through the join endpoint as a voter
    pub async fn add_member(&self, member: ClusterMember) -> Result<(), KvError> {
        member.node_id()?;
        info!(parent: &self.span, id = %member.id, addr = %member.address, "member asked to join");
        self.consensus.add_voter(member).await.inspect_err(|e| {
            error!(parent: &self.span, error = %e, "failed to add member");
        })
    }

    fn watch_leadership(&self) -> JoinHandle<()> {
        let mut changes = self.consensus.leadership_changes();
        let consensus = self.consensus.clone();
        let chance = self.config.snapshot_chance.max(1);
        let span = self.span.clone();

        tokio::spawn(async move {
            while let Some(is_leader) = changes.recv().await {
                if !is_leader {
                    info!(parent: &span, "lost leadership");
                    continue;
                }

                info!(parent: &span, "became leader");
                let take_snapshot = rand::thread_rng().gen_ratio(1, chance);
                if take_snapshot {
                    info!(parent: &span, "forcing snapshot");
                    if let Err(e) = consensus.snapshot().await {
                        warn!(parent: &span, error = %e, "snapshot failed");
                    }
                }
            }
        })
    }
}
