//! The replicated-log capability the rest of the crate depends on.
//!
//! [`Consensus`] is what the membership manager, the router and the API need
//! from a raft engine; [`RaftConsensus`] implements it on top of openraft.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use async_trait::async_trait;
use openraft::error::{ClientWriteError, InitializeError, RaftError};
use openraft::{ChangeMembers, Raft, RaftMetrics, ServerState};
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Span};

use crate::config::{ClusterMember, KvResponse, Node, NodeId, Proposal, TypeConfig};
use crate::KvError;

#[async_trait]
pub trait Consensus: Send + Sync + 'static {
    /// This node's id
    fn node_id(&self) -> NodeId;

    /// Propose an opaque command and wait until it is committed and applied.
    async fn propose(&self, command: Vec<u8>) -> Result<(), KvError>;

    /// Add `member` as a voter
    async fn add_voter(&self, member: ClusterMember) -> Result<(), KvError>;

    /// Form a single-voter cluster made of `local`
    async fn bootstrap(&self, local: ClusterMember) -> Result<(), KvError>;

    fn is_leader(&self) -> bool;

    /// The leader this node currently knows about, if any
    fn leader(&self) -> Option<ClusterMember>;

    /// Receive `true`/`false` each time this node gains or loses leadership
    fn leadership_changes(&self) -> mpsc::UnboundedReceiver<bool>;

    /// Force a snapshot of the state machine
    async fn snapshot(&self) -> Result<(), KvError>;
}

/// [`Consensus`] backed by an openraft instance
#[derive(Clone)]
pub struct RaftConsensus {
    raft: Raft<TypeConfig>,
    node_id: NodeId,
    apply_timeout: Duration,
    join_timeout: Duration,
    span: Span,
}

impl RaftConsensus {
    pub fn new(
        raft: Raft<TypeConfig>,
        node_id: NodeId,
        apply_timeout: Duration,
        join_timeout: Duration,
        span: Span,
    ) -> Self {
        Self {
            raft,
            node_id,
            apply_timeout,
            join_timeout,
            span,
        }
    }

    pub fn raft(&self) -> &Raft<TypeConfig> {
        &self.raft
    }

    fn metrics(&self) -> RaftMetrics<NodeId, Node> {
        self.raft.metrics().borrow().clone()
    }

    async fn promote(&self, id: NodeId, node: Node) -> Result<(), KvError> {
        // Blocks until the learner has caught up with the leader's log
        self.raft
            .add_learner(id, node, true)
            .await
            .map_err(write_error)?;

        self.raft
            .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false)
            .await
            .map_err(write_error)?;

        Ok(())
    }
}

fn write_error(e: RaftError<NodeId, ClientWriteError<NodeId, Node>>) -> KvError {
    match e {
        RaftError::APIError(ClientWriteError::ForwardToLeader(_)) => KvError::NotLeader,
        other => KvError::Raft(other.to_string()),
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn propose(&self, command: Vec<u8>) -> Result<(), KvError> {
        let raft = self.raft.clone();

        // Run the write in its own task so a dropped caller does not retract it
        let write = tokio::spawn(async move { raft.client_write(Proposal(command)).await });

        let response = tokio::time::timeout(self.apply_timeout, write)
            .await
            .map_err(|_| KvError::ApplyTimeout(self.apply_timeout))?
            .map_err(|e| KvError::Raft(format!("proposal task failed: {e}")))?
            .map_err(write_error)?;

        match response.data {
            KvResponse::Applied | KvResponse::Ignored => Ok(()),
            KvResponse::Failed { error } => Err(KvError::Apply(error)),
        }
    }

    async fn add_voter(&self, member: ClusterMember) -> Result<(), KvError> {
        let id = member.node_id()?;
        let node = Node {
            addr: member.address.clone(),
        };

        info!(parent: &self.span, id, addr = %member.address, "adding voter");

        tokio::time::timeout(self.join_timeout, self.promote(id, node))
            .await
            .map_err(|_| {
                KvError::Raft(format!(
                    "adding voter {id} did not finish within {:?}",
                    self.join_timeout
                ))
            })?
    }

    async fn bootstrap(&self, local: ClusterMember) -> Result<(), KvError> {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            local.node_id()?,
            Node {
                addr: local.address,
            },
        );

        match self.raft.initialize(nodes).await {
            Ok(()) => {
                info!(parent: &self.span, "bootstrapped single-node cluster");
                Ok(())
            }
            Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                info!(parent: &self.span, "cluster already initialized: {}", e);
                Ok(())
            }
            Err(e) => Err(KvError::Raft(e.to_string())),
        }
    }

    fn is_leader(&self) -> bool {
        let metrics = self.metrics();
        metrics.state == ServerState::Leader && metrics.current_leader == Some(self.node_id)
    }

    fn leader(&self) -> Option<ClusterMember> {
        let metrics = self.metrics();
        let leader = metrics.current_leader?;
        let node = metrics.membership_config.membership().get_node(&leader)?;
        Some(ClusterMember::new(leader, node.addr.clone()))
    }

    fn leadership_changes(&self) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut metrics = self.raft.metrics();
        let span = self.span.clone();

        tokio::spawn(async move {
            let mut was_leader = false;
            loop {
                let is_leader = metrics.borrow().state == ServerState::Leader;
                if is_leader != was_leader {
                    debug!(parent: &span, is_leader, "leadership changed");
                    if tx.send(is_leader).is_err() {
                        return;
                    }
                    was_leader = is_leader;
                }

                if metrics.changed().await.is_err() {
                    // Raft has shut down
                    return;
                }
            }
        });

        rx
    }

    async fn snapshot(&self) -> Result<(), KvError> {
        self.raft.trigger().snapshot().await.map_err(|e| {
            warn!(parent: &self.span, error = %e, "snapshot trigger failed");
            KvError::Raft(e.to_string())
        })
    }
}

#[cfg(test)]
pub(crate) mod fake;
