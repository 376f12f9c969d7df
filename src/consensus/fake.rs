//! In-memory [`Consensus`] for unit tests of the layers above it.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::Consensus;
use crate::config::{ClusterMember, KvResponse, NodeId};
use crate::fsm::StateMachine;
use crate::KvError;

#[derive(Default)]
pub struct FakeConsensus {
    pub id: NodeId,
    pub leader: Mutex<Option<ClusterMember>>,
    pub is_leader: AtomicBool,
    pub proposals: Mutex<Vec<Vec<u8>>>,
    pub bootstrapped: Mutex<Vec<ClusterMember>>,
    pub voters: Mutex<Vec<ClusterMember>>,
    pub snapshots: AtomicUsize,
    pub changes: Mutex<Option<mpsc::UnboundedSender<bool>>>,
    /// When set, proposals are applied here as if they had committed
    pub fsm: Option<Arc<StateMachine>>,
}

impl FakeConsensus {
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    pub fn with_state_machine(id: NodeId, fsm: Arc<StateMachine>) -> Self {
        Self {
            id,
            fsm: Some(fsm),
            ..Self::default()
        }
    }

    /// Make this node the leader at `addr`
    pub fn lead(&self, addr: &str) {
        self.is_leader.store(true, Ordering::SeqCst);
        *self.leader.lock().unwrap() = Some(ClusterMember::new(self.id, addr));
    }

    /// Follow a leader elsewhere
    pub fn follow(&self, leader: ClusterMember) {
        self.is_leader.store(false, Ordering::SeqCst);
        *self.leader.lock().unwrap() = Some(leader);
    }
}

#[async_trait]
impl Consensus for FakeConsensus {
    fn node_id(&self) -> NodeId {
        self.id
    }

    async fn propose(&self, command: Vec<u8>) -> Result<(), KvError> {
        if !self.is_leader() {
            return Err(KvError::NotLeader);
        }
        let outcome = match &self.fsm {
            Some(fsm) => fsm.apply(&command),
            None => KvResponse::Applied,
        };
        self.proposals.lock().unwrap().push(command);
        match outcome {
            KvResponse::Failed { error } => Err(KvError::Apply(error)),
            _ => Ok(()),
        }
    }

    async fn add_voter(&self, member: ClusterMember) -> Result<(), KvError> {
        self.voters.lock().unwrap().push(member);
        Ok(())
    }

    async fn bootstrap(&self, local: ClusterMember) -> Result<(), KvError> {
        self.bootstrapped.lock().unwrap().push(local);
        Ok(())
    }

    fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    fn leader(&self) -> Option<ClusterMember> {
        self.leader.lock().unwrap().clone()
    }

    fn leadership_changes(&self) -> mpsc::UnboundedReceiver<bool> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.changes.lock().unwrap() = Some(tx);
        rx
    }

    async fn snapshot(&self) -> Result<(), KvError> {
        self.snapshots.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
