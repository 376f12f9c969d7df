//! ferrokv - a replicated key-value store built with openraft
//!
//! Every node keeps the whole map in a lock-guarded JSON file. Writes go
//! through the raft log and are applied in commit order on every node; reads
//! are served from the local file. Requests that reach a follower are proxied
//! to the current leader.

use std::path::PathBuf;
use std::time::Duration;

pub mod api;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod datafile;
pub mod fsm;
pub mod network;
pub mod router;
pub mod storage;

pub use config::{ClusterMember, KvConfig, KvResponse, Node, NodeId, Proposal, TypeConfig};
pub use consensus::{Consensus, RaftConsensus};
pub use datafile::{DataFile, KvMap};
pub use fsm::{Command, FsmSnapshot, StateMachine};
pub use network::{HttpNetwork, HttpNetworkFactory};
pub use storage::{new_storage, KvStorage, LogStore, StateMachineStore};

#[derive(thiserror::Error, Debug)]
pub enum KvError {
    #[error("not leader")]
    NotLeader,

    #[error("couldn't get lock on {}", .0.display())]
    LockTimeout(PathBuf),

    #[error("malformed command: {0}")]
    CommandDecode(#[source] serde_json::Error),

    #[error("malformed data: {0}")]
    Encoding(String),

    #[error("failed to join cluster via leader {leader}: {reason}")]
    JoinFailure { leader: String, reason: String },

    #[error("command not applied within {0:?}")]
    ApplyTimeout(Duration),

    #[error("apply failed: {0}")]
    Apply(String),

    #[error("invalid cluster member: {0}")]
    InvalidMember(String),

    #[error("Raft error: {0}")]
    Raft(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Storage error: {0}")]
    Storage(#[from] openraft::StorageError<NodeId>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
