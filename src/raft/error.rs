//! Error types for the consensus layer.
//!
//! Stale terms and prev-entry mismatches are not errors: they travel back as
//! negative replies and are absorbed by replication accounting. Only
//! conditions a caller can act on surface here.

use std::fmt;

use crate::raft::message::NodeId;

#[derive(Debug, Clone)]
pub enum RaftError {
    /// Execute/Get reached a non-leader. The hint, when present, names the
    /// node the caller should retry against.
    NotLeader { leader_hint: Option<NodeId> },

    /// No leader elected yet, or at least none known to this node.
    NoLeaderAvailable,

    /// RPC timeout or I/O failure while talking to a peer.
    Transport { node_id: NodeId, reason: String },

    /// Snapshot file could not be read or written.
    Snapshot { reason: String },

    /// Cluster configuration is unusable (no peers, unknown local id, ...).
    InvalidConfig { reason: String },

    /// State machine level failure (e.g. key not found).
    Store { reason: String },
}

impl fmt::Display for RaftError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RaftError::NotLeader { leader_hint: Some(id) } => {
                write!(f, "Not the leader, try node {}", id)
            }
            RaftError::NotLeader { leader_hint: None } => {
                write!(f, "Not the leader")
            }
            RaftError::NoLeaderAvailable => {
                write!(f, "No leader currently available")
            }
            RaftError::Transport { node_id, reason } => {
                write!(f, "Transport failure talking to node {}: {}", node_id, reason)
            }
            RaftError::Snapshot { reason } => {
                write!(f, "Snapshot I/O failure: {}", reason)
            }
            RaftError::InvalidConfig { reason } => {
                write!(f, "Invalid cluster configuration: {}", reason)
            }
            RaftError::Store { reason } => {
                write!(f, "State machine error: {}", reason)
            }
        }
    }
}

impl std::error::Error for RaftError {}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Snapshot { reason: err.to_string() }
    }
}
