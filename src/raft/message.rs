//! Core message and data types shared by the consensus layer and its
//! collaborators. All of these are plain serde structs; the wire encoding is
//! the transport's concern.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Node identifier within the fixed cluster.
pub type NodeId = u32;

/// Log index or term. `-1` is the "nothing yet" sentinel used for the empty
/// log and for the entry preceding the first one.
pub type LogIndex = i64;

/// Static information about one cluster member.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub endpoint: String,
}

/// A state machine command carried in a log entry. The data bytes are opaque
/// to the consensus layer; only the owning state machine interprets them.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: i32,
    pub data: Vec<u8>,
}

/// One replicated log entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: LogIndex,
    pub term: LogIndex,
    pub cmd: Command,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: LogIndex,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: LogIndex,
    pub entries: Vec<LogEntry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    pub term: LogIndex,
    pub node_id: NodeId,
    pub leader_id: NodeId,
    pub success: bool,
    /// Highest index the follower matched with this request, -1 on failure.
    pub last_match: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: LogIndex,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteReply {
    pub term: LogIndex,
    pub node_id: NodeId,
    /// Term the vote decision was made for, so the candidate can drop stale
    /// replies from earlier elections.
    pub voted_term: LogIndex,
    pub vote_granted: bool,
}

/// Snapshot installation request. `file` points at a snapshot image readable
/// on the local machine; the transport is responsible for moving the bytes
/// across the network and materializing them into such a file.
#[derive(Clone, Debug)]
pub struct SnapshotRequest {
    pub term: LogIndex,
    pub leader_id: NodeId,
    pub snapshot_index: LogIndex,
    pub snapshot_term: LogIndex,
    pub file: PathBuf,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecuteReply {
    pub success: bool,
}

/// Read request answered by the state machine on the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub params: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetReply {
    pub data: Vec<u8>,
}
