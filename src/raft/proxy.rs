//! Peer proxy abstraction.
//!
//! The consensus core never talks to the network directly. Each peer is
//! reached through a `PeerProxy`, and the concrete transport (gRPC, in
//! process, ...) is injected through a `PeerProxyFactory` at startup.

use std::sync::Arc;

use crate::raft::error::RaftError;
use crate::raft::message::{
    AppendEntriesReply, AppendEntriesRequest, Command, ExecuteReply, GetReply, GetRequest,
    NodeInfo, RequestVoteReply, RequestVoteRequest, SnapshotRequest,
};

/// RPC client interface for one specific peer node.
#[tonic::async_trait]
pub trait PeerProxy: Send + Sync {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RaftError>;

    async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteReply, RaftError>;

    /// The transport may stream the snapshot in chunks; the core only needs
    /// the all-or-nothing result.
    async fn install_snapshot(
        &self,
        req: SnapshotRequest,
    ) -> Result<AppendEntriesReply, RaftError>;

    /// Forward a client command to this peer (used to proxy writes to the
    /// leader).
    async fn execute(&self, cmd: Command) -> Result<ExecuteReply, RaftError>;

    /// Read from this peer's state machine.
    async fn get(&self, req: GetRequest) -> Result<GetReply, RaftError>;
}

/// Factory creating one proxy per peer at cluster startup.
pub trait PeerProxyFactory: Send + Sync {
    fn new_peer_proxy(&self, info: &NodeInfo) -> Result<Arc<dyn PeerProxy>, RaftError>;
}
