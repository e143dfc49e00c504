//! Raft consensus core: role state machine, log management, per-follower
//! replication and the RPC contract. Transports and state machines plug in
//! through the traits in `proxy` and `state_machine`.

pub mod error;
pub mod log;
pub mod message;
pub mod peer;
pub mod peer_manager;
pub mod proxy;
pub mod snapshot;
pub mod state_machine;

mod election;
mod node;
mod replication;
mod timer;

#[cfg(test)]
pub(crate) mod testing;

pub use error::RaftError;
pub use log::LogManager;
pub use message::{
    AppendEntriesReply, AppendEntriesRequest, Command, ExecuteReply, GetReply, GetRequest,
    LogEntry, LogIndex, NodeId, NodeInfo, RequestVoteReply, RequestVoteRequest, SnapshotRequest,
};
pub use node::{Node, NodeRole};
pub use peer::Peer;
pub use peer_manager::PeerManager;
pub use proxy::{PeerProxy, PeerProxyFactory};
pub use state_machine::StateMachine;
