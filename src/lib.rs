pub mod config;
pub mod kv;
pub mod logging;
pub mod raft;

pub use config::ClusterConfig;
pub use kv::{KvStore, KvPeerClientFactory, KvRpcServer};
pub use raft::{Command, Node, NodeInfo, NodeRole, RaftError, StateMachine};
