//! Pluggable state machine contract.

use std::io::{Read, Write};

use crate::raft::error::RaftError;
use crate::raft::message::{Command, GetReply, GetRequest};

/// Deterministic state machine driven by committed log entries.
///
/// `apply` must be deterministic and non-blocking: it runs under the node
/// lock, in strictly increasing log index order. `serialize`/`deserialize`
/// dump and replace the full state for snapshotting.
pub trait StateMachine: Send + Sync {
    fn apply(&self, cmd: &Command);

    fn get(&self, req: &GetRequest) -> Result<GetReply, RaftError>;

    fn serialize(&self, writer: &mut dyn Write) -> std::io::Result<()>;

    fn deserialize(&self, reader: &mut dyn Read) -> std::io::Result<()>;
}
