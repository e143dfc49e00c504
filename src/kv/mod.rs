//! Reference key-value state machine plus its gRPC transport.
//!
//! `KvStore` implements the consensus layer's `StateMachine` contract;
//! `client` and `server` provide the wire transport, speaking the protobuf
//! schema in `proto/raftkv.proto`.

pub mod client;
mod convert;
pub mod server;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::raft::error::RaftError;
use crate::raft::message::{Command, GetReply, GetRequest};
use crate::raft::state_machine::StateMachine;

pub use client::{KvPeerClient, KvPeerClientFactory};
pub use server::KvRpcServer;

/// Set a key/value pair.
pub const KV_CMD_SET: i32 = 1;
/// Delete a key.
pub const KV_CMD_DEL: i32 = 2;

/// Payload of one key-value command, JSON-encoded inside `Command::data`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KvCmdData {
    pub key: String,
    pub value: String,
}

/// Build a Set command.
pub fn set_command(key: &str, value: &str) -> Command {
    let data = KvCmdData { key: key.to_string(), value: value.to_string() };
    Command {
        kind: KV_CMD_SET,
        data: serde_json::to_vec(&data).expect("kv command encoding cannot fail"),
    }
}

/// Build a Delete command.
pub fn del_command(key: &str) -> Command {
    let data = KvCmdData { key: key.to_string(), value: String::new() };
    Command {
        kind: KV_CMD_DEL,
        data: serde_json::to_vec(&data).expect("kv command encoding cannot fail"),
    }
}

/// Concurrency safe in-memory key-value store. Cloning shares the underlying
/// map, so a handle kept outside the node observes every applied command.
#[derive(Clone, Default)]
pub struct KvStore {
    data: Arc<RwLock<HashMap<String, String>>>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore::default()
    }

    /// Direct read access, bypassing consensus. Intended for inspection and
    /// tests; clients should go through `Node::get`.
    pub fn value(&self, key: &str) -> Option<String> {
        self.data.read().unwrap().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().unwrap().is_empty()
    }
}

impl StateMachine for KvStore {
    fn apply(&self, cmd: &Command) {
        // Commands were validated on submission; a malformed one here means
        // the log itself is corrupt.
        let data: KvCmdData = match serde_json::from_slice(&cmd.data) {
            Ok(data) => data,
            Err(err) => panic!("corrupt kv command payload: {}", err),
        };

        let mut map = self.data.write().unwrap();
        match cmd.kind {
            KV_CMD_SET => {
                map.insert(data.key, data.value);
            }
            KV_CMD_DEL => {
                map.remove(&data.key);
            }
            kind => panic!("unexpected kv command type {}", kind),
        }
    }

    fn get(&self, req: &GetRequest) -> Result<GetReply, RaftError> {
        if req.params.len() != 1 {
            return Err(RaftError::Store { reason: "no key provided for Get".to_string() });
        }

        let key = &req.params[0];
        match self.data.read().unwrap().get(key) {
            Some(value) => Ok(GetReply { data: value.clone().into_bytes() }),
            None => Err(RaftError::Store { reason: format!("key {} doesn't exist", key) }),
        }
    }

    fn serialize(&self, writer: &mut dyn Write) -> std::io::Result<()> {
        let map = self.data.read().unwrap();
        serde_json::to_writer(writer, &*map).map_err(std::io::Error::from)
    }

    fn deserialize(&self, reader: &mut dyn Read) -> std::io::Result<()> {
        let map = serde_json::from_reader(reader).map_err(std::io::Error::from)?;
        *self.data.write().unwrap() = map;
        Ok(())
    }
}
