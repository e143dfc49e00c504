//! Shared test doubles for the consensus layer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::raft::error::RaftError;
use crate::raft::message::{
    AppendEntriesReply, AppendEntriesRequest, Command, ExecuteReply, GetReply, GetRequest,
    NodeId, NodeInfo, RequestVoteReply, RequestVoteRequest, SnapshotRequest,
};
use crate::raft::proxy::{PeerProxy, PeerProxyFactory};

/// Peer proxy recording the last request of each kind and answering with a
/// canned reply (or a transport error when none is configured).
#[derive(Default)]
pub(crate) struct MockPeerProxy {
    pub ae_req: Mutex<Option<AppendEntriesRequest>>,
    pub rv_req: Mutex<Option<RequestVoteRequest>>,
    pub is_req: Mutex<Option<SnapshotRequest>>,

    pub ae_reply: Mutex<Option<AppendEntriesReply>>,
    pub rv_reply: Mutex<Option<RequestVoteReply>>,
}

impl MockPeerProxy {
    fn unreachable(&self) -> RaftError {
        RaftError::Transport { node_id: 0, reason: "no canned reply".to_string() }
    }
}

#[tonic::async_trait]
impl PeerProxy for MockPeerProxy {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RaftError> {
        *self.ae_req.lock().unwrap() = Some(req);
        self.ae_reply.lock().unwrap().clone().ok_or_else(|| self.unreachable())
    }

    async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteReply, RaftError> {
        *self.rv_req.lock().unwrap() = Some(req);
        self.rv_reply.lock().unwrap().clone().ok_or_else(|| self.unreachable())
    }

    async fn install_snapshot(
        &self,
        req: SnapshotRequest,
    ) -> Result<AppendEntriesReply, RaftError> {
        *self.is_req.lock().unwrap() = Some(req);
        self.ae_reply.lock().unwrap().clone().ok_or_else(|| self.unreachable())
    }

    async fn execute(&self, _cmd: Command) -> Result<ExecuteReply, RaftError> {
        Ok(ExecuteReply { success: true })
    }

    async fn get(&self, _req: GetRequest) -> Result<GetReply, RaftError> {
        Ok(GetReply { data: Vec::new() })
    }
}

/// Factory handing every peer a fresh `MockPeerProxy`, keeping hold of the
/// created proxies so tests can inspect recorded requests and stage replies.
#[derive(Default)]
pub(crate) struct MockPeerFactory {
    proxies: Mutex<HashMap<NodeId, Arc<MockPeerProxy>>>,
}

impl MockPeerFactory {
    pub fn proxy(&self, node_id: NodeId) -> Arc<MockPeerProxy> {
        self.proxies.lock().unwrap().get(&node_id).cloned().expect("unknown peer")
    }
}

impl PeerProxyFactory for MockPeerFactory {
    fn new_peer_proxy(&self, info: &NodeInfo) -> Result<Arc<dyn PeerProxy>, RaftError> {
        let proxy = Arc::new(MockPeerProxy::default());
        self.proxies.lock().unwrap().insert(info.id, proxy.clone());
        Ok(proxy)
    }
}

/// Peer infos for nodes `0..count`.
pub(crate) fn test_peer_infos(count: usize) -> HashMap<NodeId, NodeInfo> {
    (0..count as NodeId)
        .map(|id| (id, NodeInfo { id, endpoint: format!("localhost:{}", 9000 + id) }))
        .collect()
}
