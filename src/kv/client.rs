//! gRPC peer client, implementing the consensus layer's `PeerProxy`.

use std::sync::Arc;
use std::time::Duration;

use tonic::transport::{Channel, Endpoint};
use tonic::Request;

use crate::kv::convert::{
    from_pb_ae_reply, from_pb_rv_reply, to_pb_ae_request, to_pb_command, to_pb_rv_request,
};
use crate::kv::server::pb;
use crate::kv::server::pb::raft_kv_client::RaftKvClient;
use crate::raft::error::RaftError;
use crate::raft::message::{
    AppendEntriesReply, AppendEntriesRequest, Command, ExecuteReply, GetReply, GetRequest,
    NodeInfo, RequestVoteReply, RequestVoteRequest, SnapshotRequest,
};
use crate::raft::proxy::{PeerProxy, PeerProxyFactory};

/// Channel-level request deadline. The consensus core applies its own,
/// tighter deadlines per RPC kind; this is the backstop for forwarded client
/// calls which may have to wait for replication.
const CHANNEL_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot images are streamed in chunks of this size.
const SNAPSHOT_CHUNK_SIZE: usize = 64 * 1024;

/// gRPC proxy for one peer node.
pub struct KvPeerClient {
    info: NodeInfo,
    client: RaftKvClient<Channel>,
}

impl KvPeerClient {
    /// Create a client for the peer. The connection is established lazily on
    /// first use, so construction never blocks on the network.
    pub fn connect(info: &NodeInfo) -> Result<Self, RaftError> {
        let endpoint = Endpoint::from_shared(format!("http://{}", info.endpoint))
            .map_err(|err| RaftError::Transport {
                node_id: info.id,
                reason: format!("bad endpoint {}: {}", info.endpoint, err),
            })?
            .timeout(CHANNEL_TIMEOUT);

        Ok(KvPeerClient { info: info.clone(), client: RaftKvClient::new(endpoint.connect_lazy()) })
    }

    fn transport_error(&self, status: tonic::Status) -> RaftError {
        RaftError::Transport { node_id: self.info.id, reason: status.to_string() }
    }
}

#[tonic::async_trait]
impl PeerProxy for KvPeerClient {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RaftError> {
        let mut client = self.client.clone();
        let resp = client
            .append_entries(Request::new(to_pb_ae_request(&req)))
            .await
            .map_err(|status| self.transport_error(status))?;

        Ok(from_pb_ae_reply(resp.into_inner()))
    }

    async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteReply, RaftError> {
        let mut client = self.client.clone();
        let resp = client
            .request_vote(Request::new(to_pb_rv_request(&req)))
            .await
            .map_err(|status| self.transport_error(status))?;

        Ok(from_pb_rv_reply(resp.into_inner()))
    }

    async fn install_snapshot(
        &self,
        req: SnapshotRequest,
    ) -> Result<AppendEntriesReply, RaftError> {
        let bytes = tokio::fs::read(&req.file).await.map_err(|err| RaftError::Snapshot {
            reason: format!("cannot read {}: {}", req.file.display(), err),
        })?;

        let chunk_of = |data: Vec<u8>| pb::SnapshotChunk {
            term: req.term,
            leader_id: req.leader_id,
            snapshot_index: req.snapshot_index,
            snapshot_term: req.snapshot_term,
            data,
        };

        // always send at least the header chunk, even for an empty image
        let mut chunks: Vec<pb::SnapshotChunk> =
            bytes.chunks(SNAPSHOT_CHUNK_SIZE).map(|c| chunk_of(c.to_vec())).collect();
        if chunks.is_empty() {
            chunks.push(chunk_of(Vec::new()));
        }

        let mut client = self.client.clone();
        let resp = client
            .install_snapshot(Request::new(tokio_stream::iter(chunks)))
            .await
            .map_err(|status| self.transport_error(status))?;

        Ok(from_pb_ae_reply(resp.into_inner()))
    }

    async fn execute(&self, cmd: Command) -> Result<ExecuteReply, RaftError> {
        let mut client = self.client.clone();
        let resp = client
            .execute(Request::new(pb::ExecuteRequest { cmd: Some(to_pb_command(&cmd)) }))
            .await
            .map_err(|status| self.transport_error(status))?;

        Ok(ExecuteReply { success: resp.into_inner().success })
    }

    async fn get(&self, req: GetRequest) -> Result<GetReply, RaftError> {
        let mut client = self.client.clone();
        let resp = client
            .get(Request::new(pb::GetRequest { params: req.params }))
            .await
            .map_err(|status| self.transport_error(status))?;

        Ok(GetReply { data: resp.into_inner().data })
    }
}

/// Factory wiring one `KvPeerClient` per peer.
pub struct KvPeerClientFactory;

impl PeerProxyFactory for KvPeerClientFactory {
    fn new_peer_proxy(&self, info: &NodeInfo) -> Result<Arc<dyn PeerProxy>, RaftError> {
        Ok(Arc::new(KvPeerClient::connect(info)?))
    }
}
