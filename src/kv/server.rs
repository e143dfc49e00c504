//! gRPC server exposing a `Node`'s RPC surface to peers and clients.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::kv::convert::{
    from_pb_ae_request, from_pb_command, from_pb_rv_request, to_pb_ae_reply, to_pb_rv_reply,
};
use crate::raft::error::RaftError;
use crate::raft::message::{GetRequest, SnapshotRequest};
use crate::raft::snapshot;
use crate::raft::Node;

// Include the generated protobuf code
pub mod pb {
    tonic::include_proto!("raftkv");
}

use pb::raft_kv_server::{RaftKv, RaftKvServer};

/// gRPC service implementation backed by a running `Node`.
pub struct KvRpcServer {
    node: Arc<Node>,
    snapshot_dir: PathBuf,
}

impl KvRpcServer {
    pub fn new(node: Arc<Node>, snapshot_dir: PathBuf) -> Self {
        KvRpcServer { node, snapshot_dir }
    }

    /// Serve on `addr` until the returned handle is stopped.
    pub fn start(self, addr: SocketAddr) -> KvRpcServerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            Server::builder()
                .add_service(RaftKvServer::new(self))
                .serve_with_shutdown(addr, async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        KvRpcServerHandle { shutdown_tx, join }
    }
}

/// Handle for a running gRPC server.
pub struct KvRpcServerHandle {
    shutdown_tx: oneshot::Sender<()>,
    join: JoinHandle<Result<(), tonic::transport::Error>>,
}

impl KvRpcServerHandle {
    /// Initiate graceful shutdown and wait for the server to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(());
        let _ = self.join.await;
    }
}

fn to_status(err: RaftError) -> Status {
    match err {
        RaftError::NotLeader { .. } => Status::failed_precondition(err.to_string()),
        RaftError::NoLeaderAvailable | RaftError::Transport { .. } => {
            Status::unavailable(err.to_string())
        }
        _ => Status::internal(err.to_string()),
    }
}

#[tonic::async_trait]
impl RaftKv for KvRpcServer {
    async fn append_entries(
        &self,
        request: Request<pb::AppendEntriesRequest>,
    ) -> Result<Response<pb::AppendEntriesReply>, Status> {
        let req = from_pb_ae_request(request.into_inner());
        let reply = self.node.append_entries(&req);

        Ok(Response::new(to_pb_ae_reply(&reply)))
    }

    async fn request_vote(
        &self,
        request: Request<pb::RequestVoteRequest>,
    ) -> Result<Response<pb::RequestVoteReply>, Status> {
        let req = from_pb_rv_request(request.into_inner());
        let reply = self.node.request_vote(&req);

        Ok(Response::new(to_pb_rv_reply(&reply)))
    }

    async fn install_snapshot(
        &self,
        request: Request<Streaming<pb::SnapshotChunk>>,
    ) -> Result<Response<pb::AppendEntriesReply>, Status> {
        let mut stream = request.into_inner();

        let mut meta: Option<SnapshotRequest> = None;
        let mut file: Option<tokio::fs::File> = None;

        while let Some(chunk) = stream.message().await? {
            if meta.is_none() {
                // first chunk carries the header; the image lands in our own
                // snapshot directory, named after the sending leader
                let path = snapshot::snapshot_path(
                    &self.snapshot_dir,
                    chunk.leader_id,
                    chunk.snapshot_term,
                    chunk.snapshot_index,
                );
                tokio::fs::create_dir_all(&self.snapshot_dir)
                    .await
                    .map_err(|err| Status::internal(err.to_string()))?;
                file = Some(
                    tokio::fs::File::create(&path)
                        .await
                        .map_err(|err| Status::internal(err.to_string()))?,
                );
                meta = Some(SnapshotRequest {
                    term: chunk.term,
                    leader_id: chunk.leader_id,
                    snapshot_index: chunk.snapshot_index,
                    snapshot_term: chunk.snapshot_term,
                    file: path,
                });
            }

            if let Some(file) = file.as_mut() {
                file.write_all(&chunk.data)
                    .await
                    .map_err(|err| Status::internal(err.to_string()))?;
            }
        }

        let meta = meta.ok_or_else(|| Status::invalid_argument("empty snapshot stream"))?;
        if let Some(mut file) = file.take() {
            file.flush().await.map_err(|err| Status::internal(err.to_string()))?;
        }

        let reply = self.node.install_snapshot(&meta).map_err(to_status)?;
        Ok(Response::new(to_pb_ae_reply(&reply)))
    }

    async fn execute(
        &self,
        request: Request<pb::ExecuteRequest>,
    ) -> Result<Response<pb::ExecuteReply>, Status> {
        let cmd = from_pb_command(request.into_inner().cmd);
        let reply = self.node.execute(cmd).await.map_err(to_status)?;

        Ok(Response::new(pb::ExecuteReply { success: reply.success }))
    }

    async fn get(
        &self,
        request: Request<pb::GetRequest>,
    ) -> Result<Response<pb::GetReply>, Status> {
        let req = GetRequest { params: request.into_inner().params };
        let reply = self.node.get(&req).map_err(to_status)?;

        Ok(Response::new(pb::GetReply { data: reply.data }))
    }
}
