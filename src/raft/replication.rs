//! Leader-side replication: per-follower rounds, reply accounting, commit
//! advancement and client command execution.

use std::sync::Arc;
use std::time::Duration;

use slog::{trace, warn};
use tokio::time::timeout;

use crate::raft::error::RaftError;
use crate::raft::message::{
    AppendEntriesReply, AppendEntriesRequest, Command, ExecuteReply, LogIndex, NodeId,
    SnapshotRequest,
};
use crate::raft::node::{Node, NodeRole, NodeState};
use crate::raft::proxy::PeerProxy;

/// Upper bound on entries per AppendEntries request.
const MAX_APPEND_ENTRIES_COUNT: LogIndex = 100;

/// Deadline for a single replication or vote RPC.
pub(crate) const RPC_TIMEOUT: Duration = Duration::from_millis(200);

/// Snapshot transfers move far more data.
pub(crate) const SNAPSHOT_RPC_TIMEOUT: Duration = Duration::from_millis(600);

/// Work selected for one replication round, built under the read lock and
/// executed after it is released.
enum ReplicationWork {
    /// Not leader anymore, or the follower is unknown.
    None,
    Entries(AppendEntriesRequest, Arc<dyn PeerProxy>),
    Snapshot(SnapshotRequest, Arc<dyn PeerProxy>),
}

impl Node {
    /// Trigger one replication round on every follower. Caller holds the
    /// lock; the rounds themselves run on the per-follower tasks.
    pub(crate) fn send_heartbeat(&self, state: &NodeState) {
        for peer in state.peers.peers() {
            peer.trigger_replication();
        }

        // 5.2 - leadership is asserted, restart the heartbeat countdown
        state.timer.reset(NodeRole::Leader);
    }

    /// One replication round against `follower_id`: snapshot when the
    /// follower is behind the compaction boundary, a batch of entries once a
    /// matching prefix is known, an empty probe otherwise.
    pub(crate) async fn replicate(self: &Arc<Self>, follower_id: NodeId) {
        let work = self.prepare_replication(follower_id);

        let result = match work {
            ReplicationWork::None => return,
            ReplicationWork::Entries(req, proxy) => {
                timeout(RPC_TIMEOUT, proxy.append_entries(req)).await
            }
            ReplicationWork::Snapshot(req, proxy) => {
                timeout(SNAPSHOT_RPC_TIMEOUT, proxy.install_snapshot(req)).await
            }
        };

        match result {
            Ok(Ok(reply)) => self.handle_replication_reply(reply),
            Ok(Err(err)) => {
                trace!(self.logger, "replication rpc failed";
                    "follower" => follower_id, "error" => err.to_string());
            }
            Err(_) => {
                trace!(self.logger, "replication rpc timed out"; "follower" => follower_id);
            }
        }
    }

    /// Build the outgoing request for one round under the read lock.
    fn prepare_replication(&self, follower_id: NodeId) -> ReplicationWork {
        let guard = self.state.read().unwrap();
        let state = &*guard;

        if state.role != NodeRole::Leader {
            return ReplicationWork::None;
        }
        let peer = match state.peers.get_peer(follower_id) {
            Some(peer) => peer,
            None => return ReplicationWork::None,
        };

        if peer.next_index() <= state.log.snapshot_index() {
            // the entries this follower needs are compacted away
            match self.create_snapshot_request(state) {
                Some(req) => {
                    trace!(self.logger, "sending snapshot";
                        "follower" => follower_id, "snapshot_index" => req.snapshot_index);
                    ReplicationWork::Snapshot(req, peer.proxy.clone())
                }
                None => {
                    warn!(self.logger, "snapshot needed but no snapshot file present";
                        "follower" => follower_id);
                    ReplicationWork::None
                }
            }
        } else {
            // probe with empty entries until the matching prefix is found
            let max_count = if peer.has_match() { MAX_APPEND_ENTRIES_COUNT } else { 0 };
            let req = self.create_ae_request(state, peer.next_index(), max_count);
            ReplicationWork::Entries(req, peer.proxy.clone())
        }
    }

    /// Fold in an AppendEntries/InstallSnapshot reply and push replication
    /// forward when the follower still lags or new entries became
    /// committable.
    pub(crate) fn handle_replication_reply(&self, reply: AppendEntriesReply) {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        if state.try_follow_new_term(reply.node_id, reply.term, false) {
            return;
        }

        let peer = match state.peers.get_peer_mut(reply.node_id) {
            Some(peer) => peer,
            None => return,
        };

        // 5.3 - update follower indices, then try to advance the commit
        peer.update_match_index(reply.success, reply.last_match);
        let new_commit = reply.success && self.leader_commit(state);

        let last_index = state.log.last_index();
        if let Some(peer) = state.peers.get_peer(reply.node_id) {
            if new_commit || peer.has_more_to_replicate(last_index) {
                peer.trigger_replication();
            }
        }
    }

    /// Commit to the highest index of the current term with quorum. Entries
    /// from earlier terms are never committed on quorum alone (§5.4.2); they
    /// commit transitively once an entry of this term does.
    pub(crate) fn leader_commit(&self, state: &mut NodeState) -> bool {
        let mut commit_index = state.log.commit_index();

        let mut index = state.log.last_index();
        while index > state.log.commit_index() {
            let term = state.log.entry(index).term;
            if term < state.current_term {
                // ownership of older entries cannot be established
                break;
            }
            if term == state.current_term && state.peers.quorum_reached(index) {
                commit_index = index;
                break;
            }
            index -= 1;
        }

        if commit_index > state.log.commit_index() {
            trace!(self.logger, "quorum commit";
                "term" => state.current_term, "commit_index" => commit_index);
            state.log.commit(commit_index);
            return true;
        }

        false
    }

    fn create_ae_request(
        &self,
        state: &NodeState,
        next_index: LogIndex,
        max_count: LogIndex,
    ) -> AppendEntriesRequest {
        // never reach below the snapshot boundary
        let start = next_index.max(state.log.snapshot_index() + 1);
        let end = (state.log.last_index() + 1).min(start + max_count);

        let (entries, prev_log_index, prev_log_term) = state.log.get_log_entries(start, end);

        AppendEntriesRequest {
            term: state.current_term,
            leader_id: self.node_id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: state.log.commit_index(),
        }
    }

    fn create_snapshot_request(&self, state: &NodeState) -> Option<SnapshotRequest> {
        Some(SnapshotRequest {
            term: state.current_term,
            leader_id: self.node_id,
            snapshot_index: state.log.snapshot_index(),
            snapshot_term: state.log.snapshot_term(),
            file: state.log.snapshot_file()?.to_path_buf(),
        })
    }

    /// Execute a client command: the leader appends it to the log, fans out
    /// replication and waits until the entry is applied locally. Non-leaders
    /// forward to the known leader, or fail when there is none. Dropping the
    /// returned future cancels only the wait, never the replication.
    pub async fn execute(self: &Arc<Self>, cmd: Command) -> Result<ExecuteReply, RaftError> {
        enum Route {
            Wait(LogIndex),
            Forward(Arc<dyn PeerProxy>, Command),
            NoLeader,
        }

        let route = {
            let mut guard = self.state.write().unwrap();
            let state = &mut *guard;

            if state.role == NodeRole::Leader {
                let index = state.log.append(cmd, state.current_term);
                for peer in state.peers.peers() {
                    peer.trigger_replication();
                }
                Route::Wait(index)
            } else {
                match state.current_leader.and_then(|id| state.peers.get_peer(id)) {
                    Some(peer) => Route::Forward(peer.proxy.clone(), cmd),
                    None => Route::NoLeader,
                }
            }
        };

        match route {
            Route::Wait(index) => {
                let mut applied_rx = self.applied_rx.clone();
                loop {
                    if *applied_rx.borrow() >= index {
                        return Ok(ExecuteReply { success: true });
                    }
                    if applied_rx.changed().await.is_err() {
                        return Err(RaftError::Store { reason: "node shut down".to_string() });
                    }
                }
            }
            Route::Forward(proxy, cmd) => proxy.execute(cmd).await,
            Route::NoLeader => Err(RaftError::NoLeaderAvailable),
        }
    }
}
