//! The Raft node: role bookkeeping, RPC-facing operations and lifecycle.
//!
//! All mutable state lives in `NodeState` behind a single reader/writer
//! lock. The lock is never held across network I/O: requests are built in a
//! short critical section, the RPC is awaited without the lock, and the lock
//! is reacquired for reply handling. Leader-only logic lives in
//! `replication.rs`, election logic in `election.rs`.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use slog::{info, o, Logger};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::ClusterConfig;
use crate::raft::error::RaftError;
use crate::raft::log::LogManager;
use crate::raft::message::{
    AppendEntriesReply, AppendEntriesRequest, GetReply, GetRequest, LogIndex, NodeId,
    SnapshotRequest,
};
use crate::raft::peer_manager::{PeerManager, ReplicateFn, ReplicateFuture};
use crate::raft::proxy::PeerProxyFactory;
use crate::raft::state_machine::StateMachine;
use crate::raft::timer::{RaftTimer, TimerHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Follower => write!(f, "follower"),
            NodeRole::Candidate => write!(f, "candidate"),
            NodeRole::Leader => write!(f, "leader"),
        }
    }
}

/// Everything guarded by the node lock.
pub(crate) struct NodeState {
    pub(crate) node_id: NodeId,
    pub(crate) role: NodeRole,
    pub(crate) current_term: LogIndex,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) current_leader: Option<NodeId>,

    // candidate only
    pub(crate) votes: HashSet<NodeId>,

    pub(crate) log: LogManager,
    pub(crate) peers: PeerManager,
    pub(crate) timer: TimerHandle,
    pub(crate) logger: Logger,
}

impl NodeState {
    /// Adopt `new_term`. Terms never move backwards; a higher term clears
    /// the vote.
    pub(crate) fn set_term(&mut self, new_term: LogIndex) {
        if new_term < self.current_term {
            panic!(
                "term going backwards: {} -> {} on node {}",
                self.current_term, new_term, self.node_id
            );
        }

        if new_term > self.current_term {
            self.voted_for = None;
        }
        self.current_term = new_term;
    }

    /// Become follower of `source_id` at `new_term`. Until a real heartbeat
    /// for that term arrives, the source is our best guess at the leader.
    pub(crate) fn enter_follower_state(&mut self, source_id: NodeId, new_term: LogIndex) {
        let old_leader = self.current_leader;
        self.role = NodeRole::Follower;
        self.current_leader = Some(source_id);
        self.set_term(new_term);
        self.timer.reset(self.role);

        if source_id != self.node_id && old_leader != self.current_leader {
            info!(self.logger, "following new leader";
                "term" => self.current_term, "leader" => source_id);
        }
    }

    /// Become candidate: bump the term, vote for ourselves.
    pub(crate) fn enter_candidate_state(&mut self) {
        self.role = NodeRole::Candidate;
        self.current_leader = None;
        let next_term = self.current_term + 1;
        self.set_term(next_term);

        self.voted_for = Some(self.node_id);
        self.votes.clear();
        self.votes.insert(self.node_id);

        info!(self.logger, "starting election"; "term" => self.current_term);
    }

    /// Become leader for the current term and reset every follower's
    /// replication indices.
    pub(crate) fn enter_leader_state(&mut self) {
        self.role = NodeRole::Leader;
        self.current_leader = Some(self.node_id);
        self.peers.reset_follower_indices(self.log.last_index());

        info!(self.logger, "won election"; "term" => self.current_term);
    }

    /// Follow a peer that reports a higher term. Used on every RPC request
    /// and reply. With `follow_on_same_term` set (AppendEntries and snapshot
    /// traffic from the legitimate leader) an equal term also converts us to
    /// follower of the source. Returns true if we followed.
    pub(crate) fn try_follow_new_term(
        &mut self,
        source_id: NodeId,
        new_term: LogIndex,
        follow_on_same_term: bool,
    ) -> bool {
        if new_term > self.current_term
            || (new_term == self.current_term && follow_on_same_term)
        {
            self.enter_follower_state(source_id, new_term);
            return true;
        }

        false
    }
}

/// A member of the replicated state machine cluster.
///
/// Created with [`Node::new`], started with [`Node::start`]. All RPC entry
/// points are safe to call from any task.
pub struct Node {
    pub(crate) node_id: NodeId,
    pub(crate) cluster_size: usize,
    pub(crate) state: RwLock<NodeState>,
    pub(crate) timer: TimerHandle,
    pub(crate) logger: Logger,

    timer_task: Mutex<Option<RaftTimer>>,
    timer_join: Mutex<Option<JoinHandle<()>>>,
    stop_tx: watch::Sender<bool>,
    pub(crate) applied_rx: watch::Receiver<LogIndex>,
}

impl Node {
    /// Build a node from the cluster configuration, a state machine and a
    /// proxy factory for reaching peers.
    pub fn new(
        config: &ClusterConfig,
        state_machine: Box<dyn StateMachine>,
        factory: &dyn PeerProxyFactory,
        logger: Logger,
    ) -> Result<Arc<Node>, RaftError> {
        let peer_infos = config.peer_infos()?;
        let logger = logger.new(o!("node" => config.node_id));

        let (timer, timer_handle) =
            RaftTimer::new(config.election_timeout_min(), config.heartbeat_interval());

        let log = LogManager::new(
            config.node_id,
            state_machine,
            config.snapshot_dir.clone(),
            config.snapshot_threshold,
            logger.clone(),
        );
        let applied_rx = log.applied_watch();
        let peers = PeerManager::new(config.node_id, &peer_infos, factory)?;
        let (stop_tx, _) = watch::channel(false);

        let state = NodeState {
            node_id: config.node_id,
            role: NodeRole::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            votes: HashSet::new(),
            log,
            peers,
            timer: timer_handle.clone(),
            logger: logger.clone(),
        };

        Ok(Arc::new(Node {
            node_id: config.node_id,
            cluster_size: config.nodes.len(),
            state: RwLock::new(state),
            timer: timer_handle,
            logger,
            timer_task: Mutex::new(Some(timer)),
            timer_join: Mutex::new(None),
            stop_tx,
            applied_rx,
        }))
    }

    /// Start the election timer and the per-follower replication tasks.
    pub fn start(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let replicate: ReplicateFn = Arc::new(move |follower_id| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(node) = weak.upgrade() {
                    node.replicate(follower_id).await;
                }
            }) as ReplicateFuture
        });

        {
            let mut state = self.state.write().unwrap();
            let stop_rx = self.stop_tx.subscribe();
            state.peers.start(replicate, &stop_rx);
        }

        if let Some(timer) = self.timer_task.lock().unwrap().take() {
            let join = timer.spawn(Arc::downgrade(self));
            *self.timer_join.lock().unwrap() = Some(join);
        }
        self.timer.reset(NodeRole::Follower);

        info!(self.logger, "node started"; "cluster_size" => self.cluster_size);
    }

    /// Stop the timer and all replication tasks, blocking until every task
    /// has exited.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.timer.stop();

        let mut handles = self.state.write().unwrap().peers.take_handles();
        if let Some(join) = self.timer_join.lock().unwrap().take() {
            handles.push(join);
        }
        for handle in handles {
            let _ = handle.await;
        }

        info!(self.logger, "node stopped");
    }

    /// Timer callback: followers and candidates start an election, the
    /// leader fans out a heartbeat.
    pub fn on_timer(self: &Arc<Self>) {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        match state.role {
            NodeRole::Follower | NodeRole::Candidate => self.start_election(state),
            NodeRole::Leader => self.send_heartbeat(state),
        }
    }

    /// AppendEntries RPC: log reconciliation plus heartbeat handling.
    pub fn append_entries(&self, req: &AppendEntriesRequest) -> AppendEntriesReply {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        if req.term < state.current_term {
            return AppendEntriesReply {
                term: state.current_term,
                node_id: self.node_id,
                leader_id: req.leader_id,
                success: false,
                last_match: -1,
            };
        }

        // AppendEntries only ever comes from the legitimate leader of
        // req.term, so an equal term also makes us its follower.
        state.try_follow_new_term(req.leader_id, req.term, true);

        let success = state.log.process_logs(req.prev_log_index, req.prev_log_term, &req.entries);
        let mut last_match = -1;
        if success {
            state.log.commit(req.leader_commit);
            last_match = req.prev_log_index + req.entries.len() as i64;
        }

        AppendEntriesReply {
            term: state.current_term,
            node_id: self.node_id,
            leader_id: req.leader_id,
            success,
            last_match,
        }
    }

    /// InstallSnapshot RPC. The transport has already materialized the
    /// snapshot bytes into the local file named in the request.
    pub fn install_snapshot(
        &self,
        req: &SnapshotRequest,
    ) -> Result<AppendEntriesReply, RaftError> {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        if req.term < state.current_term {
            return Ok(AppendEntriesReply {
                term: state.current_term,
                node_id: self.node_id,
                leader_id: req.leader_id,
                success: false,
                last_match: -1,
            });
        }

        state.try_follow_new_term(req.leader_id, req.term, true);
        state.log.install_snapshot(req)?;

        Ok(AppendEntriesReply {
            term: state.current_term,
            node_id: self.node_id,
            leader_id: req.leader_id,
            success: true,
            last_match: req.snapshot_index,
        })
    }

    /// Read from the local state machine. Leader only; without read-index or
    /// leases a deposed leader can serve stale values until it learns about
    /// the new term.
    pub fn get(&self, req: &GetRequest) -> Result<GetReply, RaftError> {
        let guard = self.state.read().unwrap();

        if guard.role != NodeRole::Leader {
            return Err(RaftError::NotLeader { leader_hint: guard.current_leader });
        }

        guard.log.state_machine().get(req)
    }

    pub fn role(&self) -> NodeRole {
        self.state.read().unwrap().role
    }

    pub fn is_leader(&self) -> bool {
        self.role() == NodeRole::Leader
    }

    pub fn current_term(&self) -> LogIndex {
        self.state.read().unwrap().current_term
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.state.read().unwrap().current_leader
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.state.read().unwrap().voted_for
    }

    pub fn last_index(&self) -> LogIndex {
        self.state.read().unwrap().log.last_index()
    }

    pub fn commit_index(&self) -> LogIndex {
        self.state.read().unwrap().log.commit_index()
    }

    pub fn last_applied(&self) -> LogIndex {
        self.state.read().unwrap().log.last_applied()
    }
}
