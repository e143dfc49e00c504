//! Peer set management: follower indices, quorum detection and the
//! long-lived replication task per follower.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::raft::error::RaftError;
use crate::raft::message::{LogIndex, NodeId, NodeInfo};
use crate::raft::peer::Peer;
use crate::raft::proxy::PeerProxyFactory;

/// Boxed future of one replication round.
pub type ReplicateFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback running one replication round against the given follower.
pub type ReplicateFn = Arc<dyn Fn(NodeId) -> ReplicateFuture + Send + Sync>;

/// Owns every `Peer` except the local node, plus their replication tasks.
pub struct PeerManager {
    peers: HashMap<NodeId, Peer>,
    cluster_size: usize,
    handles: Vec<JoinHandle<()>>,
}

impl PeerManager {
    /// Build the peer set from the cluster configuration. `peers` must not
    /// be empty and must not contain the local node.
    pub fn new(
        node_id: NodeId,
        peers: &HashMap<NodeId, NodeInfo>,
        factory: &dyn PeerProxyFactory,
    ) -> Result<Self, RaftError> {
        if peers.is_empty() {
            return Err(RaftError::InvalidConfig { reason: "no raft peers provided".to_string() });
        }
        if peers.contains_key(&node_id) {
            return Err(RaftError::InvalidConfig {
                reason: format!("node {} is listed in its own peer set", node_id),
            });
        }

        let mut map = HashMap::with_capacity(peers.len());
        for info in peers.values() {
            let proxy = factory.new_peer_proxy(info)?;
            map.insert(info.id, Peer::new(info.clone(), proxy));
        }

        Ok(PeerManager {
            cluster_size: map.len() + 1,
            peers: map,
            handles: Vec::new(),
        })
    }

    pub fn get_peer(&self, node_id: NodeId) -> Option<&Peer> {
        self.peers.get(&node_id)
    }

    pub fn get_peer_mut(&mut self, node_id: NodeId) -> Option<&mut Peer> {
        self.peers.get_mut(&node_id)
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.peers.values()
    }

    /// Reset every follower to `next_index = last_log_index + 1`,
    /// `match_index = -1`. Invoked on winning an election.
    pub fn reset_follower_indices(&mut self, last_log_index: LogIndex) {
        for peer in self.peers.values_mut() {
            peer.reset(last_log_index);
        }
    }

    /// Whether a strict majority of the cluster has `log_index` replicated.
    /// The leader itself counts toward the majority.
    pub fn quorum_reached(&self, log_index: LogIndex) -> bool {
        let mut match_count = 1;
        let quorum = self.cluster_size / 2;
        for peer in self.peers.values() {
            if peer.match_index() >= log_index {
                match_count += 1;
                if match_count > quorum {
                    return true;
                }
            }
        }

        false
    }

    /// Signal every follower's replication task.
    pub fn trigger_all(&self) {
        for peer in self.peers.values() {
            peer.trigger_replication();
        }
    }

    /// Spawn one replication task per follower. Each task alternates between
    /// its signal channel and the stop channel; `replicate` runs the actual
    /// round so the tasks never hold a reference to the node itself.
    pub fn start(&mut self, replicate: ReplicateFn, stop_rx: &watch::Receiver<bool>) {
        for peer in self.peers.values_mut() {
            let mut signal_rx = match peer.take_signal_rx() {
                Some(rx) => rx,
                None => continue, // already started
            };
            let mut stop_rx = stop_rx.clone();
            let replicate = replicate.clone();
            let follower_id = peer.info.id;

            self.handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        sig = signal_rx.recv() => match sig {
                            Some(()) => replicate(follower_id).await,
                            None => break,
                        },
                        _ = stop_rx.changed() => break,
                    }
                }
            }));
        }
    }

    /// Hand out the replication task handles so `stop` can await them after
    /// releasing the node lock.
    pub fn take_handles(&mut self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut self.handles)
    }
}
