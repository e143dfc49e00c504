//! Per-follower replication state.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::raft::message::{LogIndex, NodeInfo};
use crate::raft::proxy::PeerProxy;

/// How far `next_index` falls back on a failed consistency check. Stepping
/// by a whole window instead of one entry keeps catch-up latency bounded
/// when logs have diverged deeply.
const NEXT_INDEX_FALLBACK_STEP: LogIndex = 20;

/// Capacity of the replication signal channel. Concurrent triggers beyond
/// this coalesce: a full channel already guarantees another round will run.
const REPLICATION_SIGNAL_CAPACITY: usize = 20;

/// One cluster peer as seen by the leader: its proxy, its replication
/// indices, and the signal channel feeding its replication task.
pub struct Peer {
    pub info: NodeInfo,
    next_index: LogIndex,
    match_index: LogIndex,
    signal_tx: mpsc::Sender<()>,
    signal_rx: Option<mpsc::Receiver<()>>,
    pub proxy: Arc<dyn PeerProxy>,
}

impl Peer {
    pub fn new(info: NodeInfo, proxy: Arc<dyn PeerProxy>) -> Self {
        let (signal_tx, signal_rx) = mpsc::channel(REPLICATION_SIGNAL_CAPACITY);

        Peer {
            info,
            next_index: 0,
            match_index: -1,
            signal_tx,
            signal_rx: Some(signal_rx),
            proxy,
        }
    }

    pub fn next_index(&self) -> LogIndex {
        self.next_index
    }

    pub fn match_index(&self) -> LogIndex {
        self.match_index
    }

    /// Whether we have located the longest common prefix with this follower.
    pub fn has_match(&self) -> bool {
        self.match_index + 1 == self.next_index
    }

    /// Whether the follower still lags the leader's log.
    pub fn has_more_to_replicate(&self, last_index: LogIndex) -> bool {
        self.match_index < last_index
    }

    /// Fold an AppendEntries/InstallSnapshot reply into the indices.
    ///
    /// Successful replies only ever move `match_index` forward; replies can
    /// arrive out of order and a stale low match must not clobber a fresh
    /// higher one. Failures back `next_index` off by a fixed step.
    pub fn update_match_index(&mut self, success: bool, last_match: LogIndex) {
        if success {
            if last_match > self.match_index {
                self.match_index = last_match;
                self.next_index = last_match + 1;
            }
        } else {
            // cap at 0, negative next_index is meaningless
            self.next_index = (self.next_index - NEXT_INDEX_FALLBACK_STEP).max(0);
            self.match_index = -1;
        }
    }

    /// Reset indices for a fresh leadership term.
    pub fn reset(&mut self, last_log_index: LogIndex) {
        self.next_index = last_log_index + 1;
        self.match_index = -1;
    }

    /// Ask the replication task to run one round. Never blocks: if the
    /// channel is full a round is already pending and the signal coalesces.
    pub fn trigger_replication(&self) {
        let _ = self.signal_tx.try_send(());
    }

    /// Hand the signal receiver to the replication task. Yields `Some` only
    /// once.
    pub(crate) fn take_signal_rx(&mut self) -> Option<mpsc::Receiver<()>> {
        self.signal_rx.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::testing::MockPeerProxy;

    fn test_peer() -> Peer {
        let info = NodeInfo { id: 1, endpoint: "localhost:9001".to_string() };
        Peer::new(info, Arc::new(MockPeerProxy::default()))
    }

    #[test]
    fn test_new_peer_defaults() {
        let peer = test_peer();
        assert_eq!(peer.next_index(), 0);
        assert_eq!(peer.match_index(), -1);
        assert!(!peer.has_match());
    }

    #[test]
    fn test_has_match() {
        let mut peer = test_peer();
        peer.next_index = 5;
        peer.match_index = 4;
        assert!(peer.has_match());

        peer.match_index = 2;
        assert!(!peer.has_match());
    }

    #[test]
    fn test_has_more_to_replicate() {
        let mut peer = test_peer();
        peer.match_index = 3;
        assert!(peer.has_more_to_replicate(5));
        assert!(!peer.has_more_to_replicate(3));
    }

    #[test]
    fn test_update_match_index_success_moves_forward() {
        let mut peer = test_peer();
        peer.next_index = 5;
        peer.match_index = -1;

        peer.update_match_index(true, 6);
        assert_eq!(peer.next_index(), 7);
        assert_eq!(peer.match_index(), 6);
    }

    #[test]
    fn test_update_match_index_ignores_stale_success() {
        let mut peer = test_peer();
        peer.next_index = 9;
        peer.match_index = 8;

        // an older reply arriving late must not lower the match
        peer.update_match_index(true, 3);
        assert_eq!(peer.next_index(), 9);
        assert_eq!(peer.match_index(), 8);
    }

    #[test]
    fn test_update_match_index_failure_backs_off() {
        let mut peer = test_peer();
        peer.next_index = 5;
        peer.match_index = 4;

        peer.update_match_index(false, -1);
        assert_eq!(peer.next_index(), 0);
        assert_eq!(peer.match_index(), -1);

        peer.next_index = 45;
        peer.update_match_index(false, -1);
        assert_eq!(peer.next_index(), 25);
        assert_eq!(peer.match_index(), -1);
    }

    #[test]
    fn test_reset() {
        let mut peer = test_peer();
        peer.next_index = 30;
        peer.match_index = 20;

        peer.reset(3);
        assert_eq!(peer.next_index(), 4);
        assert_eq!(peer.match_index(), -1);
    }

    #[tokio::test]
    async fn test_trigger_replication_coalesces() {
        let mut peer = test_peer();
        let mut rx = peer.take_signal_rx().unwrap();

        // flooding the channel must never block or panic
        for _ in 0..REPLICATION_SIGNAL_CAPACITY * 3 {
            peer.trigger_replication();
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, REPLICATION_SIGNAL_CAPACITY);
    }
}
