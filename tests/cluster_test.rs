//! Multi-node cluster scenarios over an in-process transport.
//!
//! Most tests run with election timeouts long enough that timers never fire
//! on their own; elections are driven explicitly through `on_timer` so the
//! scenarios stay deterministic. One smoke test at the end runs with real
//! timers end to end.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use raftkv::kv::{set_command, KvStore};
use raftkv::logging;
use raftkv::raft::{
    AppendEntriesReply, AppendEntriesRequest, Command, ExecuteReply, GetReply, GetRequest,
    LogEntry, Node, NodeId, NodeInfo, NodeRole, PeerProxy, PeerProxyFactory, RaftError,
    RequestVoteReply, RequestVoteRequest, SnapshotRequest,
};
use raftkv::ClusterConfig;

/// In-process cluster fabric: proxies resolve their target node at call time
/// so nodes can be wired up (or partitioned away) in any order.
#[derive(Clone, Default)]
struct LocalNet {
    nodes: Arc<Mutex<HashMap<NodeId, Arc<Node>>>>,
}

impl LocalNet {
    fn register(&self, id: NodeId, node: Arc<Node>) {
        self.nodes.lock().unwrap().insert(id, node);
    }

    /// Simulate a partition: calls to this node fail until re-registered.
    fn disconnect(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.lock().unwrap().remove(&id)
    }

    fn node(&self, id: NodeId) -> Result<Arc<Node>, RaftError> {
        self.nodes.lock().unwrap().get(&id).cloned().ok_or(RaftError::Transport {
            node_id: id,
            reason: "peer unreachable".to_string(),
        })
    }
}

struct LocalProxy {
    net: LocalNet,
    target: NodeId,
}

#[tonic::async_trait]
impl PeerProxy for LocalProxy {
    async fn append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesReply, RaftError> {
        Ok(self.net.node(self.target)?.append_entries(&req))
    }

    async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteReply, RaftError> {
        Ok(self.net.node(self.target)?.request_vote(&req))
    }

    async fn install_snapshot(
        &self,
        req: SnapshotRequest,
    ) -> Result<AppendEntriesReply, RaftError> {
        self.net.node(self.target)?.install_snapshot(&req)
    }

    async fn execute(&self, cmd: Command) -> Result<ExecuteReply, RaftError> {
        self.net.node(self.target)?.execute(cmd).await
    }

    async fn get(&self, req: GetRequest) -> Result<GetReply, RaftError> {
        self.net.node(self.target)?.get(&req)
    }
}

impl PeerProxyFactory for LocalNet {
    fn new_peer_proxy(&self, info: &NodeInfo) -> Result<Arc<dyn PeerProxy>, RaftError> {
        Ok(Arc::new(LocalProxy { net: self.clone(), target: info.id }))
    }
}

struct TestCluster {
    net: LocalNet,
    nodes: Vec<Arc<Node>>,
    stores: Vec<KvStore>,
    _snapshot_dirs: Vec<tempfile::TempDir>,
}

impl TestCluster {
    /// Build and start `size` nodes. `election_timeout_min_ms` of 60s keeps
    /// the timers quiet so tests drive elections themselves.
    fn new(size: usize, election_timeout_min_ms: u64, snapshot_threshold: i64) -> Self {
        let infos: Vec<NodeInfo> = (0..size as NodeId)
            .map(|id| NodeInfo { id, endpoint: format!("local:{}", id) })
            .collect();

        let net = LocalNet::default();
        let mut nodes = Vec::new();
        let mut stores = Vec::new();
        let mut dirs = Vec::new();

        for id in 0..size as NodeId {
            let dir = tempfile::tempdir().unwrap();
            let config = ClusterConfig {
                node_id: id,
                nodes: infos.clone(),
                snapshot_dir: dir.path().to_path_buf(),
                election_timeout_min_ms,
                snapshot_threshold,
            };
            let store = KvStore::new();
            let node = Node::new(
                &config,
                Box::new(store.clone()),
                &net,
                logging::discard_logger(),
            )
            .unwrap();

            node.start();
            net.register(id, node.clone());
            nodes.push(node);
            stores.push(store);
            dirs.push(dir);
        }

        TestCluster { net, nodes, stores, _snapshot_dirs: dirs }
    }

    fn quiet(size: usize) -> Self {
        TestCluster::new(size, 60_000, 0)
    }

    async fn stop(self) {
        for node in &self.nodes {
            node.stop().await;
        }
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

#[tokio::test]
async fn test_fresh_cluster_elects_candidate() {
    let cluster = TestCluster::quiet(3);

    cluster.nodes[2].on_timer();

    assert!(
        wait_for(|| cluster.nodes[2].is_leader(), Duration::from_secs(2)).await,
        "node 2 should win the election"
    );
    assert_eq!(cluster.nodes[2].current_term(), 1);

    // the other nodes learn about the leader through its first heartbeat
    assert!(
        wait_for(
            || (0..2).all(|i| {
                cluster.nodes[i].role() == NodeRole::Follower
                    && cluster.nodes[i].current_leader() == Some(2)
                    && cluster.nodes[i].current_term() == 1
            }),
            Duration::from_secs(2),
        )
        .await
    );

    cluster.stop().await;
}

#[tokio::test]
async fn test_commands_replicate_to_all_state_machines() {
    let cluster = TestCluster::quiet(3);

    cluster.nodes[0].on_timer();
    assert!(wait_for(|| cluster.nodes[0].is_leader(), Duration::from_secs(2)).await);

    for i in 0..5 {
        let reply = cluster.nodes[0]
            .execute(set_command(&format!("k{}", i), &format!("v{}", i)))
            .await
            .unwrap();
        assert!(reply.success);
    }
    assert_eq!(cluster.nodes[0].commit_index(), 4);

    // a heartbeat carries the final commit index to the followers
    cluster.nodes[0].on_timer();

    assert!(
        wait_for(
            || cluster.nodes.iter().all(|n| n.commit_index() == 4),
            Duration::from_secs(2),
        )
        .await,
        "all nodes should reach commit index 4"
    );
    for store in &cluster.stores {
        for i in 0..5 {
            assert_eq!(store.value(&format!("k{}", i)), Some(format!("v{}", i)));
        }
    }

    cluster.stop().await;
}

#[tokio::test]
async fn test_divergent_follower_log_is_repaired() {
    let cluster = TestCluster::quiet(3);

    let prefix = vec![
        LogEntry { index: 0, term: 1, cmd: set_command("k0", "v0") },
        LogEntry { index: 1, term: 1, cmd: set_command("k1", "v1") },
    ];

    // a term-1 leader replicated two entries everywhere
    for node in &cluster.nodes {
        let reply = node.append_entries(&AppendEntriesRequest {
            term: 1,
            leader_id: 0,
            prev_log_index: -1,
            prev_log_term: -1,
            entries: prefix.clone(),
            leader_commit: -1,
        });
        assert!(reply.success);
    }

    // a short-lived term-2 leader got one extra entry onto node 1 only
    let reply = cluster.nodes[1].append_entries(&AppendEntriesRequest {
        term: 2,
        leader_id: 2,
        prev_log_index: 1,
        prev_log_term: 1,
        entries: vec![LogEntry { index: 2, term: 2, cmd: set_command("k2", "stale") }],
        leader_commit: -1,
    });
    assert!(reply.success);
    assert_eq!(cluster.nodes[1].last_index(), 2);

    // node 0 runs a failed election at term 2 (everyone unreachable), then
    // wins at term 3
    let n1 = cluster.net.disconnect(1).unwrap();
    let n2 = cluster.net.disconnect(2).unwrap();
    cluster.nodes[0].on_timer();
    assert!(
        wait_for(
            || cluster.nodes[0].role() == NodeRole::Candidate
                && cluster.nodes[0].current_term() == 2,
            Duration::from_secs(2),
        )
        .await
    );
    cluster.net.register(1, n1);
    cluster.net.register(2, n2);
    cluster.nodes[0].on_timer();
    assert!(wait_for(|| cluster.nodes[0].is_leader(), Duration::from_secs(2)).await);
    assert_eq!(cluster.nodes[0].current_term(), 3);

    // the new leader overwrites the stale suffix on node 1
    cluster.nodes[0].execute(set_command("k2", "fresh")).await.unwrap();
    cluster.nodes[0].execute(set_command("k3", "v3")).await.unwrap();
    cluster.nodes[0].on_timer();

    assert!(
        wait_for(
            || cluster.nodes[1].commit_index() == 3,
            Duration::from_secs(2),
        )
        .await,
        "node 1 should converge on the leader's log"
    );
    assert_eq!(cluster.nodes[1].last_index(), 3);
    assert_eq!(cluster.stores[1].value("k2"), Some("fresh".to_string()));
    assert_eq!(cluster.stores[1].value("k3"), Some("v3".to_string()));
    assert_eq!(cluster.stores[1].value("k0"), Some("v0".to_string()));

    cluster.stop().await;
}

#[tokio::test]
async fn test_lagging_follower_catches_up_through_snapshot() {
    let cluster = TestCluster::new(3, 60_000, 5);

    // node 2 is partitioned away from the start
    let n2 = cluster.net.disconnect(2).unwrap();

    cluster.nodes[0].on_timer();
    assert!(wait_for(|| cluster.nodes[0].is_leader(), Duration::from_secs(2)).await);

    for i in 0..8 {
        cluster.nodes[0]
            .execute(set_command(&format!("k{}", i), &format!("v{}", i)))
            .await
            .unwrap();
    }

    // the threshold of 5 forces a snapshot along the way
    assert!(
        wait_for(|| cluster.nodes[0].last_applied() == 7, Duration::from_secs(2)).await
    );

    // node 2 comes back; the next round has to use InstallSnapshot since the
    // entries it needs are compacted away
    cluster.net.register(2, n2);
    cluster.nodes[0].on_timer();

    assert!(
        wait_for(
            || cluster.nodes[2].commit_index() == 7 && cluster.nodes[2].last_index() == 7,
            Duration::from_secs(5),
        )
        .await,
        "node 2 should catch up via snapshot plus entries"
    );
    for i in 0..8 {
        assert_eq!(
            cluster.stores[2].value(&format!("k{}", i)),
            Some(format!("v{}", i))
        );
    }

    cluster.stop().await;
}

#[tokio::test]
async fn test_leader_steps_down_when_new_term_wins() {
    let cluster = TestCluster::quiet(3);

    cluster.nodes[0].on_timer();
    assert!(wait_for(|| cluster.nodes[0].is_leader(), Duration::from_secs(2)).await);
    assert_eq!(cluster.nodes[0].current_term(), 1);

    // node 1 calls a fresh election at term 2 and wins
    cluster.nodes[1].on_timer();
    assert!(wait_for(|| cluster.nodes[1].is_leader(), Duration::from_secs(2)).await);
    assert_eq!(cluster.nodes[1].current_term(), 2);

    assert!(
        wait_for(
            || cluster.nodes[0].role() == NodeRole::Follower
                && cluster.nodes[0].current_term() == 2,
            Duration::from_secs(2),
        )
        .await,
        "the old leader should step down"
    );
    // stepping down went through RequestVote, so the vote went to node 1
    assert_eq!(cluster.nodes[0].voted_for(), Some(1));
    assert_eq!(cluster.nodes[0].current_leader(), Some(1));

    cluster.stop().await;
}

#[tokio::test]
async fn test_forwarded_writes_and_leader_reads() {
    let cluster = TestCluster::quiet(3);

    cluster.nodes[0].on_timer();
    assert!(wait_for(|| cluster.nodes[0].is_leader(), Duration::from_secs(2)).await);
    // followers need a heartbeat to learn the leader before they can forward
    assert!(
        wait_for(
            || cluster.nodes[1].current_leader() == Some(0),
            Duration::from_secs(2),
        )
        .await
    );

    // write through a follower: it forwards to the leader
    let reply = cluster.nodes[1].execute(set_command("city", "metropolis")).await.unwrap();
    assert!(reply.success);

    // reads are leader-only
    let req = GetRequest { params: vec!["city".to_string()] };
    let reply = cluster.nodes[0].get(&req).unwrap();
    assert_eq!(reply.data, b"metropolis");

    match cluster.nodes[1].get(&req) {
        Err(RaftError::NotLeader { leader_hint }) => assert_eq!(leader_hint, Some(0)),
        other => panic!("expected NotLeader from follower, got {:?}", other.map(|_| ())),
    }

    cluster.stop().await;
}

/// End-to-end smoke test with real timers: the cluster elects a leader on
/// its own and replicates a command submitted through an arbitrary node.
#[tokio::test]
async fn test_cluster_converges_with_real_timers() {
    let cluster = TestCluster::new(3, 150, 0);

    let leader_elected = wait_for(
        || cluster.nodes.iter().any(|n| n.is_leader()),
        Duration::from_secs(10),
    )
    .await;
    assert!(leader_elected, "a leader should emerge from randomized timeouts");

    // submit through node 0 whether or not it is the leader; forwarding (or
    // a not-yet-known leader) may need a few attempts right after election
    let mut accepted = false;
    for _ in 0..50 {
        match cluster.nodes[0].execute(set_command("answer", "42")).await {
            Ok(reply) if reply.success => {
                accepted = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    assert!(accepted, "the cluster should accept a write once a leader is known");

    assert!(
        wait_for(
            || cluster
                .stores
                .iter()
                .all(|s| s.value("answer") == Some("42".to_string())),
            Duration::from_secs(10),
        )
        .await,
        "the write should reach every state machine"
    );

    cluster.stop().await;
}
