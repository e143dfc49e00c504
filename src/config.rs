//! Cluster configuration.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::raft::error::RaftError;
use crate::raft::message::{NodeId, NodeInfo};

fn default_election_timeout_min_ms() -> u64 {
    150
}

fn default_snapshot_threshold() -> i64 {
    1024
}

/// Static configuration for one cluster member. The node set is fixed for
/// the lifetime of the cluster.
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterConfig {
    /// Id of the local node. Usually supplied on the command line rather
    /// than in the config file, so every member can share one file.
    #[serde(default)]
    pub node_id: NodeId,

    /// All cluster members, the local node included.
    pub nodes: Vec<NodeInfo>,

    /// Directory for snapshot images.
    pub snapshot_dir: PathBuf,

    /// Lower bound of the randomized election timeout; the actual timeout is
    /// drawn from `[min, 2*min)`. Heartbeats run at a third of this.
    #[serde(default = "default_election_timeout_min_ms")]
    pub election_timeout_min_ms: u64,

    /// Take a snapshot every this many applied entries. Zero disables
    /// automatic snapshotting.
    #[serde(default = "default_snapshot_threshold")]
    pub snapshot_threshold: i64,
}

impl ClusterConfig {
    /// Load a shared cluster config file and bind it to `node_id`.
    pub fn from_file(path: &Path, node_id: NodeId) -> Result<Self, RaftError> {
        let file = File::open(path).map_err(|err| RaftError::InvalidConfig {
            reason: format!("cannot open {}: {}", path.display(), err),
        })?;
        let mut config: ClusterConfig = serde_json::from_reader(BufReader::new(file))
            .map_err(|err| RaftError::InvalidConfig {
                reason: format!("cannot parse {}: {}", path.display(), err),
            })?;
        config.node_id = node_id;

        Ok(config)
    }

    /// Info for the local node.
    pub fn local_info(&self) -> Result<&NodeInfo, RaftError> {
        self.nodes
            .iter()
            .find(|n| n.id == self.node_id)
            .ok_or_else(|| RaftError::InvalidConfig {
                reason: format!("node {} is not part of the cluster", self.node_id),
            })
    }

    /// All members except the local node, keyed by id. Fails on duplicate
    /// ids, an unknown local id, or a single-member cluster.
    pub fn peer_infos(&self) -> Result<HashMap<NodeId, NodeInfo>, RaftError> {
        self.local_info()?;

        let mut peers = HashMap::with_capacity(self.nodes.len() - 1);
        for info in &self.nodes {
            if info.id == self.node_id {
                continue;
            }
            if peers.insert(info.id, info.clone()).is_some() {
                return Err(RaftError::InvalidConfig {
                    reason: format!("duplicate node id {}", info.id),
                });
            }
        }

        if peers.is_empty() {
            return Err(RaftError::InvalidConfig {
                reason: "cluster needs at least two members".to_string(),
            });
        }

        Ok(peers)
    }

    pub fn election_timeout_min(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms / 3)
    }
}
