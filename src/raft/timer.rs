//! Election/heartbeat timer.
//!
//! One logical timer per node. The deadline is recomputed on every reset:
//! leaders get the fixed heartbeat period, everyone else draws a fresh
//! randomized election timeout so competing candidates cannot livelock on
//! split votes.

use std::sync::Weak;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::raft::node::{Node, NodeRole};

pub(crate) enum TimerSignal {
    Reset(NodeRole),
    Stop,
}

/// Cheap clonable handle used by state transitions to reset the timer.
#[derive(Clone)]
pub(crate) struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerSignal>,
}

impl TimerHandle {
    /// Restart the countdown in the mode matching `role`. Safe to call from
    /// under the node lock: this only enqueues a signal.
    pub fn reset(&self, role: NodeRole) {
        let _ = self.tx.send(TimerSignal::Reset(role));
    }

    pub fn stop(&self) {
        let _ = self.tx.send(TimerSignal::Stop);
    }
}

pub(crate) struct RaftTimer {
    rx: mpsc::UnboundedReceiver<TimerSignal>,
    election_timeout_min: Duration,
    heartbeat_interval: Duration,
}

impl RaftTimer {
    pub fn new(
        election_timeout_min: Duration,
        heartbeat_interval: Duration,
    ) -> (Self, TimerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let timer = RaftTimer { rx, election_timeout_min, heartbeat_interval };

        (timer, TimerHandle { tx })
    }

    /// Run the timer task. The weak back-reference keeps the timer from
    /// holding the node alive; the task exits once the node is gone.
    pub fn spawn(mut self, node: Weak<Node>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut role = NodeRole::Follower;
            let mut deadline = Instant::now() + self.timeout_for(role);

            loop {
                tokio::select! {
                    signal = self.rx.recv() => match signal {
                        Some(TimerSignal::Reset(new_role)) => {
                            role = new_role;
                            deadline = Instant::now() + self.timeout_for(role);
                        }
                        Some(TimerSignal::Stop) | None => break,
                    },
                    _ = time::sleep_until(deadline) => {
                        match node.upgrade() {
                            Some(node) => node.on_timer(),
                            None => break,
                        }
                        deadline = Instant::now() + self.timeout_for(role);
                    }
                }
            }
        })
    }

    fn timeout_for(&self, role: NodeRole) -> Duration {
        match role {
            NodeRole::Leader => self.heartbeat_interval,
            _ => {
                let min = self.election_timeout_min.as_millis() as u64;
                let jitter = rand::thread_rng().gen_range(0..min);
                Duration::from_millis(min + jitter)
            }
        }
    }
}
