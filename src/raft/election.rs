//! Election logic: candidacy, vote counting and the RequestVote RPC.

use std::sync::Arc;

use slog::trace;
use tokio::time::timeout;

use crate::raft::message::{RequestVoteReply, RequestVoteRequest};
use crate::raft::node::{Node, NodeRole, NodeState};
use crate::raft::replication::RPC_TIMEOUT;

impl Node {
    /// Start an election for the next term: become candidate and broadcast
    /// RequestVote. Replies come back on separate tasks and are folded in by
    /// `handle_request_vote_reply`. Caller holds the write lock.
    pub(crate) fn start_election(self: &Arc<Self>, state: &mut NodeState) {
        state.enter_candidate_state();

        let req = RequestVoteRequest {
            term: state.current_term,
            candidate_id: self.node_id,
            last_log_index: state.log.last_index(),
            last_log_term: state.log.last_term(),
        };

        for peer in state.peers.peers() {
            let proxy = peer.proxy.clone();
            let peer_id = peer.info.id;
            let req = req.clone();
            let node = Arc::clone(self);

            tokio::spawn(async move {
                match timeout(RPC_TIMEOUT, proxy.request_vote(req)).await {
                    Ok(Ok(reply)) => node.handle_request_vote_reply(reply),
                    Ok(Err(err)) => {
                        trace!(node.logger, "request vote failed";
                            "peer" => peer_id, "error" => err.to_string());
                    }
                    Err(_) => {
                        trace!(node.logger, "request vote timed out"; "peer" => peer_id);
                    }
                }
            });
        }

        state.timer.reset(state.role);
    }

    /// Fold in one RequestVote reply; promotes to leader on a majority.
    pub(crate) fn handle_request_vote_reply(self: &Arc<Self>, reply: RequestVoteReply) {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        if state.try_follow_new_term(reply.node_id, reply.term, false) {
            // a higher term is out there, this election is over
            return;
        }

        if reply.voted_term != state.current_term
            || state.role != NodeRole::Candidate
            || !reply.vote_granted
        {
            // stale vote or denied
            return;
        }

        state.votes.insert(reply.node_id);
        if state.votes.len() > self.cluster_size / 2 {
            state.enter_leader_state();
            self.send_heartbeat(state);
        }
    }

    /// RequestVote RPC: grant iff the term matches, we have not voted for
    /// anyone else this term, and the candidate's log is at least as
    /// up-to-date as ours (§5.4.1).
    pub fn request_vote(&self, req: &RequestVoteRequest) -> RequestVoteReply {
        let mut guard = self.state.write().unwrap();
        let state = &mut *guard;

        state.try_follow_new_term(req.candidate_id, req.term, false);

        let mut vote_granted = false;
        if req.term == state.current_term
            && (state.voted_for.is_none() || state.voted_for == Some(req.candidate_id))
            && (req.last_log_term > state.log.last_term()
                || (req.last_log_term == state.log.last_term()
                    && req.last_log_index >= state.log.last_index()))
        {
            state.voted_for = Some(req.candidate_id);
            vote_granted = true;
            state.timer.reset(state.role);

            trace!(state.logger, "vote granted";
                "term" => state.current_term, "candidate" => req.candidate_id);
        }

        RequestVoteReply {
            term: state.current_term,
            node_id: self.node_id,
            voted_term: req.term,
            vote_granted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::node::tests::test_node;

    #[tokio::test]
    async fn test_request_vote_grants_and_persists_vote() {
        let node = test_node(0, 3);

        let reply = node.request_vote(&RequestVoteRequest {
            term: 1,
            candidate_id: 2,
            last_log_index: -1,
            last_log_term: -1,
        });

        assert!(reply.vote_granted);
        assert_eq!(reply.term, 1);
        assert_eq!(reply.voted_term, 1);
        assert_eq!(node.voted_for(), Some(2));

        // a competing candidate in the same term is denied
        let reply = node.request_vote(&RequestVoteRequest {
            term: 1,
            candidate_id: 1,
            last_log_index: -1,
            last_log_term: -1,
        });
        assert!(!reply.vote_granted);

        // the same candidate asking again is granted again
        let reply = node.request_vote(&RequestVoteRequest {
            term: 1,
            candidate_id: 2,
            last_log_index: -1,
            last_log_term: -1,
        });
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn test_request_vote_denies_stale_term() {
        let node = test_node(0, 3);
        node.state.write().unwrap().current_term = 5;

        let reply = node.request_vote(&RequestVoteRequest {
            term: 3,
            candidate_id: 2,
            last_log_index: -1,
            last_log_term: -1,
        });

        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 5);
    }

    #[tokio::test]
    async fn test_request_vote_denies_outdated_log() {
        let node = test_node(0, 3);
        {
            let mut state = node.state.write().unwrap();
            state.current_term = 2;
            for term in [1, 2] {
                state.log.append(
                    crate::raft::message::Command { kind: 0, data: Vec::new() },
                    term,
                );
            }
        }

        // candidate's last term is older
        let reply = node.request_vote(&RequestVoteRequest {
            term: 2,
            candidate_id: 1,
            last_log_index: 5,
            last_log_term: 1,
        });
        assert!(!reply.vote_granted);

        // same last term but shorter log
        let reply = node.request_vote(&RequestVoteRequest {
            term: 2,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 2,
        });
        assert!(!reply.vote_granted);

        // same last term, same length
        let reply = node.request_vote(&RequestVoteRequest {
            term: 2,
            candidate_id: 1,
            last_log_index: 1,
            last_log_term: 2,
        });
        assert!(reply.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_reply_majority_promotes_to_leader() {
        let node = test_node(2, 3);
        {
            let mut guard = node.state.write().unwrap();
            let state = &mut *guard;
            state.enter_candidate_state();
        }
        assert_eq!(node.current_term(), 1);

        node.handle_request_vote_reply(RequestVoteReply {
            term: 1,
            node_id: 0,
            voted_term: 1,
            vote_granted: true,
        });

        assert!(node.is_leader());
        assert_eq!(node.current_leader(), Some(2));
    }

    #[tokio::test]
    async fn test_vote_reply_ignores_stale_and_denied_votes() {
        let node = test_node(2, 5);
        {
            let mut guard = node.state.write().unwrap();
            let state = &mut *guard;
            state.enter_candidate_state();
        }

        // denied vote
        node.handle_request_vote_reply(RequestVoteReply {
            term: 1,
            node_id: 0,
            voted_term: 1,
            vote_granted: false,
        });
        // vote for an earlier term
        node.handle_request_vote_reply(RequestVoteReply {
            term: 1,
            node_id: 1,
            voted_term: 0,
            vote_granted: true,
        });

        assert_eq!(node.role(), NodeRole::Candidate);

        // two real votes reach the majority of five
        node.handle_request_vote_reply(RequestVoteReply {
            term: 1,
            node_id: 3,
            voted_term: 1,
            vote_granted: true,
        });
        assert_eq!(node.role(), NodeRole::Candidate);
        node.handle_request_vote_reply(RequestVoteReply {
            term: 1,
            node_id: 4,
            voted_term: 1,
            vote_granted: true,
        });
        assert!(node.is_leader());
    }

    #[tokio::test]
    async fn test_vote_reply_with_higher_term_ends_candidacy() {
        let node = test_node(2, 3);
        {
            let mut guard = node.state.write().unwrap();
            let state = &mut *guard;
            state.enter_candidate_state();
        }

        node.handle_request_vote_reply(RequestVoteReply {
            term: 7,
            node_id: 0,
            voted_term: 7,
            vote_granted: false,
        });

        assert_eq!(node.role(), NodeRole::Follower);
        assert_eq!(node.current_term(), 7);
    }
}
