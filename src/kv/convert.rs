//! Conversions between core message types and their protobuf counterparts.

use crate::kv::server::pb;
use crate::raft::message::{
    AppendEntriesReply, AppendEntriesRequest, Command, LogEntry, RequestVoteReply,
    RequestVoteRequest,
};

pub(crate) fn to_pb_command(cmd: &Command) -> pb::Command {
    pb::Command { kind: cmd.kind, data: cmd.data.clone() }
}

pub(crate) fn from_pb_command(cmd: Option<pb::Command>) -> Command {
    match cmd {
        Some(cmd) => Command { kind: cmd.kind, data: cmd.data },
        None => Command { kind: 0, data: Vec::new() },
    }
}

fn to_pb_entry(entry: &LogEntry) -> pb::LogEntry {
    pb::LogEntry { index: entry.index, term: entry.term, cmd: Some(to_pb_command(&entry.cmd)) }
}

fn from_pb_entry(entry: pb::LogEntry) -> LogEntry {
    LogEntry { index: entry.index, term: entry.term, cmd: from_pb_command(entry.cmd) }
}

pub(crate) fn to_pb_ae_request(req: &AppendEntriesRequest) -> pb::AppendEntriesRequest {
    pb::AppendEntriesRequest {
        term: req.term,
        leader_id: req.leader_id,
        prev_log_index: req.prev_log_index,
        prev_log_term: req.prev_log_term,
        entries: req.entries.iter().map(to_pb_entry).collect(),
        leader_commit: req.leader_commit,
    }
}

pub(crate) fn from_pb_ae_request(req: pb::AppendEntriesRequest) -> AppendEntriesRequest {
    AppendEntriesRequest {
        term: req.term,
        leader_id: req.leader_id,
        prev_log_index: req.prev_log_index,
        prev_log_term: req.prev_log_term,
        entries: req.entries.into_iter().map(from_pb_entry).collect(),
        leader_commit: req.leader_commit,
    }
}

pub(crate) fn to_pb_ae_reply(reply: &AppendEntriesReply) -> pb::AppendEntriesReply {
    pb::AppendEntriesReply {
        term: reply.term,
        node_id: reply.node_id,
        leader_id: reply.leader_id,
        success: reply.success,
        last_match: reply.last_match,
    }
}

pub(crate) fn from_pb_ae_reply(reply: pb::AppendEntriesReply) -> AppendEntriesReply {
    AppendEntriesReply {
        term: reply.term,
        node_id: reply.node_id,
        leader_id: reply.leader_id,
        success: reply.success,
        last_match: reply.last_match,
    }
}

pub(crate) fn to_pb_rv_request(req: &RequestVoteRequest) -> pb::RequestVoteRequest {
    pb::RequestVoteRequest {
        term: req.term,
        candidate_id: req.candidate_id,
        last_log_index: req.last_log_index,
        last_log_term: req.last_log_term,
    }
}

pub(crate) fn from_pb_rv_request(req: pb::RequestVoteRequest) -> RequestVoteRequest {
    RequestVoteRequest {
        term: req.term,
        candidate_id: req.candidate_id,
        last_log_index: req.last_log_index,
        last_log_term: req.last_log_term,
    }
}

pub(crate) fn to_pb_rv_reply(reply: &RequestVoteReply) -> pb::RequestVoteReply {
    pb::RequestVoteReply {
        term: reply.term,
        node_id: reply.node_id,
        voted_term: reply.voted_term,
        vote_granted: reply.vote_granted,
    }
}

pub(crate) fn from_pb_rv_reply(reply: pb::RequestVoteReply) -> RequestVoteReply {
    RequestVoteReply {
        term: reply.term,
        node_id: reply.node_id,
        voted_term: reply.voted_term,
        vote_granted: reply.vote_granted,
    }
}
