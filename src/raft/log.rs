//! Log manager: append, conflict reconciliation, commit/apply, snapshot
//! compaction and entry retrieval.
//!
//! Entries are held in memory for the range `(snapshot_index, last_index]`;
//! everything at or below the snapshot boundary has been collapsed into the
//! state machine image on disk.

use std::path::{Path, PathBuf};

use slog::{info, trace, Logger};
use tokio::sync::watch;

use crate::raft::message::{Command, LogEntry, LogIndex, NodeId, SnapshotRequest};
use crate::raft::snapshot;
use crate::raft::state_machine::StateMachine;

pub struct LogManager {
    node_id: NodeId,

    // Entries with index in (snapshot_index, last_index], contiguous.
    logs: Vec<LogEntry>,

    last_index: LogIndex,
    last_term: LogIndex,
    commit_index: LogIndex,
    last_applied: LogIndex,

    snapshot_index: LogIndex,
    snapshot_term: LogIndex,
    snapshot_file: Option<PathBuf>,
    snapshot_dir: PathBuf,
    // Take a snapshot once this many entries have been applied since the
    // last one. Zero disables automatic snapshotting.
    snapshot_threshold: i64,

    state_machine: Box<dyn StateMachine>,
    applied_tx: watch::Sender<LogIndex>,

    logger: Logger,
}

impl LogManager {
    pub fn new(
        node_id: NodeId,
        state_machine: Box<dyn StateMachine>,
        snapshot_dir: PathBuf,
        snapshot_threshold: i64,
        logger: Logger,
    ) -> Self {
        let (applied_tx, _) = watch::channel(-1);

        LogManager {
            node_id,
            logs: Vec::new(),
            last_index: -1,
            last_term: -1,
            commit_index: -1,
            last_applied: -1,
            snapshot_index: -1,
            snapshot_term: -1,
            snapshot_file: None,
            snapshot_dir,
            snapshot_threshold,
            state_machine,
            applied_tx,
            logger,
        }
    }

    pub fn last_index(&self) -> LogIndex {
        self.last_index
    }

    pub fn last_term(&self) -> LogIndex {
        self.last_term
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn snapshot_index(&self) -> LogIndex {
        self.snapshot_index
    }

    pub fn snapshot_term(&self) -> LogIndex {
        self.snapshot_term
    }

    pub fn snapshot_file(&self) -> Option<&Path> {
        self.snapshot_file.as_deref()
    }

    pub fn state_machine(&self) -> &dyn StateMachine {
        self.state_machine.as_ref()
    }

    /// Watch over `last_applied`, for callers waiting on a command to take
    /// effect.
    pub fn applied_watch(&self) -> watch::Receiver<LogIndex> {
        self.applied_tx.subscribe()
    }

    /// Slot of `index` within the in-memory entry vector.
    fn pos(&self, index: LogIndex) -> usize {
        (index - self.snapshot_index - 1) as usize
    }

    /// Entry at `index`. The index must be within `(snapshot_index,
    /// last_index]`; anything else is a caller bug and aborts the node.
    pub fn entry(&self, index: LogIndex) -> &LogEntry {
        if index <= self.snapshot_index || index > self.last_index {
            panic!(
                "log entry {} out of range ({}, {}]",
                index, self.snapshot_index, self.last_index
            );
        }
        &self.logs[self.pos(index)]
    }

    /// Term of the entry at `index`, resolving the virtual pre-log and
    /// snapshot boundary entries.
    fn term_at(&self, index: LogIndex) -> LogIndex {
        if index == -1 {
            -1
        } else if index == self.snapshot_index {
            self.snapshot_term
        } else {
            self.entry(index).term
        }
    }

    /// Leader-side append of a fresh client command. Returns the new entry's
    /// index.
    pub fn append(&mut self, cmd: Command, term: LogIndex) -> LogIndex {
        let index = self.last_index + 1;
        self.logs.push(LogEntry { index, term, cmd });
        self.last_index = index;
        self.last_term = term;
        index
    }

    /// Follower-side log reconciliation for an AppendEntries payload.
    ///
    /// Returns true iff the local log matches `(prev_index, prev_term)`. On a
    /// match, the suffix from the first conflicting incoming entry onward is
    /// replaced; incoming entries that duplicate existing ones are skipped,
    /// so replaying the same request is a no-op. Empty `entries` with a
    /// matching prev is a valid heartbeat.
    pub fn process_logs(
        &mut self,
        prev_index: LogIndex,
        prev_term: LogIndex,
        entries: &[LogEntry],
    ) -> bool {
        if !self.has_matching_prev_entry(prev_index, prev_term) {
            return false;
        }

        let conflict = self.find_first_conflict_index(prev_index, entries);
        let fresh: Vec<LogEntry> = entries
            .iter()
            .filter(|e| e.index >= conflict)
            .cloned()
            .collect();
        if fresh.is_empty() {
            // heartbeat, or a full replay of entries we already have
            return true;
        }

        self.truncate_from(conflict);
        self.append_slice(fresh);

        true
    }

    /// Whether the local log contains `(prev_index, prev_term)`. The virtual
    /// entries -1/-1 (empty log) and the snapshot boundary both match.
    fn has_matching_prev_entry(&self, prev_index: LogIndex, prev_term: LogIndex) -> bool {
        if prev_index == -1 && prev_term == -1 {
            return true;
        }
        if prev_index == self.snapshot_index && prev_term == self.snapshot_term {
            return true;
        }
        if prev_index <= self.snapshot_index || prev_index > self.last_index {
            return false;
        }

        self.entry(prev_index).term == prev_term
    }

    /// Index of the first incoming entry that conflicts with the local log
    /// (same index, different term) or extends past it. If every incoming
    /// entry matches an existing one, returns `last_index + 1`.
    fn find_first_conflict_index(&self, prev_index: LogIndex, entries: &[LogEntry]) -> LogIndex {
        if entries.is_empty() {
            return prev_index + 1;
        }

        for e in entries {
            if e.index <= self.snapshot_index {
                // already compacted, therefore committed and matching
                continue;
            }
            if e.index > self.last_index || self.entry(e.index).term != e.term {
                return e.index;
            }
        }

        self.last_index + 1
    }

    /// Drop all entries with index >= `index`.
    fn truncate_from(&mut self, index: LogIndex) {
        if index > self.last_index {
            return;
        }

        self.logs.truncate(self.pos(index));
        self.refresh_last();
    }

    fn append_slice(&mut self, entries: Vec<LogEntry>) {
        self.logs.extend(entries);
        self.refresh_last();
    }

    fn refresh_last(&mut self) {
        match self.logs.last() {
            Some(e) => {
                self.last_index = e.index;
                self.last_term = e.term;
            }
            None => {
                self.last_index = self.snapshot_index;
                self.last_term = self.snapshot_term;
            }
        }
    }

    /// Advance `commit_index` to `min(index, last_index)` and apply newly
    /// committed entries to the state machine in order. Returns true iff the
    /// commit index moved. Idempotent.
    pub fn commit(&mut self, index: LogIndex) -> bool {
        let target = index.min(self.last_index);
        if target <= self.commit_index {
            return false;
        }

        self.commit_index = target;
        trace!(self.logger, "committing"; "commit_index" => self.commit_index);

        while self.last_applied < self.commit_index {
            let next = self.last_applied + 1;
            let pos = (next - self.snapshot_index - 1) as usize;
            self.state_machine.apply(&self.logs[pos].cmd);
            self.last_applied = next;
        }
        let _ = self.applied_tx.send(self.last_applied);

        if self.snapshot_threshold > 0
            && self.last_applied - self.snapshot_index >= self.snapshot_threshold
        {
            if let Err(err) = self.take_snapshot() {
                // Losing snapshot I/O means we can no longer compact or help
                // lagging followers; crash rather than limp along.
                panic!("snapshot write failed on node {}: {}", self.node_id, err);
            }
        }

        true
    }

    /// Serialize the state machine into a new snapshot image covering
    /// everything up to `last_applied`, then drop the compacted entries.
    pub fn take_snapshot(&mut self) -> std::io::Result<(PathBuf, LogIndex, LogIndex)> {
        let index = self.last_applied;
        let term = self.term_at(index);
        if index <= self.snapshot_index {
            // nothing new to compact
            let file = self.snapshot_file.clone().unwrap_or_default();
            return Ok((file, self.snapshot_index, self.snapshot_term));
        }

        let path = snapshot::snapshot_path(&self.snapshot_dir, self.node_id, term, index);
        snapshot::write_snapshot(&path, |w| self.state_machine.serialize(w))?;

        info!(self.logger, "snapshot taken";
            "index" => index, "term" => term, "file" => path.display().to_string());

        let compacted = self.pos(index);
        self.logs.drain(..=compacted);
        self.snapshot_index = index;
        self.snapshot_term = term;

        let old = self.snapshot_file.replace(path.clone());
        if let Some(old) = old {
            if old != path {
                snapshot::remove_snapshot(&old);
            }
        }

        Ok((path, index, term))
    }

    /// Replace the state machine image with the given snapshot and reset the
    /// log to its boundary. All local entries are dropped, even those past
    /// the boundary: log matching cannot be assumed across an install.
    pub fn install_snapshot(&mut self, req: &SnapshotRequest) -> std::io::Result<()> {
        let mut reader = snapshot::open_snapshot(&req.file)?;
        self.state_machine.deserialize(&mut reader)?;

        self.logs.clear();
        self.last_index = req.snapshot_index;
        self.last_term = req.snapshot_term;
        self.snapshot_index = req.snapshot_index;
        self.snapshot_term = req.snapshot_term;
        self.commit_index = req.snapshot_index;
        self.last_applied = req.snapshot_index;
        self.snapshot_file = Some(req.file.clone());
        let _ = self.applied_tx.send(self.last_applied);

        info!(self.logger, "snapshot installed";
            "index" => req.snapshot_index, "term" => req.snapshot_term);

        Ok(())
    }

    /// Entries in `[start, end)` clamped to what the log still holds, plus
    /// the index/term of the entry immediately preceding the first returned
    /// one (snapshot boundary or -1/-1 when there is none).
    ///
    /// `start` at or below the snapshot boundary is a caller bug: the caller
    /// should have selected a snapshot transfer instead.
    pub fn get_log_entries(
        &self,
        start: LogIndex,
        end: LogIndex,
    ) -> (Vec<LogEntry>, LogIndex, LogIndex) {
        if start <= self.snapshot_index {
            panic!(
                "entry retrieval from {} below snapshot boundary {}",
                start, self.snapshot_index
            );
        }

        let end = end.min(self.last_index + 1);
        let entries = if end <= start {
            Vec::new()
        } else {
            self.logs[self.pos(start)..=self.pos(end - 1)].to_vec()
        };

        let prev_index = start - 1;
        let prev_term = self.term_at(prev_index);

        (entries, prev_index, prev_term)
    }
}
