use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc;
use tokio::time::Instant;

/// Marker for command payloads replicated through the log. The engine never
/// inspects them.
pub trait Command: Clone + fmt::Debug + Send + 'static {}

impl<T: Clone + fmt::Debug + Send + 'static> Command for T {}

/// Role of a consensus module. `Dead` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
    Dead,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "follower"),
            Role::Candidate => write!(f, "candidate"),
            Role::Leader => write!(f, "leader"),
            Role::Dead => write!(f, "dead"),
        }
    }
}

/// A single entry in the replicated log.
#[derive(Debug, Clone)]
pub struct LogEntry<C> {
    pub command: C,
    /// Term in which the leader first created this entry.
    pub term: u64,
}

/// A committed entry as delivered on the commit sink.
#[derive(Debug, Clone)]
pub struct CommitEntry<C> {
    pub command: C,
    /// 1-based log index of the entry.
    pub index: u64,
    /// The module's current term at the time of delivery.
    pub term: u64,
}

/// The complete state of one consensus module, guarded by a single mutex in
/// [`ConsensusModule`](crate::consensus::ConsensusModule). Entries are
/// addressed by 1-based index; index 0 is the "before first entry" sentinel.
#[derive(Debug)]
pub struct RaftState<C> {
    // Persistent state (durability is a hook; see crate::storage).
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry<C>>,

    // Volatile state on all servers.
    pub role: Role,
    pub commit_index: u64,
    pub last_applied: u64,
    /// Instant from which the current election timeout is measured.
    pub election_reset: Instant,

    // Volatile state on leaders (reinitialized after election).
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    /// Wakes the commit dispatcher when `commit_index` advances. Taken (and
    /// thereby closed) on stop.
    pub commit_signal: Option<mpsc::UnboundedSender<()>>,
}

impl<C: Command> RaftState<C> {
    pub fn new(commit_signal: mpsc::UnboundedSender<()>) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: Vec::new(),
            role: Role::Follower,
            commit_index: 0,
            last_applied: 0,
            election_reset: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            commit_signal: Some(commit_signal),
        }
    }

    /// Index of the last log entry, or 0 for an empty log.
    pub fn last_log_index(&self) -> u64 {
        self.log.len() as u64
    }

    /// (last index, last term), with (0, 0) for an empty log.
    pub fn last_log_index_and_term(&self) -> (u64, u64) {
        match self.log.last() {
            Some(entry) => (self.log.len() as u64, entry.term),
            None => (0, 0),
        }
    }

    /// Term of the entry at `index` (1-based), or `None` if out of range.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        if index == 0 {
            return None;
        }
        self.log.get((index - 1) as usize).map(|e| e.term)
    }

    /// Entries from `start_index` (1-based, inclusive) to the end of the log.
    pub fn entries_from(&self, start_index: u64) -> Vec<LogEntry<C>> {
        let start = (start_index.max(1) - 1) as usize;
        if start >= self.log.len() {
            return Vec::new();
        }
        self.log[start..].to_vec()
    }

    /// Append a new entry created in the current term.
    pub fn append(&mut self, command: C) {
        self.log.push(LogEntry {
            command,
            term: self.current_term,
        });
    }

    /// Raft's up-to-date comparison: the candidate's log is at least as
    /// up-to-date as ours iff its last term is greater, or the last terms are
    /// equal and its log is at least as long.
    pub fn log_up_to_date(&self, candidate_last_index: u64, candidate_last_term: u64) -> bool {
        let (our_last_index, our_last_term) = self.last_log_index_and_term();
        candidate_last_term > our_last_term
            || (candidate_last_term == our_last_term && candidate_last_index >= our_last_index)
    }

    /// Transition to follower at `term`. The only way the term advances
    /// mid-operation. `voted_for` is cleared only when the term actually
    /// moves: a step-down at an unchanged term (a candidate observing a
    /// legitimate leader) must not free this term's vote.
    pub fn become_follower(&mut self, term: u64) {
        self.role = Role::Follower;
        if term > self.current_term {
            self.voted_for = None;
        }
        self.current_term = term;
    }

    /// Transition to candidate: bump the term and vote for ourselves.
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = Role::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
    }

    /// Transition to leader and reinitialize per-peer replication indices.
    pub fn become_leader(&mut self, peer_ids: &[u64]) {
        self.role = Role::Leader;
        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Wake the commit dispatcher, if it is still running.
    pub fn signal_commit(&self) {
        if let Some(signal) = &self.commit_signal {
            let _ = signal.send(());
        }
    }
}
