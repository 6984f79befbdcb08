use async_trait::async_trait;

use crate::error::Result;
use crate::state::{Command, LogEntry};

#[derive(Debug, Clone)]
pub struct RequestVoteArgs {
    pub term: u64,
    pub candidate_id: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone)]
pub struct RequestVoteReply {
    pub term: u64,
    pub vote_granted: bool,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesArgs<C> {
    pub term: u64,
    pub leader_id: u64,
    /// Index of the entry immediately preceding `entries`; 0 means the
    /// entries start at the head of the log.
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry<C>>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone)]
pub struct AppendEntriesReply {
    pub term: u64,
    pub success: bool,
}

/// Call-out capability for sending an RPC to a peer by id.
///
/// Outbound calls are issued without the consensus module's lock held, and
/// any number may be in flight per peer. The engine tolerates drop, delay,
/// reordering, and duplication; an `Err` is treated as an absent reply and
/// retried by the next timer tick.
#[async_trait]
pub trait RaftTransport<C: Command>: Send + Sync {
    async fn request_vote(&self, peer: u64, args: RequestVoteArgs) -> Result<RequestVoteReply>;

    async fn append_entries(
        &self,
        peer: u64,
        args: AppendEntriesArgs<C>,
    ) -> Result<AppendEntriesReply>;
}
