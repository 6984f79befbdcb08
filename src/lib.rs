//! Leader-based replicated-log consensus for a small cluster of in-process
//! peers, implementing the [Raft](https://raft.github.io/) algorithm: leader
//! election, log replication, and in-order commit delivery, tolerant of
//! message loss, delay, reordering, and partitions that preserve a majority.

pub mod config;
pub mod consensus;
pub mod error;
pub mod harness;
pub mod rpc;
pub mod server;
pub mod state;
pub mod storage;
pub mod timer;

pub use config::{RaftConfig, RpcOptions};
pub use consensus::ConsensusModule;
pub use error::{Error, Result};
pub use rpc::{
    AppendEntriesArgs, AppendEntriesReply, RaftTransport, RequestVoteArgs, RequestVoteReply,
};
pub use server::Server;
pub use state::{Command, CommitEntry, LogEntry, Role};
