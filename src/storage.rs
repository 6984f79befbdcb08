use crate::state::{Command, LogEntry};

/// Hook for persisting Raft's durable state (`current_term`, `voted_for`,
/// and the log). The consensus module calls [`save`](Persist::save) under its
/// lock at every mutation of these fields, before any reply that depends on
/// them is sent. A real implementation must not return until the write is
/// durable.
pub trait Persist<C: Command>: Send + Sync {
    fn save(&self, current_term: u64, voted_for: Option<u64>, log: &[LogEntry<C>]);
}

/// The in-memory engine's default: persistence is a no-op.
pub struct NoopPersist;

impl<C: Command> Persist<C> for NoopPersist {
    fn save(&self, _current_term: u64, _voted_for: Option<u64>, _log: &[LogEntry<C>]) {}
}
