use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{interval, Duration, Instant};

use crate::config::RaftConfig;
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RaftTransport, RequestVoteArgs, RequestVoteReply,
};
use crate::state::{Command, CommitEntry, RaftState, Role};
use crate::storage::{NoopPersist, Persist};
use crate::timer::random_election_timeout;

/// Poll granularity of the election timer.
const ELECTION_TICK: Duration = Duration::from_millis(10);

/// One peer's consensus module: the state machine driving leader election,
/// log replication, and commit advancement.
///
/// All state lives behind a single mutex. Timers and drivers run as spawned
/// tasks sharing this handle; outbound RPCs are issued without the lock held,
/// and every reply re-validates role and term after reacquiring it. Cloning
/// is cheap and yields another handle to the same module.
pub struct ConsensusModule<C: Command> {
    id: u64,
    peer_ids: Vec<u64>,
    config: RaftConfig,
    transport: Arc<dyn RaftTransport<C>>,
    persist: Arc<dyn Persist<C>>,
    state: Arc<Mutex<RaftState<C>>>,
}

impl<C: Command> Clone for ConsensusModule<C> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            peer_ids: self.peer_ids.clone(),
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            persist: Arc::clone(&self.persist),
            state: Arc::clone(&self.state),
        }
    }
}

impl<C: Command> ConsensusModule<C> {
    /// Creates a module and spawns its background tasks. The election timer
    /// first arms when `ready` fires, so a whole cluster can be released
    /// atomically. Committed entries are delivered on `commit_tx` in index
    /// order; the sender is dropped after the final flush on [`stop`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`stop`]: ConsensusModule::stop
    pub fn new(
        id: u64,
        peer_ids: Vec<u64>,
        config: RaftConfig,
        transport: Arc<dyn RaftTransport<C>>,
        ready: watch::Receiver<()>,
        commit_tx: mpsc::UnboundedSender<CommitEntry<C>>,
    ) -> Self {
        Self::with_persist(
            id,
            peer_ids,
            config,
            transport,
            Arc::new(NoopPersist),
            ready,
            commit_tx,
        )
    }

    /// Like [`new`](ConsensusModule::new), with an explicit persistence hook.
    pub fn with_persist(
        id: u64,
        peer_ids: Vec<u64>,
        config: RaftConfig,
        transport: Arc<dyn RaftTransport<C>>,
        persist: Arc<dyn Persist<C>>,
        ready: watch::Receiver<()>,
        commit_tx: mpsc::UnboundedSender<CommitEntry<C>>,
    ) -> Self {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let cm = Self {
            id,
            peer_ids,
            config,
            transport,
            persist,
            state: Arc::new(Mutex::new(RaftState::new(signal_tx))),
        };

        let this = cm.clone();
        tokio::spawn(async move {
            let mut ready = ready;
            let _ = ready.changed().await;
            {
                let mut st = this.state.lock().await;
                st.election_reset = Instant::now();
            }
            this.run_election_timer().await;
        });

        let this = cm.clone();
        tokio::spawn(this.run_commit_dispatcher(signal_rx, commit_tx));

        cm
    }

    /// Submits a command to be appended to the log. Returns `true` only if
    /// this module is currently the leader; commit is eventual and signaled
    /// through the commit sink. Non-leaders do not redirect.
    pub async fn submit(&self, command: C) -> bool {
        let mut st = self.state.lock().await;
        tracing::debug!(id = self.id, role = %st.role, ?command, "submit received");
        if st.role == Role::Leader {
            st.append(command);
            self.persist.save(st.current_term, st.voted_for, &st.log);
            return true;
        }
        false
    }

    /// Reports (id, current term, is leader).
    pub async fn report(&self) -> (u64, u64, bool) {
        let st = self.state.lock().await;
        (self.id, st.current_term, st.role == Role::Leader)
    }

    /// Stops the module: the role becomes `Dead` (terminal), every timer and
    /// driver exits on its next lock acquisition, and the commit dispatcher
    /// flushes pending entries and closes the sink.
    pub async fn stop(&self) {
        let mut st = self.state.lock().await;
        st.role = Role::Dead;
        st.commit_signal = None;
        tracing::info!(id = self.id, "consensus module stopped");
    }

    /// Handles an inbound RequestVote. Atomic under the lock.
    pub async fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut st = self.state.lock().await;
        if st.role == Role::Dead {
            return RequestVoteReply {
                term: st.current_term,
                vote_granted: false,
            };
        }

        if args.term > st.current_term {
            tracing::debug!(id = self.id, term = args.term, "term out of date in RequestVote");
            self.become_follower(&mut st, args.term);
        }

        let grant = args.term == st.current_term
            && (st.voted_for.is_none() || st.voted_for == Some(args.candidate_id))
            && st.log_up_to_date(args.last_log_index, args.last_log_term);
        if grant {
            st.voted_for = Some(args.candidate_id);
            st.election_reset = Instant::now();
            self.persist.save(st.current_term, st.voted_for, &st.log);
        }

        tracing::debug!(
            id = self.id,
            candidate = args.candidate_id,
            term = args.term,
            granted = grant,
            "RequestVote reply"
        );
        RequestVoteReply {
            term: st.current_term,
            vote_granted: grant,
        }
    }

    /// Handles an inbound AppendEntries. Atomic under the lock.
    pub async fn handle_append_entries(&self, args: AppendEntriesArgs<C>) -> AppendEntriesReply {
        let mut st = self.state.lock().await;
        if st.role == Role::Dead {
            return AppendEntriesReply {
                term: st.current_term,
                success: false,
            };
        }

        if args.term > st.current_term {
            tracing::debug!(id = self.id, term = args.term, "term out of date in AppendEntries");
            self.become_follower(&mut st, args.term);
        }

        let mut success = false;
        if args.term == st.current_term {
            if st.role != Role::Follower {
                // A legitimate leader exists for this term; step down without
                // freeing this term's vote.
                self.become_follower(&mut st, args.term);
            }
            st.election_reset = Instant::now();

            let prev = args.prev_log_index;
            let prev_matches = prev == 0 || st.term_at(prev) == Some(args.prev_log_term);
            if prev_matches {
                success = true;

                // Walk the new entries alongside the existing log; on the
                // first term mismatch, truncate from there and append the
                // rest. A matching suffix is left untouched.
                let mut insert_index = prev + 1;
                let mut new_index = 0usize;
                while insert_index <= st.last_log_index()
                    && new_index < args.entries.len()
                    && st.term_at(insert_index) == Some(args.entries[new_index].term)
                {
                    insert_index += 1;
                    new_index += 1;
                }
                if new_index < args.entries.len() {
                    tracing::debug!(
                        id = self.id,
                        from = insert_index,
                        count = args.entries.len() - new_index,
                        "appending entries from leader"
                    );
                    st.log.truncate((insert_index - 1) as usize);
                    st.log.extend_from_slice(&args.entries[new_index..]);
                    self.persist.save(st.current_term, st.voted_for, &st.log);
                }

                if args.leader_commit > st.commit_index {
                    st.commit_index = args.leader_commit.min(st.last_log_index());
                    tracing::debug!(id = self.id, commit_index = st.commit_index, "commit index advanced by leader");
                    st.signal_commit();
                }
            }
        }

        AppendEntriesReply {
            term: st.current_term,
            success,
        }
    }

    /// The election timer: runs while the role is Follower or Candidate,
    /// polling every [`ELECTION_TICK`]. Exits when the role leaves those
    /// states or when a newer timer has taken over the term; triggers an
    /// election when the randomized timeout elapses without a reset.
    async fn run_election_timer(self) {
        let timeout = random_election_timeout(&self.config);
        let term_started = self.state.lock().await.current_term;
        tracing::debug!(
            id = self.id,
            term = term_started,
            timeout_ms = timeout.as_millis() as u64,
            "election timer armed"
        );

        let mut tick = interval(ELECTION_TICK);
        loop {
            tick.tick().await;

            let mut st = self.state.lock().await;
            if st.role != Role::Candidate && st.role != Role::Follower {
                return;
            }
            if st.current_term != term_started {
                // A newer timer owns the current term.
                return;
            }
            if st.election_reset.elapsed() >= timeout {
                self.start_election(&mut st);
                return;
            }
        }
    }

    /// Starts an election for the next term. Called with the lock held.
    fn start_election(&self, st: &mut RaftState<C>) {
        st.become_candidate(self.id);
        st.election_reset = Instant::now();
        let term = st.current_term;
        let (last_log_index, last_log_term) = st.last_log_index_and_term();
        self.persist.save(st.current_term, st.voted_for, &st.log);
        tracing::info!(id = self.id, term, "becoming candidate");

        // Fan out vote requests; each reply is re-validated under the lock.
        let votes = Arc::new(AtomicUsize::new(1));
        for &peer in &self.peer_ids {
            let cm = self.clone();
            let votes = Arc::clone(&votes);
            let args = RequestVoteArgs {
                term,
                candidate_id: self.id,
                last_log_index,
                last_log_term,
            };
            tokio::spawn(async move {
                let reply = match cm.transport.request_vote(peer, args).await {
                    Ok(reply) => reply,
                    Err(err) => {
                        tracing::trace!(id = cm.id, peer, error = %err, "RequestVote failed");
                        return;
                    }
                };

                let mut st = cm.state.lock().await;
                if st.role != Role::Candidate {
                    return;
                }
                if reply.term > term {
                    cm.become_follower(&mut st, reply.term);
                    return;
                }
                if reply.term == term && reply.vote_granted {
                    let granted = votes.fetch_add(1, Ordering::SeqCst) + 1;
                    if granted * 2 > cm.peer_ids.len() + 1 {
                        tracing::info!(id = cm.id, term, votes = granted, "won election");
                        cm.start_leader(&mut st);
                    }
                }
            });
        }

        // Arm another timer in case this election stalls or splits.
        let cm = self.clone();
        tokio::spawn(cm.run_election_timer());
    }

    /// Transitions to follower at `new_term` and arms a fresh election
    /// timer. The only way the term advances mid-operation; callers invoke
    /// this whenever any message carries a term greater than ours.
    fn become_follower(&self, st: &mut RaftState<C>, new_term: u64) {
        tracing::info!(id = self.id, term = new_term, "becoming follower");
        st.become_follower(new_term);
        st.election_reset = Instant::now();
        self.persist.save(st.current_term, st.voted_for, &st.log);

        let cm = self.clone();
        tokio::spawn(cm.run_election_timer());
    }

    /// Transitions to leader and starts the replication loop. Called with
    /// the lock held.
    fn start_leader(&self, st: &mut RaftState<C>) {
        st.become_leader(&self.peer_ids);
        tracing::info!(id = self.id, term = st.current_term, "becoming leader");

        let cm = self.clone();
        let heartbeat = Duration::from_millis(self.config.heartbeat_interval_ms);
        tokio::spawn(async move {
            let mut tick = interval(heartbeat);
            loop {
                tick.tick().await;
                if !cm.broadcast_append_entries().await {
                    return;
                }
            }
        });
    }

    /// One replication round: sends an AppendEntries (possibly empty, as a
    /// heartbeat) to every peer. Returns `false` once no longer leader.
    async fn broadcast_append_entries(&self) -> bool {
        let st = self.state.lock().await;
        if st.role != Role::Leader {
            return false;
        }
        let term = st.current_term;

        for &peer in &self.peer_ids {
            let next = st.next_index.get(&peer).copied().unwrap_or(1);
            let prev_log_index = next - 1;
            let prev_log_term = st.term_at(prev_log_index).unwrap_or(0);
            let args = AppendEntriesArgs {
                term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term,
                entries: st.entries_from(next),
                leader_commit: st.commit_index,
            };
            let cm = self.clone();
            tokio::spawn(async move {
                cm.send_append_entries(peer, args).await;
            });
        }
        true
    }

    /// Sends one AppendEntries and applies its reply under the lock.
    async fn send_append_entries(&self, peer: u64, args: AppendEntriesArgs<C>) {
        let sent_prev = args.prev_log_index;
        let sent_count = args.entries.len() as u64;

        let reply = match self.transport.append_entries(peer, args).await {
            Ok(reply) => reply,
            Err(err) => {
                // Absent reply; the next tick retries.
                tracing::trace!(id = self.id, peer, error = %err, "AppendEntries failed");
                return;
            }
        };

        let mut st = self.state.lock().await;
        if st.role == Role::Dead {
            return;
        }
        if reply.term > st.current_term {
            self.become_follower(&mut st, reply.term);
            return;
        }
        if st.role != Role::Leader || reply.term != st.current_term {
            return;
        }

        if reply.success {
            st.next_index.insert(peer, sent_prev + sent_count + 1);
            st.match_index.insert(peer, sent_prev + sent_count);
            self.advance_commit_index(&mut st);
        } else {
            // Back off by one and retry with an earlier prefix next tick.
            let next = st.next_index.get(&peer).copied().unwrap_or(1);
            if next > 1 {
                st.next_index.insert(peer, next - 1);
            }
            tracing::debug!(id = self.id, peer, next_index = next.saturating_sub(1).max(1), "append rejected, backing off");
        }
    }

    /// Advances the leader's commit index to the highest index replicated on
    /// a majority, counting ourselves. Only entries created in the current
    /// term are counted directly (Raft Figure 8); earlier-term entries commit
    /// implicitly through a same-term successor.
    fn advance_commit_index(&self, st: &mut RaftState<C>) {
        let saved = st.commit_index;
        for i in (st.commit_index + 1)..=st.last_log_index() {
            if st.term_at(i) != Some(st.current_term) {
                continue;
            }
            let mut replicated = 1;
            for &peer in &self.peer_ids {
                if st.match_index.get(&peer).copied().unwrap_or(0) >= i {
                    replicated += 1;
                }
            }
            if replicated * 2 > self.peer_ids.len() + 1 {
                st.commit_index = i;
            }
        }
        if st.commit_index != saved {
            tracing::debug!(id = self.id, commit_index = st.commit_index, "leader advanced commit index");
            st.signal_commit();
        }
    }

    /// The commit dispatcher: the single consumer that forwards newly
    /// committed entries to the sink in index order, exactly once. When the
    /// signal channel closes on stop, it flushes whatever remains and drops
    /// the sink sender.
    async fn run_commit_dispatcher(
        self,
        mut signal_rx: mpsc::UnboundedReceiver<()>,
        commit_tx: mpsc::UnboundedSender<CommitEntry<C>>,
    ) {
        while signal_rx.recv().await.is_some() {
            if !self.flush_committed(&commit_tx).await {
                return;
            }
        }
        self.flush_committed(&commit_tx).await;
        tracing::debug!(id = self.id, "commit dispatcher done");
    }

    /// Emits entries in `(last_applied, commit_index]` to the sink. Returns
    /// `false` if the sink receiver is gone.
    async fn flush_committed(&self, commit_tx: &mpsc::UnboundedSender<CommitEntry<C>>) -> bool {
        let batch = {
            let mut st = self.state.lock().await;
            let term = st.current_term;
            let from = st.last_applied + 1;
            let to = st.commit_index;
            let batch: Vec<CommitEntry<C>> = (from..=to)
                .map(|index| CommitEntry {
                    command: st.log[(index - 1) as usize].command.clone(),
                    index,
                    term,
                })
                .collect();
            st.last_applied = to;
            batch
        };

        for entry in batch {
            tracing::debug!(id = self.id, index = entry.index, term = entry.term, "delivering committed entry");
            if commit_tx.send(entry).is_err() {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::Error;
    use crate::state::LogEntry;

    /// Transport whose peers are always unreachable.
    struct NullTransport;

    #[async_trait]
    impl RaftTransport<u64> for NullTransport {
        async fn request_vote(
            &self,
            peer: u64,
            _args: RequestVoteArgs,
        ) -> crate::Result<RequestVoteReply> {
            Err(Error::PeerDisconnected(peer))
        }

        async fn append_entries(
            &self,
            peer: u64,
            _args: AppendEntriesArgs<u64>,
        ) -> crate::Result<AppendEntriesReply> {
            Err(Error::PeerDisconnected(peer))
        }
    }

    /// Records every persistence call.
    struct RecordingPersist {
        saves: StdMutex<Vec<(u64, Option<u64>, usize)>>,
    }

    impl Persist<u64> for RecordingPersist {
        fn save(&self, current_term: u64, voted_for: Option<u64>, log: &[LogEntry<u64>]) {
            self.saves
                .lock()
                .expect("lock poisoned")
                .push((current_term, voted_for, log.len()));
        }
    }

    /// A dormant module: the ready signal is never fired, so no timers run
    /// and handler behavior is deterministic.
    fn dormant_cm() -> (
        ConsensusModule<u64>,
        mpsc::UnboundedReceiver<CommitEntry<u64>>,
        watch::Sender<()>,
    ) {
        let (ready_tx, ready_rx) = watch::channel(());
        let (commit_tx, commit_rx) = mpsc::unbounded_channel();
        let cm = ConsensusModule::new(
            0,
            vec![1, 2],
            RaftConfig::default(),
            Arc::new(NullTransport),
            ready_rx,
            commit_tx,
        );
        (cm, commit_rx, ready_tx)
    }

    fn entries(terms: &[u64]) -> Vec<LogEntry<u64>> {
        terms
            .iter()
            .enumerate()
            .map(|(i, &term)| LogEntry {
                command: i as u64,
                term,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_initial_report() {
        let (cm, _rx, _ready) = dormant_cm();
        assert_eq!(cm.report().await, (0, 0, false));
    }

    #[tokio::test]
    async fn test_vote_granted_and_term_adopted() {
        let (cm, _rx, _ready) = dormant_cm();
        let reply = cm
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(reply.vote_granted);
        assert_eq!(reply.term, 1);
        assert_eq!(cm.report().await.1, 1);
    }

    #[tokio::test]
    async fn test_one_vote_per_term() {
        let (cm, _rx, _ready) = dormant_cm();
        let first = cm
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(first.vote_granted);

        // A different candidate in the same term is refused.
        let second = cm
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(!second.vote_granted);

        // The same candidate asking again is granted (duplicate request).
        let again = cm
            .handle_request_vote(RequestVoteArgs {
                term: 1,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(again.vote_granted);
    }

    #[tokio::test]
    async fn test_vote_denied_for_stale_term() {
        let (cm, _rx, _ready) = dormant_cm();
        cm.handle_append_entries(AppendEntriesArgs {
            term: 3,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        })
        .await;

        let reply = cm
            .handle_request_vote(RequestVoteArgs {
                term: 2,
                candidate_id: 2,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(!reply.vote_granted);
        assert_eq!(reply.term, 3);
    }

    #[tokio::test]
    async fn test_vote_denied_for_out_of_date_log() {
        let (cm, _rx, _ready) = dormant_cm();
        let reply = cm
            .handle_append_entries(AppendEntriesArgs {
                term: 2,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: entries(&[1, 2]),
                leader_commit: 0,
            })
            .await;
        assert!(reply.success);

        // Candidate's last term is older than ours.
        let denied = cm
            .handle_request_vote(RequestVoteArgs {
                term: 3,
                candidate_id: 2,
                last_log_index: 5,
                last_log_term: 1,
            })
            .await;
        assert!(!denied.vote_granted);

        // Same last term, log at least as long: granted.
        let granted = cm
            .handle_request_vote(RequestVoteArgs {
                term: 4,
                candidate_id: 2,
                last_log_index: 2,
                last_log_term: 2,
            })
            .await;
        assert!(granted.vote_granted);
    }

    #[tokio::test]
    async fn test_append_rejected_on_consistency_check() {
        let (cm, _rx, _ready) = dormant_cm();
        // prev_log_index beyond our (empty) log.
        let reply = cm
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 1,
                prev_log_index: 2,
                prev_log_term: 1,
                entries: entries(&[1]),
                leader_commit: 0,
            })
            .await;
        assert!(!reply.success);
        assert_eq!(reply.term, 1);
    }

    #[tokio::test]
    async fn test_append_rejected_for_stale_leader() {
        let (cm, _rx, _ready) = dormant_cm();
        cm.handle_append_entries(AppendEntriesArgs {
            term: 2,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: Vec::new(),
            leader_commit: 0,
        })
        .await;

        let reply = cm
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 2,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: entries(&[1]),
                leader_commit: 0,
            })
            .await;
        assert!(!reply.success);
        assert_eq!(reply.term, 2);
    }

    #[tokio::test]
    async fn test_append_truncates_conflicting_suffix() {
        let (cm, _rx, _ready) = dormant_cm();
        cm.handle_append_entries(AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: entries(&[1, 1, 1]),
            leader_commit: 0,
        })
        .await;

        // A newer leader overwrites indices 2..3 with term-2 entries.
        let reply = cm
            .handle_append_entries(AppendEntriesArgs {
                term: 2,
                leader_id: 2,
                prev_log_index: 1,
                prev_log_term: 1,
                entries: entries(&[2, 2]),
                leader_commit: 0,
            })
            .await;
        assert!(reply.success);

        let st = cm.state.lock().await;
        assert_eq!(st.last_log_index_and_term(), (3, 2));
        assert_eq!(st.term_at(1), Some(1));
        assert_eq!(st.term_at(2), Some(2));
    }

    #[tokio::test]
    async fn test_append_keeps_matching_suffix() {
        let (cm, _rx, _ready) = dormant_cm();
        cm.handle_append_entries(AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: entries(&[1, 1, 1]),
            leader_commit: 0,
        })
        .await;

        // A duplicate of an already-applied prefix must not truncate.
        let reply = cm
            .handle_append_entries(AppendEntriesArgs {
                term: 1,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: entries(&[1, 1]),
                leader_commit: 0,
            })
            .await;
        assert!(reply.success);

        let st = cm.state.lock().await;
        assert_eq!(st.last_log_index(), 3);
    }

    #[tokio::test]
    async fn test_commit_entries_delivered_in_order() {
        let (cm, mut commit_rx, _ready) = dormant_cm();
        cm.handle_append_entries(AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: entries(&[1, 1]),
            leader_commit: 2,
        })
        .await;

        let first = tokio::time::timeout(Duration::from_secs(1), commit_rx.recv())
            .await
            .expect("commit timed out")
            .expect("sink closed");
        let second = tokio::time::timeout(Duration::from_secs(1), commit_rx.recv())
            .await
            .expect("commit timed out")
            .expect("sink closed");
        assert_eq!((first.index, first.command), (1, 0));
        assert_eq!((second.index, second.command), (2, 1));
    }

    #[tokio::test]
    async fn test_commit_index_capped_at_log_length() {
        let (cm, mut commit_rx, _ready) = dormant_cm();
        cm.handle_append_entries(AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: entries(&[1]),
            leader_commit: 10,
        })
        .await;

        let only = tokio::time::timeout(Duration::from_secs(1), commit_rx.recv())
            .await
            .expect("commit timed out")
            .expect("sink closed");
        assert_eq!(only.index, 1);
        assert_eq!(cm.state.lock().await.commit_index, 1);
    }

    #[tokio::test]
    async fn test_submit_on_non_leader_returns_false() {
        let (cm, _rx, _ready) = dormant_cm();
        assert!(!cm.submit(42).await);
        assert_eq!(cm.state.lock().await.last_log_index(), 0);
    }

    #[tokio::test]
    async fn test_dead_module_answers_benignly_and_closes_sink() {
        let (cm, mut commit_rx, _ready) = dormant_cm();
        cm.stop().await;

        let vote = cm
            .handle_request_vote(RequestVoteArgs {
                term: 5,
                candidate_id: 1,
                last_log_index: 0,
                last_log_term: 0,
            })
            .await;
        assert!(!vote.vote_granted);

        let append = cm
            .handle_append_entries(AppendEntriesArgs {
                term: 5,
                leader_id: 1,
                prev_log_index: 0,
                prev_log_term: 0,
                entries: Vec::new(),
                leader_commit: 0,
            })
            .await;
        assert!(!append.success);

        // Dispatcher exits and drops the sink sender.
        let closed = tokio::time::timeout(Duration::from_secs(1), commit_rx.recv())
            .await
            .expect("sink close timed out");
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn test_persistence_hook_sees_durable_mutations() {
        let persist = Arc::new(RecordingPersist {
            saves: StdMutex::new(Vec::new()),
        });
        let (_ready_tx, ready_rx) = watch::channel(());
        let (commit_tx, _commit_rx) = mpsc::unbounded_channel();
        let cm = ConsensusModule::with_persist(
            0,
            vec![1, 2],
            RaftConfig::default(),
            Arc::new(NullTransport),
            Arc::clone(&persist) as Arc<dyn Persist<u64>>,
            ready_rx,
            commit_tx,
        );

        cm.handle_append_entries(AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: entries(&[1]),
            leader_commit: 0,
        })
        .await;
        cm.handle_request_vote(RequestVoteArgs {
            term: 2,
            candidate_id: 2,
            last_log_index: 5,
            last_log_term: 2,
        })
        .await;

        let saves = persist.saves.lock().expect("lock poisoned").clone();
        // become_follower(1), append, become_follower(2), vote grant.
        assert_eq!(saves.len(), 4);
        assert_eq!(saves.last(), Some(&(2, Some(2), 1)));
    }
}
