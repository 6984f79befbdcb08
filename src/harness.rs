use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing_subscriber::EnvFilter;

use crate::config::{RaftConfig, RpcOptions};
use crate::server::Server;
use crate::state::{Command, CommitEntry};

/// An in-process cluster of fully connected servers, with partition control
/// and commit verification. Used by the integration tests and the demo
/// binary; its check methods panic on violated expectations.
pub struct Cluster<C: Command> {
    servers: Vec<Arc<Server<C>>>,
    connected: Vec<bool>,
    commits: Vec<Arc<StdMutex<Vec<CommitEntry<C>>>>>,
    collectors: Vec<JoinHandle<()>>,
    n: usize,
}

impl<C: Command + PartialEq> Cluster<C> {
    /// A reliable cluster of `n` servers with default timing.
    pub fn new(n: usize) -> Self {
        Self::with_options(n, RaftConfig::default(), RpcOptions::default())
    }

    /// A cluster whose RPC proxies drop and delay inbound calls.
    pub fn unreliable(n: usize) -> Self {
        Self::with_options(n, RaftConfig::default(), RpcOptions::unreliable())
    }

    /// Builds `n` servers, wires the full mesh, starts a collector for each
    /// commit sink, and releases every election timer at once.
    pub fn with_options(n: usize, config: RaftConfig, rpc_options: RpcOptions) -> Self {
        let (ready_tx, ready_rx) = watch::channel(());

        let mut servers = Vec::with_capacity(n);
        let mut commits = Vec::with_capacity(n);
        let mut collectors = Vec::with_capacity(n);
        for id in 0..n as u64 {
            let peer_ids: Vec<u64> = (0..n as u64).filter(|&p| p != id).collect();
            let (commit_tx, mut commit_rx) = mpsc::unbounded_channel::<CommitEntry<C>>();

            let store: Arc<StdMutex<Vec<CommitEntry<C>>>> = Arc::new(StdMutex::new(Vec::new()));
            let sink = Arc::clone(&store);
            collectors.push(tokio::spawn(async move {
                while let Some(entry) = commit_rx.recv().await {
                    let mut sink = sink.lock().expect("lock poisoned");
                    if let Some(last) = sink.last() {
                        assert!(
                            entry.index > last.index,
                            "server {id} emitted index {} after {}",
                            entry.index,
                            last.index
                        );
                    }
                    sink.push(entry);
                }
            }));

            servers.push(Server::new(
                id,
                peer_ids,
                config.clone(),
                rpc_options.clone(),
                ready_rx.clone(),
                commit_tx,
            ));
            commits.push(store);
        }

        for i in 0..n {
            for j in 0..n {
                if i != j {
                    servers[i].connect_to_peer(j as u64, servers[j].rpc_handle());
                }
            }
        }
        let _ = ready_tx.send(());

        Self {
            servers,
            connected: vec![true; n],
            commits,
            collectors,
            n,
        }
    }

    /// Cuts `id` off from the cluster in both directions.
    pub fn disconnect_peer(&mut self, id: usize) {
        tracing::info!(id, "disconnecting peer");
        self.servers[id].disconnect_all();
        for j in 0..self.n {
            if j != id {
                self.servers[j].disconnect_peer(id as u64);
            }
        }
        self.connected[id] = false;
    }

    /// Restores `id`'s connections in both directions.
    pub fn reconnect_peer(&mut self, id: usize) {
        tracing::info!(id, "reconnecting peer");
        for j in 0..self.n {
            if j != id {
                self.servers[id].connect_to_peer(j as u64, self.servers[j].rpc_handle());
                self.servers[j].connect_to_peer(id as u64, self.servers[id].rpc_handle());
            }
        }
        self.connected[id] = true;
    }

    /// Disconnects everything, stops every server, and waits for the commit
    /// collectors to drain their sinks.
    pub async fn shutdown(&mut self) {
        for i in 0..self.n {
            self.servers[i].disconnect_all();
            self.connected[i] = false;
        }
        for i in 0..self.n {
            self.servers[i].shutdown().await;
        }
        for collector in self.collectors.drain(..) {
            collector.await.expect("commit collector failed");
        }
    }

    /// Submits a command to server `id`, returning its leader claim.
    pub async fn submit(&self, id: usize, command: C) -> bool {
        self.servers[id].submit(command).await
    }

    /// Snapshot of the entries server `id` has emitted on its commit sink.
    pub fn committed(&self, id: usize) -> Vec<CommitEntry<C>> {
        self.commits[id].lock().expect("lock poisoned").clone()
    }

    /// Waits until exactly one connected server reports leadership and
    /// returns its (id, term). Panics if two servers claim the same instant
    /// or no leader emerges.
    pub async fn check_single_leader(&self) -> (usize, u64) {
        for _ in 0..8 {
            let mut leader: Option<(usize, u64)> = None;
            for i in 0..self.n {
                if !self.connected[i] {
                    continue;
                }
                let (_, term, is_leader) = self.servers[i].report().await;
                if is_leader {
                    if let Some((other, _)) = leader {
                        panic!("servers {other} and {i} both claim leadership");
                    }
                    leader = Some((i, term));
                }
            }
            if let Some(found) = leader {
                return found;
            }
            sleep_ms(150).await;
        }
        panic!("no leader elected");
    }

    /// Asserts that no connected server currently claims leadership.
    pub async fn check_no_leader(&self) {
        for i in 0..self.n {
            if !self.connected[i] {
                continue;
            }
            let (_, _, is_leader) = self.servers[i].report().await;
            assert!(!is_leader, "server {i} claims leadership, want none");
        }
    }

    /// Verifies that every connected server agrees on its committed prefix
    /// and that `command` appears in it; returns how many connected servers
    /// committed it and at which index. Panics if the command was never
    /// committed or the servers disagree.
    pub fn check_committed(&self, command: &C) -> (usize, u64) {
        // All connected servers must have emitted the same number of entries.
        let mut commits_len: Option<usize> = None;
        for i in 0..self.n {
            if !self.connected[i] {
                continue;
            }
            let len = self.commits[i].lock().expect("lock poisoned").len();
            match commits_len {
                Some(expected) => assert_eq!(
                    len, expected,
                    "server {i} emitted {len} entries, others emitted {expected}"
                ),
                None => commits_len = Some(len),
            }
        }

        for slot in 0..commits_len.unwrap_or(0) {
            let mut command_at_slot: Option<C> = None;
            for i in 0..self.n {
                if !self.connected[i] {
                    continue;
                }
                let got = self.commits[i].lock().expect("lock poisoned")[slot]
                    .command
                    .clone();
                match &command_at_slot {
                    Some(expected) => assert!(
                        got == *expected,
                        "commit disagreement at slot {slot}: {got:?} vs {expected:?}"
                    ),
                    None => command_at_slot = Some(got),
                }
            }
            if command_at_slot.as_ref() == Some(command) {
                let mut index: Option<u64> = None;
                let mut count = 0;
                for i in 0..self.n {
                    if !self.connected[i] {
                        continue;
                    }
                    let got = self.commits[i].lock().expect("lock poisoned")[slot].index;
                    match index {
                        Some(expected) => assert_eq!(
                            got, expected,
                            "index disagreement at slot {slot}: {got} vs {expected}"
                        ),
                        None => index = Some(got),
                    }
                    count += 1;
                }
                return (count, index.unwrap_or(0));
            }
        }
        panic!("command {command:?} was not committed by any connected server");
    }

    /// Asserts `command` was committed by exactly `want` connected servers.
    pub fn check_committed_n(&self, command: &C, want: usize) {
        let (count, _) = self.check_committed(command);
        assert_eq!(count, want, "command {command:?} committed by {count} servers, want {want}");
    }

    /// Asserts no connected server has emitted `command`.
    pub fn check_not_committed(&self, command: &C) {
        for i in 0..self.n {
            if !self.connected[i] {
                continue;
            }
            let found = self.commits[i]
                .lock()
                .expect("lock poisoned")
                .iter()
                .any(|entry| entry.command == *command);
            assert!(!found, "command {command:?} was committed by server {i}");
        }
    }
}

/// Sleep helper matching the cadence the scenario tests are written in.
pub async fn sleep_ms(ms: u64) {
    sleep(Duration::from_millis(ms)).await;
}

/// Initializes test/demo logging; safe to call more than once.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}
