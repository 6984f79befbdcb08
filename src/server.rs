use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;

use crate::config::{RaftConfig, RpcOptions};
use crate::consensus::ConsensusModule;
use crate::error::{Error, Result};
use crate::rpc::{
    AppendEntriesArgs, AppendEntriesReply, RaftTransport, RequestVoteArgs, RequestVoteReply,
};
use crate::state::{Command, CommitEntry};

/// An in-flight inbound RPC: arguments plus the slot for the reply. Dropping
/// the reply sender makes the call fail at the caller, which is how the
/// proxy models a lost message.
pub enum RpcRequest<C: Command> {
    RequestVote(RequestVoteArgs, oneshot::Sender<RequestVoteReply>),
    AppendEntries(AppendEntriesArgs<C>, oneshot::Sender<AppendEntriesReply>),
}

/// Handle on which a server accepts inbound RPCs from a peer.
pub type RpcHandle<C> = mpsc::UnboundedSender<RpcRequest<C>>;

type PeerMap<C> = Arc<StdMutex<HashMap<u64, RpcHandle<C>>>>;

/// The call-out side of the in-memory cluster transport: routes an RPC to
/// the target peer's inbound pump and awaits the reply. A peer missing from
/// the map (disconnected, or its pump already stopped) yields a transport
/// error, which the consensus module treats as an absent reply.
pub struct ClusterTransport<C: Command> {
    peers: PeerMap<C>,
}

impl<C: Command> ClusterTransport<C> {
    async fn call<R>(
        &self,
        peer: u64,
        request: RpcRequest<C>,
        reply_rx: oneshot::Receiver<R>,
    ) -> Result<R> {
        let handle = self
            .peers
            .lock()
            .expect("lock poisoned")
            .get(&peer)
            .cloned()
            .ok_or(Error::PeerDisconnected(peer))?;
        handle
            .send(request)
            .map_err(|_| Error::PeerDisconnected(peer))?;
        reply_rx.await.map_err(|_| Error::RpcFailed)
    }
}

#[async_trait]
impl<C: Command> RaftTransport<C> for ClusterTransport<C> {
    async fn request_vote(&self, peer: u64, args: RequestVoteArgs) -> Result<RequestVoteReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.call(peer, RpcRequest::RequestVote(args, reply_tx), reply_rx)
            .await
    }

    async fn append_entries(
        &self,
        peer: u64,
        args: AppendEntriesArgs<C>,
    ) -> Result<AppendEntriesReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.call(peer, RpcRequest::AppendEntries(args, reply_tx), reply_rx)
            .await
    }
}

/// Sits in front of every inbound RPC. In reliable mode it adds a small
/// uniform latency; in unreliable mode one roll per call either drops it or
/// delays it. Seedable so tests can pin the fault sequence.
struct RpcProxy {
    options: RpcOptions,
    rng: StdMutex<StdRng>,
}

enum Fate {
    Deliver(Duration),
    Drop,
}

impl RpcProxy {
    fn new(options: RpcOptions) -> Self {
        let rng = match options.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            options,
            rng: StdMutex::new(rng),
        }
    }

    fn roll(&self) -> Fate {
        let mut rng = self.rng.lock().expect("lock poisoned");
        if self.options.unreliable {
            let dice: f64 = rng.gen();
            if dice < self.options.drop_probability {
                Fate::Drop
            } else if dice < self.options.drop_probability + self.options.delay_probability {
                Fate::Deliver(Duration::from_millis(self.options.delay_ms))
            } else {
                Fate::Deliver(Duration::ZERO)
            }
        } else {
            let latency =
                rng.gen_range(self.options.latency_min_ms..=self.options.latency_max_ms);
            Fate::Deliver(Duration::from_millis(latency))
        }
    }
}

/// One cluster member: a consensus module plus its connection lifecycle.
///
/// Inbound RPCs arrive on the server's pump and are dispatched concurrently,
/// one task per call, through the proxy. Outbound calls go through
/// [`ClusterTransport`] over the peer handles registered with
/// [`connect_to_peer`](Server::connect_to_peer).
pub struct Server<C: Command> {
    id: u64,
    cm: ConsensusModule<C>,
    inbound: RpcHandle<C>,
    peers: PeerMap<C>,
    proxy: Arc<RpcProxy>,
    quit: CancellationToken,
}

impl<C: Command> Server<C> {
    /// Creates the server and starts its RPC pump. The consensus module
    /// stays dormant until `ready` fires.
    pub fn new(
        id: u64,
        peer_ids: Vec<u64>,
        config: RaftConfig,
        rpc_options: RpcOptions,
        ready: watch::Receiver<()>,
        commit_tx: mpsc::UnboundedSender<CommitEntry<C>>,
    ) -> Arc<Self> {
        let peers: PeerMap<C> = Arc::new(StdMutex::new(HashMap::new()));
        let transport = Arc::new(ClusterTransport {
            peers: Arc::clone(&peers),
        });
        let cm = ConsensusModule::new(id, peer_ids, config, transport, ready, commit_tx);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let server = Arc::new(Self {
            id,
            cm,
            inbound: inbound_tx,
            peers,
            proxy: Arc::new(RpcProxy::new(rpc_options)),
            quit: CancellationToken::new(),
        });
        tokio::spawn(Arc::clone(&server).serve(inbound_rx));
        server
    }

    async fn serve(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<RpcRequest<C>>) {
        loop {
            tokio::select! {
                _ = self.quit.cancelled() => break,
                request = inbound.recv() => {
                    let Some(request) = request else { break };
                    let server = Arc::clone(&self);
                    tokio::spawn(async move {
                        server.dispatch(request).await;
                    });
                }
            }
        }
        tracing::debug!(id = self.id, "rpc pump stopped");
    }

    async fn dispatch(self: Arc<Self>, request: RpcRequest<C>) {
        let delay = match self.proxy.roll() {
            Fate::Deliver(delay) => delay,
            Fate::Drop => {
                tracing::debug!(id = self.id, "dropping inbound rpc");
                return;
            }
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }

        match request {
            RpcRequest::RequestVote(args, reply_tx) => {
                let reply = self.cm.handle_request_vote(args).await;
                let _ = reply_tx.send(reply);
            }
            RpcRequest::AppendEntries(args, reply_tx) => {
                let reply = self.cm.handle_append_entries(args).await;
                let _ = reply_tx.send(reply);
            }
        }
    }

    /// Handle other servers use to send RPCs to this one.
    pub fn rpc_handle(&self) -> RpcHandle<C> {
        self.inbound.clone()
    }

    /// Registers the outbound route to `peer`. Idempotent.
    pub fn connect_to_peer(&self, peer: u64, handle: RpcHandle<C>) {
        self.peers
            .lock()
            .expect("lock poisoned")
            .entry(peer)
            .or_insert(handle);
    }

    /// Drops the outbound route to `peer`; in-flight calls fail as absent
    /// replies.
    pub fn disconnect_peer(&self, peer: u64) {
        self.peers.lock().expect("lock poisoned").remove(&peer);
    }

    /// Drops every outbound route.
    pub fn disconnect_all(&self) {
        self.peers.lock().expect("lock poisoned").clear();
    }

    pub async fn submit(&self, command: C) -> bool {
        self.cm.submit(command).await
    }

    pub async fn report(&self) -> (u64, u64, bool) {
        self.cm.report().await
    }

    /// Stops the consensus module and the RPC pump.
    pub async fn shutdown(&self) {
        self.cm.stop().await;
        self.quit.cancel();
    }
}
