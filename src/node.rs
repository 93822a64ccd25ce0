//! # Mainline DHT Node
//!
//! One Kademlia participant on one UDP socket. The node follows the actor
//! pattern: [`DhtNode`] is a cheap-to-clone handle, while the private
//! actor owns all mutable state (routing table, swarm tracker, token
//! store) and processes commands sequentially, so no lock is ever held
//! across a suspension point.
//!
//! | Task | Role |
//! |------|------|
//! | receive loop | parses datagrams, matches replies to transactions, forwards queries |
//! | actor | owns routing table + tracker + tokens, answers inbound queries |
//! | maintenance loop | refreshes stale buckets, expires swarm peers and token secrets |
//!
//! ## Outbound queries
//!
//! Every query gets a fresh transaction id (a counter in little-endian
//! bytes, trailing zeroes trimmed) and waits for a reply matched by
//! `(transaction id, source endpoint)` or a timeout. The outcome feeds
//! the routing table: replies verify the node, failures count against it.
//!
//! ## Bootstrap
//!
//! The node id is derived per BEP-42 from the external endpoint observed
//! by a seed node, *before* the routing table or any handler exists, so a
//! half-initialized id is unrepresentable. Without configured seeds the
//! node starts a standalone swarm using its bind address.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use hmac::{Hmac, Mac};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use sha1::Sha1;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::id::NodeId;
use crate::krpc::{
    ErrorMsg, Message, NodeContact, QueryMsg, ReplyMsg, ERR_PROTOCOL, ERR_UNKNOWN_METHOD,
};
use crate::lookup::{self, LookupRpc};
use crate::mux::UdpMultiplexer;
use crate::routing::{RoutingTable, BUCKET_SIZE};

/// Per-query timeout for ping/find_node/get_peers/announce_peer.
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout for the initial seed ping.
const BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(15);

/// Buckets untouched by a lookup for this long get refreshed.
const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// How often stale buckets and expired swarm peers are checked for.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Announce-token secrets rotate this often; the two newest are accepted,
/// giving tokens a ten-minute validity window.
const TOKEN_ROTATE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Announced peers expire after this long.
const ANNOUNCE_VALIDITY: Duration = Duration::from_secs(30 * 60);

/// Peers handed out per get_peers reply.
const PEERS_PER_REPLY: usize = 8;

/// Nodes asked for peers (and then announced to) per swarm walk.
const RESPONSIBLE_TRACKERS: usize = 8;

/// Well-known bootstrap hosts tried when none are configured.
pub const DEFAULT_BOOTSTRAP: &[&str] = &[
    "router.bittorrent.com:6881",
    "router.utorrent.com:6881",
    "dht.transmissionbt.com:6881",
];

type HmacSha1 = Hmac<Sha1>;

/// Result of one get_peers query.
#[derive(Debug, Default, Clone)]
pub struct GetPeersResult {
    pub peers: Vec<SocketAddr>,
    pub token: Option<Vec<u8>>,
    pub closer: Vec<NodeContact>,
}

enum ReplyOutcome {
    Reply(ReplyMsg),
    ErrorReply(ErrorMsg),
}

struct PendingTx {
    destination: SocketAddr,
    reply_tx: oneshot::Sender<ReplyOutcome>,
}

struct Inner {
    id: NodeId,
    wan_endpoint: SocketAddr,
    mux: UdpMultiplexer,
    cmd_tx: mpsc::Sender<Command>,
    pending: StdMutex<HashMap<Vec<u8>, PendingTx>>,
    next_tx: AtomicU32,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running DHT node.
#[derive(Clone)]
pub struct DhtNode {
    inner: Arc<Inner>,
}

/// Non-owning handle; announcers hold one so the node can shut down
/// underneath them.
#[derive(Clone)]
pub struct WeakDhtNode {
    inner: Weak<Inner>,
}

impl WeakDhtNode {
    pub fn upgrade(&self) -> Option<DhtNode> {
        self.inner.upgrade().map(|inner| DhtNode { inner })
    }
}

enum Command {
    QuerySucceeded(NodeContact),
    QueryFailed(NodeContact),
    Closest(NodeId, usize, oneshot::Sender<Vec<NodeContact>>),
    NoteLookup(NodeId),
    RefreshTargets(bool, oneshot::Sender<Vec<NodeId>>),
    HandleQuery(SocketAddr, QueryMsg),
    Sweep,
    NodeCount(oneshot::Sender<usize>),
    Quit,
}

impl DhtNode {
    /// Bind a socket, learn our external endpoint from a seed, derive the
    /// BEP-42 id, then start the actor and populate the routing table via
    /// a self-lookup and one lookup per bucket.
    pub async fn bootstrap(bind: SocketAddr, seeds: &[String]) -> Result<DhtNode> {
        let mux = UdpMultiplexer::bind(bind).await?;
        let mut rng = StdRng::from_entropy();

        let mut seed_endpoints = Vec::new();
        for seed in seeds {
            match tokio::net::lookup_host(seed.as_str()).await {
                Ok(addrs) => seed_endpoints.extend(addrs),
                Err(e) => warn!(%seed, error = %e, "cannot resolve bootstrap host"),
            }
        }

        let (wan_endpoint, seed_contact) =
            match bootstrap_ping(&mux, &seed_endpoints, &mut rng).await {
                Some(found) => found,
                None if seeds.is_empty() => {
                    // First node of a fresh swarm.
                    info!("no bootstrap seeds; starting standalone");
                    (mux.local_addr(), None)
                }
                None => {
                    mux.close();
                    return Err(Error::TimedOut);
                }
            };

        let id = NodeId::for_endpoint(&wan_endpoint.ip(), &mut rng);
        info!(%id, %wan_endpoint, "node identity chosen");

        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let inner = Arc::new(Inner {
            id,
            wan_endpoint,
            mux: mux.clone(),
            cmd_tx: cmd_tx.clone(),
            pending: StdMutex::new(HashMap::new()),
            next_tx: AtomicU32::new(1),
            tasks: StdMutex::new(Vec::new()),
        });
        let node = DhtNode { inner };

        let actor = Actor {
            routing: RoutingTable::new(id),
            tracker: Tracker::new(),
            tokens: TokenStore::new(&mut rng),
            rng: StdRng::from_entropy(),
            mux: mux.clone(),
            node: node.downgrade(),
            cmd_rx,
        };
        let actor_task = tokio::spawn(actor.run());
        let receive_task = tokio::spawn(run_receive(mux, node.downgrade()));
        let maintenance_task = tokio::spawn(run_maintenance(cmd_tx, node.downgrade()));
        node.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([actor_task, receive_task, maintenance_task]);

        if let Some(contact) = seed_contact {
            node.command(Command::QuerySucceeded(contact)).await;
        }

        // Look ourselves up to build a path to our own neighborhood, then
        // run one lookup per bucket so peers that should route to us
        // actually learn about us.
        lookup::find_closest_nodes(&node, id, seed_endpoints).await;
        let targets = node.refresh_targets(false).await;
        let mut lookups = JoinSet::new();
        for target in targets {
            let node = node.clone();
            lookups.spawn(async move {
                lookup::find_closest_nodes(&node, target, Vec::new()).await;
            });
        }
        while lookups.join_next().await.is_some() {}

        info!(nodes = node.node_count().await, "bootstrap complete");
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn wan_endpoint(&self) -> SocketAddr {
        self.inner.wan_endpoint
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.mux.local_addr()
    }

    pub fn downgrade(&self) -> WeakDhtNode {
        WeakDhtNode {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop all node tasks and abort every pending operation. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.inner.cmd_tx.send(Command::Quit).await;
        self.inner.mux.close();
        for task in self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    async fn command(&self, cmd: Command) {
        let _ = self.inner.cmd_tx.send(cmd).await;
    }

    fn fresh_tx(&self) -> Vec<u8> {
        let mut value = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        if value == 0 {
            value = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        }
        tx_bytes(value)
    }

    /// Send one query and wait for the matching reply or a timeout. The
    /// outcome updates the routing table when the destination id is known.
    async fn query(
        &self,
        destination: SocketAddr,
        destination_id: Option<NodeId>,
        build: impl FnOnce(Vec<u8>, NodeId) -> QueryMsg,
        deadline: Duration,
    ) -> Result<ReplyMsg> {
        let tx = self.fresh_tx();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                tx.clone(),
                PendingTx {
                    destination,
                    reply_tx,
                },
            );

        let message = Message::Query(build(tx.clone(), self.inner.id));
        let result = match message
            .to_bytes()
            .and_then(|bytes| self.inner.mux.send(bytes, destination))
        {
            Err(e) => Err(e),
            Ok(()) => match timeout(deadline, reply_rx).await {
                Err(_) => Err(Error::TimedOut),
                Ok(Err(_)) => Err(Error::Aborted),
                Ok(Ok(ReplyOutcome::Reply(reply))) => Ok(reply),
                Ok(Ok(ReplyOutcome::ErrorReply(e))) => {
                    debug!(code = e.code, message = %e.message, %destination, "dht error reply");
                    Err(Error::Unsupported("dht error reply"))
                }
            },
        };
        self.inner
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&tx);

        if let Some(id) = destination_id {
            let contact = NodeContact {
                id,
                endpoint: destination,
            };
            match &result {
                Ok(_) => self.command(Command::QuerySucceeded(contact)).await,
                Err(Error::Aborted) => {}
                Err(_) => self.command(Command::QueryFailed(contact)).await,
            }
        }
        result
    }

    /// Fire-and-forget liveness check used by the routing table.
    pub fn send_ping(&self, contact: NodeContact) {
        let node = self.clone();
        tokio::spawn(async move {
            let _ = node
                .query(
                    contact.endpoint,
                    Some(contact.id),
                    QueryMsg::ping,
                    QUERY_TIMEOUT,
                )
                .await;
        });
    }

    pub async fn query_find_node(
        &self,
        target: NodeId,
        endpoint: SocketAddr,
        endpoint_id: Option<NodeId>,
    ) -> Result<Vec<NodeContact>> {
        let reply = self
            .query(
                endpoint,
                endpoint_id,
                |tx, id| QueryMsg::find_node(tx, id, target),
                QUERY_TIMEOUT,
            )
            .await?;
        let mut contacts = reply.nodes;
        contacts.extend(reply.nodes6);
        Ok(contacts)
    }

    pub async fn query_get_peers(
        &self,
        info_hash: NodeId,
        contact: NodeContact,
    ) -> Result<GetPeersResult> {
        let reply = self
            .query(
                contact.endpoint,
                Some(contact.id),
                |tx, id| QueryMsg::get_peers(tx, id, info_hash),
                QUERY_TIMEOUT,
            )
            .await?;
        let mut closer = reply.nodes;
        closer.extend(reply.nodes6);
        Ok(GetPeersResult {
            peers: reply.peers,
            token: reply.token,
            closer,
        })
    }

    pub async fn announce_peer(
        &self,
        contact: NodeContact,
        info_hash: NodeId,
        port: Option<u16>,
        token: Vec<u8>,
    ) -> Result<()> {
        self.query(
            contact.endpoint,
            Some(contact.id),
            |tx, id| QueryMsg::announce_peer(tx, id, info_hash, port, token),
            QUERY_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    /// Query the swarm around `info_hash` for peer endpoints.
    pub async fn tracker_get_peers(&self, info_hash: NodeId) -> Result<BTreeSet<SocketAddr>> {
        let (peers, _) = self.search_swarm(info_hash).await?;
        Ok(peers)
    }

    /// Announce ourselves on the swarm around `info_hash` and collect the
    /// peers already in it. `port` unset announces the implied UDP port.
    pub async fn tracker_announce(
        &self,
        info_hash: NodeId,
        port: Option<u16>,
    ) -> Result<BTreeSet<SocketAddr>> {
        let (peers, responsible) = self.search_swarm(info_hash).await?;

        let mut announced = 0usize;
        let mut announces = JoinSet::new();
        for (contact, token) in responsible {
            let node = self.clone();
            announces
                .spawn(async move { node.announce_peer(contact, info_hash, port, token).await });
        }
        while let Some(joined) = announces.join_next().await {
            if matches!(joined, Ok(Ok(()))) {
                announced += 1;
            }
        }
        if announced == 0 {
            return Err(Error::NotFound);
        }
        debug!(%info_hash, announced, "announced to swarm trackers");
        Ok(peers)
    }

    /// The get_peers walk shared by peer lookups and announces: find the
    /// closest nodes, ask each for peers, and keep their announce tokens.
    async fn search_swarm(
        &self,
        info_hash: NodeId,
    ) -> Result<(BTreeSet<SocketAddr>, Vec<(NodeContact, Vec<u8>)>)> {
        let contacts = lookup::find_closest_nodes(self, info_hash, Vec::new()).await;
        if contacts.is_empty() {
            return Err(Error::NotFound);
        }

        let mut peers = BTreeSet::new();
        let mut responsible = Vec::new();
        let mut queries = JoinSet::new();
        for contact in contacts.into_iter().take(RESPONSIBLE_TRACKERS) {
            let node = self.clone();
            queries.spawn(async move {
                let result = node.query_get_peers(info_hash, contact).await;
                (contact, result)
            });
        }
        while let Some(joined) = queries.join_next().await {
            if let Ok((contact, Ok(result))) = joined {
                peers.extend(result.peers);
                if let Some(token) = result.token {
                    responsible.push((contact, token));
                }
            }
        }

        if responsible.is_empty() && peers.is_empty() {
            return Err(Error::NotFound);
        }
        Ok((peers, responsible))
    }

    pub async fn closest_routing_nodes(&self, target: NodeId, count: usize) -> Vec<NodeContact> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::Closest(target, count, tx)).await;
        rx.await.unwrap_or_default()
    }

    async fn refresh_targets(&self, stale_only: bool) -> Vec<NodeId> {
        let (tx, rx) = oneshot::channel();
        self.command(Command::RefreshTargets(stale_only, tx)).await;
        rx.await.unwrap_or_default()
    }

    pub async fn node_count(&self) -> usize {
        let (tx, rx) = oneshot::channel();
        self.command(Command::NodeCount(tx)).await;
        rx.await.unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl LookupRpc for DhtNode {
    fn local_id(&self) -> NodeId {
        self.id()
    }

    async fn closest_known(&self, target: NodeId, count: usize) -> Vec<NodeContact> {
        self.closest_routing_nodes(target, count).await
    }

    async fn find_node(
        &self,
        endpoint: SocketAddr,
        endpoint_id: Option<NodeId>,
        target: NodeId,
    ) -> Result<Vec<NodeContact>> {
        self.query_find_node(target, endpoint, endpoint_id).await
    }

    async fn note_lookup(&self, target: NodeId) {
        self.command(Command::NoteLookup(target)).await;
    }
}

/// Little-endian counter bytes with trailing zeroes trimmed.
fn tx_bytes(mut value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(4);
    while value != 0 {
        out.push((value & 0xff) as u8);
        value >>= 8;
    }
    out
}

/// Ping the seed endpoints until one tells us our external endpoint.
async fn bootstrap_ping(
    mux: &UdpMultiplexer,
    seeds: &[SocketAddr],
    rng: &mut StdRng,
) -> Option<(SocketAddr, Option<NodeContact>)> {
    for &seed in seeds {
        let mut ephemeral = [0u8; 20];
        rng.fill(&mut ephemeral[..]);
        let tx: Vec<u8> = rng.gen::<u16>().to_le_bytes().to_vec();
        let ping = Message::Query(QueryMsg::ping(tx.clone(), NodeId::from_bytes(ephemeral)));
        let bytes = match ping.to_bytes() {
            Ok(bytes) => bytes,
            Err(_) => continue,
        };
        if mux.send(bytes, seed).is_err() {
            return None;
        }

        let deadline = Instant::now() + BOOTSTRAP_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (datagram, from) = match timeout(remaining, mux.receive()).await {
                Ok(Ok(received)) => received,
                Ok(Err(_)) => return None,
                Err(_) => break,
            };
            if from != seed {
                continue;
            }
            match Message::from_bytes(&datagram) {
                Ok(Message::Reply(reply)) if reply.tx == tx => {
                    let Some(wan) = reply.observed_endpoint else {
                        warn!(%seed, "bootstrap reply lacks observed endpoint");
                        break;
                    };
                    let contact = reply.id.map(|id| NodeContact { id, endpoint: seed });
                    return Some((wan, contact));
                }
                _ => continue,
            }
        }
        debug!(%seed, "bootstrap seed did not answer");
    }
    None
}

async fn run_receive(mux: UdpMultiplexer, node: WeakDhtNode) {
    loop {
        let (datagram, from) = match mux.receive().await {
            Ok(received) => received,
            Err(_) => break,
        };
        let Some(node) = node.upgrade() else { break };

        let message = match Message::from_bytes(&datagram) {
            Ok(message) => message,
            Err(_) => {
                trace!(%from, "dropping malformed datagram");
                continue;
            }
        };
        match message {
            Message::Reply(reply) => {
                dispatch_reply(&node, from, reply.tx.clone(), ReplyOutcome::Reply(reply));
            }
            Message::Error(error) => {
                dispatch_reply(
                    &node,
                    from,
                    error.tx.clone(),
                    ReplyOutcome::ErrorReply(error),
                );
            }
            Message::Query(query) => {
                node.command(Command::HandleQuery(from, query)).await;
            }
        }
    }
}

fn dispatch_reply(node: &DhtNode, from: SocketAddr, tx: Vec<u8>, outcome: ReplyOutcome) {
    let mut pending = node
        .inner
        .pending
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    match pending.get(&tx) {
        Some(entry) if entry.destination == from => {
            if let Some(entry) = pending.remove(&tx) {
                let _ = entry.reply_tx.send(outcome);
            }
        }
        _ => trace!(%from, "ignoring unmatched reply"),
    }
}

async fn run_maintenance(cmd_tx: mpsc::Sender<Command>, node: WeakDhtNode) {
    let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
    interval.tick().await;
    loop {
        interval.tick().await;
        if cmd_tx.send(Command::Sweep).await.is_err() {
            break;
        }

        let (tx, rx) = oneshot::channel();
        if cmd_tx
            .send(Command::RefreshTargets(true, tx))
            .await
            .is_err()
        {
            break;
        }
        let targets = match rx.await {
            Ok(targets) => targets,
            Err(_) => break,
        };
        for target in targets {
            let Some(node) = node.upgrade() else { return };
            debug!(%target, "refreshing stale bucket");
            lookup::find_closest_nodes(&node, target, Vec::new()).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct Actor {
    routing: RoutingTable,
    tracker: Tracker,
    tokens: TokenStore,
    rng: StdRng,
    mux: UdpMultiplexer,
    node: WeakDhtNode,
    cmd_rx: mpsc::Receiver<Command>,
}

impl Actor {
    async fn run(mut self) {
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::QuerySucceeded(contact) => {
                    let pings = self.routing.try_add(contact, true);
                    self.spawn_pings(pings);
                }
                Command::QueryFailed(contact) => {
                    let pings = self.routing.fail_node(&contact);
                    self.spawn_pings(pings);
                }
                Command::Closest(target, count, reply) => {
                    let _ = reply.send(self.routing.closest(&target, count));
                }
                Command::NoteLookup(target) => {
                    self.routing.note_lookup(&target);
                }
                Command::RefreshTargets(stale_only, reply) => {
                    let targets = if stale_only {
                        self.routing
                            .stale_refresh_targets(BUCKET_REFRESH_INTERVAL, &mut self.rng)
                    } else {
                        self.routing.refresh_targets(&mut self.rng)
                    };
                    let _ = reply.send(targets);
                }
                Command::HandleQuery(from, query) => {
                    self.handle_query(from, query);
                }
                Command::Sweep => {
                    self.tracker.sweep();
                    self.tokens.rotate(&mut self.rng);
                }
                Command::NodeCount(reply) => {
                    let _ = reply.send(self.routing.node_count());
                }
                Command::Quit => break,
            }
        }
    }

    fn spawn_pings(&self, contacts: Vec<NodeContact>) {
        if contacts.is_empty() {
            return;
        }
        if let Some(node) = self.node.upgrade() {
            for contact in contacts {
                node.send_ping(contact);
            }
        }
    }

    fn send_message(&self, message: Message, to: SocketAddr) {
        if let Ok(bytes) = message.to_bytes() {
            let _ = self.mux.send(bytes, to);
        }
    }

    fn send_error(&self, to: SocketAddr, tx: Vec<u8>, code: i64, text: &str) {
        self.send_message(
            Message::Error(ErrorMsg {
                tx,
                code,
                message: text.to_string(),
            }),
            to,
        );
    }

    fn send_reply(&self, to: SocketAddr, mut reply: ReplyMsg) {
        reply.id = Some(self.routing.self_id());
        reply.observed_endpoint = Some(to);
        self.send_message(Message::Reply(reply), to);
    }

    fn handle_query(&mut self, from: SocketAddr, query: QueryMsg) {
        let Some(sender_id) = query.args.id else {
            self.send_error(from, query.tx, ERR_PROTOCOL, "Missing argument 'id'");
            return;
        };

        // Per BEP-43, read-only senders are not routing material.
        if !query.read_only {
            let contact = NodeContact {
                id: sender_id,
                endpoint: from,
            };
            let pings = self.routing.try_add(contact, false);
            self.spawn_pings(pings);
        }

        match query.name.as_str() {
            "ping" => {
                self.send_reply(
                    from,
                    ReplyMsg {
                        tx: query.tx,
                        ..ReplyMsg::default()
                    },
                );
            }
            "find_node" => {
                let Some(target) = query.args.target else {
                    self.send_error(from, query.tx, ERR_PROTOCOL, "Missing argument 'target'");
                    return;
                };
                let (nodes, nodes6) = self.closest_for_reply(target);
                self.send_reply(
                    from,
                    ReplyMsg {
                        tx: query.tx,
                        nodes,
                        nodes6,
                        ..ReplyMsg::default()
                    },
                );
            }
            "get_peers" => {
                let Some(info_hash) = query.args.info_hash else {
                    self.send_error(from, query.tx, ERR_PROTOCOL, "Missing argument 'info_hash'");
                    return;
                };
                let peers = self
                    .tracker
                    .sample(&info_hash, PEERS_PER_REPLY, &mut self.rng);
                let token = self.tokens.generate(from.ip(), &mut self.rng);
                let (nodes, nodes6) = if peers.is_empty() {
                    self.closest_for_reply(info_hash)
                } else {
                    (Vec::new(), Vec::new())
                };
                self.send_reply(
                    from,
                    ReplyMsg {
                        tx: query.tx,
                        nodes,
                        nodes6,
                        peers,
                        token: Some(token),
                        ..ReplyMsg::default()
                    },
                );
            }
            "announce_peer" => {
                let Some(info_hash) = query.args.info_hash else {
                    self.send_error(from, query.tx, ERR_PROTOCOL, "Missing argument 'info_hash'");
                    return;
                };
                let Some(token) = query.args.token.as_deref() else {
                    self.send_error(from, query.tx, ERR_PROTOCOL, "Missing argument 'token'");
                    return;
                };
                if !self.tokens.verify(from.ip(), token) {
                    self.send_error(from, query.tx, ERR_PROTOCOL, "Invalid announce token");
                    return;
                }
                let port = match (query.args.implied_port, query.args.port) {
                    (false, Some(port)) => port,
                    _ => from.port(),
                };
                self.tracker.add(info_hash, SocketAddr::new(from.ip(), port));
                trace!(%info_hash, peer = %from, "peer announced");
                self.send_reply(
                    from,
                    ReplyMsg {
                        tx: query.tx,
                        ..ReplyMsg::default()
                    },
                );
            }
            _ => {
                self.send_error(
                    from,
                    query.tx,
                    ERR_UNKNOWN_METHOD,
                    "Query type not implemented",
                );
            }
        }
    }

    /// The closest known contacts for a reply; when the target itself is
    /// known, return just that one.
    fn closest_for_reply(&self, target: NodeId) -> (Vec<NodeContact>, Vec<NodeContact>) {
        let mut contacts = self.routing.closest(&target, BUCKET_SIZE);
        if let Some(first) = contacts.first() {
            if first.id == target {
                contacts.truncate(1);
            }
        }
        let nodes6 = contacts
            .iter()
            .filter(|c| c.endpoint.is_ipv6())
            .copied()
            .collect();
        let nodes = contacts
            .into_iter()
            .filter(|c| c.endpoint.is_ipv4())
            .collect();
        (nodes, nodes6)
    }
}

// ---------------------------------------------------------------------------
// Announce tokens and swarm storage
// ---------------------------------------------------------------------------

/// Rotating-secret HMAC tokens tying an announce to a prior get_peers.
struct TokenStore {
    secrets: VecDeque<(Instant, [u8; 20])>,
}

impl TokenStore {
    fn new(rng: &mut StdRng) -> Self {
        let mut store = TokenStore {
            secrets: VecDeque::new(),
        };
        store.push_secret(rng);
        store
    }

    fn push_secret(&mut self, rng: &mut StdRng) {
        let mut secret = [0u8; 20];
        rng.fill(&mut secret[..]);
        self.secrets.push_back((Instant::now(), secret));
        while self.secrets.len() > 2 {
            self.secrets.pop_front();
        }
    }

    fn rotate(&mut self, rng: &mut StdRng) {
        let newest = self.secrets.back().map(|(at, _)| *at);
        match newest {
            Some(at) if at.elapsed() < TOKEN_ROTATE_INTERVAL => {}
            _ => self.push_secret(rng),
        }
    }

    fn token_for(secret: &[u8; 20], ip: IpAddr) -> Vec<u8> {
        let mut mac = HmacSha1::new_from_slice(secret).expect("hmac accepts any key length");
        mac.update(ip.to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn generate(&mut self, ip: IpAddr, rng: &mut StdRng) -> Vec<u8> {
        self.rotate(rng);
        match self.secrets.back() {
            Some((_, secret)) => Self::token_for(secret, ip),
            None => Vec::new(),
        }
    }

    fn verify(&self, ip: IpAddr, token: &[u8]) -> bool {
        self.secrets
            .iter()
            .any(|(_, secret)| Self::token_for(secret, ip) == token)
    }
}

/// Peers announced per infohash, with expiry.
struct Tracker {
    swarms: HashMap<NodeId, Vec<(SocketAddr, Instant)>>,
}

impl Tracker {
    fn new() -> Self {
        Tracker {
            swarms: HashMap::new(),
        }
    }

    fn add(&mut self, info_hash: NodeId, endpoint: SocketAddr) {
        let swarm = self.swarms.entry(info_hash).or_default();
        match swarm.iter_mut().find(|(ep, _)| *ep == endpoint) {
            Some(entry) => entry.1 = Instant::now(),
            None => swarm.push((endpoint, Instant::now())),
        }
    }

    /// A random subset of the swarm.
    fn sample(&self, info_hash: &NodeId, count: usize, rng: &mut StdRng) -> Vec<SocketAddr> {
        match self.swarms.get(info_hash) {
            Some(swarm) => swarm
                .choose_multiple(rng, count)
                .map(|(ep, _)| *ep)
                .collect(),
            None => Vec::new(),
        }
    }

    fn sweep(&mut self) {
        self.swarms.retain(|_, swarm| {
            swarm.retain(|(_, seen)| seen.elapsed() < ANNOUNCE_VALIDITY);
            !swarm.is_empty()
        });
    }
}
