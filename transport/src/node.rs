//! A running node: the DHT core wired to live peer sessions.
//!
//! `Peers` is the shared connection state behind the transport; the
//! `NodeSender` handed to the DHT resolves unknown ids returned by a
//! lookup through the relay bootstrap, so a lookup result is always a
//! set of reachable contacts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use async_broadcast as broadcast;
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, event, trace, Level};
use webkad_logic::config::SystemConfig;
use webkad_logic::search::LookupOptions;
use webkad_logic::transport::{
    Contact, RawResponse, Request, Response, TransportError, TransportListener, TransportSender,
};
use webkad_logic::{Dht, Id};

use crate::channel::{ChannelEvent, ChannelEvents};
use crate::error::NodeError;
use crate::net::Rendezvous;
use crate::peer::{Peer, PeerConfig};
use crate::protocol::{Message, Payload, Typed, UNREACHABLE};
use crate::signaling::{
    pick_survivor, SessionCredentials, SessionDescriptor, SignalingCodec, Survivor, TokenCodec,
};

#[derive(Debug, Clone, Default)]
pub struct NodeConfig {
    pub system: SystemConfig,
    pub peer: PeerConfig,
    /// Ids dialed best-effort through every fresh session.
    pub bootstrap_ids: Vec<Id>,
}

/// What the application layer sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected(Id),
    Disconnected(Id),
    Chat { from: Id, message: String },
}

/// A lookup-resolved handle: either a live session or a plain id (the
/// node itself, or a session that closed under us).
#[derive(Clone)]
pub enum NodeContact {
    Bare(Id),
    Session(Arc<Peer>),
}

impl Contact for NodeContact {
    fn id(&self) -> Id {
        match self {
            NodeContact::Bare(x) => *x,
            NodeContact::Session(x) => x.id(),
        }
    }
}

impl std::fmt::Debug for NodeContact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("NodeContact").field(&self.id()).finish()
    }
}

type ConnectResult = Result<NodeContact, TransportError>;

/// Shared connection state: live sessions, in-progress signaling and
/// the dedup table for concurrent dials to the same id.
pub(crate) struct Peers {
    dht: Weak<Dht<NodeSender>>,
    self_id: Id,
    config: NodeConfig,
    rendezvous: Arc<Rendezvous>,
    peers: Mutex<HashMap<Id, Arc<Peer>>>,
    sessions: Mutex<HashMap<Id, SessionDescriptor>>,
    connecting: Mutex<HashMap<Id, broadcast::Receiver<ConnectResult>>>,
    events: mpsc::UnboundedSender<NodeEvent>,
}

impl Peers {
    fn peer(&self, id: Id) -> Option<Arc<Peer>> {
        self.peers.lock().unwrap().get(&id).cloned()
    }

    fn request_timeout(&self) -> Duration {
        self.config.system.timing.request_timeout
    }

    fn lookup_options(&self) -> LookupOptions {
        LookupOptions {
            parallelism: self.config.system.routing.alpha,
        }
    }

    /// Admits a freshly opened session. A duplicate id triggers the
    /// commutative credential tie-break; the losing channel is closed
    /// on the spot and the surviving peer is returned.
    fn register_peer(self: &Arc<Self>, peer: Arc<Peer>) -> Arc<Peer> {
        let id = peer.id();
        let (survivor, loser, fresh) = {
            let mut peers = self.peers.lock().unwrap();
            match peers.get(&id).cloned() {
                Some(existing) if Arc::ptr_eq(&existing, &peer) => (existing, None, false),
                Some(existing) => {
                    match pick_survivor(existing.credentials(), peer.credentials()) {
                        Survivor::First => (existing, Some(peer), false),
                        Survivor::Second => {
                            peers.insert(id, peer.clone());
                            (peer, Some(existing), false)
                        }
                    }
                }
                None => {
                    peers.insert(id, peer.clone());
                    (peer, None, true)
                }
            }
        };
        if let Some(loser) = loser {
            event!(Level::INFO, kad_id=%self.self_id, "Merging duplicate session with {id}");
            loser.close();
        }
        if fresh {
            if let Some(dht) = self.dht.upgrade() {
                dht.on_connect(id);
                // Warm the routing table through the new neighborhood
                let options = self.lookup_options();
                tokio::spawn(async move { dht.bootstrap(options).await });
            }
            let _ = self.events.send(NodeEvent::Connected(id));
            self.introduce(survivor.clone());
        }
        survivor
    }

    /// Post-connect exchange on a fresh session: greet it with a ping,
    /// then dial the configured bootstrap ids through it.
    fn introduce(self: &Arc<Self>, peer: Arc<Peer>) {
        let this = self.clone();
        tokio::spawn(async move {
            let start = Instant::now();
            match peer.request(Message::ping(), this.request_timeout()).await {
                Ok(Payload::Message(Message::Typed(Typed::Pong))) => {
                    debug!(
                        kad_id=%this.self_id,
                        "Session with {} up, rtt {:?}", peer.id(), start.elapsed()
                    );
                }
                x => debug!(kad_id=%this.self_id, "Greeting {} failed: {x:?}", peer.id()),
            }
            let targets: Vec<Id> = this
                .config
                .bootstrap_ids
                .iter()
                .copied()
                .filter(|x| *x != this.self_id && *x != peer.id() && this.peer(*x).is_none())
                .collect();
            for target in targets {
                if let Err(x) = this.clone().connect_through(peer.clone(), target).await {
                    debug!(kad_id=%this.self_id, "Bootstrap dial to {target} failed: {x}");
                }
            }
        });
    }

    /// Drops a session, but only if it still is the live one for its
    /// id (a merged-away duplicate must not evict its survivor).
    fn unregister(&self, peer: &Arc<Peer>) {
        let id = peer.id();
        let removed = {
            let mut peers = self.peers.lock().unwrap();
            match peers.get(&id) {
                Some(current) if Arc::ptr_eq(current, peer) => {
                    peers.remove(&id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            if let Some(dht) = self.dht.upgrade() {
                dht.on_disconnect(id);
            }
            let _ = self.events.send(NodeEvent::Disconnected(id));
        }
    }

    /// Owns one channel's event stream for the session's lifetime.
    async fn run_channel(self: Arc<Self>, peer: Arc<Peer>, mut events: ChannelEvents) {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Open) => {
                    self.register_peer(peer.clone());
                }
                Some(ChannelEvent::Message(text)) => match peer.on_frame(&text) {
                    Ok(Some((request, payload))) => self.dispatch(&peer, request, payload),
                    Ok(None) => {}
                    Err(x) => {
                        debug!(kad_id=%self.self_id, "Bad frame from {}: {x}", peer.id())
                    }
                },
                Some(ChannelEvent::Close) | None => break,
            }
        }
        peer.close();
        self.unregister(&peer);
    }

    /// Single dispatch point for unsolicited payloads.
    fn dispatch(self: &Arc<Self>, peer: &Arc<Peer>, request: Id, payload: Payload) {
        let from = peer.id();
        let message = match payload {
            Payload::Message(x) => x,
            // Opaque bytes surface as chat text
            Payload::Text(text) => {
                let _ = self.events.send(NodeEvent::Chat {
                    from,
                    message: text,
                });
                return;
            }
        };
        match message {
            Message::Chat { message } => {
                let _ = self.events.send(NodeEvent::Chat { from, message });
            }
            Message::Typed(Typed::Ping) => {
                if let Some(dht) = self.dht.upgrade() {
                    dht.on_request(from, Request::Ping);
                }
                self.answer(peer, request, Message::pong());
            }
            Message::Typed(Typed::FindNode { key: Some(key), .. }) => {
                if let Some(dht) = self.dht.upgrade() {
                    if let Response::FoundNodes(found) = dht.on_request(from, Request::FindNodes(key))
                    {
                        self.answer(peer, request, Message::find_node_reply(found));
                    }
                }
            }
            Message::Typed(Typed::Relay {
                payload: Some(payload),
                to: Some(to),
                ..
            }) => {
                let this = self.clone();
                let peer = peer.clone();
                tokio::spawn(async move { this.relay_hop(peer, request, to, payload).await });
            }
            Message::Typed(Typed::Forward {
                payload: Some(payload),
                from: Some(origin),
                ..
            }) => {
                let reply = self.accept_forward(payload, origin);
                self.answer(peer, request, reply);
            }
            other => trace!(kad_id=%self.self_id, "Stray message from {from}: {other:?}"),
        }
    }

    fn answer(&self, peer: &Arc<Peer>, request: Id, message: Message) {
        if let Err(x) = peer.reply(request, message) {
            debug!(kad_id=%self.self_id, "Dropping reply to {}: {x}", peer.id());
        }
    }

    /// The middle hop of the connection bootstrap: pass the payload on
    /// to `to` if it is live here, relay its answer back.
    async fn relay_hop(self: Arc<Self>, source: Arc<Peer>, request: Id, to: Id, payload: Value) {
        let reply = match self.peer(to) {
            // One round trip, no probing on behalf of the requester
            None => Message::relay_error(UNREACHABLE),
            Some(target) => {
                let forwarded = Message::forward(payload, source.id());
                match target.request(forwarded, self.request_timeout()).await {
                    Ok(Payload::Message(x)) => x,
                    Ok(Payload::Text(_)) => Message::relay_error("malformed forward answer"),
                    Err(x) => Message::relay_error(x.to_string()),
                }
            }
        };
        self.answer(&source, request, reply);
    }

    /// The far end of the bootstrap: a relayed offer arrived, answer
    /// it with a session of our own.
    fn accept_forward(self: &Arc<Self>, payload: Value, origin: Id) -> Message {
        let res = payload
            .as_str()
            .ok_or(NodeError::BadToken("forward payload is not a token".into()))
            .and_then(|token| TokenCodec.decode(token))
            .and_then(|offer| {
                if offer.peer_id != origin {
                    return Err(NodeError::BadToken("offer does not match its origin".into()));
                }
                self.accept_descriptor(offer)
            });
        match res {
            Ok(token) => Message::relay_answer(Value::String(token)),
            Err(x) => {
                debug!(kad_id=%self.self_id, "Rejecting forwarded offer from {origin}: {x}");
                Message::forward_error(x.to_string())
            }
        }
    }

    fn create_offer(&self) -> String {
        let offer = SessionDescriptor::offer(self.self_id, &mut rand::thread_rng());
        self.sessions.lock().unwrap().insert(offer.session, offer.clone());
        TokenCodec.encode(&offer)
    }

    /// Answers an offer: mints the channel pair at the rendezvous and
    /// starts pumping our end. Registration happens when the channel
    /// opens, which is when the offerer applies our answer.
    fn accept_descriptor(self: &Arc<Self>, offer: SessionDescriptor) -> Result<String, NodeError> {
        if offer.is_answer {
            return Err(NodeError::BadToken("expected an offer".into()));
        }
        let answer = offer.answer_to(self.self_id, &mut rand::thread_rng());
        let (channel, events) = self.rendezvous.accept(offer.session);
        let credentials =
            SessionCredentials::new(answer.ice_ufrag.clone(), offer.ice_ufrag.clone());
        let peer = Arc::new(Peer::new(
            offer.peer_id,
            credentials,
            Box::new(channel),
            self.config.peer.clone(),
        ));
        tokio::spawn(self.clone().run_channel(peer, events));
        Ok(TokenCodec.encode(&answer))
    }

    /// Applies an answer to one of our pending offers and registers
    /// the session right away.
    fn apply_descriptor(self: &Arc<Self>, answer: SessionDescriptor) -> Result<Arc<Peer>, NodeError> {
        if !answer.is_answer {
            return Err(NodeError::BadToken("expected an answer".into()));
        }
        let offer = self
            .sessions
            .lock()
            .unwrap()
            .remove(&answer.session)
            .ok_or(NodeError::UnknownSession)?;
        let (channel, events) = self
            .rendezvous
            .apply_answer(answer.session)
            .ok_or(NodeError::UnknownSession)?;
        let credentials = SessionCredentials::new(offer.ice_ufrag, answer.ice_ufrag.clone());
        let peer = Arc::new(Peer::new(
            answer.peer_id,
            credentials,
            Box::new(channel),
            self.config.peer.clone(),
        ));
        let survivor = self.register_peer(peer.clone());
        tokio::spawn(self.clone().run_channel(peer, events));
        Ok(survivor)
    }

    fn abandon_session(&self, session: Id) {
        self.sessions.lock().unwrap().remove(&session);
    }

    /// Turns found ids into live contacts, dialing unknown ones
    /// through the peer that reported them.
    async fn resolve(self: &Arc<Self>, referrer: &Arc<Peer>, ids: Vec<Id>) -> Vec<NodeContact> {
        let mut known: Vec<Option<NodeContact>> = Vec::with_capacity(ids.len());
        let mut to_dial = Vec::new();
        {
            let peers = self.peers.lock().unwrap();
            for id in ids {
                if id == self.self_id {
                    known.push(Some(NodeContact::Bare(id)));
                } else if let Some(peer) = peers.get(&id) {
                    known.push(Some(NodeContact::Session(peer.clone())));
                } else {
                    known.push(None);
                    to_dial.push(id);
                }
            }
        }
        let dialed = future::join_all(to_dial.into_iter().map(|id| {
            let this = self.clone();
            let referrer = referrer.clone();
            async move { this.connect_through(referrer, id).await }
        }))
        .await;

        let mut dialed = dialed.into_iter();
        known
            .into_iter()
            .filter_map(|slot| match slot {
                Some(x) => Some(x),
                None => dialed.next().and_then(|res| match res {
                    Ok(x) => Some(x),
                    Err(x) => {
                        debug!(kad_id=%self.self_id, "Dropping unreachable candidate: {x}");
                        None
                    }
                }),
            })
            .collect()
    }

    /// Deduplicated dial: concurrent callers for the same target share
    /// one attempt and all get its outcome.
    async fn connect_through(
        self: Arc<Self>,
        referrer: Arc<Peer>,
        target: Id,
    ) -> ConnectResult {
        if target == self.self_id {
            return Ok(NodeContact::Bare(target));
        }
        if let Some(peer) = self.peer(target) {
            return Ok(NodeContact::Session(peer));
        }

        enum Role {
            Lead(broadcast::Sender<ConnectResult>),
            Join(broadcast::Receiver<ConnectResult>),
        }
        let role = {
            let mut connecting = self.connecting.lock().unwrap();
            match connecting.get(&target) {
                Some(rx) => Role::Join(rx.clone()),
                None => {
                    let (tx, rx) = broadcast::broadcast(1);
                    connecting.insert(target, rx);
                    Role::Lead(tx)
                }
            }
        };
        match role {
            Role::Join(mut rx) => rx
                .recv()
                .await
                .unwrap_or(Err(TransportError::ConnectionLost)),
            Role::Lead(tx) => {
                let mut guard = DialGuard {
                    owner: self.clone(),
                    target,
                    channel: Some(tx),
                };
                let res = self.dial_through(&referrer, target).await;
                guard.settle(res.clone());
                res
            }
        }
    }

    /// Offer token over relay, answer token back, session up.
    async fn dial_through(
        self: &Arc<Self>,
        referrer: &Arc<Peer>,
        target: Id,
    ) -> ConnectResult {
        debug!(kad_id=%self.self_id, "Dialing {target} through {}", referrer.id());
        let offer = SessionDescriptor::offer(self.self_id, &mut rand::thread_rng());
        let session = offer.session;
        self.sessions.lock().unwrap().insert(session, offer.clone());

        let request = Message::relay(Value::String(TokenCodec.encode(&offer)), target);
        let reply = match referrer.request(request, self.request_timeout()).await {
            Ok(x) => x,
            Err(x) => {
                self.abandon_session(session);
                return Err(x.into());
            }
        };

        let answer = match reply {
            Payload::Message(Message::Typed(Typed::Relay {
                payload: Some(x), ..
            })) => x,
            Payload::Message(Message::Typed(
                Typed::Relay { error: Some(x), .. } | Typed::Forward { error: Some(x), .. },
            )) => {
                self.abandon_session(session);
                return Err(if x == UNREACHABLE {
                    TransportError::Unreachable
                } else {
                    TransportError::UnknownError(x.into())
                });
            }
            _ => {
                self.abandon_session(session);
                return Err("unexpected relay reply".into());
            }
        };

        let descriptor = answer
            .as_str()
            .ok_or_else(|| TransportError::from("relay answer is not a token"))
            .and_then(|token| {
                TokenCodec
                    .decode(token)
                    .map_err(|x| TransportError::UnknownError(x.to_string().into()))
            });
        let descriptor = match descriptor {
            Ok(x) => x,
            Err(x) => {
                self.abandon_session(session);
                return Err(x);
            }
        };
        let peer = self
            .apply_descriptor(descriptor)
            .map_err(|x| TransportError::UnknownError(x.to_string().into()))?;
        Ok(NodeContact::Session(peer))
    }
}

/// Owns the `connecting` entry of one leading dial. Settling removes
/// the entry and wakes every joined waiter; a guard dropped mid-dial
/// (the caller was cancelled) settles with an error, so an abandoned
/// attempt cannot poison later dials to the same id.
struct DialGuard {
    owner: Arc<Peers>,
    target: Id,
    channel: Option<broadcast::Sender<ConnectResult>>,
}

impl DialGuard {
    fn settle(&mut self, result: ConnectResult) {
        if let Some(channel) = self.channel.take() {
            self.owner.connecting.lock().unwrap().remove(&self.target);
            let _ = channel.try_broadcast(result);
        }
    }
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        self.settle(Err("dial abandoned".into()));
    }
}

/// The transport handle the DHT core drives.
#[derive(Clone)]
pub struct NodeSender(pub(crate) Arc<Peers>);

impl TransportSender for NodeSender {
    /// Liveness probe behind bucket eviction: a failed ping settles
    /// the probe against the incumbent and drops its session.
    fn ping(&self, id: Id) {
        let root = self.0.clone();
        tokio::spawn(async move {
            let timeout = root.request_timeout();
            let alive = match root.peer(id) {
                Some(peer) => matches!(
                    peer.request(Message::ping(), timeout).await,
                    Ok(Payload::Message(Message::Typed(Typed::Pong)))
                ),
                None => false,
            };
            if let Some(dht) = root.dht.upgrade() {
                dht.resolve_probe(id, alive);
            }
            if !alive {
                if let Some(peer) = root.peer(id) {
                    peer.close();
                    root.unregister(&peer);
                }
            }
        });
    }

    type Fut = BoxFuture<'static, Result<RawResponse<NodeContact>, TransportError>>;

    fn send(&self, id: Id, msg: Request) -> Self::Fut {
        let root = self.0.clone();
        async move {
            let peer = root.peer(id).ok_or(TransportError::ContactLost)?;
            let (wire, timeout) = match msg {
                Request::Ping => (Message::ping(), root.request_timeout()),
                Request::FindNodes(key) => (
                    Message::find_node_query(key),
                    root.config.system.timing.lookup_timeout,
                ),
            };
            let reply = peer.request(wire, timeout).await.map_err(TransportError::from)?;
            match reply {
                Payload::Message(Message::Typed(Typed::Pong)) => Ok(RawResponse::Pong),
                Payload::Message(Message::Typed(Typed::FindNode {
                    contacts: Some(found),
                    ..
                })) => Ok(RawResponse::FoundNodes(root.resolve(&peer, found).await)),
                _ => Ok(RawResponse::Error),
            }
        }
        .boxed()
    }

    fn wrap_contact(&self, id: Id) -> NodeContact {
        match self.0.peer(id) {
            Some(peer) => NodeContact::Session(peer),
            None => NodeContact::Bare(id),
        }
    }

    type Contact = NodeContact;
}

/// One local node: id, DHT core and its live sessions.
pub struct Node {
    dht: Arc<Dht<NodeSender>>,
    events: Mutex<Option<mpsc::UnboundedReceiver<NodeEvent>>>,
}

impl Node {
    pub(crate) fn new(config: NodeConfig, id: Id, rendezvous: Arc<Rendezvous>) -> Node {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dht = Arc::new_cyclic(|weak_dht: &Weak<Dht<NodeSender>>| {
            let peers = Arc::new(Peers {
                dht: weak_dht.clone(),
                self_id: id,
                config: config.clone(),
                rendezvous,
                peers: Mutex::new(HashMap::new()),
                sessions: Mutex::new(HashMap::new()),
                connecting: Mutex::new(HashMap::new()),
                events: events_tx,
            });
            Dht::new(config.system, id, NodeSender(peers))
        });
        Node {
            dht,
            events: Mutex::new(Some(events_rx)),
        }
    }

    fn peers(&self) -> &Arc<Peers> {
        &self.dht.transport().0
    }

    pub fn id(&self) -> Id {
        self.dht.id()
    }

    pub fn dht(&self) -> &Arc<Dht<NodeSender>> {
        &self.dht
    }

    /// The application event stream; there is exactly one.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<NodeEvent>> {
        self.events.lock().unwrap().take()
    }

    /// A copy-pasteable token inviting another node to connect.
    pub fn create_offer(&self) -> String {
        self.peers().create_offer()
    }

    /// Answers an offer token, returning the answer token to hand
    /// back out-of-band.
    pub fn accept_offer(&self, token: &str) -> Result<String, NodeError> {
        let offer = TokenCodec.decode(token)?;
        self.peers().accept_descriptor(offer)
    }

    /// Completes the handshake; returns the remote node's id.
    pub fn apply_answer(&self, token: &str) -> Result<Id, NodeError> {
        let answer = TokenCodec.decode(token)?;
        let peer = self.peers().apply_descriptor(answer)?;
        Ok(peer.id())
    }

    pub fn is_connected(&self, id: Id) -> bool {
        self.peers().peer(id).is_some()
    }

    pub fn connected_ids(&self) -> Vec<Id> {
        self.peers().peers.lock().unwrap().keys().copied().collect()
    }

    /// Round-trip time to a connected peer.
    pub async fn ping(&self, id: Id) -> Result<Duration, NodeError> {
        let peer = self
            .peers()
            .peer(id)
            .ok_or(NodeError::Transport(TransportError::ContactLost))?;
        let start = Instant::now();
        let reply = peer
            .request(Message::ping(), self.peers().request_timeout())
            .await?;
        match reply {
            Payload::Message(Message::Typed(Typed::Pong)) => Ok(start.elapsed()),
            _ => Err(NodeError::Transport("unexpected ping reply".into())),
        }
    }

    pub fn send_chat(&self, id: Id, text: impl Into<String>) -> Result<(), NodeError> {
        let peer = self
            .peers()
            .peer(id)
            .ok_or(NodeError::Transport(TransportError::ContactLost))?;
        peer.send(Message::chat(text)).map_err(NodeError::from)
    }

    /// Best effort fanout to every live peer; returns how many took it.
    pub fn broadcast(&self, text: &str) -> usize {
        let peers: Vec<_> = self.peers().peers.lock().unwrap().values().cloned().collect();
        peers
            .iter()
            .filter(|peer| peer.send(Message::chat(text)).is_ok())
            .count()
    }

    /// Iterative lookup for the ids closest to `key`; unknown results
    /// are connected through whoever reported them.
    pub async fn lookup(&self, key: Id) -> Vec<Id> {
        let options = self.peers().lookup_options();
        self.dht
            .lookup_nodes(key, options)
            .await
            .iter()
            .map(Contact::id)
            .collect()
    }

    pub async fn bootstrap(&self) {
        let options = self.peers().lookup_options();
        self.dht.bootstrap(options).await;
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node").field("id", &self.id()).finish()
    }
}
