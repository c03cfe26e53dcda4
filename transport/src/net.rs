//! In-process glue: a set of nodes sharing one rendezvous that turns
//! signaling tokens into channel pairs. Offer tokens mint the pair at
//! accept time; applying the answer opens both ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use webkad_logic::Id;

use crate::channel::{ChannelEvents, MemoryChannel};
use crate::error::{NodeError, PeerError};
use crate::node::{Node, NodeConfig};
use crate::signaling::{SignalingCodec, TokenCodec};

const DEFAULT_FRAME_LEN: usize = 1024;
const CONNECT_DEADLINE: Duration = Duration::from_secs(5);

/// Holds the offerer's channel end between accept and answer, keyed
/// by session id.
pub(crate) struct Rendezvous {
    frame_len: usize,
    pending: Mutex<HashMap<Id, (MemoryChannel, ChannelEvents)>>,
}

impl Rendezvous {
    pub(crate) fn new(frame_len: usize) -> Arc<Rendezvous> {
        Arc::new(Rendezvous {
            frame_len,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Mints the channel pair for an accepted offer and parks the
    /// offerer's end until the answer comes back.
    pub(crate) fn accept(&self, session: Id) -> (MemoryChannel, ChannelEvents) {
        let (offerer, acceptor) = MemoryChannel::pair(self.frame_len);
        self.pending.lock().unwrap().insert(session, offerer);
        acceptor
    }

    /// Hands the parked end to the offerer and fires `Open` at both
    /// ends of the pair.
    pub(crate) fn apply_answer(&self, session: Id) -> Option<(MemoryChannel, ChannelEvents)> {
        let (channel, events) = self.pending.lock().unwrap().remove(&session)?;
        channel.open();
        Some((channel, events))
    }
}

/// A process-local network of nodes.
pub struct Net {
    rendezvous: Arc<Rendezvous>,
    config: NodeConfig,
    nodes: Mutex<Vec<Arc<Node>>>,
}

impl Net {
    pub fn new() -> Net {
        Net::with_config(NodeConfig::default())
    }

    /// The config handed to nodes `bind` mints on its own.
    pub fn with_config(config: NodeConfig) -> Net {
        Net {
            rendezvous: Rendezvous::new(DEFAULT_FRAME_LEN),
            config,
            nodes: Mutex::new(Vec::new()),
        }
    }

    pub fn node(&self, config: NodeConfig) -> Arc<Node> {
        self.node_with_id(config, rand::random())
    }

    pub fn node_with_id(&self, config: NodeConfig, id: Id) -> Arc<Node> {
        let node = Arc::new(Node::new(config, id, self.rendezvous.clone()));
        self.nodes.lock().unwrap().push(node.clone());
        node
    }

    /// Routes a pasted signaling token: an answer goes to the node
    /// owning its pending session, an offer gets answered by a fresh
    /// node whose answer token is returned.
    pub fn bind(&self, token: &str) -> Result<Option<String>, NodeError> {
        let descriptor = TokenCodec.decode(token)?;
        if descriptor.is_answer {
            for node in self.nodes.lock().unwrap().iter() {
                match node.apply_answer(token) {
                    Ok(_) => return Ok(None),
                    Err(NodeError::UnknownSession) => continue,
                    Err(x) => return Err(x),
                }
            }
            return Err(NodeError::UnknownSession);
        }
        let node = self.node(self.config.clone());
        node.accept_offer(token).map(Some)
    }

    /// Full token dance between two nodes, waiting until both ends
    /// see the session.
    pub async fn connect(&self, a: &Node, b: &Node) -> Result<(), NodeError> {
        let offer = a.create_offer();
        let answer = b.accept_offer(&offer)?;
        a.apply_answer(&answer)?;

        let deadline = tokio::time::Instant::now() + CONNECT_DEADLINE;
        while !(a.is_connected(b.id()) && b.is_connected(a.id())) {
            if tokio::time::Instant::now() >= deadline {
                return Err(NodeError::Peer(PeerError::Timeout));
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        Ok(())
    }
}

impl Default for Net {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::node::NodeEvent;

    fn quick_config() -> NodeConfig {
        let mut config = NodeConfig::default();
        config.system.timing.request_timeout = Duration::from_secs(2);
        config.system.timing.lookup_timeout = Duration::from_secs(1);
        config.peer.chunk_size = 64;
        config
    }

    async fn wait_chat(
        events: &mut tokio::sync::mpsc::UnboundedReceiver<NodeEvent>,
    ) -> (Id, String) {
        let deadline = Duration::from_secs(2);
        tokio::time::timeout(deadline, async {
            loop {
                match events.recv().await {
                    Some(NodeEvent::Chat { from, message }) => return (from, message),
                    Some(_) => continue,
                    None => panic!("event stream ended"),
                }
            }
        })
        .await
        .expect("no chat arrived")
    }

    #[test_log::test(tokio::test)]
    async fn token_dance_connects_both_ends() {
        let net = Net::new();
        let a = net.node(quick_config());
        let b = net.node(quick_config());
        net.connect(&a, &b).await.unwrap();

        assert_eq!(a.connected_ids(), vec![b.id()]);
        assert_eq!(b.connected_ids(), vec![a.id()]);
        assert!(a.ping(b.id()).await.is_ok());
        assert!(b.ping(a.id()).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn chat_crosses_the_wire() {
        let net = Net::new();
        let a = net.node(quick_config());
        let b = net.node(quick_config());
        let mut b_events = b.take_events().unwrap();
        net.connect(&a, &b).await.unwrap();

        a.send_chat(b.id(), "hello over there").unwrap();
        let (from, message) = wait_chat(&mut b_events).await;
        assert_eq!(from, a.id());
        assert_eq!(message, "hello over there");

        // Broadcast reaches the only live peer too
        assert_eq!(a.broadcast("to everyone"), 1);
        let (_, message) = wait_chat(&mut b_events).await;
        assert_eq!(message, "to everyone");
    }

    #[test_log::test(tokio::test)]
    async fn simultaneous_sessions_converge() {
        let net = Net::new();
        let a = net.node(quick_config());
        let b = net.node(quick_config());

        // Both sides offer at the same time and both answers land
        let offer_a = a.create_offer();
        let offer_b = b.create_offer();
        let answer_b = b.accept_offer(&offer_a).unwrap();
        let answer_a = a.accept_offer(&offer_b).unwrap();
        a.apply_answer(&answer_b).unwrap();
        b.apply_answer(&answer_a).unwrap();

        // Let the merge settle
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(a.connected_ids(), vec![b.id()]);
        assert_eq!(b.connected_ids(), vec![a.id()]);

        // Both ends must have kept the same session: requests answer
        // in both directions
        assert!(a.ping(b.id()).await.is_ok());
        assert!(b.ping(a.id()).await.is_ok());
    }

    #[test_log::test(tokio::test)]
    async fn bind_routes_tokens_to_the_right_node() {
        let net = Net::with_config(quick_config());
        let a = net.node(quick_config());
        let offer = a.create_offer();

        // An offer is answered by a freshly minted node
        let answer = net.bind(&offer).unwrap().expect("an answer token");
        // The answer finds the node holding the pending session
        assert_eq!(net.bind(&answer).unwrap(), None);

        let deadline = tokio::time::Instant::now() + CONNECT_DEADLINE;
        while a.connected_ids().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "bind never connected");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let minted = a.connected_ids()[0];
        assert!(a.ping(minted).await.is_ok());

        // A spent answer matches no pending session anywhere
        assert!(matches!(net.bind(&answer), Err(NodeError::UnknownSession)));
    }

    #[test_log::test(tokio::test)]
    async fn lookup_dials_through_the_referrer() {
        let net = Net::new();
        let a = net.node(quick_config());
        let b = net.node(quick_config());
        let c = net.node(quick_config());
        net.connect(&a, &b).await.unwrap();
        net.connect(&c, &b).await.unwrap();

        let found = a.lookup(c.id()).await;
        assert!(found.contains(&c.id()));
        // The lookup resolved c through b's relay hop
        assert!(a.is_connected(c.id()));
        assert!(a.ping(c.id()).await.is_ok());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn fifty_nodes_find_each_other() {
        let net = Net::new();
        let mut rng = StdRng::seed_from_u64(77);
        let nodes: Vec<_> = (0..50)
            .map(|_| net.node_with_id(quick_config(), rng.gen()))
            .collect();

        // Everyone enters through the same bootstrap node
        for node in &nodes[1..] {
            net.connect(node, &nodes[0]).await.unwrap();
        }
        for node in &nodes {
            node.bootstrap().await;
        }

        for (i, j) in [(42usize, 17usize), (3, 49), (25, 8)] {
            let found = nodes[i].lookup(nodes[j].id()).await;
            assert!(
                found.contains(&nodes[j].id()),
                "node {i} could not locate node {j}"
            );
        }
    }
}
