//! One established session with a remote node.
//!
//! A [`Peer`] owns the channel end, cuts outgoing payloads into chunk
//! frames and reassembles incoming ones, and correlates replies to
//! in-flight requests by the shared request id. Frames whose id does
//! not match a pending request surface to the node dispatch instead.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};
use webkad_logic::Id;

use crate::channel::DataChannel;
use crate::chunk::{chop, ChunkFrame, ReassemblyTable};
use crate::error::PeerError;
use crate::protocol::{Message, Payload};
use crate::signaling::SessionCredentials;

/// Worst-case JSON envelope around one chunk: id, count, i and the
/// field syntax. The chunk text gets whatever the channel frame cap
/// leaves after this.
const FRAME_OVERHEAD: usize = 96;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Base64 bytes carried per chunk frame.
    pub chunk_size: usize,

    /// Half-delivered payloads tracked before the oldest is abandoned.
    pub max_reassembly: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            chunk_size: 16,
            max_reassembly: 64,
        }
    }
}

struct PeerState {
    pending: HashMap<Id, oneshot::Sender<Payload>>,
    reassembly: ReassemblyTable,
    closed: bool,
}

pub struct Peer {
    id: Id,
    credentials: SessionCredentials,
    channel: Box<dyn DataChannel>,
    config: PeerConfig,
    state: Mutex<PeerState>,
}

impl Peer {
    pub fn new(
        id: Id,
        credentials: SessionCredentials,
        channel: Box<dyn DataChannel>,
        config: PeerConfig,
    ) -> Peer {
        let reassembly = ReassemblyTable::new(config.max_reassembly);
        Peer {
            id,
            credentials,
            channel,
            config,
            state: Mutex::new(PeerState {
                pending: HashMap::new(),
                reassembly,
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn credentials(&self) -> &SessionCredentials {
        &self.credentials
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }

    fn transmit(&self, id: Id, payload: &Payload) -> Result<(), PeerError> {
        let cap = self.channel.max_frame_len().saturating_sub(FRAME_OVERHEAD);
        let mtu = self.config.chunk_size.min(cap).max(1);
        for frame in chop(id, &payload.encode(), mtu) {
            let text = serde_json::to_string(&frame)?;
            self.channel.send(&text)?;
        }
        Ok(())
    }

    /// Fire-and-forget under a fresh id. Nothing is tracked, any reply
    /// would surface through node dispatch.
    pub fn send(&self, message: Message) -> Result<(), PeerError> {
        if self.is_closed() {
            return Err(PeerError::SessionClosed);
        }
        self.transmit(rand::random(), &message.into())
    }

    /// Answers a dispatched payload by reusing its id, so the other
    /// end can match it to a pending request.
    pub fn reply(&self, id: Id, message: Message) -> Result<(), PeerError> {
        self.transmit(id, &message.into())
    }

    /// Sends `message` under a fresh id and waits for the payload that
    /// comes back under the same id.
    pub async fn request(&self, message: Message, timeout: Duration) -> Result<Payload, PeerError> {
        let id: Id = rand::random();
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(PeerError::SessionClosed);
            }
            state.pending.insert(id, tx);
        }
        if let Err(x) = self.transmit(id, &message.into()) {
            self.state.lock().unwrap().pending.remove(&id);
            return Err(x);
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(PeerError::SessionClosed),
            Err(_) => {
                debug!(peer = %self.id, request = %id, "Request timed out");
                self.state.lock().unwrap().pending.remove(&id);
                Err(PeerError::Timeout)
            }
        }
    }

    /// Feeds one raw channel frame in. Returns the completed payload
    /// and its id when it is NOT the reply to a pending request; those
    /// are routed to their waiter instead.
    pub fn on_frame(&self, text: &str) -> Result<Option<(Id, Payload)>, PeerError> {
        let frame: ChunkFrame = serde_json::from_str(text)?;
        let mut state = self.state.lock().unwrap();
        let raw = match state.reassembly.push(frame.clone()) {
            Some(x) => x,
            None => return Ok(None),
        };
        let payload = Payload::decode(&raw);
        trace!(peer = %self.id, request = %frame.id, "Payload complete");
        if let Some(waiter) = state.pending.remove(&frame.id) {
            // A dropped waiter already gave up on the reply
            let _ = waiter.send(payload);
            return Ok(None);
        }
        Ok(Some((frame.id, payload)))
    }

    /// Closes the channel and fails every in-flight request.
    pub fn close(&self) {
        self.channel.close();
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        // Dropping the senders wakes the waiters with SessionClosed
        state.pending.clear();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
