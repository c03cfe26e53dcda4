use std::{borrow::Cow, fmt::Debug, future::Future};

use thiserror::Error;

use crate::id::Id;

/// A transport-held handle to a remote node.
///
/// Transports that bootstrap connections lazily (through a relay hop)
/// hand out smart handles keeping the underlying session alive;
/// simulated transports may simply use `Id`.
pub trait Contact: Clone + Debug {
    fn id(&self) -> Id;
}

impl Contact for Id {
    fn id(&self) -> Id {
        *self
    }
}

/// Object able to send requests to an id.
// Should use interior mutability and refcounting; a copy must be
// cheap and sendable across task boundaries.
pub trait TransportSender: Clone + Send {
    /// Fire-and-forget liveness probe. A failed probe must surface as
    /// a disconnection of that peer.
    fn ping(&self, id: Id);

    /// Future returned when sending a request to another peer.
    type Fut: Future<Output = Result<RawResponse<Self::Contact>, TransportError>> + Send;

    /// Sends a request and waits for the fully reassembled reply.
    fn send(&self, id: Id, msg: Request) -> Self::Fut;

    /// Wraps an id the routing table knows into a contact handle.
    fn wrap_contact(&self, id: Id) -> Self::Contact;

    type Contact: Contact + Send;
}

pub trait TransportListener {
    /// Returns true if the new session's id was admitted into the
    /// routing table.
    fn on_connect(&self, id: Id) -> bool;

    fn on_disconnect(&self, id: Id);

    fn on_request(&self, sender: Id, request: Request) -> Response;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request {
    Ping,
    FindNodes(Id),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RawResponse<C> {
    Pong,
    FoundNodes(Vec<C>),
    // Generic bad response (should never be produced by a correct peer)
    Error,
}

pub type Response = RawResponse<Id>;

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,

    #[error("Peer connection lost")]
    ConnectionLost,

    #[error("Cannot find a live session for the contact")]
    ContactLost,

    #[error("Target not reachable through the relay")]
    Unreachable,

    #[error("Unknown transport error: {0}")]
    UnknownError(Cow<'static, str>),
}

impl From<&'static str> for TransportError {
    fn from(x: &'static str) -> Self {
        TransportError::UnknownError(Cow::Borrowed(x))
    }
}

impl From<String> for TransportError {
    fn from(x: String) -> Self {
        TransportError::UnknownError(Cow::Owned(x))
    }
}
