#![forbid(unsafe_code)]

//! Peer session layer on top of unreliable, unordered data channels:
//! chunked framing with request/response correlation, the relay and
//! forward connection bootstrap, and the in-process `Net` glue that
//! routes signaling tokens between nodes.

pub mod channel;
pub mod chunk;
mod error;
mod net;
mod node;
mod peer;
pub mod protocol;
pub mod signaling;

pub use error::{ChannelError, NodeError, PeerError};
pub use net::Net;
pub use node::{Node, NodeConfig, NodeContact, NodeEvent, NodeSender};
pub use peer::{Peer, PeerConfig};
