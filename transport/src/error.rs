use std::borrow::Cow;

use thiserror::Error;
use webkad_logic::transport::TransportError;

#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ChannelError {
    #[error("Channel is closed")]
    Closed,

    #[error("Frame of {len} bytes larger than the {max} the channel accepts")]
    FrameTooLarge { len: usize, max: usize },
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum PeerError {
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("No complete reply arrived within the deadline")]
    Timeout,

    #[error("Wrong frame format: {0}")]
    WrongFormat(#[from] serde_json::Error),

    #[error("Session closed while waiting for a reply")]
    SessionClosed,
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum NodeError {
    #[error("Peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("Bad signaling token: {0}")]
    BadToken(Cow<'static, str>),

    #[error("No session matches the answer token")]
    UnknownSession,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl From<PeerError> for TransportError {
    fn from(x: PeerError) -> Self {
        match x {
            PeerError::Timeout => TransportError::Timeout,
            PeerError::Channel(_) | PeerError::SessionClosed => TransportError::ConnectionLost,
            x => TransportError::UnknownError(x.to_string().into()),
        }
    }
}
