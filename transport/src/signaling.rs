//! The out-of-band signaling contract.
//!
//! The codec that turns a session descriptor into a short
//! copy-pasteable token is an external collaborator; the core only
//! consumes `encode`/`decode` and reads the answer flag. A base64/JSON
//! codec is provided for the in-process net and the tests.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use webkad_logic::Id;

use crate::error::NodeError;

/// Everything the token carries: node id, ICE-style credentials, the
/// DTLS fingerprint, one candidate address, and the offer/answer flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub peer_id: Id,
    pub session: Id,
    pub ice_ufrag: String,
    pub ice_pwd: String,
    pub fingerprint: String,
    pub candidate: String,
    pub is_answer: bool,
}

impl SessionDescriptor {
    /// A fresh offer descriptor with random credentials.
    pub fn offer<R: Rng>(peer_id: Id, rng: &mut R) -> SessionDescriptor {
        SessionDescriptor {
            peer_id,
            session: rng.gen(),
            ice_ufrag: random_credential(rng),
            ice_pwd: random_credential(rng),
            fingerprint: random_credential(rng),
            candidate: String::new(),
            is_answer: false,
        }
    }

    /// The answering side of an offer: same session, own credentials.
    pub fn answer_to<R: Rng>(&self, peer_id: Id, rng: &mut R) -> SessionDescriptor {
        SessionDescriptor {
            peer_id,
            session: self.session,
            ice_ufrag: random_credential(rng),
            ice_pwd: random_credential(rng),
            fingerprint: random_credential(rng),
            candidate: String::new(),
            is_answer: true,
        }
    }
}

fn random_credential<R: Rng>(rng: &mut R) -> String {
    rng.sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect()
}

/// The encode/decode contract the core consumes. Tokens are opaque to
/// everything but the codec itself.
pub trait SignalingCodec {
    fn encode(&self, descriptor: &SessionDescriptor) -> String;
    fn decode(&self, token: &str) -> Result<SessionDescriptor, NodeError>;
}

/// Reference codec: JSON wrapped in url-safe base64.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenCodec;

impl SignalingCodec for TokenCodec {
    fn encode(&self, descriptor: &SessionDescriptor) -> String {
        let raw = serde_json::to_vec(descriptor).expect("descriptor is always serializable");
        base64::encode_config(raw, base64::URL_SAFE_NO_PAD)
    }

    fn decode(&self, token: &str) -> Result<SessionDescriptor, NodeError> {
        let raw = base64::decode_config(token, base64::URL_SAFE_NO_PAD)
            .map_err(|_| NodeError::BadToken("not base64".into()))?;
        serde_json::from_slice(&raw).map_err(|_| NodeError::BadToken("bad descriptor".into()))
    }
}

/// The ICE-credential strings of one established session, as seen by
/// either end; both peers know the same two strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub local_ufrag: String,
    pub remote_ufrag: String,
}

impl SessionCredentials {
    pub fn new(local_ufrag: impl Into<String>, remote_ufrag: impl Into<String>) -> Self {
        SessionCredentials {
            local_ufrag: local_ufrag.into(),
            remote_ufrag: remote_ufrag.into(),
        }
    }

    fn contains(&self, s: &str) -> bool {
        self.local_ufrag == s || self.remote_ufrag == s
    }

    /// Seen from the other end of the channel: the same string pair.
    pub fn flipped(&self) -> SessionCredentials {
        SessionCredentials {
            local_ufrag: self.remote_ufrag.clone(),
            remote_ufrag: self.local_ufrag.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Survivor {
    First,
    Second,
}

/// Duplicate-session tie-break: take the lexicographically smallest of
/// the four credential strings; the session NOT owning it survives.
/// The rule only looks at the unordered string sets, so both ends of
/// both sessions agree on the winner without coordination.
pub fn pick_survivor(a: &SessionCredentials, b: &SessionCredentials) -> Survivor {
    let smallest = [
        &a.local_ufrag,
        &a.remote_ufrag,
        &b.local_ufrag,
        &b.remote_ufrag,
    ]
    .into_iter()
    .min()
    .expect("four candidates");

    if a.contains(smallest) {
        Survivor::Second
    } else {
        Survivor::First
    }
}
