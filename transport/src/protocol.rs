//! The JSON wire schema carried inside reassembled payloads.
//!
//! Every structured message is one tagged union decoded in a single
//! place; free-text chat payloads that fail structured decode stay
//! valid as opaque text.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use webkad_logic::Id;

pub const UNREACHABLE: &str = "unreachable";

/// A structured wire message. `{"type": ...}` variants plus the plain
/// `{"message": ...}` chat shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Typed(Typed),
    Chat { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Typed {
    Ping,
    Pong,
    FindNode {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<Id>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contacts: Option<Vec<Id>>,
    },
    Relay {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<Id>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Forward {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<Id>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Message {
    pub fn ping() -> Message {
        Message::Typed(Typed::Ping)
    }

    pub fn pong() -> Message {
        Message::Typed(Typed::Pong)
    }

    pub fn chat(message: impl Into<String>) -> Message {
        Message::Chat {
            message: message.into(),
        }
    }

    pub fn find_node_query(key: Id) -> Message {
        Message::Typed(Typed::FindNode {
            key: Some(key),
            contacts: None,
        })
    }

    pub fn find_node_reply(contacts: Vec<Id>) -> Message {
        Message::Typed(Typed::FindNode {
            key: None,
            contacts: Some(contacts),
        })
    }

    pub fn relay(payload: Value, to: Id) -> Message {
        Message::Typed(Typed::Relay {
            payload: Some(payload),
            to: Some(to),
            error: None,
        })
    }

    pub fn relay_answer(payload: Value) -> Message {
        Message::Typed(Typed::Relay {
            payload: Some(payload),
            to: None,
            error: None,
        })
    }

    pub fn relay_error(error: impl Into<String>) -> Message {
        Message::Typed(Typed::Relay {
            payload: None,
            to: None,
            error: Some(error.into()),
        })
    }

    pub fn forward(payload: Value, from: Id) -> Message {
        Message::Typed(Typed::Forward {
            payload: Some(payload),
            from: Some(from),
            error: None,
        })
    }

    pub fn forward_error(error: impl Into<String>) -> Message {
        Message::Typed(Typed::Forward {
            payload: None,
            from: None,
            error: Some(error.into()),
        })
    }
}

/// A reassembled payload: structured when it decodes, opaque text
/// otherwise (malformed bytes are data, not an error).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Message(Message),
    Text(String),
}

impl Payload {
    pub fn decode(raw: &[u8]) -> Payload {
        match serde_json::from_slice::<Message>(raw) {
            Ok(x) => Payload::Message(x),
            Err(_) => Payload::Text(String::from_utf8_lossy(raw).into_owned()),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            // Message serialization cannot fail, every variant is a
            // plain JSON object
            Payload::Message(x) => serde_json::to_vec(x).expect("message is always serializable"),
            Payload::Text(x) => x.as_bytes().to_vec(),
        }
    }
}

impl From<Message> for Payload {
    fn from(x: Message) -> Self {
        Payload::Message(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shapes() {
        let ping = serde_json::to_value(Message::ping()).unwrap();
        assert_eq!(ping, serde_json::json!({ "type": "ping" }));

        let key = Id::from_hex("ab");
        let q = serde_json::to_value(Message::find_node_query(key)).unwrap();
        assert_eq!(
            q,
            serde_json::json!({ "type": "findNode", "key": key.as_hex() })
        );

        let err = serde_json::to_value(Message::relay_error(UNREACHABLE)).unwrap();
        assert_eq!(
            err,
            serde_json::json!({ "type": "relay", "error": "unreachable" })
        );

        let chat = serde_json::to_value(Message::chat("hi")).unwrap();
        assert_eq!(chat, serde_json::json!({ "message": "hi" }));
    }

    #[test]
    fn decode_round_trip() {
        let msgs = [
            Message::ping(),
            Message::pong(),
            Message::find_node_reply(vec![Id::from_hex("01"), Id::from_hex("02")]),
            Message::relay(serde_json::json!("token"), Id::from_hex("cc")),
            Message::forward(serde_json::json!("token"), Id::from_hex("aa")),
            Message::chat("hey there"),
        ];
        for msg in msgs {
            let bytes = Payload::Message(msg.clone()).encode();
            assert_eq!(Payload::decode(&bytes), Payload::Message(msg));
        }
    }

    #[test]
    fn malformed_is_opaque_text() {
        assert_eq!(
            Payload::decode(b"not json at all"),
            Payload::Text("not json at all".to_owned())
        );
        // Valid JSON of an unknown shape is opaque too
        assert_eq!(
            Payload::decode(b"{\"weird\": 1}"),
            Payload::Text("{\"weird\": 1}".to_owned())
        );
    }
}
