//! Wire protocol of the live connection
//!
//! Frames are JSON objects discriminated by a `type` field.
//!
//! ## Client → Server
//!
//! ```json
//! {"type": "hello", "protocol": 1}
//! {"type": "subscribe", "topic": {"kind": "game", "id": 42}}
//! {"type": "unsubscribe", "topic": {"kind": "game", "id": 42}}
//! {"type": "command", "request_id": "…", "entity_id": 42, "version": 7,
//!  "action": {"kind": "bid", "bid": 3}}
//! ```
//!
//! ## Server → Client
//!
//! ```json
//! {"type": "hello_ack", "protocol": 1, "user_id": 12}
//! {"type": "ack", "message": "subscribed"}
//! {"type": "state_update", "topic": {...}, "version": 8, "payload": {...}}
//! {"type": "game_state", "topic": {...}, "version": 8, "game": {...}, "viewer": {...}}
//! {"type": "your_turn", "game_id": 42, "version": 8}
//! {"type": "long_wait_invalidated", "game_id": 42}
//! {"type": "command_ack", "request_id": "…", "version": 8}
//! {"type": "error", "code": "bad_topic", "message": "…"}
//! ```
//!
//! Inbound text goes through [`decode`], which yields a known frame or
//! nothing. Unknown or malformed frames are dropped, never fatal.

use crate::core::entity::{EntityId, Topic, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

/// Protocol revision announced in `hello`
pub const PROTOCOL_VERSION: u32 = 1;

/// A user command against one game
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GameAction {
    Bid { bid: u8 },
    Trump { trump: String },
    Play { card: String },
    Ready { is_ready: bool },
}

impl GameAction {
    /// Name of the command endpoint (`/api/games/{id}/{name}`)
    pub fn command_name(&self) -> &'static str {
        match self {
            GameAction::Bid { .. } => "bid",
            GameAction::Trump { .. } => "trump",
            GameAction::Play { .. } => "play",
            GameAction::Ready { .. } => "ready",
        }
    }

    /// Request body expected by the command endpoint
    pub fn http_body(&self) -> Value {
        match self {
            GameAction::Bid { bid } => json!({ "bid": bid }),
            GameAction::Trump { trump } => json!({ "trump": trump }),
            GameAction::Play { card } => json!({ "card": card }),
            GameAction::Ready { is_ready } => json!({ "is_ready": is_ready }),
        }
    }
}

/// Messages sent from client to server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// First frame of every connection
    Hello { protocol: u32 },
    Subscribe { topic: Topic },
    Unsubscribe { topic: Topic },
    /// A command issued against `version` of `entity_id`
    Command {
        request_id: Uuid,
        entity_id: EntityId,
        version: Version,
        action: GameAction,
    },
}

impl ClientFrame {
    pub fn hello() -> Self {
        ClientFrame::Hello {
            protocol: PROTOCOL_VERSION,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Hello { .. } => "hello",
            ClientFrame::Subscribe { .. } => "subscribe",
            ClientFrame::Unsubscribe { .. } => "unsubscribe",
            ClientFrame::Command { .. } => "command",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake accepted
    HelloAck {
        #[serde(default)]
        protocol: Option<u32>,
        #[serde(default)]
        user_id: Option<i64>,
    },
    /// Subscription bookkeeping confirmation
    Ack { message: String },
    /// Full state of an entity at `version`
    StateUpdate {
        topic: Topic,
        version: Version,
        payload: Value,
    },
    /// Hint that the viewer is expected to act
    YourTurn {
        #[serde(alias = "game_id")]
        entity_id: EntityId,
        #[serde(default)]
        version: Option<Version>,
    },
    /// A long-running wait was invalidated
    #[serde(alias = "long_wait_invalidated")]
    Invalidated {
        #[serde(default, alias = "game_id")]
        entity_id: Option<EntityId>,
    },
    /// A command sent on this connection was applied
    CommandAck {
        request_id: Uuid,
        #[serde(default)]
        version: Option<Version>,
    },
    Error {
        code: String,
        message: String,
        #[serde(default)]
        request_id: Option<Uuid>,
    },
}

impl ServerFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerFrame::HelloAck { .. } => "hello_ack",
            ServerFrame::Ack { .. } => "ack",
            ServerFrame::StateUpdate { .. } => "state_update",
            ServerFrame::YourTurn { .. } => "your_turn",
            ServerFrame::Invalidated { .. } => "invalidated",
            ServerFrame::CommandAck { .. } => "command_ack",
            ServerFrame::Error { .. } => "error",
        }
    }
}

/// `game_state` frames split the payload into game and viewer halves
#[derive(Debug, Deserialize)]
struct GameStateFrame {
    topic: Topic,
    version: Version,
    game: Value,
    #[serde(default)]
    viewer: Value,
}

impl From<GameStateFrame> for ServerFrame {
    fn from(frame: GameStateFrame) -> Self {
        ServerFrame::StateUpdate {
            topic: frame.topic,
            version: frame.version,
            payload: json!({ "game": frame.game, "viewer": frame.viewer }),
        }
    }
}

/// Parse an inbound text frame
///
/// Returns `None` (and logs at debug level) for anything that is not a
/// known, well-formed frame.
pub fn decode(text: &str) -> Option<ServerFrame> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            tracing::debug!(error = %e, "dropping non-JSON frame");
            return None;
        }
    };

    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        tracing::debug!("dropping frame without type");
        return None;
    };

    let decoded = if kind == "game_state" {
        serde_json::from_value::<GameStateFrame>(value).map(ServerFrame::from)
    } else {
        let kind = kind.to_string();
        serde_json::from_value::<ServerFrame>(value).inspect_err(|_| {
            tracing::debug!(kind = %kind, "unrecognized frame");
        })
    };

    match decoded {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::debug!(error = %e, "dropping malformed frame");
            None
        }
    }
}

/// Serialize an outbound frame
pub fn encode(frame: &ClientFrame) -> Result<String, serde_json::Error> {
    serde_json::to_string(frame)
}
