//! Event-channel protocol between a canvas client and the room authority.
//!
//! Wire format (bincode-encoded, one message per WebSocket binary frame):
//! ```text
//! client → server   ClientMessage { room_id, is_replay, original_timestamp, request }
//! server → client   ServerMessage (lock notifications, probe replies, mutations)
//! ```
//!
//! `Request` bodies are the intents a client emits; replays of queued
//! intents carry `is_replay = true` and the timestamp at which the user
//! originally issued them.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Identity of the local participant, attached to lock requests.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub username: String,
    /// Presence color hint (CSS hex)
    pub color: String,
}

impl Participant {
    pub fn new(
        user_id: impl Into<String>,
        username: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
            color: color.into(),
        }
    }

    /// Create with a color derived from the user id, stable across sessions.
    pub fn with_stable_color(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let color = stable_color(&user_id);
        Self {
            user_id,
            username: username.into(),
            color,
        }
    }
}

/// FNV-1a over the id bytes, folded into an `#rrggbb` string.
fn stable_color(id: &str) -> String {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in id.as_bytes() {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    format!("#{:06x}", hash & 0x00FF_FFFF)
}

/// Symbolic action name of a request, used for queue records and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionType {
    RequestLock,
    ReleaseLock,
    Probe,
    Mutation,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::RequestLock => "request-lock",
            ActionType::ReleaseLock => "release-lock",
            ActionType::Probe => "probe",
            ActionType::Mutation => "mutation",
        }
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An outbound intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    RequestLock {
        element_id: String,
        user_id: String,
        username: String,
        color: String,
    },
    ReleaseLock {
        element_id: String,
        user_id: String,
        is_auto_release: bool,
    },
    /// Liveness probe; the authority echoes it back as `ProbeReply`
    Probe { probe_id: Uuid, sent_at: u64 },
    /// Application mutation, opaque to the sync layer
    Mutation { event: String, payload: Vec<u8> },
}

impl Request {
    pub fn lock(element_id: impl Into<String>, who: &Participant) -> Self {
        Request::RequestLock {
            element_id: element_id.into(),
            user_id: who.user_id.clone(),
            username: who.username.clone(),
            color: who.color.clone(),
        }
    }

    pub fn release(element_id: impl Into<String>, who: &Participant, is_auto_release: bool) -> Self {
        Request::ReleaseLock {
            element_id: element_id.into(),
            user_id: who.user_id.clone(),
            is_auto_release,
        }
    }

    pub fn action_type(&self) -> ActionType {
        match self {
            Request::RequestLock { .. } => ActionType::RequestLock,
            Request::ReleaseLock { .. } => ActionType::ReleaseLock,
            Request::Probe { .. } => ActionType::Probe,
            Request::Mutation { .. } => ActionType::Mutation,
        }
    }

    /// Element this request concerns, if it is a lock request or release.
    pub fn element_id(&self) -> Option<&str> {
        match self {
            Request::RequestLock { element_id, .. } | Request::ReleaseLock { element_id, .. } => {
                Some(element_id)
            }
            _ => None,
        }
    }
}

/// Client → server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub room_id: String,
    /// Set when the request is replayed from the offline outbox
    pub is_replay: bool,
    /// When the user originally issued a replayed request (ms since epoch)
    pub original_timestamp: Option<u64>,
    pub request: Request,
}

impl ClientMessage {
    /// A request sent as soon as it was issued.
    pub fn live(room_id: impl Into<String>, request: Request) -> Self {
        Self {
            room_id: room_id.into(),
            is_replay: false,
            original_timestamp: None,
            request,
        }
    }

    /// A queued request being replayed after reconnection.
    pub fn replay(room_id: impl Into<String>, request: Request, original_timestamp: u64) -> Self {
        Self {
            room_id: room_id.into(),
            is_replay: true,
            original_timestamp: Some(original_timestamp),
            request,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Server → client notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    LockGranted {
        element_id: String,
        user_id: String,
        username: String,
        color: String,
    },
    LockReleased {
        element_id: String,
        user_id: String,
    },
    LockDenied {
        element_id: String,
        reason: String,
        /// Display name of the current holder, when the authority shares it
        holder: Option<String>,
    },
    ForceUnlock {
        element_id: String,
    },
    ProbeReply {
        probe_id: Uuid,
        sent_at: u64,
    },
    /// Mutation broadcast from another participant
    Mutation {
        event: String,
        payload: Vec<u8>,
        user_id: String,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Lifecycle and inbound traffic of a channel, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Connected,
    Disconnected,
    Message(ServerMessage),
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Participant {
        Participant::new("u-alice", "Alice", "#ff0000")
    }

    #[test]
    fn test_lock_request_carries_identity() {
        let req = Request::lock("elem-1", &alice());
        match &req {
            Request::RequestLock { element_id, user_id, username, color } => {
                assert_eq!(element_id, "elem-1");
                assert_eq!(user_id, "u-alice");
                assert_eq!(username, "Alice");
                assert_eq!(color, "#ff0000");
            }
            other => panic!("unexpected request {other:?}"),
        }
        assert_eq!(req.action_type(), ActionType::RequestLock);
        assert_eq!(req.element_id(), Some("elem-1"));
    }

    #[test]
    fn test_replay_message_flags() {
        let msg = ClientMessage::replay("room", Request::release("e", &alice(), false), 1234);
        assert!(msg.is_replay);
        assert_eq!(msg.original_timestamp, Some(1234));

        let live = ClientMessage::live("room", Request::release("e", &alice(), true));
        assert!(!live.is_replay);
        assert!(live.original_timestamp.is_none());
    }

    #[test]
    fn test_client_message_wire_roundtrip() {
        let msg = ClientMessage::replay(
            "room-9",
            Request::Mutation { event: "element-update".into(), payload: vec![1, 2, 3] },
            42,
        );
        let decoded = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_server_message_wire_roundtrip() {
        let msg = ServerMessage::LockDenied {
            element_id: "elem-2".into(),
            reason: "held".into(),
            holder: Some("Bob".into()),
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ServerMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ClientMessage::decode(&[]).is_err());
    }

    #[test]
    fn test_probe_frame_is_small() {
        let msg = ClientMessage::live(
            "r",
            Request::Probe { probe_id: Uuid::new_v4(), sent_at: unix_millis() },
        );
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 64, "probe frame {} bytes", encoded.len());
    }

    #[test]
    fn test_stable_color() {
        let a = Participant::with_stable_color("user-1", "A");
        let b = Participant::with_stable_color("user-1", "A again");
        let c = Participant::with_stable_color("user-2", "C");
        assert_eq!(a.color, b.color);
        assert_ne!(a.color, c.color);
        assert_eq!(a.color.len(), 7);
        assert!(a.color.starts_with('#'));
    }

    #[test]
    fn test_action_type_names() {
        assert_eq!(ActionType::RequestLock.to_string(), "request-lock");
        assert_eq!(ActionType::ReleaseLock.as_str(), "release-lock");
        assert_eq!(ActionType::Mutation.as_str(), "mutation");
    }
}
