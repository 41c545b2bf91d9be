//! Message protocol definitions
//!
//! JSON wire shapes exchanged with the peer: the inbound action message and
//! the outbound broadcast message, plus the rejection frame sent back when a
//! request cannot be served.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{JoinError, ValidationError};
use crate::types::{RoomId, UserId};

/// History replay size when a join does not ask for one.
pub const DEFAULT_HISTORY_LIMIT: usize = 30;

/// Inbound action verb
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Join,
    Leave,
    Message,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Join => "join",
            Action::Leave => "leave",
            Action::Message => "message",
        };
        f.write_str(name)
    }
}

/// Peer → system message
///
/// Decoded leniently: missing `roomIDs` or `content` default to empty, and
/// `historyLimit` is kept only when it is a non-negative integer or a string
/// holding one.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    #[serde(rename = "senderID", default)]
    pub sender_id: Option<UserId>,
    pub action: Action,
    #[serde(rename = "roomIDs", default)]
    pub room_ids: Vec<RoomId>,
    #[serde(default)]
    pub content: String,
    #[serde(
        rename = "historyLimit",
        default,
        deserialize_with = "lenient_limit"
    )]
    pub history_limit: Option<usize>,
}

/// A validated inbound message, ready to become a hub request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join { rooms: Vec<RoomId>, history_limit: usize },
    Leave { rooms: Vec<RoomId> },
    Message { rooms: Vec<RoomId>, content: String },
}

impl InboundMessage {
    /// Check the payload and turn it into a typed request.
    ///
    /// Room ids are de-duplicated and sorted.
    pub fn validate(self) -> Result<Request, ValidationError> {
        let mut rooms = self.room_ids;
        rooms.sort_unstable();
        rooms.dedup();

        if rooms.is_empty() {
            return Err(ValidationError::EmptyRooms {
                action: self.action,
            });
        }

        Ok(match self.action {
            Action::Join => {
                // Older clients put the limit in `content`
                let history_limit = self
                    .history_limit
                    .or_else(|| self.content.trim().parse().ok())
                    .unwrap_or(DEFAULT_HISTORY_LIMIT);
                Request::Join {
                    rooms,
                    history_limit,
                }
            }
            Action::Leave => Request::Leave { rooms },
            Action::Message => Request::Message {
                rooms,
                content: self.content,
            },
        })
    }
}

fn lenient_limit<'de, D>(deserializer: D) -> Result<Option<usize>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// System → peer message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    #[serde(rename = "senderID")]
    pub sender_id: UserId,
    #[serde(rename = "roomIDs")]
    pub room_ids: Vec<RoomId>,
    pub content: String,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(sender_id: UserId, room_ids: Vec<RoomId>, content: String) -> Self {
        Self {
            sender_id,
            room_ids,
            content,
            sent_at: Utc::now(),
        }
    }
}

/// Error codes for rejection frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Action sent without any room
    EmptyRooms,
    /// Membership validation refused the join
    Forbidden,
    /// Repository or hub could not serve the request
    Unavailable,
}

/// Rejection sent back to the originating peer only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub error: ErrorCode,
    pub message: String,
    #[serde(rename = "roomIDs", default)]
    pub room_ids: Vec<RoomId>,
}

/// Everything a connection's mailbox can carry
///
/// Untagged so that broadcasts keep their plain outbound shape on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Message(OutboundMessage),
    Rejected(Rejection),
}

impl ServerMessage {
    pub fn rejected(error: ErrorCode, message: impl Into<String>, room_ids: Vec<RoomId>) -> Self {
        ServerMessage::Rejected(Rejection {
            error,
            message: message.into(),
            room_ids,
        })
    }
}

impl From<OutboundMessage> for ServerMessage {
    fn from(msg: OutboundMessage) -> Self {
        ServerMessage::Message(msg)
    }
}

impl From<ValidationError> for ServerMessage {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::EmptyRooms { .. } => {
                ServerMessage::rejected(ErrorCode::EmptyRooms, err.to_string(), Vec::new())
            }
        }
    }
}

/// Convert a join rejection for `rooms` into a frame for the peer
pub fn join_rejection(err: &JoinError, rooms: Vec<RoomId>) -> ServerMessage {
    let code = match err {
        JoinError::Forbidden { .. } => ErrorCode::Forbidden,
        JoinError::Repository(_) | JoinError::HubClosed => ErrorCode::Unavailable,
    };
    ServerMessage::rejected(code, err.to_string(), rooms)
}
