//! Error types for the chat core
//!
//! Defines connection-fatal errors, mailbox delivery errors, join rejections
//! and repository failures. Uses thiserror for ergonomic error definitions.

use thiserror::Error;

use crate::message::Action;
use crate::types::RoomId;

/// Application-level errors
///
/// All of these are fatal for a single connection and never for the hub.
#[derive(Debug, Error)]
pub enum AppError {
    /// WebSocket protocol error (fatal)
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// JSON serialization/deserialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error (fatal)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Upgrade request did not identify the user
    #[error("Missing or invalid userID")]
    MissingUserId,

    /// The hub request queue is gone (fatal - hub stopped)
    #[error("Room hub closed")]
    HubClosed,
}

/// Mailbox delivery errors
///
/// Returned by a non-blocking delivery into a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MailboxError {
    /// The mailbox is at capacity; the peer is consuming too slowly
    #[error("Mailbox full")]
    Full,
    /// The receiving end of the mailbox has been closed
    #[error("Mailbox closed")]
    Closed,
}

/// Inbound message failed local validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// `roomIDs` was empty for an action that needs at least one room
    #[error("{action} requires at least one room")]
    EmptyRooms { action: Action },
}

/// Errors reported by a repository implementation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepositoryError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend failure (connection lost, constraint violated, ...)
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Join rejection returned by the hub to the requesting connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JoinError {
    /// The user may not join this room (unknown user or room)
    #[error("Not allowed to join room {room}")]
    Forbidden { room: RoomId },

    /// Membership could not be validated
    #[error("Membership check failed: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Room hub closed")]
    HubClosed,
}

