//! Room-based WebSocket Chat Core
//!
//! The real-time part of a room chat service, built with tokio-tungstenite
//! using the Actor pattern for state management.
//!
//! # Features
//! - Per-connection duplex actor (receive loop + send loop)
//! - Joining and leaving any number of integer-identified rooms
//! - History replay on join, bounded by `historyLimit`
//! - Broadcast to every member of the target rooms
//! - Drop-and-evict handling of peers that cannot keep up
//! - Disconnection handling
//!
//! # Architecture
//! Uses the Actor pattern with `mpsc` channels:
//! - `RoomHub` is the central actor owning all room membership
//! - Each connection runs two tasks talking to the hub through a `HubHandle`
//! - Storage sits behind the `Repository` trait, injected into the hub
//! - No locks needed - all membership access goes through message passing
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use tokio::net::TcpListener;
//! use room_chat::{handle_connection, InMemoryRepository, RoomHub};
//!
//! #[tokio::main]
//! async fn main() {
//!     let listener = TcpListener::bind("127.0.0.1:8080").await.unwrap();
//!     let (hub, _) = RoomHub::start(Arc::new(InMemoryRepository::open()), 256);
//!
//!     while let Ok((stream, _)) = listener.accept().await {
//!         tokio::spawn(handle_connection(stream, hub.clone(), 64));
//!     }
//! }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;
pub mod repository;
pub mod room;
pub mod types;

// Re-export main types for convenience
pub use client::{Client, Connection};
pub use config::Config;
pub use error::{AppError, JoinError, MailboxError, RepositoryError, ValidationError};
pub use handler::{handle_connection, run_connection};
pub use hub::{BroadcastReport, HubCommand, HubHandle, RoomHub};
pub use message::{Action, ErrorCode, InboundMessage, OutboundMessage, ServerMessage};
pub use repository::{InMemoryRepository, MessageRecord, Repository};
pub use room::Room;
pub use types::{ConnectionId, MessageId, RoomId, UserId};
