//! Repository seam consumed by the room hub
//!
//! The hub needs three things from storage: a membership check before a
//! join, a bounded history per room, and atomic creation of a message that
//! belongs to several rooms. `InMemoryRepository` is the implementation used
//! by the binary and the tests.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::RepositoryError;
use crate::message::OutboundMessage;
use crate::types::{MessageId, RoomId, UserId};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub sender_id: UserId,
    pub content: String,
    pub room_ids: Vec<RoomId>,
    pub sent_at: DateTime<Utc>,
}

impl From<MessageRecord> for OutboundMessage {
    fn from(record: MessageRecord) -> Self {
        OutboundMessage {
            sender_id: record.sender_id,
            room_ids: record.room_ids,
            content: record.content,
            sent_at: record.sent_at,
        }
    }
}

/// Storage used by the room hub.
///
/// Implementations must allow concurrent reads. `create_message` must make
/// the message and all of its room associations visible together.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Whether `user` may be a member of `room`.
    async fn validate_membership(&self, user: UserId, room: RoomId) -> RepositoryResult<bool>;

    /// The most recent `limit` messages of `room`, oldest first.
    async fn fetch_history(&self, room: RoomId, limit: usize) -> RepositoryResult<Vec<MessageRecord>>;

    /// Persist a message sent to `rooms`.
    async fn create_message(
        &self,
        sender: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
        rooms: &[RoomId],
    ) -> RepositoryResult<MessageId>;
}

#[derive(Debug, Default)]
struct Store {
    /// Accept any user and room
    open: bool,
    users: HashSet<UserId>,
    rooms: HashSet<RoomId>,
    /// All messages in creation order
    messages: Vec<MessageRecord>,
    /// Room -> indexes into `messages`, in creation order
    room_index: HashMap<RoomId, Vec<usize>>,
}

impl Store {
    fn insert(&mut self, sender: UserId, content: &str, sent_at: DateTime<Utc>, rooms: &[RoomId]) -> MessageId {
        let id = MessageId(self.messages.len() as i64 + 1);
        let slot = self.messages.len();
        self.messages.push(MessageRecord {
            id,
            sender_id: sender,
            content: content.to_string(),
            room_ids: rooms.to_vec(),
            sent_at,
        });
        for room in rooms {
            self.room_index.entry(*room).or_default().push(slot);
        }
        id
    }
}

/// In-process repository backed by a single `RwLock`.
///
/// Users and rooms must be registered before a join validates. Every write
/// happens under one lock acquisition, so a message and its room rows appear
/// together.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    store: RwLock<Store>,
}

impl InMemoryRepository {
    /// A repository that accepts every user and room
    ///
    /// Used when no account store is wired in.
    pub fn open() -> Self {
        let store = Store {
            open: true,
            ..Store::default()
        };
        Self {
            store: RwLock::new(store),
        }
    }

    /// Create a repository that knows the given users and rooms
    pub fn with_members(
        users: impl IntoIterator<Item = UserId>,
        rooms: impl IntoIterator<Item = RoomId>,
    ) -> Self {
        let store = Store {
            users: users.into_iter().collect(),
            rooms: rooms.into_iter().collect(),
            ..Store::default()
        };
        Self {
            store: RwLock::new(store),
        }
    }

    pub async fn add_user(&self, user: UserId) {
        self.store.write().await.users.insert(user);
    }

    /// Append `count` messages from `sender` to `room`, numbered from 1
    pub async fn seed_messages(&self, room: RoomId, sender: UserId, count: usize) {
        let mut store = self.store.write().await;
        for i in 1..=count {
            let content = format!("Room {} message {}", room, i);
            store.insert(sender, &content, Utc::now(), &[room]);
        }
    }

    pub async fn message_count(&self) -> usize {
        self.store.read().await.messages.len()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn validate_membership(&self, user: UserId, room: RoomId) -> RepositoryResult<bool> {
        let store = self.store.read().await;
        Ok(store.open || (store.users.contains(&user) && store.rooms.contains(&room)))
    }

    async fn fetch_history(&self, room: RoomId, limit: usize) -> RepositoryResult<Vec<MessageRecord>> {
        let store = self.store.read().await;
        let Some(slots) = store.room_index.get(&room) else {
            return Ok(Vec::new());
        };
        let start = slots.len().saturating_sub(limit);
        Ok(slots[start..]
            .iter()
            .map(|&slot| store.messages[slot].clone())
            .collect())
    }

    async fn create_message(
        &self,
        sender: UserId,
        content: &str,
        sent_at: DateTime<Utc>,
        rooms: &[RoomId],
    ) -> RepositoryResult<MessageId> {
        if rooms.is_empty() {
            return Err(RepositoryError::Storage(
                "message must belong to at least one room".to_string(),
            ));
        }

        let mut store = self.store.write().await;
        let unknown = rooms
            .iter()
            .find(|room| !store.open && !store.rooms.contains(*room));
        if let Some(missing) = unknown {
            // Nothing is written when any association would fail
            return Err(RepositoryError::NotFound(format!("room {}", missing)));
        }
        Ok(store.insert(sender, content, sent_at, rooms))
    }
}
