//! Room struct definition
//!
//! A room is a set of connections sharing broadcast delivery. Rooms are only
//! ever touched from inside the hub's event loop.

use std::collections::HashMap;
use std::sync::Arc;

use crate::client::Connection;
use crate::types::{ConnectionId, RoomId};

/// Chat room membership
///
/// Each connection appears at most once; insertion order is irrelevant.
#[derive(Debug)]
pub struct Room {
    /// Room identifier
    pub id: RoomId,
    members: HashMap<ConnectionId, Arc<dyn Connection>>,
}

impl Room {
    /// Create an empty room
    pub fn new(id: RoomId) -> Self {
        Self {
            id,
            members: HashMap::new(),
        }
    }

    /// Add a member to the room
    ///
    /// Returns false if the connection was already a member.
    pub fn add_member(&mut self, conn: Arc<dyn Connection>) -> bool {
        self.members.insert(conn.id(), conn).is_none()
    }

    /// Remove a member from the room
    ///
    /// Returns false if the connection was not a member.
    pub fn remove_member(&mut self, id: ConnectionId) -> bool {
        self.members.remove(&id).is_some()
    }

    /// Check if a connection is in this room
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members.contains_key(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = &Arc<dyn Connection>> {
        self.members.values()
    }

    pub fn member_ids(&self) -> impl Iterator<Item = ConnectionId> + '_ {
        self.members.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }
}
