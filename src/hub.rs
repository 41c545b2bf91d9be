//! RoomHub actor implementation
//!
//! The single owner of room membership. Connections talk to it through a
//! `HubHandle`; every join, leave, broadcast and disconnect is processed in
//! order by one event loop, so membership is never mutated concurrently and
//! each room sees broadcasts in the order the hub handled them.
//!
//! Full-mailbox policy: the hub never waits on a member. A member whose
//! mailbox is full (or already closed) misses that message, is removed from
//! every room and is torn down. Other members are unaffected. A join's
//! history replay shares that mailbox, so connections cap the requested
//! `historyLimit` below the mailbox size before asking the hub.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::client::Connection;
use crate::error::{AppError, JoinError, MailboxError, RepositoryError};
use crate::message::{OutboundMessage, ServerMessage};
use crate::repository::{MessageRecord, Repository};
use crate::room::Room;
use crate::types::{ConnectionId, MessageId, RoomId};

/// Outcome of one broadcast, for callers that want to know
#[derive(Debug)]
pub struct BroadcastReport {
    /// Members that received the message
    pub delivered: usize,
    /// Members evicted because their mailbox was full or closed
    pub evicted: usize,
    /// Persistence result; delivery does not depend on it
    pub persisted: Result<MessageId, RepositoryError>,
}

/// Commands sent from connections to the RoomHub actor
#[derive(Debug)]
pub enum HubCommand {
    /// Join rooms and get the history replay back
    Join {
        conn: Arc<dyn Connection>,
        rooms: Vec<RoomId>,
        history_limit: usize,
        reply: oneshot::Sender<Result<Vec<OutboundMessage>, JoinError>>,
    },
    /// Leave rooms
    Leave {
        conn_id: ConnectionId,
        rooms: Vec<RoomId>,
    },
    /// Fan a message out to the members of its rooms
    Broadcast {
        message: OutboundMessage,
        reply: Option<oneshot::Sender<BroadcastReport>>,
    },
    /// Connection went away; drop it from every room
    Disconnect {
        conn_id: ConnectionId,
    },
    /// Current members of a room
    Members {
        room: RoomId,
        reply: oneshot::Sender<Vec<ConnectionId>>,
    },
    /// Rooms a connection is currently in, sorted
    RoomsOf {
        conn_id: ConnectionId,
        reply: oneshot::Sender<Vec<RoomId>>,
    },
}

/// Cloneable request surface of the hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    sender: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    pub fn new(sender: mpsc::Sender<HubCommand>) -> Self {
        Self { sender }
    }

    async fn send(&self, cmd: HubCommand) -> Result<(), AppError> {
        self.sender.send(cmd).await.map_err(|_| AppError::HubClosed)
    }

    /// Join `rooms`; returns the history replay, oldest first
    pub async fn join(
        &self,
        conn: Arc<dyn Connection>,
        rooms: Vec<RoomId>,
        history_limit: usize,
    ) -> Result<Vec<OutboundMessage>, JoinError> {
        let (reply, rx) = oneshot::channel();
        self.sender
            .send(HubCommand::Join {
                conn,
                rooms,
                history_limit,
                reply,
            })
            .await
            .map_err(|_| JoinError::HubClosed)?;
        rx.await.map_err(|_| JoinError::HubClosed)?
    }

    pub async fn leave(&self, conn_id: ConnectionId, rooms: Vec<RoomId>) -> Result<(), AppError> {
        self.send(HubCommand::Leave { conn_id, rooms }).await
    }

    /// Queue a broadcast without waiting for it to be processed
    pub async fn broadcast(&self, message: OutboundMessage) -> Result<(), AppError> {
        self.send(HubCommand::Broadcast {
            message,
            reply: None,
        })
        .await
    }

    /// Broadcast and wait for the delivery and persistence outcome
    pub async fn broadcast_and_wait(
        &self,
        message: OutboundMessage,
    ) -> Result<BroadcastReport, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Broadcast {
            message,
            reply: Some(reply),
        })
        .await?;
        rx.await.map_err(|_| AppError::HubClosed)
    }

    pub async fn disconnect(&self, conn_id: ConnectionId) -> Result<(), AppError> {
        self.send(HubCommand::Disconnect { conn_id }).await
    }

    pub async fn members(&self, room: RoomId) -> Result<Vec<ConnectionId>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Members { room, reply }).await?;
        rx.await.map_err(|_| AppError::HubClosed)
    }

    pub async fn rooms_of(&self, conn_id: ConnectionId) -> Result<Vec<RoomId>, AppError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::RoomsOf { conn_id, reply }).await?;
        rx.await.map_err(|_| AppError::HubClosed)
    }
}

/// The room hub actor
///
/// Holds membership in two maps kept in sync: room -> members, and
/// connection -> rooms for cheap teardown.
pub struct RoomHub {
    /// Active rooms. Empty rooms are removed.
    rooms: HashMap<RoomId, Room>,
    /// Connection -> rooms it has joined
    memberships: HashMap<ConnectionId, HashSet<RoomId>>,
    repository: Arc<dyn Repository>,
    /// Command receiver channel
    receiver: mpsc::Receiver<HubCommand>,
}

impl RoomHub {
    /// Create a new RoomHub with the given command receiver and repository
    pub fn new(receiver: mpsc::Receiver<HubCommand>, repository: Arc<dyn Repository>) -> Self {
        Self {
            rooms: HashMap::new(),
            memberships: HashMap::new(),
            repository,
            receiver,
        }
    }

    /// Spawn a hub on the current runtime and return its handle
    pub fn start(repository: Arc<dyn Repository>, capacity: usize) -> (HubHandle, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(capacity);
        let task = tokio::spawn(RoomHub::new(cmd_rx, repository).run());
        (HubHandle::new(cmd_tx), task)
    }

    /// Run the RoomHub event loop
    ///
    /// Continuously receives and processes commands until all handles are dropped.
    pub async fn run(mut self) {
        info!("RoomHub started");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd).await;
            #[cfg(debug_assertions)]
            self.check_invariants();
        }

        info!("RoomHub shutting down");
    }

    /// Process a single command
    async fn handle_command(&mut self, cmd: HubCommand) {
        match cmd {
            HubCommand::Join {
                conn,
                rooms,
                history_limit,
                reply,
            } => {
                let result = self.handle_join(conn, &rooms, history_limit).await;
                // Requester may have gone away meanwhile
                let _ = reply.send(result);
            }
            HubCommand::Leave { conn_id, rooms } => {
                self.handle_leave(conn_id, &rooms);
            }
            HubCommand::Broadcast { message, reply } => {
                let report = self.handle_broadcast(message).await;
                if let Some(reply) = reply {
                    let _ = reply.send(report);
                }
            }
            HubCommand::Disconnect { conn_id } => {
                self.handle_disconnect(conn_id);
            }
            HubCommand::Members { room, reply } => {
                let members = self
                    .rooms
                    .get(&room)
                    .map(|r| r.member_ids().collect())
                    .unwrap_or_default();
                let _ = reply.send(members);
            }
            HubCommand::RoomsOf { conn_id, reply } => {
                let mut rooms: Vec<RoomId> = self
                    .memberships
                    .get(&conn_id)
                    .map(|r| r.iter().copied().collect())
                    .unwrap_or_default();
                rooms.sort_unstable();
                let _ = reply.send(rooms);
            }
        }
    }

    /// Handle a join: validate every room, then add, then load history
    async fn handle_join(
        &mut self,
        conn: Arc<dyn Connection>,
        rooms: &[RoomId],
        history_limit: usize,
    ) -> Result<Vec<OutboundMessage>, JoinError> {
        let user = conn.user_id();

        for &room in rooms {
            match self.repository.validate_membership(user, room).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!("User {} may not join room {}", user, room);
                    return Err(JoinError::Forbidden { room });
                }
                Err(e) => {
                    error!("Membership check for user {} in room {} failed: {}", user, room, e);
                    return Err(e.into());
                }
            }
        }

        for &room in rooms {
            self.add_member(conn.clone(), room);
        }

        info!("Connection {} (user {}) joined rooms {:?}", conn.id(), user, rooms);

        Ok(self.load_history(rooms, history_limit).await)
    }

    /// Merge the history of `rooms`, keeping the latest `limit` messages
    ///
    /// A room whose history cannot be read contributes nothing.
    async fn load_history(&self, rooms: &[RoomId], limit: usize) -> Vec<OutboundMessage> {
        if limit == 0 {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut records: Vec<MessageRecord> = Vec::new();
        for &room in rooms {
            match self.repository.fetch_history(room, limit).await {
                Ok(history) => {
                    // A message sent to several joined rooms is replayed once
                    records.extend(history.into_iter().filter(|r| seen.insert(r.id)));
                }
                Err(e) => {
                    error!("Failed to fetch history for room {}: {}", room, e);
                }
            }
        }

        records.sort_by(|a, b| a.sent_at.cmp(&b.sent_at).then(a.id.cmp(&b.id)));
        let start = records.len().saturating_sub(limit);
        records
            .split_off(start)
            .into_iter()
            .map(OutboundMessage::from)
            .collect()
    }

    /// Handle voluntary room leaving; unknown rooms are ignored
    fn handle_leave(&mut self, conn_id: ConnectionId, rooms: &[RoomId]) {
        for &room in rooms {
            if self.remove_member(conn_id, room) {
                info!("Connection {} left room {}", conn_id, room);
            }
        }
    }

    /// Handle connection teardown
    fn handle_disconnect(&mut self, conn_id: ConnectionId) {
        let rooms = self.remove_everywhere(conn_id);
        info!("Connection {} disconnected, removed from {} room(s)", conn_id, rooms);
        debug!(
            "Total connections: {}, Total rooms: {}",
            self.memberships.len(),
            self.rooms.len()
        );
    }

    /// Handle a broadcast: fan out first, then persist
    async fn handle_broadcast(&mut self, message: OutboundMessage) -> BroadcastReport {
        // One copy per connection, even if it sits in several target rooms
        let mut targets: HashMap<ConnectionId, Arc<dyn Connection>> = HashMap::new();
        for room in &message.room_ids {
            if let Some(room) = self.rooms.get(room) {
                for member in room.members() {
                    targets.entry(member.id()).or_insert_with(|| member.clone());
                }
            }
        }

        let payload = ServerMessage::from(message.clone());
        let mut delivered = 0;
        let mut unhealthy = Vec::new();
        for conn in targets.values() {
            match conn.deliver(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(MailboxError::Full) => {
                    warn!("Mailbox of connection {} is full, evicting", conn.id());
                    unhealthy.push(conn.clone());
                }
                Err(MailboxError::Closed) => {
                    debug!("Mailbox of connection {} is closed, evicting", conn.id());
                    unhealthy.push(conn.clone());
                }
            }
        }

        let evicted = unhealthy.len();
        for conn in unhealthy {
            self.remove_everywhere(conn.id());
            conn.teardown();
        }

        debug!(
            "Broadcast from user {} to rooms {:?}: {} delivered, {} evicted",
            message.sender_id, message.room_ids, delivered, evicted
        );

        let persisted = self
            .repository
            .create_message(
                message.sender_id,
                &message.content,
                message.sent_at,
                &message.room_ids,
            )
            .await;
        if let Err(e) = &persisted {
            error!(
                "Failed to persist message from user {} to rooms {:?}: {}",
                message.sender_id, message.room_ids, e
            );
        }

        BroadcastReport {
            delivered,
            evicted,
            persisted,
        }
    }

    /// Helper: add a connection to a room, creating the room on first join
    fn add_member(&mut self, conn: Arc<dyn Connection>, room: RoomId) {
        let conn_id = conn.id();
        let entry = self
            .rooms
            .entry(room)
            .or_insert_with(|| Room::new(room));
        if entry.add_member(conn) {
            debug!("Room {} now has {} member(s)", room, entry.len());
            self.memberships.entry(conn_id).or_default().insert(room);
        }
    }

    /// Helper: remove a connection from one room, dropping the room if empty
    ///
    /// Returns true if the connection was a member.
    fn remove_member(&mut self, conn_id: ConnectionId, room_id: RoomId) -> bool {
        let Some(room) = self.rooms.get_mut(&room_id) else {
            return false;
        };
        if !room.remove_member(conn_id) {
            return false;
        }
        if room.is_empty() {
            self.rooms.remove(&room_id);
            debug!("Room {} deleted (empty)", room_id);
        }

        if let Some(joined) = self.memberships.get_mut(&conn_id) {
            joined.remove(&room_id);
            if joined.is_empty() {
                self.memberships.remove(&conn_id);
            }
        }
        true
    }

    /// Helper: remove a connection from every room; returns how many
    fn remove_everywhere(&mut self, conn_id: ConnectionId) -> usize {
        let rooms: Vec<RoomId> = self
            .memberships
            .get(&conn_id)
            .map(|r| r.iter().copied().collect())
            .unwrap_or_default();
        for &room in &rooms {
            self.remove_member(conn_id, room);
        }
        rooms.len()
    }

    /// Both membership maps must describe the same relation
    #[cfg(debug_assertions)]
    fn check_invariants(&self) {
        for (conn_id, joined) in &self.memberships {
            debug_assert!(!joined.is_empty(), "empty membership entry for {}", conn_id);
            for room in joined {
                debug_assert!(
                    self.rooms.get(room).is_some_and(|r| r.contains(*conn_id)),
                    "connection {} indexed in room {} but not a member",
                    conn_id,
                    room
                );
            }
        }
        for (room_id, room) in &self.rooms {
            debug_assert!(!room.is_empty(), "empty room {} kept", room_id);
            for conn_id in room.member_ids() {
                debug_assert!(
                    self.memberships
                        .get(&conn_id)
                        .is_some_and(|r| r.contains(room_id)),
                    "member {} of room {} missing from index",
                    conn_id,
                    room_id
                );
            }
        }
    }
}
