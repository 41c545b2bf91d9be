//! Connection capability set and the live client handle
//!
//! The hub only ever sees a connection through the `Connection` trait:
//! identity, a non-blocking mailbox write end, and teardown. `Client` is the
//! implementation backed by a real peer connection.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::error::MailboxError;
use crate::message::ServerMessage;
use crate::types::{ConnectionId, UserId};

/// What the room hub may do with a connection
pub trait Connection: Send + Sync + fmt::Debug {
    /// Identity of this connection (membership key)
    fn id(&self) -> ConnectionId;

    /// User this connection was authenticated as
    fn user_id(&self) -> UserId;

    /// Enqueue a message without waiting.
    fn deliver(&self, msg: ServerMessage) -> Result<(), MailboxError>;

    /// Close the connection. Safe to call any number of times from anywhere.
    fn teardown(&self);
}

/// Handle to a live peer connection
///
/// Cheap to clone; all clones share the same mailbox and teardown signal.
#[derive(Debug, Clone)]
pub struct Client {
    id: ConnectionId,
    user_id: UserId,
    /// Write end of the outbound mailbox
    sender: mpsc::Sender<ServerMessage>,
    /// Flips to `true` exactly once, on teardown
    shutdown: Arc<watch::Sender<bool>>,
}

impl Client {
    /// Create a client handle and the read end of its mailbox
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<ServerMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let (shutdown, _) = watch::channel(false);
        let client = Self {
            id: ConnectionId::new(),
            user_id,
            sender,
            shutdown: Arc::new(shutdown),
        };
        (client, receiver)
    }

    /// Enqueue a message, waiting for room in the mailbox
    ///
    /// Used by the connection itself for replies addressed to its own peer.
    pub async fn send(&self, msg: ServerMessage) -> Result<(), MailboxError> {
        if self.is_closed() {
            return Err(MailboxError::Closed);
        }
        self.sender
            .send(msg)
            .await
            .map_err(|_| MailboxError::Closed)
    }

    /// Size of the outbound mailbox
    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Resolve once teardown has been requested
    pub async fn closed(&self) {
        let mut rx = self.shutdown.subscribe();
        // The sender lives in `self`, so this only ends on teardown
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

impl Connection for Client {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn user_id(&self) -> UserId {
        self.user_id
    }

    fn deliver(&self, msg: ServerMessage) -> Result<(), MailboxError> {
        if self.is_closed() {
            return Err(MailboxError::Closed);
        }
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => MailboxError::Full,
            mpsc::error::TrySendError::Closed(_) => MailboxError::Closed,
        })
    }

    fn teardown(&self) {
        if !self.shutdown.send_replace(true) {
            debug!("Connection {} torn down", self.id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::OutboundMessage;
    use crate::types::RoomId;

    fn hello() -> ServerMessage {
        OutboundMessage::new(UserId(1), vec![RoomId(1)], "hello".to_string()).into()
    }

    #[tokio::test]
    async fn test_client_creation() {
        let (client, _rx) = Client::new(UserId(7), 4);

        assert_eq!(client.user_id(), UserId(7));
        assert!(!client.is_closed());
    }

    #[tokio::test]
    async fn test_deliver_reports_full_mailbox() {
        let (client, mut rx) = Client::new(UserId(1), 1);

        assert!(client.deliver(hello()).is_ok());
        assert_eq!(client.deliver(hello()), Err(MailboxError::Full));

        assert!(rx.recv().await.is_some());
        assert!(client.deliver(hello()).is_ok());
    }

    #[tokio::test]
    async fn test_deliver_reports_closed_mailbox() {
        let (client, rx) = Client::new(UserId(1), 4);
        drop(rx);

        assert_eq!(client.deliver(hello()), Err(MailboxError::Closed));
        assert_eq!(client.send(hello()).await, Err(MailboxError::Closed));
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent_and_shared() {
        let (client, _rx) = Client::new(UserId(1), 4);
        let other = client.clone();

        let waiter = tokio::spawn(async move { other.closed().await });

        client.teardown();
        client.teardown();

        waiter.await.unwrap();
        assert!(client.is_closed());
        assert_eq!(client.deliver(hello()), Err(MailboxError::Closed));
    }
}
