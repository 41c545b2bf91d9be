//! WebSocket connection actor
//!
//! Each peer connection runs two tasks: a receive loop that turns inbound
//! frames into hub requests, and a send loop that drains the connection's
//! mailbox into the socket. Whichever loop stops first tears the connection
//! down, the other loop notices, and the hub is told to forget the
//! connection.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

use crate::client::{Client, Connection};
use crate::error::{AppError, JoinError};
use crate::hub::HubHandle;
use crate::message::{join_rejection, InboundMessage, OutboundMessage, Request as ChatRequest, ServerMessage};
use crate::types::UserId;

/// How long the send loop tries to flush a close frame
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// How long the second loop may take after the first one stopped
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Handle a new TCP connection
///
/// Performs the WebSocket handshake, then runs the connection actor until
/// the peer goes away.
pub async fn handle_connection(
    stream: TcpStream,
    hub: HubHandle,
    mailbox_capacity: usize,
) -> Result<(), AppError> {
    let peer_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    debug!("New TCP connection from {}", peer_addr);

    let (ws_stream, user_id) = accept_peer(stream).await?;
    info!("User {} connected from {}", user_id, peer_addr);

    run_connection(ws_stream, user_id, hub, mailbox_capacity).await
}

/// WebSocket handshake that takes the user id from `?userID=<n>`
///
/// The upgrade is refused with 400 when the parameter is missing.
pub async fn accept_peer(stream: TcpStream) -> Result<(WebSocketStream<TcpStream>, UserId), AppError> {
    let mut user_id = None;
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        match user_id_from_query(req.uri().query()) {
            Some(id) => {
                user_id = Some(id);
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some("missing or invalid userID".to_string()));
                *err.status_mut() = StatusCode::BAD_REQUEST;
                Err(err)
            }
        }
    };

    let ws_stream = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
    let user_id = user_id.ok_or(AppError::MissingUserId)?;
    Ok((ws_stream, user_id))
}

fn user_id_from_query(query: Option<&str>) -> Option<UserId> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, _)| *key == "userID")
        .and_then(|(_, value)| value.parse().ok())
        .map(UserId)
}

/// Run the connection actor over an established WebSocket
///
/// Returns once both loops have stopped and the hub has been notified.
/// The first transport or decode error, if any, is returned.
pub async fn run_connection<S>(
    ws_stream: WebSocketStream<S>,
    user_id: UserId,
    hub: HubHandle,
    mailbox_capacity: usize,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client, mailbox) = Client::new(user_id, mailbox_capacity);
    let client_id = client.id();
    let (ws_sender, ws_receiver) = ws_stream.split();

    debug!("Connection {} started for user {}", client_id, user_id);

    let mut read_task = tokio::spawn(receive_loop(ws_receiver, client.clone(), hub.clone()));
    let mut write_task = tokio::spawn(send_loop(ws_sender, mailbox, client.clone()));

    // Wait for either task to complete
    let (first, mut other) = tokio::select! {
        result = &mut read_task => {
            debug!("Read task completed for {}", client_id);
            (result, write_task)
        }
        result = &mut write_task => {
            debug!("Write task completed for {}", client_id);
            (result, read_task)
        }
    };

    // The other loop watches the same signal; abort it if it does not follow
    client.teardown();
    let second = match timeout(SHUTDOWN_GRACE, &mut other).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Connection {} did not stop in time, aborting", client_id);
            other.abort();
            Ok(Ok(()))
        }
    };

    // Implicit leave for every room this connection was in
    if hub.disconnect(client_id).await.is_err() {
        debug!("Hub already closed while disconnecting {}", client_id);
    }

    info!("Connection {} (user {}) closed", client_id, user_id);

    for result in [first, second] {
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) => error!("Connection task for {} failed: {}", client_id, e),
        }
    }
    Ok(())
}

/// Read frames until the peer leaves, a frame fails to decode, or the
/// connection is torn down from elsewhere
async fn receive_loop<S>(
    mut ws_receiver: SplitStream<WebSocketStream<S>>,
    client: Client,
    hub: HubHandle,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = loop {
        let frame = tokio::select! {
            _ = client.closed() => break Ok(()),
            frame = ws_receiver.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                let inbound = match serde_json::from_str::<InboundMessage>(&text) {
                    Ok(inbound) => inbound,
                    Err(e) => {
                        warn!("Invalid JSON from {}: {}", client.id(), e);
                        break Err(e.into());
                    }
                };
                if let Err(e) = dispatch(&client, &hub, inbound).await {
                    break Err(e);
                }
            }
            Some(Ok(Message::Close(_))) => {
                debug!("Connection {} sent close frame", client.id());
                break Ok(());
            }
            Some(Ok(_)) => {
                // Ping/pong is answered by tungstenite; binary is ignored
            }
            Some(Err(e)) => {
                error!("WebSocket error for {}: {}", client.id(), e);
                break Err(e.into());
            }
            None => break Ok(()),
        }
    };

    client.teardown();
    debug!("Read task ended for {}", client.id());
    result
}

/// Turn one inbound message into a hub request
///
/// Only hub loss is fatal; rejections go back to this peer's mailbox.
async fn dispatch(client: &Client, hub: &HubHandle, inbound: InboundMessage) -> Result<(), AppError> {
    if let Some(claimed) = inbound.sender_id {
        if claimed != client.user_id() {
            warn!(
                "Connection {} claimed sender {} but is user {}",
                client.id(),
                claimed,
                client.user_id()
            );
        }
    }

    let request = match inbound.validate() {
        Ok(request) => request,
        Err(e) => {
            debug!("Rejected message from {}: {}", client.id(), e);
            reply(client, e.into()).await;
            return Ok(());
        }
    };

    match request {
        ChatRequest::Join {
            rooms,
            history_limit,
        } => {
            let limit = replay_limit(history_limit, client.capacity());
            if limit < history_limit {
                debug!(
                    "Capping history replay for {} from {} to {}",
                    client.id(),
                    history_limit,
                    limit
                );
            }
            let conn: Arc<dyn Connection> = Arc::new(client.clone());
            match hub.join(conn, rooms.clone(), limit).await {
                Ok(history) => {
                    debug!("Replaying {} message(s) to {}", history.len(), client.id());
                    for msg in history {
                        reply(client, msg.into()).await;
                    }
                }
                Err(JoinError::HubClosed) => return Err(AppError::HubClosed),
                Err(e) => reply(client, join_rejection(&e, rooms)).await,
            }
        }
        ChatRequest::Leave { rooms } => {
            hub.leave(client.id(), rooms).await?;
        }
        ChatRequest::Message { rooms, content } => {
            hub.broadcast(OutboundMessage::new(client.user_id(), rooms, content))
                .await?;
        }
    }
    Ok(())
}

// Replay is queued while broadcasts to the joined rooms keep arriving, so
// half of the mailbox stays free for them
fn replay_limit(requested: usize, mailbox_capacity: usize) -> usize {
    requested.min((mailbox_capacity / 2).max(1))
}

async fn reply(client: &Client, msg: ServerMessage) {
    if client.send(msg).await.is_err() {
        debug!("Mailbox of {} closed, dropping reply", client.id());
    }
}

/// Drain the mailbox into the socket, in order
///
/// Writes race the teardown signal, so a peer that stopped reading cannot
/// hold the task once the hub has evicted it.
async fn send_loop<S>(
    mut ws_sender: SplitSink<WebSocketStream<S>, Message>,
    mut mailbox: mpsc::Receiver<ServerMessage>,
    client: Client,
) -> Result<(), AppError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let result = loop {
        let msg = tokio::select! {
            _ = client.closed() => break Ok(()),
            msg = mailbox.recv() => msg,
        };
        let Some(msg) = msg else {
            break Ok(());
        };

        let json = match serde_json::to_string(&msg) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize message for {}: {}", client.id(), e);
                break Err(e.into());
            }
        };
        let sent = tokio::select! {
            _ = client.closed() => break Ok(()),
            sent = ws_sender.send(Message::Text(json.into())) => sent,
        };
        if let Err(e) = sent {
            debug!("WebSocket send failed for {}, ending write task", client.id());
            break Err(e.into());
        }
    };

    client.teardown();
    // Unblocks a receive loop waiting for mailbox space
    mailbox.close();
    if timeout(CLOSE_TIMEOUT, ws_sender.close()).await.is_err() {
        debug!("Close frame for {} not flushed, dropping socket", client.id());
    }
    debug!("Write task ended for {}", client.id());
    result
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;

    use super::*;
    use crate::hub::RoomHub;
    use crate::message::{ErrorCode, Rejection};
    use crate::repository::InMemoryRepository;
    use crate::types::RoomId;

    const WAIT: Duration = Duration::from_secs(2);
    const QUIET: Duration = Duration::from_millis(200);

    struct Peer {
        ws: WebSocketStream<DuplexStream>,
        task: JoinHandle<Result<(), AppError>>,
    }

    impl Peer {
        async fn connect(hub: &HubHandle, user: i64) -> Self {
            Self::connect_with(hub, user, 64 * 1024, 32).await
        }

        /// `buffer` bounds the bytes in flight towards this peer
        async fn connect_with(hub: &HubHandle, user: i64, buffer: usize, capacity: usize) -> Self {
            let (server_io, client_io) = tokio::io::duplex(buffer);
            let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
            let ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
            let task = tokio::spawn(run_connection(server, UserId(user), hub.clone(), capacity));
            Self { ws, task }
        }

        async fn send(&mut self, value: serde_json::Value) {
            self.send_text(value.to_string()).await;
        }

        async fn send_text(&mut self, text: String) {
            self.ws.send(Message::Text(text.into())).await.unwrap();
        }

        async fn recv(&mut self) -> ServerMessage {
            loop {
                let frame = timeout(WAIT, self.ws.next())
                    .await
                    .expect("timed out waiting for a frame")
                    .expect("connection closed")
                    .unwrap();
                if let Message::Text(text) = frame {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }

        async fn recv_message(&mut self) -> OutboundMessage {
            match self.recv().await {
                ServerMessage::Message(msg) => msg,
                other => panic!("Expected message, got {:?}", other),
            }
        }

        async fn recv_rejection(&mut self) -> Rejection {
            match self.recv().await {
                ServerMessage::Rejected(rejection) => rejection,
                other => panic!("Expected rejection, got {:?}", other),
            }
        }

        async fn expect_silence(&mut self) {
            assert!(
                timeout(QUIET, self.ws.next()).await.is_err(),
                "unexpected frame"
            );
        }

        async fn expect_closed(&mut self) {
            loop {
                match timeout(WAIT, self.ws.next()).await.expect("connection stayed open") {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    fn setup() -> (HubHandle, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::with_members(
            (1..=3).map(UserId),
            [RoomId(1), RoomId(2)],
        ));
        let (hub, _) = RoomHub::start(repo.clone(), 64);
        (hub, repo)
    }

    async fn wait_for_members(hub: &HubHandle, room: RoomId, count: usize) {
        timeout(WAIT, async {
            while hub.members(room).await.unwrap().len() != count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("membership never settled");
    }

    #[tokio::test]
    async fn test_join_history_then_broadcast() {
        let (hub, repo) = setup();
        repo.seed_messages(RoomId(1), UserId(1), 5).await;

        let mut alice = Peer::connect(&hub, 1).await;
        let mut bob = Peer::connect(&hub, 2).await;
        let mut carol = Peer::connect(&hub, 3).await;

        alice
            .send(json!({"senderID": 1, "action": "join", "roomIDs": [1], "content": "", "historyLimit": 2}))
            .await;
        assert_eq!(alice.recv_message().await.content, "Room 1 message 4");
        assert_eq!(alice.recv_message().await.content, "Room 1 message 5");

        bob.send(json!({"senderID": 2, "action": "join", "roomIDs": [1], "historyLimit": 0}))
            .await;
        carol
            .send(json!({"senderID": 3, "action": "join", "roomIDs": [2], "historyLimit": 0}))
            .await;
        wait_for_members(&hub, RoomId(1), 2).await;
        wait_for_members(&hub, RoomId(2), 1).await;

        alice
            .send(json!({"senderID": 1, "action": "message", "roomIDs": [1], "content": "hi"}))
            .await;

        let received = bob.recv_message().await;
        assert_eq!(received.sender_id, UserId(1));
        assert_eq!(received.room_ids, vec![RoomId(1)]);
        assert_eq!(received.content, "hi");
        assert_eq!(alice.recv_message().await.content, "hi");
        carol.expect_silence().await;
        bob.expect_silence().await;
    }

    #[tokio::test]
    async fn test_empty_rooms_rejected_locally() {
        let (hub, _) = setup();
        let mut alice = Peer::connect(&hub, 1).await;

        alice
            .send(json!({"senderID": 1, "action": "join", "roomIDs": []}))
            .await;

        let rejection = alice.recv_rejection().await;
        assert_eq!(rejection.error, ErrorCode::EmptyRooms);
        assert!(hub.members(RoomId(1)).await.unwrap().is_empty());

        // Connection stays usable
        alice
            .send(json!({"senderID": 1, "action": "join", "roomIDs": [1], "historyLimit": 0}))
            .await;
        wait_for_members(&hub, RoomId(1), 1).await;
    }

    #[tokio::test]
    async fn test_forbidden_join_is_reported() {
        let (hub, _) = setup();
        let mut alice = Peer::connect(&hub, 1).await;

        alice
            .send(json!({"senderID": 1, "action": "join", "roomIDs": [1, 9]}))
            .await;

        let rejection = alice.recv_rejection().await;
        assert_eq!(rejection.error, ErrorCode::Forbidden);
        assert_eq!(rejection.room_ids, vec![RoomId(1), RoomId(9)]);
        assert!(hub.members(RoomId(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leave_stops_delivery() {
        let (hub, _) = setup();
        let mut alice = Peer::connect(&hub, 1).await;
        let mut bob = Peer::connect(&hub, 2).await;

        for peer in [&mut alice, &mut bob] {
            peer.send(json!({"action": "join", "roomIDs": [1], "historyLimit": 0}))
                .await;
        }
        wait_for_members(&hub, RoomId(1), 2).await;

        bob.send(json!({"senderID": 2, "action": "leave", "roomIDs": [1]}))
            .await;
        wait_for_members(&hub, RoomId(1), 1).await;

        alice
            .send(json!({"senderID": 1, "action": "message", "roomIDs": [1], "content": "anyone?"}))
            .await;
        assert_eq!(alice.recv_message().await.content, "anyone?");
        bob.expect_silence().await;
    }

    #[tokio::test]
    async fn test_sender_id_comes_from_connection() {
        let (hub, _) = setup();
        let mut alice = Peer::connect(&hub, 1).await;

        alice
            .send(json!({"action": "join", "roomIDs": [1], "historyLimit": 0}))
            .await;
        wait_for_members(&hub, RoomId(1), 1).await;

        alice
            .send(json!({"senderID": 3, "action": "message", "roomIDs": [1], "content": "spoof"}))
            .await;

        assert_eq!(alice.recv_message().await.sender_id, UserId(1));
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (hub, _) = setup();
        let mut alice = Peer::connect(&hub, 1).await;

        alice
            .send(json!({"action": "join", "roomIDs": [1, 2], "historyLimit": 0}))
            .await;
        wait_for_members(&hub, RoomId(2), 1).await;

        alice.send_text("this is not json".to_string()).await;

        alice.expect_closed().await;
        let result = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(matches!(result, Err(AppError::Json(_))));
        assert!(hub.members(RoomId(1)).await.unwrap().is_empty());
        assert!(hub.members(RoomId(2)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_peer_close_removes_membership() {
        let (hub, _) = setup();
        let mut alice = Peer::connect(&hub, 1).await;
        let mut bob = Peer::connect(&hub, 2).await;

        for peer in [&mut alice, &mut bob] {
            peer.send(json!({"action": "join", "roomIDs": [1], "historyLimit": 0}))
                .await;
        }
        wait_for_members(&hub, RoomId(1), 2).await;

        alice.ws.close(None).await.unwrap();
        let result = timeout(WAIT, alice.task).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(hub.members(RoomId(1)).await.unwrap().len(), 1);

        bob.send(json!({"action": "message", "roomIDs": [1], "content": "still here"}))
            .await;
        assert_eq!(bob.recv_message().await.content, "still here");
    }

    #[tokio::test]
    async fn test_stalled_peer_is_evicted_and_closed() {
        let (hub, _) = setup();
        // Small pipe and mailbox; this peer never reads
        let mut slow = Peer::connect_with(&hub, 1, 512, 2).await;

        slow.send(json!({"action": "join", "roomIDs": [1], "historyLimit": 0}))
            .await;
        wait_for_members(&hub, RoomId(1), 1).await;

        let content = "x".repeat(400);
        let mut evicted = 0;
        for _ in 0..50 {
            let report = hub
                .broadcast_and_wait(OutboundMessage::new(UserId(2), vec![RoomId(1)], content.clone()))
                .await
                .unwrap();
            evicted += report.evicted;
        }

        assert_eq!(evicted, 1);
        assert!(hub.members(RoomId(1)).await.unwrap().is_empty());

        // The blocked write must not keep the connection alive
        let result = timeout(Duration::from_secs(3), &mut slow.task)
            .await
            .expect("connection task hung after eviction")
            .unwrap();
        assert!(result.is_ok());
        slow.expect_closed().await;
    }

    #[tokio::test]
    async fn test_history_replay_is_capped_by_mailbox() {
        let (hub, repo) = setup();
        repo.seed_messages(RoomId(1), UserId(1), 10).await;
        let mut alice = Peer::connect_with(&hub, 1, 64 * 1024, 4).await;

        alice
            .send(json!({"action": "join", "roomIDs": [1], "historyLimit": 30}))
            .await;

        assert_eq!(alice.recv_message().await.content, "Room 1 message 9");
        assert_eq!(alice.recv_message().await.content, "Room 1 message 10");
        alice.expect_silence().await;
    }

    #[test]
    fn test_replay_limit() {
        assert_eq!(replay_limit(30, 64), 30);
        assert_eq!(replay_limit(30, 32), 16);
        assert_eq!(replay_limit(0, 32), 0);
        assert_eq!(replay_limit(5, 1), 1);
    }

    #[test]
    fn test_user_id_from_query() {
        assert_eq!(user_id_from_query(Some("userID=5")), Some(UserId(5)));
        assert_eq!(
            user_id_from_query(Some("token=abc&userID=12")),
            Some(UserId(12))
        );
        assert_eq!(user_id_from_query(Some("userID=abc")), None);
        assert_eq!(user_id_from_query(Some("user=5")), None);
        assert_eq!(user_id_from_query(None), None);
    }
}
