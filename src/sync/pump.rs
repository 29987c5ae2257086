//! Connection pump pair: the read and write loops of one WebSocket client.
//!
//! The two pumps share nothing but queues. The write pump owns the transport
//! sink and drains the connection's outbound queue; the read pump owns the
//! transport stream and turns inbound frames into room requests. Each pump
//! holds an [`UnregisterGuard`], so whichever ends first signals the room.
//!
//! The read pump only keeps a weak sender to the outbound queue. The room
//! actor holds the one strong sender, and removing the member from the room is
//! what closes the queue and lets the write pump send its close frame.

use std::fmt::Display;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::protocol::{now_nanos, pong_frame, ClientFrame};
use super::{ConnectionId, SyncResult};
use crate::config::PumpConfig;
use crate::room::{Connection, RoomHandle, RoomRequest};

/// Serve an upgraded WebSocket until either pump ends
pub async fn serve_connection(
    socket: WebSocket,
    room: RoomHandle,
    username: String,
    config: PumpConfig,
) {
    let (sink, stream) = socket.split();
    let key = room.key().to_string();

    if let Err(e) = run_pumps(sink, stream, room, username, config).await {
        warn!(room = %key, "Connection ended before joining: {}", e);
    }
}

/// Register a connection with `room` and run its pumps to completion.
///
/// Generic over the transport halves so the pumps can run on any
/// sink/stream of WebSocket messages.
pub async fn run_pumps<S, R, E>(
    sink: S,
    stream: R,
    room: RoomHandle,
    username: String,
    config: PumpConfig,
) -> SyncResult<()>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: Display + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.outbound_capacity);
    let replies = tx.downgrade();
    let connection = Connection::new(username, tx);
    let conn_id = connection.id().to_string();

    // Pumps start only once the actor knows the connection
    room.register(connection).await?;
    info!(room = %room.key(), conn = %conn_id, "Connection registered");

    let mut writer = tokio::spawn(write_pump(
        sink,
        rx,
        config.clone(),
        UnregisterGuard::new(room.clone(), conn_id.clone()),
    ));
    let mut reader = tokio::spawn(read_pump(
        stream,
        room.clone(),
        conn_id.clone(),
        replies,
        config.clone(),
        UnregisterGuard::new(room.clone(), conn_id.clone()),
    ));

    tokio::select! {
        _ = &mut writer => {
            reader.abort();
        }
        _ = &mut reader => {
            // The writer sees its queue close once the room drops the member
            if timeout(config.write_deadline, &mut writer).await.is_err() {
                debug!(conn = %conn_id, "Write pump did not finish in time");
                writer.abort();
            }
        }
    }

    info!(room = %room.key(), conn = %conn_id, "Connection closed");
    Ok(())
}

/// Signals a non-blocking unregister when dropped
struct UnregisterGuard {
    room: RoomHandle,
    conn_id: ConnectionId,
}

impl UnregisterGuard {
    fn new(room: RoomHandle, conn_id: ConnectionId) -> Self {
        Self { room, conn_id }
    }
}

impl Drop for UnregisterGuard {
    fn drop(&mut self) {
        self.room.unregister(&self.conn_id);
    }
}

// ============================================================================
// WRITE PUMP
// ============================================================================

async fn write_pump<S>(
    mut sink: S,
    mut outbound: mpsc::Receiver<Bytes>,
    config: PumpConfig,
    guard: UnregisterGuard,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let mut ping = interval_at(Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // Removed from the room
                    let _ = timeout(config.write_deadline, sink.send(Message::Close(None))).await;
                    break;
                };
                let text = match String::from_utf8(frame.to_vec()) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(conn = %guard.conn_id, "Dropping non UTF-8 outbound frame: {}", e);
                        continue;
                    }
                };
                if !write_with_deadline(&mut sink, Message::Text(text), &config, &guard).await {
                    break;
                }
            }
            _ = ping.tick() => {
                if !write_with_deadline(&mut sink, Message::Ping(Vec::new()), &config, &guard).await {
                    break;
                }
            }
        }
    }

    let _ = timeout(config.write_deadline, sink.close()).await;
    debug!(conn = %guard.conn_id, "Write pump ended");
}

async fn write_with_deadline<S>(
    sink: &mut S,
    msg: Message,
    config: &PumpConfig,
    guard: &UnregisterGuard,
) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    match timeout(config.write_deadline, sink.send(msg)).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(conn = %guard.conn_id, "Write failed: {}", e);
            false
        }
        Err(_) => {
            warn!(conn = %guard.conn_id, "Write deadline exceeded");
            false
        }
    }
}

// ============================================================================
// READ PUMP
// ============================================================================

async fn read_pump<R, E>(
    mut stream: R,
    room: RoomHandle,
    conn_id: ConnectionId,
    replies: mpsc::WeakSender<Bytes>,
    config: PumpConfig,
    _guard: UnregisterGuard,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    loop {
        // Every frame, control frames included, restarts the deadline
        let msg = match timeout(config.read_deadline, stream.next()).await {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(conn = %conn_id, "Transport error: {}", e);
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(conn = %conn_id, "Read deadline expired, dropping peer");
                break;
            }
        };

        let frame = match msg {
            Message::Text(text) => ClientFrame::decode(&text),
            Message::Binary(data) => ClientFrame::decode_bytes(&data),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                debug!(conn = %conn_id, "Close frame received");
                break;
            }
        };

        match frame {
            Ok(frame) => {
                if !dispatch(frame, &room, &conn_id, &replies).await {
                    break;
                }
            }
            Err(e) => {
                warn!(conn = %conn_id, "Dropping frame: {}", e);
            }
        }
    }

    debug!(conn = %conn_id, "Read pump ended");
}

/// Route one decoded frame. Returns false when the connection should end.
async fn dispatch(
    frame: ClientFrame,
    room: &RoomHandle,
    conn_id: &str,
    replies: &mpsc::WeakSender<Bytes>,
) -> bool {
    debug!(conn = %conn_id, kind = frame.kind(), "Frame received");

    let request = match frame {
        ClientFrame::Ping => return reply(replies, pong_frame(), conn_id),
        ClientFrame::Init(init) => RoomRequest::Identify {
            origin: conn_id.to_string(),
            init,
        },
        ClientFrame::Operation(edit) => RoomRequest::Edit(edit.stamp(conn_id, now_nanos())),
        ClientFrame::DocumentUpdate(meta) => RoomRequest::UpdateMetadata {
            origin: conn_id.to_string(),
            title: meta.title,
            language: meta.language,
        },
        ClientFrame::Snapshot(snapshot) => RoomRequest::SubmitSnapshot {
            origin: conn_id.to_string(),
            content: snapshot.content,
            seq: snapshot.seq,
        },
        ClientFrame::PresenceUser(presence) => RoomRequest::Presence {
            origin: conn_id.to_string(),
            presence,
        },
    };

    match room.request(request).await {
        Ok(()) => true,
        Err(e) => {
            warn!(conn = %conn_id, "{}", e);
            false
        }
    }
}

/// Direct reply on the connection's own queue, never blocking
fn reply(replies: &mpsc::WeakSender<Bytes>, frame: Bytes, conn_id: &str) -> bool {
    let Some(tx) = replies.upgrade() else {
        // Already removed from the room
        return false;
    };
    match tx.try_send(frame) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!(conn = %conn_id, "Outbound queue full, dropping connection");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RoomConfig;
    use crate::room::RoomRegistry;
    use crate::storage::MemoryDocumentStore;
    use serde_json::Value;
    use std::convert::Infallible;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    struct TestPeer {
        inbound: mpsc::UnboundedSender<Message>,
        outbound: mpsc::UnboundedReceiver<Message>,
        task: JoinHandle<SyncResult<()>>,
    }

    impl TestPeer {
        fn send_text(&self, text: &str) {
            self.inbound.send(Message::Text(text.to_string())).unwrap();
        }

        async fn next_message(&mut self) -> Message {
            timeout(Duration::from_secs(2), self.outbound.recv())
                .await
                .expect("timed out waiting for message")
                .expect("transport closed")
        }

        /// Next JSON frame, skipping transport pings
        async fn next_json(&mut self) -> Value {
            loop {
                match self.next_message().await {
                    Message::Text(text) => return serde_json::from_str(&text).unwrap(),
                    Message::Ping(_) => continue,
                    other => panic!("Unexpected message: {:?}", other),
                }
            }
        }

        async fn next_of_type(&mut self, kind: &str) -> Value {
            loop {
                let frame = self.next_json().await;
                if frame["type"] == kind {
                    return frame;
                }
            }
        }
    }

    fn quiet_config() -> PumpConfig {
        PumpConfig {
            read_deadline: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
            write_deadline: Duration::from_secs(1),
            ..Default::default()
        }
    }

    async fn test_room() -> RoomHandle {
        let registry = RoomRegistry::new(
            Arc::new(MemoryDocumentStore::new()),
            RoomConfig::default(),
        );
        registry.get_or_create("room").await.unwrap()
    }

    fn connect(room: &RoomHandle, name: &str, config: PumpConfig) -> TestPeer {
        let (inbound, inbound_rx) = mpsc::unbounded_channel::<Message>();
        let (outbound_tx, outbound) = mpsc::unbounded_channel::<Message>();

        let stream = futures_util::stream::unfold(inbound_rx, |mut rx| async move {
            rx.recv().await.map(|msg| (Ok::<_, Infallible>(msg), rx))
        });
        let sink = futures_util::sink::unfold(outbound_tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| "peer gone".to_string())?;
            Ok::<_, String>(tx)
        });

        let task = tokio::spawn(run_pumps(
            Box::pin(sink),
            Box::pin(stream),
            room.clone(),
            name.to_string(),
            config,
        ));
        TestPeer {
            inbound,
            outbound,
            task,
        }
    }

    #[tokio::test]
    async fn test_join_snapshot_and_ping_pong() {
        let room = test_room().await;
        let mut peer = connect(&room, "ann", quiet_config());

        let snapshot = peer.next_json().await;
        assert_eq!(snapshot["type"], "snapshot");
        assert_eq!(snapshot["users"][0]["username"], "ann");

        peer.send_text(r#"{"type":"ping"}"#);
        assert_eq!(peer.next_json().await, serde_json::json!({"type":"pong"}));
    }

    #[tokio::test]
    async fn test_malformed_frames_do_not_close_connection() {
        let room = test_room().await;
        let mut peer = connect(&room, "ann", quiet_config());
        peer.next_of_type("snapshot").await;

        peer.send_text("definitely not json");
        peer.send_text(r#"{"type":"teleport"}"#);
        peer.send_text(r#"{"type":"operation","operation":{"type":"insert"}}"#);
        peer.inbound
            .send(Message::Binary(vec![0xff, 0x00]))
            .unwrap();
        peer.send_text(r#"{"type":"ping"}"#);

        assert_eq!(peer.next_json().await["type"], "pong");
        assert!(!peer.task.is_finished());
    }

    #[tokio::test]
    async fn test_edit_is_stamped_and_relayed() {
        let room = test_room().await;
        let mut ann = connect(&room, "ann", quiet_config());
        ann.next_of_type("snapshot").await;
        let mut bob = connect(&room, "bob", quiet_config());
        bob.next_of_type("snapshot").await;
        let joined = ann.next_of_type("user_joined").await;

        ann.send_text(
            r#"{"type":"operation","operation":{"type":"insert","position":0,"content":"hi","length":0}}"#,
        );
        let op = bob.next_of_type("operation").await;
        assert_eq!(op["operation"]["content"], "hi");
        assert_ne!(op["operation"]["client_id"], joined["id"]);
        assert!(op["operation"]["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_stream_end_unregisters_and_closes() {
        let room = test_room().await;
        let mut ann = connect(&room, "ann", quiet_config());
        ann.next_of_type("snapshot").await;
        let mut bob = connect(&room, "bob", quiet_config());
        bob.next_of_type("snapshot").await;

        // Bob's transport goes away
        let TestPeer {
            inbound,
            outbound: mut bob_out,
            task,
        } = bob;
        drop(inbound);

        let left = ann.next_of_type("user_left").await;
        assert_eq!(left["username"], "bob");

        let mut saw_close = false;
        while let Ok(Some(msg)) = timeout(Duration::from_secs(2), bob_out.recv()).await {
            if matches!(msg, Message::Close(_)) {
                saw_close = true;
                break;
            }
        }
        assert!(saw_close);

        timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(room.members().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ping_probe_is_sent() {
        let room = test_room().await;
        let config = PumpConfig {
            ping_interval: Duration::from_millis(50),
            ..quiet_config()
        };
        let mut peer = connect(&room, "ann", config);

        loop {
            if matches!(peer.next_message().await, Message::Ping(_)) {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_silent_peer_hits_read_deadline() {
        let room = test_room().await;
        let config = PumpConfig {
            read_deadline: Duration::from_millis(150),
            ping_interval: Duration::from_millis(100),
            write_deadline: Duration::from_millis(500),
            ..Default::default()
        };
        let peer = connect(&room, "ann", config);

        // Probes are never answered
        timeout(Duration::from_secs(2), peer.task)
            .await
            .expect("read deadline never fired")
            .unwrap()
            .unwrap();
        assert!(room.members().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_answered_pings_keep_connection_alive() {
        let room = test_room().await;
        let config = PumpConfig {
            read_deadline: Duration::from_millis(200),
            ping_interval: Duration::from_millis(80),
            write_deadline: Duration::from_millis(500),
            ..Default::default()
        };
        let TestPeer {
            inbound,
            mut outbound,
            task,
        } = connect(&room, "ann", config);

        // Answer every probe the way a browser would
        let answering = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                if let Message::Ping(payload) = msg {
                    if inbound.send(Message::Pong(payload)).is_err() {
                        break;
                    }
                }
            }
        });

        // Several read deadlines pass without any application frame
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!task.is_finished());
        assert_eq!(room.members().await.unwrap().len(), 1);

        task.abort();
        answering.abort();
    }
}
