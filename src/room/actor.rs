//! The room actor: the only task that touches a room's members or document.
//!
//! Four bounded queues feed the actor (register, unregister, broadcast and
//! requests). It handles one message at a time, so membership changes,
//! broadcasts and document mutations are totally ordered per room.
//!
//! Delivery to members never waits. A member whose outbound queue is full or
//! closed is evicted on the spot and announced with `user_left`.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use super::persistence::{PersistenceFailure, PersistenceWriter};
use super::{Connection, Register, RoomHandle, RoomRequest};
use crate::config::RoomConfig;
use crate::storage::{Document, DocumentGateway};
use crate::sync::document::{DocumentCache, Operation};
use crate::sync::protocol::{
    now_nanos, InitFrame, MetadataChange, PresenceFrame, ServerFrame, UserInfo,
};
use crate::sync::{ConnectionId, RoomKey};

struct Member {
    /// Display id bound by `init`, echoed only in `init_ok`
    user_id: Option<String>,
    username: String,
    outbound: mpsc::Sender<Bytes>,
    join_seq: u64,
}

impl Member {
    /// How the member is listed to others. The id is always the connection
    /// id, so `user_joined` and `user_left` name the same member.
    fn info(&self, conn_id: &str) -> UserInfo {
        UserInfo {
            id: conn_id.to_string(),
            username: self.username.clone(),
        }
    }
}

struct RoomActor {
    key: RoomKey,
    document: DocumentCache,
    members: HashMap<ConnectionId, Member>,
    next_seq: u64,
    persistence: PersistenceWriter,
    register_rx: mpsc::Receiver<Register>,
    unregister_rx: mpsc::Receiver<ConnectionId>,
    broadcast_rx: mpsc::Receiver<Bytes>,
    request_rx: mpsc::Receiver<RoomRequest>,
}

/// Start the actor for `key` with `doc` as its initial state
pub(crate) fn spawn_room(
    key: RoomKey,
    doc: Document,
    store: Arc<dyn DocumentGateway>,
    failures: broadcast::Sender<PersistenceFailure>,
    config: &RoomConfig,
) -> RoomHandle {
    let (register_tx, register_rx) = mpsc::channel(config.control_capacity);
    let (unregister_tx, unregister_rx) = mpsc::channel(config.control_capacity);
    let (broadcast_tx, broadcast_rx) = mpsc::channel(config.control_capacity);
    let (request_tx, request_rx) = mpsc::channel(config.control_capacity);

    let persistence = PersistenceWriter::spawn(key.clone(), doc.id.clone(), store, failures);

    let actor = RoomActor {
        key: key.clone(),
        document: DocumentCache::new(doc),
        members: HashMap::new(),
        next_seq: 0,
        persistence,
        register_rx,
        unregister_rx,
        broadcast_rx,
        request_rx,
    };
    tokio::spawn(actor.run());

    RoomHandle {
        key,
        register_tx,
        unregister_tx,
        broadcast_tx,
        request_tx,
    }
}

impl RoomActor {
    async fn run(mut self) {
        info!(room = %self.key, document = %self.document.id(), "Room started");

        loop {
            tokio::select! {
                Some(register) = self.register_rx.recv() => self.on_register(register),
                Some(id) = self.unregister_rx.recv() => self.on_unregister(&id),
                Some(frame) = self.broadcast_rx.recv() => self.fan_out(frame, None),
                Some(request) = self.request_rx.recv() => self.on_request(request),
                else => break,
            }
        }

        info!(room = %self.key, "Room stopped");
    }

    // ========================================================================
    // Membership
    // ========================================================================

    fn on_register(&mut self, register: Register) {
        let Register { connection, joined } = register;
        let Connection {
            id,
            username,
            outbound,
        } = connection;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.members.insert(
            id.clone(),
            Member {
                user_id: None,
                username: username.clone(),
                outbound,
                join_seq: seq,
            },
        );
        info!(room = %self.key, conn = %id, username = %username, "Client joined");

        let snapshot = ServerFrame::JoinSnapshot {
            id: self.document.id().to_string(),
            content: self.document.content().to_string(),
            title: self.document.title().to_string(),
            language: self.document.language().to_string(),
            version: self.document.version(),
            users: self.users(),
        };
        self.send_to(&id, &snapshot);

        if self.members.contains_key(&id) {
            let joined_frame = ServerFrame::UserJoined {
                id: id.clone(),
                username,
            };
            self.publish(&joined_frame, Some(id.as_str()));
        }

        // The joiner may have given up waiting
        let _ = joined.send(());
    }

    fn on_unregister(&mut self, id: &str) {
        // Already evicted or never registered
        let Some(member) = self.members.remove(id) else {
            debug!(room = %self.key, conn = %id, "Unregister for non-member ignored");
            return;
        };
        info!(room = %self.key, conn = %id, "Client left");
        self.announce_left(vec![(id.to_string(), member)]);
    }

    /// Broadcast `user_left` for each removed member, evicting any member
    /// that cannot take the announcement. Iterates until nobody else drops.
    fn announce_left(&mut self, removed: Vec<(ConnectionId, Member)>) {
        let mut pending: VecDeque<(ConnectionId, Member)> = removed.into();

        while let Some((id, member)) = pending.pop_front() {
            let info = member.info(&id);
            // Dropping the member drops the only strong sender of its queue
            drop(member);

            let Some(frame) = encode(&ServerFrame::UserLeft {
                id: info.id,
                username: info.username,
            }) else {
                continue;
            };
            for dead in self.deliver(&frame, None) {
                if let Some(member) = self.members.remove(&dead) {
                    pending.push_back((dead, member));
                }
            }
        }
    }

    // ========================================================================
    // Delivery
    // ========================================================================

    /// Non-blocking enqueue to every member except `exclude`. Returns the ids
    /// whose queue was full or closed; they are still members.
    fn deliver(&self, frame: &Bytes, exclude: Option<&str>) -> Vec<ConnectionId> {
        let mut dead = Vec::new();
        for (id, member) in &self.members {
            if exclude == Some(id.as_str()) {
                continue;
            }
            if let Err(e) = member.outbound.try_send(frame.clone()) {
                warn!(room = %self.key, conn = %id, "Evicting slow consumer: {}", e);
                dead.push(id.clone());
            }
        }
        dead
    }

    /// Deliver a pre-encoded frame and evict whoever could not take it
    fn fan_out(&mut self, frame: Bytes, exclude: Option<&str>) {
        let dead = self.deliver(&frame, exclude);
        self.evict(dead);
    }

    fn publish(&mut self, frame: &ServerFrame, exclude: Option<&str>) {
        if let Some(bytes) = encode(frame) {
            self.fan_out(bytes, exclude);
        }
    }

    /// Send to one member only
    fn send_to(&mut self, id: &str, frame: &ServerFrame) {
        let Some(bytes) = encode(frame) else {
            return;
        };
        let Some(member) = self.members.get(id) else {
            return;
        };
        if let Err(e) = member.outbound.try_send(bytes) {
            warn!(room = %self.key, conn = %id, "Evicting slow consumer: {}", e);
            self.evict(vec![id.to_string()]);
        }
    }

    fn evict(&mut self, dead: Vec<ConnectionId>) {
        if dead.is_empty() {
            return;
        }
        let removed = dead
            .into_iter()
            .filter_map(|id| self.members.remove(&id).map(|member| (id, member)))
            .collect();
        self.announce_left(removed);
    }

    /// Members in join order
    fn users(&self) -> Vec<UserInfo> {
        let mut members: Vec<_> = self.members.iter().collect();
        members.sort_by_key(|(_, member)| member.join_seq);
        members
            .into_iter()
            .map(|(id, member)| member.info(id))
            .collect()
    }

    // ========================================================================
    // Mutation pipeline
    // ========================================================================

    fn on_request(&mut self, request: RoomRequest) {
        match request {
            RoomRequest::Identify { origin, init } => self.identify(&origin, init),
            RoomRequest::Edit(op) => self.apply_edit(op),
            RoomRequest::UpdateMetadata {
                origin,
                title,
                language,
            } => self.update_metadata(&origin, title, language),
            RoomRequest::SubmitSnapshot {
                origin,
                content,
                seq,
            } => self.submit_snapshot(&origin, content, seq),
            RoomRequest::Presence { origin, presence } => self.relay_presence(&origin, presence),
            RoomRequest::Members(reply) => self.reply_members(reply),
        }
    }

    fn identify(&mut self, origin: &str, init: InitFrame) {
        let Some(member) = self.members.get_mut(origin) else {
            debug!(room = %self.key, conn = %origin, "Init from non-member ignored");
            return;
        };
        if let Some(id) = init.id.filter(|id| !id.is_empty()) {
            member.user_id = Some(id);
        }
        if let Some(username) = init.username.filter(|name| !name.is_empty()) {
            member.username = username;
        }
        let id = member.user_id.clone().unwrap_or_else(|| origin.to_string());
        let username = member.username.clone();
        debug!(room = %self.key, conn = %origin, user = %id, "Identity bound");

        self.publish(&ServerFrame::InitOk { id, username }, None);
    }

    fn apply_edit(&mut self, op: Operation) {
        let changed = self.document.apply(&op);
        debug!(
            room = %self.key,
            conn = %op.client_id,
            kind = ?op.kind,
            changed,
            version = self.document.version(),
            "Operation applied"
        );

        let origin = op.client_id.clone();
        self.publish(&ServerFrame::Operation { operation: op }, Some(origin.as_str()));
    }

    fn update_metadata(&mut self, origin: &str, title: String, language: String) {
        self.document.set_metadata(title.clone(), language.clone());
        self.persistence.submit(self.document.flush_update());

        let change = MetadataChange {
            title,
            language,
            client_id: origin.to_string(),
            timestamp: now_nanos(),
        };
        self.publish(
            &ServerFrame::DocumentUpdate {
                document_update: change,
            },
            Some(origin),
        );
    }

    fn submit_snapshot(&mut self, origin: &str, content: String, seq: Option<u64>) {
        self.document.replace_content(content.clone());
        self.persistence.submit(self.document.flush_update());

        let update = ServerFrame::SnapshotUpdate {
            content,
            users: self.users(),
        };
        self.publish(&update, Some(origin));

        if let Some(seq) = seq {
            self.send_to(origin, &ServerFrame::snapshot_ack(seq));
        }
    }

    fn relay_presence(&mut self, origin: &str, presence: PresenceFrame) {
        let frame = ServerFrame::PresenceUser {
            id: origin.to_string(),
            username: presence.username,
            color: presence.color,
            line_number: presence.line_number,
            column: presence.column,
        };
        self.publish(&frame, Some(origin));
    }

    fn reply_members(&self, reply: oneshot::Sender<Vec<UserInfo>>) {
        let _ = reply.send(self.users());
    }
}

fn encode(frame: &ServerFrame) -> Option<Bytes> {
    match frame.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Failed to encode outbound frame: {}", e);
            None
        }
    }
}
