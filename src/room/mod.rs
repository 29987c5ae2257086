//! Room module: per-room actors and the registry that owns them.
//!
//! This module handles:
//! - The room actor loop that serializes membership, broadcast and edits
//! - The registry that lazily starts one actor per room key
//! - Best-effort persistence of room documents
//!
//! A room is only ever touched through its [`RoomHandle`]. The handle wraps the
//! actor's four bounded control queues; the actor owns the member table and the
//! document cache outright.

mod actor;
mod manager;
mod persistence;

pub use manager::RoomRegistry;
pub use persistence::PersistenceFailure;

pub(crate) use actor::spawn_room;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::sync::document::Operation;
use crate::sync::protocol::{InitFrame, PresenceFrame, UserInfo};
use crate::sync::{ConnectionId, RoomKey, SyncError, SyncResult};

/// One live client session as handed to a room
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    username: String,
    outbound: mpsc::Sender<Bytes>,
}

impl Connection {
    /// Create a connection with a fresh server-generated id
    pub fn new(username: impl Into<String>, outbound: mpsc::Sender<Bytes>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            username: username.into(),
            outbound,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Join request; `joined` fires once the actor has processed it
pub(crate) struct Register {
    connection: Connection,
    joined: oneshot::Sender<()>,
}

/// Work items the actor applies on behalf of a connection
#[derive(Debug)]
pub enum RoomRequest {
    /// Bind a display identity to a connection
    Identify {
        origin: ConnectionId,
        init: InitFrame,
    },
    /// Content edit, already stamped with origin and timestamp
    Edit(Operation),
    UpdateMetadata {
        origin: ConnectionId,
        title: String,
        language: String,
    },
    SubmitSnapshot {
        origin: ConnectionId,
        content: String,
        seq: Option<u64>,
    },
    Presence {
        origin: ConnectionId,
        presence: PresenceFrame,
    },
    /// Current member list
    Members(oneshot::Sender<Vec<UserInfo>>),
}

/// Cloneable handle to a running room actor
#[derive(Clone)]
pub struct RoomHandle {
    key: RoomKey,
    register_tx: mpsc::Sender<Register>,
    unregister_tx: mpsc::Sender<ConnectionId>,
    broadcast_tx: mpsc::Sender<Bytes>,
    request_tx: mpsc::Sender<RoomRequest>,
}

impl RoomHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Add a connection and wait until the actor has registered it.
    ///
    /// The joiner's snapshot is already queued on its outbound queue when this
    /// returns.
    pub async fn register(&self, connection: Connection) -> SyncResult<()> {
        let (joined, done) = oneshot::channel();
        self.register_tx
            .send(Register { connection, joined })
            .await
            .map_err(|_| self.closed())?;
        done.await.map_err(|_| self.closed())
    }

    /// Ask the actor to drop a connection without ever waiting.
    ///
    /// Returns false when the signal could not be queued. Safe to call more
    /// than once for the same connection.
    pub fn unregister(&self, id: &str) -> bool {
        match self.unregister_tx.try_send(id.to_string()) {
            Ok(()) => true,
            Err(e) => {
                debug!(room = %self.key, conn = %id, "Unregister signal not queued: {}", e);
                false
            }
        }
    }

    /// Fan a pre-encoded frame out to every member
    pub async fn broadcast(&self, frame: Bytes) -> SyncResult<()> {
        self.broadcast_tx
            .send(frame)
            .await
            .map_err(|_| self.closed())
    }

    /// Queue a request for the actor
    pub async fn request(&self, request: RoomRequest) -> SyncResult<()> {
        self.request_tx
            .send(request)
            .await
            .map_err(|_| self.closed())
    }

    /// Snapshot of the member list, in join order
    pub async fn members(&self) -> SyncResult<Vec<UserInfo>> {
        let (reply, rx) = oneshot::channel();
        self.request(RoomRequest::Members(reply)).await?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> SyncError {
        SyncError::RoomClosed(self.key.clone())
    }
}
