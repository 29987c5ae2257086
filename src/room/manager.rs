//! Room registry: the process-wide table of running rooms.
//!
//! A room is started on first reference to its key and then lives for the
//! rest of the process. Rooms are bootstrapped from the document store; with
//! `auto_create` a missing document is created under the room key.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use super::persistence::PersistenceFailure;
use super::{spawn_room, RoomHandle};
use crate::config::RoomConfig;
use crate::storage::{Document, DocumentGateway, NewDocument, StorageError, StorageResult};
use crate::sync::{RoomKey, SyncError, SyncResult};

/// Capacity of the persistence failure channel
const FAILURE_CHANNEL_CAPACITY: usize = 64;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<RoomKey, RoomHandle>>,
    store: Arc<dyn DocumentGateway>,
    config: RoomConfig,
    failures: broadcast::Sender<PersistenceFailure>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn DocumentGateway>, config: RoomConfig) -> Self {
        let (failures, _) = broadcast::channel(FAILURE_CHANNEL_CAPACITY);
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
            failures,
        }
    }

    /// Return the running room for `key`, starting it if needed.
    ///
    /// The table stays write-locked while the backing document is fetched, so
    /// two callers can never start two actors for the same key. On failure no
    /// room is registered.
    pub async fn get_or_create(&self, key: &str) -> SyncResult<RoomHandle> {
        // Fast path
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(key) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(key) {
            return Ok(room.clone());
        }

        let doc = self
            .load_document(key)
            .await
            .map_err(|source| SyncError::RoomUnavailable {
                room: key.to_string(),
                source,
            })?;

        let room = spawn_room(
            key.to_string(),
            doc,
            self.store.clone(),
            self.failures.clone(),
            &self.config,
        );
        rooms.insert(key.to_string(), room.clone());

        info!(room = %key, active_rooms = rooms.len(), "Created room");
        Ok(room)
    }

    /// Get a running room without starting one
    pub async fn get(&self, key: &str) -> Option<RoomHandle> {
        let rooms = self.rooms.read().await;
        rooms.get(key).cloned()
    }

    /// Get the number of active rooms
    pub async fn room_count(&self) -> usize {
        let rooms = self.rooms.read().await;
        rooms.len()
    }

    pub fn store(&self) -> &Arc<dyn DocumentGateway> {
        &self.store
    }

    /// Subscribe to persistence failures swallowed by the rooms
    pub fn subscribe_failures(&self) -> broadcast::Receiver<PersistenceFailure> {
        self.failures.subscribe()
    }

    async fn load_document(&self, key: &str) -> StorageResult<Document> {
        match self.store.get(key).await {
            Err(StorageError::NotFound(_)) if self.config.auto_create => {
                let new = NewDocument::new(key, "", "plaintext").with_id(key);
                match self.store.create(new).await {
                    Ok(doc) => {
                        info!(room = %key, "Created backing document");
                        Ok(doc)
                    }
                    // Created behind our back, e.g. over the REST API
                    Err(StorageError::AlreadyExists(_)) => self.store.get(key).await,
                    Err(e) => {
                        warn!(room = %key, "Failed to create backing document: {}", e);
                        Err(e)
                    }
                }
            }
            other => other,
        }
    }
}
