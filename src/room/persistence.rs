//! Best-effort persistence for one room.
//!
//! The room actor never awaits storage. It hands full-document updates to a
//! writer task which applies them in order, keeping only the newest when a
//! backlog builds up. Failures never reach the actor: they are logged and
//! published as [`PersistenceFailure`] events.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::storage::{DocumentGateway, DocumentUpdate};
use crate::sync::RoomKey;

/// A swallowed storage error, published for observers
#[derive(Debug, Clone, PartialEq)]
pub struct PersistenceFailure {
    pub room: RoomKey,
    pub document_id: String,
    pub error: String,
}

/// Sending side of a room's persistence writer
#[derive(Debug, Clone)]
pub(crate) struct PersistenceWriter {
    tx: mpsc::UnboundedSender<DocumentUpdate>,
}

impl PersistenceWriter {
    /// Start the writer task for `document_id`.
    ///
    /// The task exits once every writer handle has been dropped and the
    /// backlog is drained.
    pub(crate) fn spawn(
        room: RoomKey,
        document_id: String,
        store: Arc<dyn DocumentGateway>,
        failures: broadcast::Sender<PersistenceFailure>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(room, document_id, store, failures, rx));
        Self { tx }
    }

    /// Queue an update. Never blocks.
    pub(crate) fn submit(&self, update: DocumentUpdate) {
        if self.tx.send(update).is_err() {
            warn!("Persistence writer is gone, update dropped");
        }
    }
}

async fn run_writer(
    room: RoomKey,
    document_id: String,
    store: Arc<dyn DocumentGateway>,
    failures: broadcast::Sender<PersistenceFailure>,
    mut rx: mpsc::UnboundedReceiver<DocumentUpdate>,
) {
    while let Some(mut update) = rx.recv().await {
        // Updates carry every field, so only the newest queued one matters
        while let Ok(newer) = rx.try_recv() {
            update = newer;
        }

        match store.update(&document_id, update).await {
            Ok(doc) => {
                debug!(room = %room, version = doc.version, "Document persisted");
            }
            Err(e) => {
                warn!(room = %room, "Failed to persist document: {}", e);
                // No subscribers is fine
                let _ = failures.send(PersistenceFailure {
                    room: room.clone(),
                    document_id: document_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    debug!(room = %room, "Persistence writer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryDocumentStore, NewDocument};
    use std::time::Duration;

    #[tokio::test]
    async fn test_writer_applies_updates() {
        let store = Arc::new(MemoryDocumentStore::new());
        let doc = store
            .create(NewDocument::new("t", "", "text").with_id("r1"))
            .await
            .unwrap();
        let (failures, _) = broadcast::channel(8);

        let writer = PersistenceWriter::spawn(
            "r1".to_string(),
            doc.id.clone(),
            store.clone(),
            failures,
        );
        writer.submit(DocumentUpdate::full("t", "hello", "text"));

        let mut persisted = String::new();
        for _ in 0..50 {
            persisted = store.get("r1").await.unwrap().content;
            if persisted == "hello" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(persisted, "hello");
    }

    #[tokio::test]
    async fn test_missing_document_publishes_failure() {
        let store = Arc::new(MemoryDocumentStore::new());
        let (failures, mut events) = broadcast::channel(8);

        let writer =
            PersistenceWriter::spawn("r1".to_string(), "gone".to_string(), store, failures);
        writer.submit(DocumentUpdate::full("t", "c", "text"));

        let failure = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failure.room, "r1");
        assert_eq!(failure.document_id, "gone");
        assert!(failure.error.contains("not found"));
    }
}
