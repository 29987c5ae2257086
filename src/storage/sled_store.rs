//! Sled-based implementation of the document gateway.
//!
//! Documents live in a single tree keyed by document id, encoded with bincode.
//! Updates run inside a sled transaction so concurrent writers never lose a
//! version bump.

use async_trait::async_trait;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{
    sort_recent_first, Document, DocumentGateway, DocumentUpdate, NewDocument, StorageConfig,
    StorageError, StorageResult,
};

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";

/// Sled-based document store
#[derive(Clone)]
pub struct SledDocumentStore {
    db: Arc<Db>,
    documents: Tree,
}

impl SledDocumentStore {
    /// Open or create a new document store at the given path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
        })
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    fn decode(bytes: &[u8]) -> StorageResult<Document> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[async_trait]
impl DocumentGateway for SledDocumentStore {
    async fn create(&self, new: NewDocument) -> StorageResult<Document> {
        let doc = Document::from_new(new);
        let bytes = bincode::serialize(&doc)?;

        // Only insert if the id is still free
        let swapped = self
            .documents
            .compare_and_swap(doc.id.as_bytes(), None as Option<&[u8]>, Some(bytes))?;
        if swapped.is_err() {
            return Err(StorageError::AlreadyExists(doc.id));
        }

        Ok(doc)
    }

    async fn get(&self, id: &str) -> StorageResult<Document> {
        match self.documents.get(id.as_bytes())? {
            Some(bytes) => Self::decode(&bytes),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn update(&self, id: &str, update: DocumentUpdate) -> StorageResult<Document> {
        let result = self.documents.transaction(|tx| {
            let current = tx.get(id.as_bytes())?.ok_or_else(|| {
                ConflictableTransactionError::Abort(StorageError::NotFound(id.to_string()))
            })?;
            let mut doc = Self::decode(&current).map_err(ConflictableTransactionError::Abort)?;

            if doc.apply_update(update.clone()) {
                let bytes = bincode::serialize(&doc)
                    .map_err(|e| ConflictableTransactionError::Abort(StorageError::from(e)))?;
                tx.insert(id.as_bytes(), bytes)?;
            }
            Ok(doc)
        });

        result.map_err(|e| match e {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => StorageError::Sled(e),
        })
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        match self.documents.remove(id.as_bytes())? {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn list(&self) -> StorageResult<Vec<Document>> {
        let mut docs = Vec::with_capacity(self.documents.len());
        for item in self.documents.iter() {
            let (_, value) = item?;
            docs.push(Self::decode(&value)?);
        }
        sort_recent_first(&mut docs);
        Ok(docs)
    }
}

impl Drop for SledDocumentStore {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{tempdir, TempDir};

    fn test_store() -> (TempDir, SledDocumentStore) {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let store = SledDocumentStore::open(config).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_dir, store) = test_store();

        let created = store
            .create(NewDocument::new("Notes", "hello", "markdown"))
            .await
            .unwrap();
        let loaded = store.get(&created.id).await.unwrap();

        assert_eq!(loaded, created);
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn test_document_not_found() {
        let (_dir, store) = test_store();
        let err = store.get("nonexistent").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_create_with_existing_id_fails() {
        let (_dir, store) = test_store();
        store
            .create(NewDocument::default().with_id("room-a"))
            .await
            .unwrap();

        let err = store
            .create(NewDocument::default().with_id("room-a"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(id) if id == "room-a"));
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let (_dir, store) = test_store();
        let doc = store
            .create(NewDocument::new("t", "old", "rust"))
            .await
            .unwrap();

        let updated = store
            .update(&doc.id, DocumentUpdate::full("t2", "new", "go"))
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.content, "new");
        assert!(updated.updated_at >= doc.updated_at);
        assert_eq!(store.get(&doc.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let (_dir, store) = test_store();
        let err = store
            .update("ghost", DocumentUpdate::full("a", "b", "c"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_document() {
        let (_dir, store) = test_store();
        let doc = store.create(NewDocument::default()).await.unwrap();

        store.delete(&doc.id).await.unwrap();

        assert!(store.get(&doc.id).await.unwrap_err().is_not_found());
        assert!(store.delete(&doc.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let (_dir, store) = test_store();
        let first = store.create(NewDocument::new("first", "", "")).await.unwrap();
        let second = store.create(NewDocument::new("second", "", "")).await.unwrap();

        // Touch the older one so it becomes the most recent
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        store
            .update(&first.id, DocumentUpdate::full("first", "x", ""))
            .await
            .unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }
}
