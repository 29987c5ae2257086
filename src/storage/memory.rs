//! In-memory document gateway backed by DashMap.
//!
//! Nothing survives a restart. Useful for `STORAGE_BACKEND=memory` and as the
//! default store in tests.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{
    sort_recent_first, Document, DocumentGateway, DocumentUpdate, NewDocument, StorageError,
    StorageResult,
};

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: DashMap<String, Document>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl DocumentGateway for MemoryDocumentStore {
    async fn create(&self, new: NewDocument) -> StorageResult<Document> {
        let doc = Document::from_new(new);
        match self.documents.entry(doc.id.clone()) {
            Entry::Occupied(_) => Err(StorageError::AlreadyExists(doc.id)),
            Entry::Vacant(slot) => {
                slot.insert(doc.clone());
                Ok(doc)
            }
        }
    }

    async fn get(&self, id: &str) -> StorageResult<Document> {
        self.documents
            .get(id)
            .map(|doc| doc.clone())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn update(&self, id: &str, update: DocumentUpdate) -> StorageResult<Document> {
        let mut doc = self
            .documents
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        doc.apply_update(update);
        Ok(doc.clone())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.documents
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn list(&self) -> StorageResult<Vec<Document>> {
        let mut docs: Vec<Document> = self.documents.iter().map(|e| e.value().clone()).collect();
        sort_recent_first(&mut docs);
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_crud_cycle() {
        let store = MemoryDocumentStore::new();

        let doc = store
            .create(NewDocument::new("Draft", "abc", "text"))
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        let updated = store
            .update(
                &doc.id,
                DocumentUpdate {
                    content: Some("abcd".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.title, "Draft");

        store.delete(&doc.id).await.unwrap();
        assert!(store.is_empty());
        assert!(store.get(&doc.id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = MemoryDocumentStore::new();
        store
            .create(NewDocument::default().with_id("r"))
            .await
            .unwrap();
        assert!(matches!(
            store.create(NewDocument::default().with_id("r")).await,
            Err(StorageError::AlreadyExists(_))
        ));
    }
}
