//! Storage module: the persistence gateway consumed by the room engine.
//!
//! Rooms mirror one [`Document`] each. The gateway is deliberately small
//! (create/get/update/delete/list) so the rest of the server can treat
//! durability as an external service. Two backends are provided:
//! - [`SledDocumentStore`] for the embedded on-disk database
//! - [`MemoryDocumentStore`] for ephemeral deployments and tests

mod memory;
mod sled_store;

pub use memory::MemoryDocumentStore;
pub use sled_store::SledDocumentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// A persisted collaborative document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Starts at 1, bumped by every effective update
    pub version: u64,
}

impl Document {
    fn from_new(new: NewDocument) -> Self {
        let now = Utc::now();
        Self {
            id: new.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            title: new.title,
            content: new.content,
            language: new.language,
            created_at: now,
            updated_at: now,
            version: 1,
        }
    }

    /// Apply a partial update. Returns false when nothing was provided.
    fn apply_update(&mut self, update: DocumentUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        if let Some(title) = update.title {
            self.title = title;
        }
        if let Some(content) = update.content {
            self.content = content;
        }
        if let Some(language) = update.language {
            self.language = language;
        }
        self.updated_at = Utc::now();
        self.version += 1;
        true
    }
}

/// Input for [`DocumentGateway::create`]
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewDocument {
    /// Explicit id; generated when absent
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub language: String,
}

impl NewDocument {
    pub fn new(
        title: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            title: title.into(),
            content: content.into(),
            language: language.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// Partial update. `None` leaves the field untouched, `Some("")` clears it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl DocumentUpdate {
    /// Update that rewrites every field, used when a room flushes its cache
    pub fn full(
        title: impl Into<String>,
        content: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            title: Some(title.into()),
            content: Some(content.into()),
            language: Some(language.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.content.is_none() && self.language.is_none()
    }
}

/// The external durable document store.
///
/// Every `update` that carries at least one field bumps the stored version and
/// update timestamp. `list` returns the most recently updated documents first.
#[async_trait]
pub trait DocumentGateway: Send + Sync + 'static {
    async fn create(&self, new: NewDocument) -> StorageResult<Document>;

    async fn get(&self, id: &str) -> StorageResult<Document>;

    async fn update(&self, id: &str, update: DocumentUpdate) -> StorageResult<Document>;

    async fn delete(&self, id: &str) -> StorageResult<()>;

    async fn list(&self) -> StorageResult<Vec<Document>>;
}

/// Sort newest-updated first, the order `list` promises
fn sort_recent_first(docs: &mut [Document]) {
    docs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
}

/// Configuration for the sled backend
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 64 * 1024 * 1024, // 64MB
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_document_defaults() {
        let doc = Document::from_new(NewDocument::new("Notes", "hello", "markdown"));

        assert_eq!(doc.version, 1);
        assert_eq!(doc.created_at, doc.updated_at);
        assert!(uuid::Uuid::parse_str(&doc.id).is_ok());
    }

    #[test]
    fn test_explicit_id_is_kept() {
        let doc = Document::from_new(NewDocument::default().with_id("room-1"));
        assert_eq!(doc.id, "room-1");
    }

    #[test]
    fn test_empty_update_is_noop() {
        let mut doc = Document::from_new(NewDocument::new("t", "c", "rust"));
        assert!(!doc.apply_update(DocumentUpdate::default()));
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn test_partial_update_bumps_version() {
        let mut doc = Document::from_new(NewDocument::new("t", "c", "rust"));
        let update = DocumentUpdate {
            title: Some("renamed".to_string()),
            ..Default::default()
        };

        assert!(doc.apply_update(update));
        assert_eq!(doc.title, "renamed");
        assert_eq!(doc.content, "c");
        assert_eq!(doc.version, 2);
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default().with_cache_size(1024);
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.flush_interval_ms, 500);
    }
}
