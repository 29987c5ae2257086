//! Room-local document cache and edit application.
//!
//! Edits are applied optimistically in arrival order. There is no operational
//! transform: concurrent edits against stale positions are clamped or dropped,
//! never rebased. Positions and lengths count `char`s, not bytes.

use serde::{Deserialize, Serialize};

use super::ConnectionId;
use crate::storage::{Document, DocumentUpdate};

/// Kind of a single content edit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Delete,
    Retain,
}

/// A content edit stamped by the server with its origin and arrival time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    #[serde(rename = "type")]
    pub kind: OperationKind,
    pub position: usize,
    pub content: String,
    pub length: usize,
    pub client_id: ConnectionId,
    /// Nanoseconds since the Unix epoch
    pub timestamp: i64,
}

/// The room's in-memory copy of its document.
///
/// Only the room actor owns one, so every method takes `&mut self` without
/// further synchronization. Each accepted change bumps `version` by one.
#[derive(Debug, Clone)]
pub struct DocumentCache {
    doc: Document,
}

impl DocumentCache {
    pub fn new(doc: Document) -> Self {
        Self { doc }
    }

    pub fn id(&self) -> &str {
        &self.doc.id
    }

    pub fn title(&self) -> &str {
        &self.doc.title
    }

    pub fn content(&self) -> &str {
        &self.doc.content
    }

    pub fn language(&self) -> &str {
        &self.doc.language
    }

    pub fn version(&self) -> u64 {
        self.doc.version
    }

    /// Length of the content in chars
    pub fn len(&self) -> usize {
        self.doc.content.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.content.is_empty()
    }

    /// Apply an edit. Returns whether the document changed.
    ///
    /// - `insert` at or past the end appends
    /// - `delete` only applies when `position + length` fits, otherwise it is ignored
    /// - `retain` never changes content
    pub fn apply(&mut self, op: &Operation) -> bool {
        match op.kind {
            OperationKind::Insert => {
                if op.position >= self.len() {
                    self.doc.content.push_str(&op.content);
                } else {
                    let at = byte_offset(&self.doc.content, op.position);
                    self.doc.content.insert_str(at, &op.content);
                }
            }
            OperationKind::Delete => {
                let fits = op
                    .position
                    .checked_add(op.length)
                    .map_or(false, |end| end <= self.len());
                if !fits {
                    return false;
                }
                let start = byte_offset(&self.doc.content, op.position);
                let end = byte_offset(&self.doc.content, op.position + op.length);
                self.doc.content.replace_range(start..end, "");
            }
            OperationKind::Retain => return false,
        }
        self.doc.version += 1;
        true
    }

    /// Replace title and language
    pub fn set_metadata(&mut self, title: impl Into<String>, language: impl Into<String>) {
        self.doc.title = title.into();
        self.doc.language = language.into();
        self.doc.version += 1;
    }

    /// Replace the whole content with a client-submitted snapshot
    pub fn replace_content(&mut self, content: impl Into<String>) {
        self.doc.content = content.into();
        self.doc.version += 1;
    }

    /// Update that flushes every cached field to the store
    pub fn flush_update(&self) -> DocumentUpdate {
        DocumentUpdate::full(&self.doc.title, &self.doc.content, &self.doc.language)
    }
}

fn byte_offset(s: &str, char_pos: usize) -> usize {
    s.char_indices()
        .nth(char_pos)
        .map(|(i, _)| i)
        .unwrap_or(s.len())
}
