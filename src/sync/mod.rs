//! Synchronization module for real-time collaboration.
//!
//! It provides:
//! - The JSON wire protocol spoken over each WebSocket
//! - The cached document and the edit operations applied to it
//! - The per-connection read/write pumps that bridge sockets and rooms

pub mod document;
pub mod protocol;
pub mod pump;

pub use document::{DocumentCache, Operation, OperationKind};

use thiserror::Error;

use crate::storage::StorageError;

/// Key of a collaboration room; equal to the backing document id
pub type RoomKey = String;

/// Server-generated identifier of one live connection
pub type ConnectionId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur while resolving or talking to a room
#[derive(Debug, Error)]
pub enum SyncError {
    /// The backing document could not be fetched or created
    #[error("Room {room} unavailable: {source}")]
    RoomUnavailable {
        room: RoomKey,
        #[source]
        source: StorageError,
    },

    /// The room actor stopped accepting commands
    #[error("Room {0} is closed")]
    RoomClosed(RoomKey),
}

impl SyncError {
    /// True when the room failed because its document does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, SyncError::RoomUnavailable { source, .. } if source.is_not_found())
    }
}
