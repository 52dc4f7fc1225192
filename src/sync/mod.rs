//! Synchronization core.
//!
//! - `diff` / `patch`: text diffing, the patch format and fuzzy application
//! - `coordinator`: per-document critical sections around read-apply-write
//! - `gateway`: client events in, outbound messages out
//! - `peers`: live connections and their outbound channels
//! - `protocol`: wire messages and framing

pub mod coordinator;
pub mod diff;
pub mod gateway;
pub mod patch;
pub mod peers;
pub mod protocol;

pub use coordinator::{ServerStats, SyncCoordinator};
pub use gateway::ConnectionGateway;
pub use patch::{CodecConfig, Patch, PatchCodec, PatchError};
pub use peers::{Outbox, PeerDirectory};

use std::time::Duration;
use thiserror::Error;

use crate::room::RoomError;
use crate::storage::StorageError;
use protocol::ErrorCode;

/// Opaque document identifier
pub type DocumentId = String;

/// Identifier assigned to each connection
pub type ClientId = String;

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during synchronization.
///
/// Each is scoped to the request that caused it and only reported back to
/// its originator.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Document not found: {0}")]
    NotFound(DocumentId),

    #[error("Document already exists: {0}")]
    AlreadyExists(DocumentId),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Patch conflict on {document_id}: {reason}")]
    PatchConflict {
        document_id: DocumentId,
        reason: String,
    },

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl SyncError {
    /// Wire error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::NotFound(_) => ErrorCode::NotFound,
            SyncError::AlreadyExists(_) => ErrorCode::AlreadyExists,
            SyncError::InvalidInput(_) => ErrorCode::InvalidInput,
            SyncError::PatchConflict { .. } => ErrorCode::PatchConflict,
            SyncError::Storage(_) | SyncError::Connection(_) => ErrorCode::ServerError,
        }
    }
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => SyncError::NotFound(id),
            StorageError::AlreadyExists(id) => SyncError::AlreadyExists(id),
            StorageError::TooLarge { .. } => SyncError::InvalidInput(err.to_string()),
            other => SyncError::Storage(other),
        }
    }
}

impl From<RoomError> for SyncError {
    fn from(err: RoomError) -> Self {
        match err {
            RoomError::DocumentNotFound(id) => SyncError::NotFound(id),
            RoomError::Storage(e) => e.into(),
        }
    }
}

/// Configuration for sync behavior
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Reject patches whose base version is not the current version
    pub strict_versioning: bool,
    /// Dirty document save interval
    pub save_interval: Duration,
    /// Interval for reaping dead connections
    pub cleanup_interval: Duration,
    pub codec: CodecConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            strict_versioning: false,
            save_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(60),
            codec: CodecConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_strict_versioning(mut self, strict: bool) -> Self {
        self.strict_versioning = strict;
        self
    }

    pub fn with_save_interval(mut self, interval: Duration) -> Self {
        self.save_interval = interval;
        self
    }

    pub fn with_codec(mut self, codec: CodecConfig) -> Self {
        self.codec = codec;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::NotFound("test-123".to_string());
        assert_eq!(err.to_string(), "Document not found: test-123");
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_storage_error_mapping() {
        let err: SyncError = StorageError::TooLarge { size: 10, limit: 5 }.into();
        assert_eq!(err.code(), ErrorCode::InvalidInput);

        let err: SyncError = StorageError::AlreadyExists("x".to_string()).into();
        assert!(matches!(err, SyncError::AlreadyExists(id) if id == "x"));

        let err: SyncError = RoomError::DocumentNotFound("y".to_string()).into();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert!(!config.strict_versioning);
        assert_eq!(config.save_interval, Duration::from_secs(5));
        assert_eq!(config.codec.patch_margin, 4);
    }
}
