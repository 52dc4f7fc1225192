//! Document storage.
//!
//! [`DocumentStore`] holds the authoritative text of every open document in
//! memory and tracks a version per document. Persistence is delegated to a
//! [`DocumentBackend`]: sled on disk, or a plain map for tests.

mod memory;
mod sled_store;
mod store;

pub use memory::MemoryBackend;
pub use sled_store::SledBackend;
pub use store::{DocumentSnapshot, DocumentStore};

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

    #[error("Document too large: {size} characters (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Corruption detected in document: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata stored alongside document content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Opaque document identifier
    pub document_id: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of last modification
    pub updated_at: i64,
    /// Number of accepted writes since creation
    pub version: u64,
    /// Size of the content in characters
    pub size_chars: u64,
}

impl DocumentMetadata {
    pub fn new(document_id: impl Into<String>, content: &str) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            document_id: document_id.into(),
            created_at: now,
            updated_at: now,
            version: 0,
            size_chars: content.chars().count() as u64,
        }
    }

    /// Record a new write of `content`
    pub fn touch(&mut self, content: &str) {
        self.updated_at = chrono::Utc::now().timestamp();
        self.version += 1;
        self.size_chars = content.chars().count() as u64;
    }
}

/// A document as handed to and from a backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedDocument {
    pub metadata: DocumentMetadata,
    pub content: String,
}

/// Persistence collaborator for [`DocumentStore`].
///
/// Backends only move whole documents; versioning and locking live in the store.
pub trait DocumentBackend: Send + Sync {
    fn load(&self, document_id: &str) -> StorageResult<Option<PersistedDocument>>;

    fn save(&self, document: &PersistedDocument) -> StorageResult<()>;

    fn exists(&self, document_id: &str) -> StorageResult<bool>;

    fn list(&self) -> StorageResult<Vec<DocumentMetadata>>;

    /// Force pending writes to durable storage
    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// Which backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Sled,
    Memory,
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sled" => Ok(Self::Sled),
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(format!("unknown storage backend: {}", other)),
        }
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    pub backend: BackendKind,
    /// Cache size in bytes (default: 256MB)
    pub cache_size: u64,
    /// Sled flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
    /// Largest accepted document, in characters
    pub max_document_size: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/textsync.sled".to_string(),
            backend: BackendKind::Sled,
            cache_size: 256 * 1024 * 1024,
            flush_interval_ms: 500,
            max_document_size: 1024 * 1024,
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

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_max_document_size(mut self, chars: usize) -> Self {
        self.max_document_size = chars;
        self
    }
}
