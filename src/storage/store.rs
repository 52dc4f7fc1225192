//! Authoritative in-memory document store.
//!
//! Every document lives behind its own lock so reads and writes for
//! unrelated documents never contend. Writes bump the document version and
//! mark it dirty; [`DocumentStore::flush_dirty`] pushes dirty documents to
//! the backend.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    BackendKind, DocumentBackend, DocumentMetadata, MemoryBackend, PersistedDocument,
    SledBackend, StorageConfig, StorageError, StorageResult,
};

/// Point-in-time copy of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentSnapshot {
    pub document_id: String,
    pub content: String,
    pub version: u64,
}

struct StoredDocument {
    content: String,
    metadata: DocumentMetadata,
    dirty: bool,
}

impl StoredDocument {
    fn persisted(&self) -> PersistedDocument {
        PersistedDocument {
            metadata: self.metadata.clone(),
            content: self.content.clone(),
        }
    }
}

impl From<PersistedDocument> for StoredDocument {
    fn from(doc: PersistedDocument) -> Self {
        Self {
            content: doc.content,
            metadata: doc.metadata,
            dirty: false,
        }
    }
}

/// Maps document ids to their current authoritative content
pub struct DocumentStore {
    documents: DashMap<String, Arc<RwLock<StoredDocument>>>,
    /// Ids with a create in progress
    creating: DashMap<String, ()>,
    backend: Arc<dyn DocumentBackend>,
    max_document_size: usize,
}

impl DocumentStore {
    /// Open the backend named by the configuration
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
        let backend: Arc<dyn DocumentBackend> = match config.backend {
            BackendKind::Sled => {
                let backend = SledBackend::open(config)?;
                info!(
                    "Opened sled storage at {} ({} bytes on disk)",
                    config.path,
                    backend.size_on_disk()
                );
                Arc::new(backend)
            }
            BackendKind::Memory => {
                info!("Using in-memory storage");
                Arc::new(MemoryBackend::new())
            }
        };
        Ok(Self::with_backend(backend, config.max_document_size))
    }

    pub fn with_backend(backend: Arc<dyn DocumentBackend>, max_document_size: usize) -> Self {
        Self {
            documents: DashMap::new(),
            creating: DashMap::new(),
            backend,
            max_document_size,
        }
    }

    /// Store without persistence, with default limits
    #[cfg(test)]
    pub(crate) fn in_memory() -> Self {
        Self::with_backend(
            Arc::new(MemoryBackend::new()),
            StorageConfig::default().max_document_size,
        )
    }

    fn check_size(&self, content: &str) -> StorageResult<()> {
        let size = content.chars().count();
        if size > self.max_document_size {
            return Err(StorageError::TooLarge {
                size,
                limit: self.max_document_size,
            });
        }
        Ok(())
    }

    /// Resolve a document, loading it from the backend if it is not cached
    fn entry(&self, document_id: &str) -> StorageResult<Arc<RwLock<StoredDocument>>> {
        if let Some(doc) = self.documents.get(document_id) {
            return Ok(doc.clone());
        }

        let loaded = self
            .backend
            .load(document_id)?
            .ok_or_else(|| StorageError::NotFound(document_id.to_string()))?;
        debug!("Loaded document {} from backend", document_id);

        // Another task may have loaded it in the meantime; keep theirs
        let doc = self
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(StoredDocument::from(loaded))))
            .clone();
        Ok(doc)
    }

    /// Create a document. Fails if the id is taken here or in the backend.
    ///
    /// The id is reserved first so the backend save runs without holding
    /// any map shard lock.
    pub fn create(&self, document_id: &str, content: &str) -> StorageResult<DocumentSnapshot> {
        self.check_size(content)?;

        match self.creating.entry(document_id.to_string()) {
            Entry::Occupied(_) => return Err(StorageError::AlreadyExists(document_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let result = self.create_reserved(document_id, content);
        self.creating.remove(document_id);
        result
    }

    fn create_reserved(&self, document_id: &str, content: &str) -> StorageResult<DocumentSnapshot> {
        if self.documents.contains_key(document_id) || self.backend.exists(document_id)? {
            return Err(StorageError::AlreadyExists(document_id.to_string()));
        }

        let stored = StoredDocument {
            content: content.to_string(),
            metadata: DocumentMetadata::new(document_id, content),
            dirty: false,
        };
        self.backend.save(&stored.persisted())?;

        // A reader may already have pulled the saved copy from the backend
        self.documents
            .entry(document_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(stored)));

        info!(
            "Created document {} ({} chars)",
            document_id,
            content.chars().count()
        );
        Ok(DocumentSnapshot {
            document_id: document_id.to_string(),
            content: content.to_string(),
            version: 0,
        })
    }

    pub fn read(&self, document_id: &str) -> StorageResult<DocumentSnapshot> {
        let doc = self.entry(document_id)?;
        let doc = doc.read();
        Ok(DocumentSnapshot {
            document_id: document_id.to_string(),
            content: doc.content.clone(),
            version: doc.metadata.version,
        })
    }

    /// Replace a document's content. Returns the new version.
    pub fn write(&self, document_id: &str, content: String) -> StorageResult<u64> {
        self.check_size(&content)?;

        let doc = self.entry(document_id)?;
        let mut doc = doc.write();
        doc.metadata.touch(&content);
        doc.content = content;
        doc.dirty = true;
        Ok(doc.metadata.version)
    }

    pub fn exists(&self, document_id: &str) -> StorageResult<bool> {
        if self.documents.contains_key(document_id) {
            return Ok(true);
        }
        self.backend.exists(document_id)
    }

    /// Metadata of every known document, cached or persisted
    pub fn list(&self) -> StorageResult<Vec<DocumentMetadata>> {
        let mut listed = self.backend.list()?;
        for item in self.documents.iter() {
            let meta = item.value().read().metadata.clone();
            match listed.iter_mut().find(|m| m.document_id == meta.document_id) {
                Some(existing) => *existing = meta,
                None => listed.push(meta),
            }
        }
        listed.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.document_id.cmp(&b.document_id)));
        Ok(listed)
    }

    /// Number of documents held in memory
    pub fn cached_count(&self) -> usize {
        self.documents.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.documents
            .iter()
            .filter(|item| item.value().read().dirty)
            .count()
    }

    /// Persist every dirty document. Returns how many were saved.
    ///
    /// A failed save leaves the document dirty for the next attempt.
    pub fn flush_dirty(&self) -> StorageResult<usize> {
        let dirty: Vec<(String, Arc<RwLock<StoredDocument>>)> = self
            .documents
            .iter()
            .filter(|item| item.value().read().dirty)
            .map(|item| (item.key().clone(), item.value().clone()))
            .collect();

        let mut saved = 0;
        let mut first_error = None;
        for (document_id, doc) in dirty {
            let persisted = {
                let mut doc = doc.write();
                doc.dirty = false;
                doc.persisted()
            };
            match self.backend.save(&persisted) {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!("Failed to save document {}: {}", document_id, e);
                    doc.write().dirty = true;
                    first_error.get_or_insert(e);
                }
            }
        }

        self.backend.flush()?;
        match first_error {
            Some(e) => Err(e),
            None => Ok(saved),
        }
    }

    /// Generate a fresh 16-hex-character document id
    pub fn generate_document_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
    }
}
