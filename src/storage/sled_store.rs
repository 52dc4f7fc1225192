//! Sled-based persistence for document content.
//!
//! Content lives in the `documents` tree as raw UTF-8, keyed by document id.
//! Metadata is bincode-encoded in the `metadata` tree under the same key.
//! Both are written in one transaction so a crash never leaves a document
//! without its metadata.

use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use std::path::Path;
use std::sync::Arc;

use super::{
    DocumentBackend, DocumentMetadata, PersistedDocument, StorageConfig, StorageError,
    StorageResult,
};

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_METADATA: &str = "metadata";

/// Sled-backed document persistence
#[derive(Clone)]
pub struct SledBackend {
    db: Arc<Db>,
    documents: Tree,
    metadata: Tree,
}

impl SledBackend {
    /// Open or create a store at the configured path
    pub fn open(config: &StorageConfig) -> StorageResult<Self> {
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
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            metadata,
        })
    }

    fn decode_metadata(bytes: &[u8]) -> StorageResult<DocumentMetadata> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Approximate disk usage, for health reporting
    pub fn size_on_disk(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }
}

impl DocumentBackend for SledBackend {
    fn load(&self, document_id: &str) -> StorageResult<Option<PersistedDocument>> {
        let key = document_id.as_bytes();
        let Some(raw) = self.documents.get(key)? else {
            return Ok(None);
        };

        let content = String::from_utf8(raw.to_vec())
            .map_err(|_| StorageError::Corruption(document_id.to_string()))?;
        let metadata = match self.metadata.get(key)? {
            Some(bytes) => Self::decode_metadata(&bytes)?,
            // Content without metadata: rebuild it rather than lose the text
            None => DocumentMetadata::new(document_id, &content),
        };

        Ok(Some(PersistedDocument { metadata, content }))
    }

    fn save(&self, document: &PersistedDocument) -> StorageResult<()> {
        let key = document.metadata.document_id.as_bytes();
        let meta_bytes = bincode::serialize(&document.metadata)?;

        (&self.documents, &self.metadata)
            .transaction(|(documents, metadata)| {
                documents.insert(key, document.content.as_bytes())?;
                metadata.insert(key, meta_bytes.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::Sled(e),
                TransactionError::Abort(()) => {
                    StorageError::Corruption(document.metadata.document_id.clone())
                }
            })
    }

    fn exists(&self, document_id: &str) -> StorageResult<bool> {
        Ok(self.documents.contains_key(document_id.as_bytes())?)
    }

    fn list(&self) -> StorageResult<Vec<DocumentMetadata>> {
        let mut docs = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            docs.push(Self::decode_metadata(&value)?);
        }
        Ok(docs)
    }

    fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for SledBackend {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn persisted(id: &str, content: &str) -> PersistedDocument {
        PersistedDocument {
            metadata: DocumentMetadata::new(id, content),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_document_save_load() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let backend = SledBackend::open(&config).unwrap();

        backend.save(&persisted("doc-1", "Hello\nWorld\n!!!")).unwrap();
        let loaded = backend.load("doc-1").unwrap().unwrap();

        assert_eq!(loaded.content, "Hello\nWorld\n!!!");
        assert_eq!(loaded.metadata.size_chars, 15);
        assert!(backend.exists("doc-1").unwrap());
    }

    #[test]
    fn test_document_not_found() {
        let dir = tempdir().unwrap();
        let config = StorageConfig::new(dir.path().join("test.sled").to_string_lossy().to_string());
        let backend = SledBackend::open(&config).unwrap();

        assert!(backend.load("nonexistent").unwrap().is_none());
        assert!(!backend.exists("nonexistent").unwrap());
    }

    #[test]
    fn test_list_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sled").to_string_lossy().to_string();

        {
            let backend = SledBackend::open(&StorageConfig::new(path.clone())).unwrap();
            backend.save(&persisted("a", "first")).unwrap();
            let mut doc = persisted("b", "second");
            doc.metadata.touch("second!");
            doc.content = "second!".to_string();
            backend.save(&doc).unwrap();
            backend.flush().unwrap();
        }

        let backend = SledBackend::open(&StorageConfig::new(path)).unwrap();
        let mut listed = backend.list().unwrap();
        listed.sort_by(|a, b| a.document_id.cmp(&b.document_id));

        assert_eq!(listed.len(), 2);
        assert_eq!(listed[1].document_id, "b");
        assert_eq!(listed[1].version, 1);
        assert_eq!(backend.load("b").unwrap().unwrap().content, "second!");
    }
}
