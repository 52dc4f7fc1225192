//! In-memory backend for tests and ephemeral servers.

use parking_lot::RwLock;
use std::collections::HashMap;

use super::{DocumentBackend, DocumentMetadata, PersistedDocument, StorageResult};

/// Keeps persisted documents in a map; everything is lost on drop.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    docs: RwLock<HashMap<String, PersistedDocument>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DocumentBackend for MemoryBackend {
    fn load(&self, document_id: &str) -> StorageResult<Option<PersistedDocument>> {
        Ok(self.docs.read().get(document_id).cloned())
    }

    fn save(&self, document: &PersistedDocument) -> StorageResult<()> {
        self.docs
            .write()
            .insert(document.metadata.document_id.clone(), document.clone());
        Ok(())
    }

    fn exists(&self, document_id: &str) -> StorageResult<bool> {
        Ok(self.docs.read().contains_key(document_id))
    }

    fn list(&self) -> StorageResult<Vec<DocumentMetadata>> {
        Ok(self
            .docs
            .read()
            .values()
            .map(|doc| doc.metadata.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_load() {
        let backend = MemoryBackend::new();
        assert!(backend.list().unwrap().is_empty());

        let doc = PersistedDocument {
            metadata: DocumentMetadata::new("x", "abc"),
            content: "abc".to_string(),
        };
        backend.save(&doc).unwrap();

        assert!(backend.exists("x").unwrap());
        assert_eq!(backend.load("x").unwrap(), Some(doc));
        assert_eq!(backend.list().unwrap().len(), 1);
        assert!(backend.load("y").unwrap().is_none());
    }
}
