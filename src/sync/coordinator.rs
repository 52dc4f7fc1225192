//! SyncCoordinator: serializes edits per document and fans them out.
//!
//! Every document has its own async mutex (its critical section). Patch
//! application, joins and snapshot requests for a document run under it, so
//! each member observes snapshots and patches in the order the section
//! admitted them. Documents never share a section, so unrelated documents
//! make progress independently and no task ever holds two sections.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use super::patch::{Patch, PatchCodec};
use super::peers::Outbox;
use super::protocol::ServerMessage;
use super::{DocumentId, SyncConfig, SyncError, SyncResult};
use crate::room::{JoinOutcome, LeaveOutcome, SessionRegistry};
use crate::storage::{DocumentSnapshot, DocumentStore};

/// Attempts at finding an unused generated id before giving up
const ID_ATTEMPTS: usize = 8;

/// The orchestration core
pub struct SyncCoordinator {
    config: SyncConfig,
    store: Arc<DocumentStore>,
    registry: SessionRegistry,
    outbox: Arc<dyn Outbox>,
    codec: PatchCodec,
    /// Per-document critical sections
    sections: DashMap<DocumentId, Arc<Mutex<()>>>,
    patches_applied: AtomicU64,
    patches_rejected: AtomicU64,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncCoordinator {
    pub fn new(store: Arc<DocumentStore>, outbox: Arc<dyn Outbox>, config: SyncConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            codec: PatchCodec::new(config.codec.clone()),
            registry: SessionRegistry::new(store.clone()),
            config,
            store,
            outbox,
            sections: DashMap::new(),
            patches_applied: AtomicU64::new(0),
            patches_rejected: AtomicU64::new(0),
            started_at: Instant::now(),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DocumentStore> {
        &self.store
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn codec(&self) -> &PatchCodec {
        &self.codec
    }

    pub(super) fn section(&self, document_id: &str) -> Arc<Mutex<()>> {
        self.sections
            .entry(document_id.to_string())
            .or_default()
            .clone()
    }

    /// Create a document under the given id
    pub fn submit_create(&self, document_id: &str, content: &str) -> SyncResult<DocumentSnapshot> {
        if document_id.is_empty() {
            return Err(SyncError::InvalidInput("document id is empty".to_string()));
        }
        Ok(self.store.create(document_id, content)?)
    }

    /// Create a document under a freshly generated id
    pub fn create_document(&self, content: &str) -> SyncResult<DocumentSnapshot> {
        for _ in 0..ID_ATTEMPTS {
            let document_id = DocumentStore::generate_document_id();
            match self.store.create(&document_id, content) {
                Err(crate::storage::StorageError::AlreadyExists(_)) => {
                    warn!("Generated document id {} already taken", document_id);
                }
                other => return Ok(other?),
            }
        }
        Err(SyncError::Storage(crate::storage::StorageError::InitFailed(
            "could not allocate a document id".to_string(),
        )))
    }

    /// Apply a client's patch to a document and relay it to the rest of the room.
    ///
    /// On success the other members receive the patch text verbatim and the
    /// sender receives an acknowledgement carrying the new version. On failure
    /// nothing is written and nothing is sent; the caller reports the error.
    pub async fn submit_patch(
        &self,
        document_id: &str,
        client_id: &str,
        patch_text: &str,
        base_version: Option<u64>,
    ) -> SyncResult<u64> {
        let patch = Patch::from_text(patch_text)
            .map_err(|e| SyncError::InvalidInput(e.to_string()))?;

        if !self.store.exists(document_id)? {
            return Err(SyncError::NotFound(document_id.to_string()));
        }

        let section = self.section(document_id);
        let _guard = section.lock().await;

        let current = self.store.read(document_id)?;

        if self.config.strict_versioning {
            match base_version {
                Some(base) if base == current.version => {}
                Some(base) => {
                    self.patches_rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(SyncError::PatchConflict {
                        document_id: document_id.to_string(),
                        reason: format!(
                            "patch is based on version {}, document is at {}",
                            base, current.version
                        ),
                    });
                }
                None => {
                    return Err(SyncError::InvalidInput(
                        "base_version is required".to_string(),
                    ))
                }
            }
        }

        let updated = match self.codec.apply(&patch, &current.content) {
            Ok(text) => text,
            Err(e) => {
                self.patches_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Rejected patch from {} on {}: {}",
                    client_id, document_id, e
                );
                return Err(SyncError::PatchConflict {
                    document_id: document_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let version = self.store.write(document_id, updated)?;
        self.patches_applied.fetch_add(1, Ordering::Relaxed);

        let recipients = self.registry.members_except(document_id, client_id);
        for member in &recipients {
            self.outbox.deliver(
                member,
                ServerMessage::PatchBroadcast {
                    document_id: document_id.to_string(),
                    patch: patch_text.to_string(),
                    from_client: client_id.to_string(),
                    version,
                },
            );
        }
        self.outbox.deliver(
            client_id,
            ServerMessage::PatchAccepted {
                document_id: document_id.to_string(),
                version,
            },
        );

        debug!(
            "Applied patch from {} on {} (v{}, {} recipients)",
            client_id,
            document_id,
            version,
            recipients.len()
        );
        Ok(version)
    }

    /// Add a client to a document's room and send it the current content.
    pub async fn join(&self, document_id: &str, client_id: &str) -> SyncResult<JoinOutcome> {
        let section = self.section(document_id);
        let _guard = section.lock().await;

        let outcome = self.registry.join(document_id, client_id)?;
        self.deliver_snapshot(document_id, client_id)?;

        info!("Client {} joined document {}", client_id, document_id);
        Ok(outcome)
    }

    /// Send a fresh snapshot to a client
    pub async fn send_snapshot(&self, document_id: &str, client_id: &str) -> SyncResult<()> {
        let section = self.section(document_id);
        let _guard = section.lock().await;
        self.deliver_snapshot(document_id, client_id)
    }

    fn deliver_snapshot(&self, document_id: &str, client_id: &str) -> SyncResult<()> {
        let snapshot = self.store.read(document_id)?;
        self.outbox.deliver(
            client_id,
            ServerMessage::Snapshot {
                document_id: snapshot.document_id,
                content: snapshot.content,
                version: snapshot.version,
            },
        );
        Ok(())
    }

    /// Remove a client from a room. Not being a member is not an error.
    pub fn leave(&self, document_id: &str, client_id: &str) -> LeaveOutcome {
        let outcome = self.registry.leave(document_id, client_id);
        if outcome.was_member {
            info!("Client {} left document {}", client_id, document_id);
        }
        outcome
    }

    pub fn snapshot(&self, document_id: &str) -> SyncResult<DocumentSnapshot> {
        Ok(self.store.read(document_id)?)
    }

    /// Save dirty documents to storage
    pub fn save_dirty_documents(&self) -> usize {
        match self.store.flush_dirty() {
            Ok(saved) => saved,
            Err(e) => {
                error!("Failed to save documents: {}", e);
                0
            }
        }
    }

    /// Drop critical sections nobody is using
    pub fn prune_sections(&self) {
        let before = self.sections.len();
        self.sections
            .retain(|_, section| Arc::strong_count(section) > 1);
        let pruned = before.saturating_sub(self.sections.len());
        if pruned > 0 {
            debug!("Pruned {} idle document sections", pruned);
        }
    }

    /// Get a shutdown receiver
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Initiate graceful shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Get server statistics
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            cached_documents: self.store.cached_count(),
            dirty_documents: self.store.dirty_count(),
            active_rooms: self.registry.room_count(),
            members_in_rooms: self.registry.total_members(),
            patches_applied: self.patches_applied.load(Ordering::Relaxed),
            patches_rejected: self.patches_rejected.load(Ordering::Relaxed),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }
}

/// Server statistics
#[derive(Debug, Clone, Serialize)]
pub struct ServerStats {
    pub cached_documents: usize,
    pub dirty_documents: usize,
    pub active_rooms: usize,
    pub members_in_rooms: usize,
    pub patches_applied: u64,
    pub patches_rejected: u64,
    pub uptime_seconds: u64,
}
