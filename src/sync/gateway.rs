//! ConnectionGateway: the boundary between sockets and the coordinator.
//!
//! Each decoded [`ClientMessage`] goes through [`ConnectionGateway::handle`],
//! which dispatches it to one handler. Handlers talk to the coordinator and
//! queue outbound messages through the peer directory; errors become an
//! `Error` message for the sender alone.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::coordinator::SyncCoordinator;
use super::peers::{Outbox, PeerDirectory};
use super::protocol::{ClientMessage, MembershipChange, ServerMessage, PROTOCOL_VERSION};
use super::{SyncConfig, SyncResult};
use crate::storage::DocumentStore;

pub struct ConnectionGateway {
    coordinator: Arc<SyncCoordinator>,
    peers: Arc<PeerDirectory>,
}

impl ConnectionGateway {
    pub fn new(store: Arc<DocumentStore>, config: SyncConfig) -> Self {
        let peers = Arc::new(PeerDirectory::new());
        let coordinator = Arc::new(SyncCoordinator::new(store, peers.clone(), config));
        Self { coordinator, peers }
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    pub fn connected_clients(&self) -> usize {
        self.peers.len()
    }

    /// Register a connection and greet it. Returns the assigned client id.
    pub fn connect(&self, tx: mpsc::UnboundedSender<ServerMessage>) -> String {
        let client_id = uuid::Uuid::new_v4().to_string();
        self.peers.register(&client_id, tx);
        self.peers.deliver(
            &client_id,
            ServerMessage::Welcome {
                protocol_version: PROTOCOL_VERSION,
                client_id: client_id.clone(),
                server_time: chrono::Utc::now().timestamp_millis(),
            },
        );
        client_id
    }

    /// Drop a connection and leave every room it was in.
    ///
    /// A patch this client has in flight still completes.
    pub fn disconnect(&self, client_id: &str) {
        for document_id in self.peers.unregister(client_id) {
            self.leave_room(&document_id, client_id);
        }
    }

    /// Dispatch one client message
    pub async fn handle(&self, client_id: &str, msg: ClientMessage) {
        if !self.peers.contains(client_id) {
            debug!("Dropping message from disconnected client {}", client_id);
            return;
        }
        let document_id = msg.document_id().map(str::to_string);

        let result = match msg {
            ClientMessage::Join { document_id } => self.on_join(client_id, &document_id).await,
            ClientMessage::Leave { document_id } => self.on_leave(client_id, &document_id),
            ClientMessage::SubmitPatch {
                document_id,
                patch,
                base_version,
            } => self
                .coordinator
                .submit_patch(&document_id, client_id, &patch, base_version)
                .await
                .map(|_| ()),
            ClientMessage::RequestSnapshot { document_id } => {
                self.coordinator.send_snapshot(&document_id, client_id).await
            }
            ClientMessage::Ping { timestamp } => {
                self.peers.deliver(
                    client_id,
                    ServerMessage::Pong {
                        timestamp,
                        server_time: chrono::Utc::now().timestamp_millis(),
                    },
                );
                Ok(())
            }
        };

        if let Err(e) = result {
            debug!("Request from {} failed: {}", client_id, e);
            self.peers.deliver(
                client_id,
                ServerMessage::error(e.code(), e.to_string(), document_id),
            );
        }
    }

    /// Report a frame that could not be decoded
    pub fn reject_frame(&self, client_id: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!("Invalid message from {}: {}", client_id, reason);
        self.peers.deliver(
            client_id,
            ServerMessage::error(super::protocol::ErrorCode::InvalidInput, reason, None),
        );
    }

    async fn on_join(&self, client_id: &str, document_id: &str) -> SyncResult<()> {
        let outcome = self.coordinator.join(document_id, client_id).await?;
        self.peers.mark_joined(client_id, document_id);

        // Disconnected while the join was queued
        if !self.peers.contains(client_id) {
            self.leave_room(document_id, client_id);
            return Ok(());
        }

        if outcome.newly_joined {
            self.notify_room(
                document_id,
                client_id,
                MembershipChange::Joined,
                outcome.member_count,
            );
        }
        Ok(())
    }

    fn on_leave(&self, client_id: &str, document_id: &str) -> SyncResult<()> {
        self.peers.mark_left(client_id, document_id);
        self.leave_room(document_id, client_id);
        self.peers.deliver(
            client_id,
            ServerMessage::Left {
                document_id: document_id.to_string(),
            },
        );
        Ok(())
    }

    fn leave_room(&self, document_id: &str, client_id: &str) {
        let outcome = self.coordinator.leave(document_id, client_id);
        if outcome.was_member {
            self.notify_room(
                document_id,
                client_id,
                MembershipChange::Left,
                outcome.remaining,
            );
        }
    }

    fn notify_room(
        &self,
        document_id: &str,
        client_id: &str,
        change: MembershipChange,
        member_count: usize,
    ) {
        for member in self
            .coordinator
            .registry()
            .members_except(document_id, client_id)
        {
            self.peers.deliver(
                &member,
                ServerMessage::MembershipChanged {
                    document_id: document_id.to_string(),
                    client_id: client_id.to_string(),
                    change,
                    member_count,
                },
            );
        }
    }

    /// Disconnect clients whose socket task is gone
    pub fn reap_closed_connections(&self) -> usize {
        let closed = self.peers.closed_clients();
        for client_id in &closed {
            warn!("Removing dead connection: {}", client_id);
            self.disconnect(client_id);
        }
        closed.len()
    }

    /// Start background tasks (save loop, cleanup loop)
    pub fn start_background_tasks(self: Arc<Self>) -> BackgroundTaskHandles {
        let gateway = self.clone();
        let save_interval = gateway.coordinator.config().save_interval;
        let mut shutdown = gateway.coordinator.shutdown_receiver();

        // Save task
        let save_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(save_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let saved = gateway.coordinator.save_dirty_documents();
                        if saved > 0 {
                            debug!("Auto-saved {} documents", saved);
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("Save task shutting down");
                        // Final save
                        let saved = gateway.coordinator.save_dirty_documents();
                        info!("Saved {} documents on shutdown", saved);
                        break;
                    }
                }
            }
        });

        let gateway = self;
        let cleanup_interval = gateway.coordinator.config().cleanup_interval;
        let mut shutdown = gateway.coordinator.shutdown_receiver();

        // Cleanup task
        let cleanup_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        gateway.reap_closed_connections();
                        gateway.coordinator.prune_sections();
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        });

        BackgroundTaskHandles {
            save_task: save_handle,
            cleanup_task: cleanup_handle,
        }
    }
}

/// Handles for background tasks
pub struct BackgroundTaskHandles {
    pub save_task: tokio::task::JoinHandle<()>,
    pub cleanup_task: tokio::task::JoinHandle<()>,
}

impl BackgroundTaskHandles {
    /// Wait for all tasks to complete, giving up after `timeout`
    pub async fn wait(self, timeout: Duration) {
        let joined = async {
            let _ = tokio::join!(self.save_task, self.cleanup_task);
        };
        if tokio::time::timeout(timeout, joined).await.is_err() {
            warn!("Background tasks did not stop within {:?}", timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::patch::Patch;
    use crate::sync::protocol::ErrorCode;
    use tokio::sync::mpsc::UnboundedReceiver;

    const BASE: &str = "Hello\nWorld\n!!!";
    const DOC: &str = "1a2b3c4d5e6f7890";

    fn gateway() -> Arc<ConnectionGateway> {
        let store = Arc::new(DocumentStore::in_memory());
        store.create(DOC, BASE).unwrap();
        Arc::new(ConnectionGateway::new(store, SyncConfig::default()))
    }

    /// Connect a client and swallow its welcome
    fn client(gateway: &ConnectionGateway) -> (String, UnboundedReceiver<ServerMessage>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = gateway.connect(tx);
        assert!(matches!(
            rx.try_recv(),
            Ok(ServerMessage::Welcome { ref client_id, .. }) if *client_id == id
        ));
        (id, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut msgs = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            msgs.push(msg);
        }
        msgs
    }

    fn join(document_id: &str) -> ClientMessage {
        ClientMessage::Join {
            document_id: document_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_then_read() {
        let gateway = gateway();
        let created = gateway.coordinator().create_document(BASE).unwrap();

        assert_ne!(created.document_id, DOC);
        assert_eq!(
            gateway.coordinator().snapshot(&created.document_id).unwrap().content,
            BASE
        );
    }

    #[tokio::test]
    async fn test_join_delivers_snapshot() {
        let gateway = gateway();
        let (a, mut rx_a) = client(&gateway);

        gateway.handle(&a, join(DOC)).await;

        assert_eq!(
            drain(&mut rx_a),
            vec![ServerMessage::Snapshot {
                document_id: DOC.to_string(),
                content: BASE.to_string(),
                version: 0,
            }]
        );
        assert_eq!(gateway.coordinator().registry().member_count(DOC), 1);
    }

    #[tokio::test]
    async fn test_join_twice_resends_snapshot() {
        let gateway = gateway();
        let (a, mut rx_a) = client(&gateway);
        let (b, mut rx_b) = client(&gateway);
        gateway.handle(&b, join(DOC)).await;
        gateway.handle(&a, join(DOC)).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        gateway.handle(&a, join(DOC)).await;

        let msgs = drain(&mut rx_a);
        assert_eq!(msgs.len(), 1);
        assert!(matches!(msgs[0], ServerMessage::Snapshot { .. }));
        assert_eq!(gateway.coordinator().registry().member_count(DOC), 2);
        // No second membership notification
        assert!(drain(&mut rx_b).is_empty());
    }

    #[tokio::test]
    async fn test_patch_reaches_other_members_only() {
        let gateway = gateway();
        let (a, mut rx_a) = client(&gateway);
        let (b, mut rx_b) = client(&gateway);
        gateway.handle(&a, join(DOC)).await;
        gateway.handle(&b, join(DOC)).await;

        let msgs = drain(&mut rx_a);
        assert!(matches!(
            msgs.last(),
            Some(ServerMessage::MembershipChanged {
                change: MembershipChange::Joined,
                member_count: 2,
                ..
            })
        ));
        drain(&mut rx_b);

        let codec = gateway.coordinator().codec().clone();
        let patch = codec.patch_between(BASE, "Howdy\nWorld\n!!!").to_text();
        gateway
            .handle(
                &a,
                ClientMessage::SubmitPatch {
                    document_id: DOC.to_string(),
                    patch: patch.clone(),
                    base_version: Some(0),
                },
            )
            .await;

        // B rebuilds the new content from the broadcast
        let to_b = drain(&mut rx_b);
        assert_eq!(to_b.len(), 1);
        let ServerMessage::PatchBroadcast {
            patch: relayed,
            from_client,
            ..
        } = &to_b[0]
        else {
            panic!("Expected PatchBroadcast, got {:?}", to_b[0]);
        };
        assert_eq!(from_client, &a);
        let local = codec.apply(&Patch::from_text(relayed).unwrap(), BASE).unwrap();
        assert_eq!(local, "Howdy\nWorld\n!!!");

        // A only gets its acknowledgement
        let to_a = drain(&mut rx_a);
        assert_eq!(
            to_a,
            vec![ServerMessage::PatchAccepted {
                document_id: DOC.to_string(),
                version: 1,
            }]
        );
    }

    #[tokio::test]
    async fn test_leave_notifies_and_stops_broadcasts() {
        let gateway = gateway();
        let (a, mut rx_a) = client(&gateway);
        let (b, mut rx_b) = client(&gateway);
        gateway.handle(&a, join(DOC)).await;
        gateway.handle(&b, join(DOC)).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        gateway
            .handle(
                &a,
                ClientMessage::Leave {
                    document_id: DOC.to_string(),
                },
            )
            .await;

        assert_eq!(
            drain(&mut rx_a),
            vec![ServerMessage::Left {
                document_id: DOC.to_string()
            }]
        );
        assert_eq!(
            drain(&mut rx_b),
            vec![ServerMessage::MembershipChanged {
                document_id: DOC.to_string(),
                client_id: a.clone(),
                change: MembershipChange::Left,
                member_count: 1,
            }]
        );

        let patch = gateway
            .coordinator()
            .codec()
            .patch_between(BASE, "Hello\nWorld\n???")
            .to_text();
        gateway
            .handle(
                &b,
                ClientMessage::SubmitPatch {
                    document_id: DOC.to_string(),
                    patch,
                    base_version: None,
                },
            )
            .await;
        assert!(drain(&mut rx_a).is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_leaves_all_rooms() {
        let gateway = gateway();
        gateway.coordinator().submit_create("second", "more text").unwrap();
        let (a, _rx_a) = client(&gateway);
        let (b, mut rx_b) = client(&gateway);
        gateway.handle(&a, join(DOC)).await;
        gateway.handle(&a, join("second")).await;
        gateway.handle(&b, join(DOC)).await;
        drain(&mut rx_b);

        gateway.disconnect(&a);

        assert_eq!(gateway.connected_clients(), 1);
        assert_eq!(gateway.coordinator().registry().members(DOC), vec![b.clone()]);
        assert_eq!(gateway.coordinator().registry().member_count("second"), 0);
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerMessage::MembershipChanged {
                change: MembershipChange::Left,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_errors_go_to_sender_only() {
        let gateway = gateway();
        let (a, mut rx_a) = client(&gateway);
        let (b, mut rx_b) = client(&gateway);
        gateway.handle(&b, join(DOC)).await;
        drain(&mut rx_b);

        gateway.handle(&a, join("missing")).await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::Error {
                code: ErrorCode::NotFound,
                document_id: Some(_),
                ..
            }]
        ));

        let stale = gateway
            .coordinator()
            .codec()
            .patch_between("The quick brown fox", "The quick red fox")
            .to_text();
        gateway
            .handle(
                &a,
                ClientMessage::SubmitPatch {
                    document_id: DOC.to_string(),
                    patch: stale,
                    base_version: None,
                },
            )
            .await;
        assert!(matches!(
            drain(&mut rx_a).as_slice(),
            [ServerMessage::Error {
                code: ErrorCode::PatchConflict,
                ..
            }]
        ));
        assert!(drain(&mut rx_b).is_empty());
        assert_eq!(gateway.coordinator().snapshot(DOC).unwrap().content, BASE);
    }

    #[tokio::test]
    async fn test_concurrent_submissions_apply_both() {
        let gateway = gateway();
        let (a, _rx_a) = client(&gateway);
        let (b, _rx_b) = client(&gateway);
        let codec = gateway.coordinator().codec().clone();
        let first = codec.patch_between(BASE, "Howdy\nWorld\n!!!").to_text();
        let second = codec.patch_between(BASE, "Hello\nWorld\n???").to_text();

        let g1 = gateway.clone();
        let g2 = gateway.clone();
        let t1 = tokio::spawn(async move {
            g1.handle(
                &a,
                ClientMessage::SubmitPatch {
                    document_id: DOC.to_string(),
                    patch: first,
                    base_version: Some(0),
                },
            )
            .await
        });
        let t2 = tokio::spawn(async move {
            g2.handle(
                &b,
                ClientMessage::SubmitPatch {
                    document_id: DOC.to_string(),
                    patch: second,
                    base_version: Some(0),
                },
            )
            .await
        });
        t1.await.unwrap();
        t2.await.unwrap();

        let snapshot = gateway.coordinator().snapshot(DOC).unwrap();
        assert_eq!(snapshot.content, "Howdy\nWorld\n???");
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn test_request_snapshot_and_ping() {
        let gateway = gateway();
        let (a, mut rx_a) = client(&gateway);

        gateway
            .handle(
                &a,
                ClientMessage::RequestSnapshot {
                    document_id: DOC.to_string(),
                },
            )
            .await;
        gateway.handle(&a, ClientMessage::Ping { timestamp: 42 }).await;

        let msgs = drain(&mut rx_a);
        assert!(matches!(msgs[0], ServerMessage::Snapshot { version: 0, .. }));
        assert!(matches!(msgs[1], ServerMessage::Pong { timestamp: 42, .. }));
    }

    #[tokio::test]
    async fn test_disconnected_client_cannot_join() {
        let gateway = gateway();
        let (a, _rx_a) = client(&gateway);
        gateway.disconnect(&a);

        gateway.handle(&a, join(DOC)).await;

        assert!(gateway.coordinator().registry().members(DOC).is_empty());
        assert_eq!(gateway.coordinator().registry().room_count(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_during_join_leaves_no_member() {
        let gateway = gateway();
        let (a, _rx_a) = client(&gateway);
        let (b, mut rx_b) = client(&gateway);
        gateway.handle(&b, join(DOC)).await;
        drain(&mut rx_b);

        // Queue a's join behind the document's critical section
        let section = gateway.coordinator().section(DOC);
        let held = section.lock().await;
        let g = gateway.clone();
        let joiner = a.clone();
        let pending = tokio::spawn(async move { g.handle(&joiner, join(DOC)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        gateway.disconnect(&a);
        drop(held);
        pending.await.unwrap();

        assert_eq!(gateway.coordinator().registry().members(DOC), vec![b.clone()]);
        // b only ever sees a leave
        assert!(matches!(
            drain(&mut rx_b).as_slice(),
            [ServerMessage::MembershipChanged {
                change: MembershipChange::Left,
                member_count: 1,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn test_reap_closed_connections() {
        let gateway = gateway();
        let (a, rx_a) = client(&gateway);
        let (b, mut rx_b) = client(&gateway);
        gateway.handle(&a, join(DOC)).await;
        gateway.handle(&b, join(DOC)).await;
        drain(&mut rx_b);

        drop(rx_a);
        assert_eq!(gateway.reap_closed_connections(), 1);
        assert_eq!(gateway.coordinator().registry().member_count(DOC), 1);
        assert_eq!(drain(&mut rx_b).len(), 1);
    }

    #[tokio::test]
    async fn test_background_tasks_final_save() {
        let gateway = gateway();
        let (a, _rx_a) = client(&gateway);
        let patch = gateway
            .coordinator()
            .codec()
            .patch_between(BASE, "Hello\nWorld\n???")
            .to_text();
        gateway
            .handle(
                &a,
                ClientMessage::SubmitPatch {
                    document_id: DOC.to_string(),
                    patch,
                    base_version: None,
                },
            )
            .await;
        assert_eq!(gateway.coordinator().stats().dirty_documents, 1);

        let handles = gateway.clone().start_background_tasks();
        gateway.coordinator().shutdown();
        handles.wait(Duration::from_secs(5)).await;

        assert_eq!(gateway.coordinator().stats().dirty_documents, 0);
    }
}
