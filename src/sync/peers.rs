//! Live client connections.
//!
//! Each connection owns an unbounded channel; the socket task drains it.
//! Sending never blocks, so delivery can happen while a document's critical
//! section is held.

use dashmap::DashMap;
use std::collections::HashSet;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::protocol::ServerMessage;
use super::{ClientId, DocumentId, SyncError};

/// Where the coordinator sends outbound messages
pub trait Outbox: Send + Sync {
    /// Queue a message for one client. False if the client is gone.
    fn deliver(&self, client_id: &str, msg: ServerMessage) -> bool;
}

/// A single client connection
pub struct PeerConnection {
    pub client_id: ClientId,
    /// Channel to send messages to this client
    tx: mpsc::UnboundedSender<ServerMessage>,
    /// Documents this client has joined
    joined_documents: HashSet<DocumentId>,
}

impl PeerConnection {
    pub fn new(client_id: impl Into<String>, tx: mpsc::UnboundedSender<ServerMessage>) -> Self {
        Self {
            client_id: client_id.into(),
            tx,
            joined_documents: HashSet::new(),
        }
    }

    /// Send a message to this client
    pub fn send(&self, msg: ServerMessage) -> Result<(), SyncError> {
        self.tx
            .send(msg)
            .map_err(|_| SyncError::Connection("Channel closed".to_string()))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// All connected clients
#[derive(Default)]
pub struct PeerDirectory {
    peers: DashMap<ClientId, PeerConnection>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client_id: &str, tx: mpsc::UnboundedSender<ServerMessage>) {
        self.peers
            .insert(client_id.to_string(), PeerConnection::new(client_id, tx));
        info!("Client connected: {}", client_id);
    }

    /// Drop a connection, returning the documents it had joined
    pub fn unregister(&self, client_id: &str) -> Vec<DocumentId> {
        match self.peers.remove(client_id) {
            Some((_, peer)) => {
                info!("Client disconnected: {}", peer.client_id);
                peer.joined_documents.into_iter().collect()
            }
            None => Vec::new(),
        }
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.peers.contains_key(client_id)
    }

    pub fn mark_joined(&self, client_id: &str, document_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(client_id) {
            peer.joined_documents.insert(document_id.to_string());
        }
    }

    pub fn mark_left(&self, client_id: &str, document_id: &str) {
        if let Some(mut peer) = self.peers.get_mut(client_id) {
            peer.joined_documents.remove(document_id);
        }
    }

    /// Clients whose socket task has gone away without disconnecting
    pub fn closed_clients(&self) -> Vec<ClientId> {
        let closed: Vec<ClientId> = self
            .peers
            .iter()
            .filter(|entry| entry.is_closed())
            .map(|entry| entry.key().clone())
            .collect();
        if !closed.is_empty() {
            debug!("Found {} closed connections", closed.len());
        }
        closed
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl Outbox for PeerDirectory {
    fn deliver(&self, client_id: &str, msg: ServerMessage) -> bool {
        match self.peers.get(client_id) {
            Some(peer) => peer.send(msg).is_ok(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pong() -> ServerMessage {
        ServerMessage::Pong {
            timestamp: 1,
            server_time: 2,
        }
    }

    #[test]
    fn test_register_and_deliver() {
        let peers = PeerDirectory::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        peers.register("client-1", tx);

        assert!(peers.contains("client-1"));
        assert!(peers.deliver("client-1", pong()));
        assert_eq!(rx.try_recv().unwrap(), pong());

        assert!(!peers.deliver("client-2", pong()));
    }

    #[test]
    fn test_joined_documents_tracking() {
        let peers = PeerDirectory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        peers.register("client-1", tx);

        peers.mark_joined("client-1", "a");
        peers.mark_joined("client-1", "b");
        peers.mark_left("client-1", "a");

        let left = peers.unregister("client-1");
        assert_eq!(left, vec!["b"]);
        assert!(peers.is_empty());
        assert!(peers.unregister("client-1").is_empty());
    }

    #[test]
    fn test_closed_clients() {
        let peers = PeerDirectory::new();
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        peers.register("gone", tx1);
        peers.register("here", tx2);

        drop(rx1);
        assert_eq!(peers.closed_clients(), vec!["gone"]);
        assert!(!peers.deliver("gone", pong()));
    }
}
