//! Session registry: document id -> room.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::{JoinOutcome, LeaveOutcome, Room, RoomError};
use crate::storage::DocumentStore;

/// Tracks which clients are in which document's room
pub struct SessionRegistry {
    rooms: DashMap<String, Room>,
    store: Arc<DocumentStore>,
}

impl SessionRegistry {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self {
            rooms: DashMap::new(),
            store,
        }
    }

    /// Add a client to a document's room.
    ///
    /// Joining twice is not an error; the outcome reports that nothing changed.
    pub fn join(&self, document_id: &str, client_id: &str) -> Result<JoinOutcome, RoomError> {
        if !self.store.exists(document_id)? {
            return Err(RoomError::DocumentNotFound(document_id.to_string()));
        }

        let mut room = self.rooms.entry(document_id.to_string()).or_insert_with(|| {
            info!("Opened room for document {}", document_id);
            Room::new(document_id)
        });
        let newly_joined = room.insert(client_id);

        debug!(
            "Client {} joined {} ({} members)",
            client_id,
            document_id,
            room.len()
        );
        Ok(JoinOutcome {
            newly_joined,
            member_count: room.len(),
        })
    }

    /// Remove a client from a room. Leaving a room one is not in is a no-op.
    pub fn leave(&self, document_id: &str, client_id: &str) -> LeaveOutcome {
        let outcome = match self.rooms.get_mut(document_id) {
            Some(mut room) => LeaveOutcome {
                was_member: room.remove(client_id),
                remaining: room.len(),
            },
            None => {
                return LeaveOutcome {
                    was_member: false,
                    remaining: 0,
                }
            }
        };

        if outcome.remaining == 0
            && self
                .rooms
                .remove_if(document_id, |_, room| room.is_empty())
                .is_some()
        {
            info!("Closed empty room for document {}", document_id);
        }

        outcome
    }

    /// Every member of the room except `client_id`
    pub fn members_except(&self, document_id: &str, client_id: &str) -> Vec<String> {
        self.rooms
            .get(document_id)
            .map(|room| {
                room.members()
                    .filter(|member| *member != client_id)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn members(&self, document_id: &str) -> Vec<String> {
        self.rooms
            .get(document_id)
            .map(|room| room.members().map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn member_count(&self, document_id: &str) -> usize {
        self.rooms.get(document_id).map_or(0, |room| room.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn total_members(&self) -> usize {
        self.rooms.iter().map(|room| room.len()).sum()
    }
}
