//! Room membership.
//!
//! A room is the set of clients subscribed to one document's broadcasts.
//! Rooms are created by the first join and dropped when the last member
//! leaves.

mod registry;

pub use registry::SessionRegistry;

use std::collections::HashSet;
use thiserror::Error;

use crate::storage::StorageError;

/// Errors from membership operations
#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Clients currently subscribed to one document
#[derive(Debug, Clone)]
pub struct Room {
    pub document_id: String,
    members: HashSet<String>,
}

impl Room {
    pub fn new(document_id: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            members: HashSet::new(),
        }
    }

    /// Add a member; false if it was already present
    pub fn insert(&mut self, client_id: &str) -> bool {
        self.members.insert(client_id.to_string())
    }

    /// Remove a member; false if it was not present
    pub fn remove(&mut self, client_id: &str) -> bool {
        self.members.remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }
}

/// Result of a join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinOutcome {
    /// False when the client was already a member
    pub newly_joined: bool,
    pub member_count: usize,
}

/// Result of a leave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// False when the client was not a member
    pub was_member: bool,
    pub remaining: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_membership() {
        let mut room = Room::new("doc");
        assert!(room.is_empty());

        assert!(room.insert("a"));
        assert!(!room.insert("a"));
        assert!(room.insert("b"));
        assert_eq!(room.len(), 2);

        assert!(room.remove("a"));
        assert!(!room.remove("a"));
        assert_eq!(room.members().collect::<Vec<_>>(), vec!["b"]);
    }
}
