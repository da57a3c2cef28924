//! Error types for the topology directory and its backing store.

use std::fmt;

use thiserror::Error;

/// Result type alias for directory operations.
pub type TopologyResult<T> = Result<T, TopologyError>;

/// The entity kinds held by the directory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A logical pool.
    LogicalPool,
    /// A physical pool.
    PhysicalPool,
    /// A zone.
    Zone,
    /// A server.
    Server,
    /// A chunkserver.
    ChunkServer,
    /// A copyset.
    CopySet,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::LogicalPool => "logical pool",
            EntityKind::PhysicalPool => "physical pool",
            EntityKind::Zone => "zone",
            EntityKind::Server => "server",
            EntityKind::ChunkServer => "chunkserver",
            EntityKind::CopySet => "copyset",
        };
        f.write_str(name)
    }
}

/// Failures of the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A lower-level I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// Persisted data is damaged.
    #[error("corrupt store: {0}")]
    Corrupt(String),

    /// The store refused the write.
    #[error("store rejected write: {0}")]
    Rejected(String),

    /// Another handle already owns the store directory.
    #[error("store directory {0} is locked by another process")]
    Locked(String),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

/// Error variants for directory operations.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// No live entity has the given id or key.
    #[error("{kind} {key} not found")]
    NotFound {
        /// Kind of the missing entity.
        kind: EntityKind,
        /// Id or natural key that was looked up.
        key: String,
    },

    /// The id or a unique key is already taken by another live entity.
    #[error("{kind} {key} already exists")]
    AlreadyExists {
        /// Kind of the conflicting entity.
        kind: EntityKind,
        /// Conflicting id or natural key.
        key: String,
    },

    /// Removal refused because child entities still reference the target.
    #[error("{kind} {key} still has dependents")]
    HasDependents {
        /// Kind of the entity being removed.
        kind: EntityKind,
        /// Id of the entity being removed.
        key: String,
    },

    /// The record names a parent that does not exist.
    #[error("{kind} {key} references missing {parent}")]
    InvalidReference {
        /// Kind of the record being written.
        kind: EntityKind,
        /// Id of the record being written.
        key: String,
        /// Description of the missing parent, e.g. "zone 4".
        parent: String,
    },

    /// The durable store failed; in-memory state matches storage.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),

    /// The persisted snapshot could not be loaded consistently.
    #[error("initialization failed: {0}")]
    Initialization(String),
}

impl TopologyError {
    pub(crate) fn not_found(kind: EntityKind, key: impl fmt::Display) -> Self {
        TopologyError::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    pub(crate) fn already_exists(kind: EntityKind, key: impl fmt::Display) -> Self {
        TopologyError::AlreadyExists {
            kind,
            key: key.to_string(),
        }
    }

    pub(crate) fn has_dependents(kind: EntityKind, key: impl fmt::Display) -> Self {
        TopologyError::HasDependents {
            kind,
            key: key.to_string(),
        }
    }

    pub(crate) fn invalid_reference(
        kind: EntityKind,
        key: impl fmt::Display,
        parent_kind: EntityKind,
        parent: impl fmt::Display,
    ) -> Self {
        TopologyError::InvalidReference {
            kind,
            key: key.to_string(),
            parent: format!("{} {}", parent_kind, parent),
        }
    }

    /// True for failures a caller may retry unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TopologyError::Storage(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display() {
        let err = TopologyError::not_found(EntityKind::Zone, 42);
        assert_eq!(format!("{}", err), "zone 42 not found");
    }

    #[test]
    fn test_invalid_reference_display() {
        let err = TopologyError::invalid_reference(
            EntityKind::Server,
            7,
            EntityKind::Zone,
            3,
        );
        assert_eq!(format!("{}", err), "server 7 references missing zone 3");
    }

    #[test]
    fn test_only_storage_is_retryable() {
        let storage = TopologyError::from(StoreError::Rejected("full".to_string()));
        assert!(storage.is_retryable());
        assert_eq!(format!("{}", storage), "storage failure: store rejected write: full");
        assert!(!TopologyError::has_dependents(EntityKind::Zone, 1).is_retryable());
        assert!(!TopologyError::Initialization("x".to_string()).is_retryable());
    }
}
