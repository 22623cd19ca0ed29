//! Error types for the snapshot validation statistics store
//!
//! Lifecycle and write operations surface these directly; the caller owns any
//! retry/abort decision.

use crate::validation_core::types::SnapshotId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StatsError>;

#[derive(Debug, Error)]
pub enum StatsError {
    /// No open or persisted store exists for the snapshot
    #[error("snapshot {snapshot_id} has no validation data")]
    NotInitialized { snapshot_id: SnapshotId },

    /// Write-time rule set differs from the one registered at initialization
    #[error("rule set mismatch for snapshot {snapshot_id}: {detail}")]
    SchemaMismatch { snapshot_id: SnapshotId, detail: String },

    #[error("storage error while {context}: {source}")]
    StorageIo {
        context: String,
        #[source]
        source: StorageFailure,
    },

    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// Operation not allowed in the snapshot's current lifecycle state
    #[error("snapshot {snapshot_id} is in the wrong state: {detail}")]
    InvalidState { snapshot_id: SnapshotId, detail: String },
}

#[derive(Debug, Error)]
pub enum StorageFailure {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Response class a presentation layer should map an error to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    ServerError,
    ClientError,
    NoStatistics,
}

impl StatsError {
    pub fn storage(context: impl Into<String>, source: impl Into<StorageFailure>) -> Self {
        StatsError::StorageIo {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn invalid_filter(filter: impl Into<String>, reason: impl Into<String>) -> Self {
        StatsError::InvalidFilter {
            filter: filter.into(),
            reason: reason.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StatsError::NotInitialized { .. } => ErrorClass::NoStatistics,
            StatsError::InvalidFilter { .. } => ErrorClass::ClientError,
            StatsError::InvalidState { .. } => ErrorClass::ClientError,
            StatsError::SchemaMismatch { .. } | StatsError::StorageIo { .. } => ErrorClass::ServerError,
        }
    }

    pub fn is_not_initialized(&self) -> bool {
        matches!(self, StatsError::NotInitialized { .. })
    }
}

/// Attach an operation description to a storage-level failure
pub(crate) trait StorageContext<T> {
    fn storage_context(self, context: impl FnOnce() -> String) -> Result<T>;
}

impl<T, E> StorageContext<T> for std::result::Result<T, E>
where
    E: Into<StorageFailure>,
{
    fn storage_context(self, context: impl FnOnce() -> String) -> Result<T> {
        self.map_err(|e| StatsError::storage(context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let not_init = StatsError::NotInitialized { snapshot_id: 1 };
        assert_eq!(not_init.class(), ErrorClass::NoStatistics);
        assert!(not_init.is_not_initialized());

        let filter = StatsError::invalid_filter("is_valid", "missing separator");
        assert_eq!(filter.class(), ErrorClass::ClientError);

        let io = StatsError::storage(
            "creating directory",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(io.class(), ErrorClass::ServerError);
        assert!(io.to_string().contains("creating directory"));
    }
}
