//! # Error Types
//!
//! Every fallible library operation returns [`SyncError`]. The variants follow
//! the failure classes callers have to tell apart: a missing node, a sibling
//! name collision, an exhausted optimistic-concurrency retry loop, an
//! unreadable content source, and a missing local session.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("name conflict: '{name}' already exists in {parent}")]
    NameConflict { parent: String, name: String },

    #[error("version conflict: profile update gave up after {attempts} attempt(s)")]
    VersionConflict { attempts: u32 },

    #[error("could not fingerprint {}: {source}", path.display())]
    IntegrityFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no active session on this peer")]
    SessionUnavailable,

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("overlay error: {0}")]
    Dht(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of a [`SyncError`], cheap to copy into reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    NameConflict,
    VersionConflict,
    IntegrityFailure,
    SessionUnavailable,
    InvalidOperation,
    Dht,
    Crypto,
    Serialization,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::NameConflict { .. } => ErrorKind::NameConflict,
            SyncError::VersionConflict { .. } => ErrorKind::VersionConflict,
            SyncError::IntegrityFailure { .. } => ErrorKind::IntegrityFailure,
            SyncError::SessionUnavailable => ErrorKind::SessionUnavailable,
            SyncError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            SyncError::Dht(_) => ErrorKind::Dht,
            SyncError::Crypto(_) => ErrorKind::Crypto,
            SyncError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        SyncError::NotFound(what.into())
    }

    pub fn integrity(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::IntegrityFailure {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(SyncError::not_found("node").kind(), ErrorKind::NotFound);
        assert_eq!(
            SyncError::VersionConflict { attempts: 3 }.kind(),
            ErrorKind::VersionConflict
        );
        assert_eq!(SyncError::SessionUnavailable.kind(), ErrorKind::SessionUnavailable);
    }

    #[test]
    fn test_integrity_failure_message() {
        let err = SyncError::integrity(
            "/tmp/locked.bin",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), ErrorKind::IntegrityFailure);
        assert!(err.to_string().contains("/tmp/locked.bin"));
    }

    #[test]
    fn test_name_conflict_message() {
        let err = SyncError::NameConflict {
            parent: "/docs".to_string(),
            name: "a.txt".to_string(),
        };
        assert_eq!(err.to_string(), "name conflict: 'a.txt' already exists in /docs");
    }
}
