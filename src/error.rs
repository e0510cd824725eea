//! Error types for elohim-dedup
//!
//! Three layers:
//! - [`LedgerError`] - failures of the relational ledger, including the
//!   structured uniqueness [`ConflictKind`] used to resolve insert races
//! - [`BlobStoreError`] - failures of a [`BlobStore`](crate::blob_store::BlobStore) backend
//! - [`DedupError`] - what the ingest, quota and GC services return to callers

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use thiserror::Error;

/// Which uniqueness constraint an insert collided with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// Another writer committed a ContentBlob row with the same hash
    BlobHash,
    /// The (user, blob) pair already has a Link row
    Link,
    /// Username already registered
    Username,
    /// The hash's previous blob is collected but its object delete has not
    /// finished yet
    PendingDelete,
}

/// Which ledger table a missing row belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    User,
    Blob,
    Link,
}

impl std::fmt::Display for RowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RowKind::User => write!(f, "user"),
            RowKind::Blob => write!(f, "blob"),
            RowKind::Link => write!(f, "link"),
        }
    }
}

impl std::fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConflictKind::BlobHash => write!(f, "files.hash"),
            ConflictKind::Link => write!(f, "user_files(user_id, file_id)"),
            ConflictKind::Username => write!(f, "users.username"),
            ConflictKind::PendingDelete => write!(f, "pending_deletes.hash"),
        }
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Unique constraint conflict on {0}")]
    Conflict(ConflictKind),

    #[error("Ledger row not found: {kind} {id}")]
    NotFound { kind: RowKind, id: String },

    #[error("Query failed: {0}")]
    Query(#[from] DieselError),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Ledger task failed: {0}")]
    Join(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Classify a diesel error raised by an INSERT guarded by `kind`.
    ///
    /// Unique violations become [`LedgerError::Conflict`], everything else
    /// stays a query failure.
    pub fn on_insert(err: DieselError, kind: ConflictKind) -> Self {
        match err {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                LedgerError::Conflict(kind)
            }
            other => LedgerError::Query(other),
        }
    }

    pub fn not_found(kind: RowKind, id: impl Into<String>) -> Self {
        LedgerError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_conflict(&self, kind: ConflictKind) -> bool {
        matches!(self, LedgerError::Conflict(k) if *k == kind)
    }

    pub fn is_not_found(&self, kind: RowKind) -> bool {
        matches!(self, LedgerError::NotFound { kind: k, .. } if *k == kind)
    }
}

#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("Size mismatch for {key}: declared {declared}, received {received}")]
    SizeMismatch {
        key: String,
        declared: u64,
        received: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blob backend error: {0}")]
    Backend(String),
}

/// Errors surfaced by the dedup services
#[derive(Error, Debug)]
pub enum DedupError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: user {user_id} does not own content {content_id}")]
    PermissionDenied { user_id: String, content_id: String },

    #[error("Quota exceeded: used {used} + request {requested} > quota {quota}")]
    QuotaExceeded {
        used: u64,
        requested: u64,
        quota: u64,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Ledger store error: {0}")]
    TransientStore(#[source] LedgerError),

    #[error("Blob store failure: {0}")]
    BlobStore(#[from] BlobStoreError),

    /// The ledger deletion committed but the blob object could not be removed
    #[error("Blob cleanup failed for {object_key}: {source}")]
    BlobCleanup {
        object_key: String,
        #[source]
        source: BlobStoreError,
    },
}

impl DedupError {
    /// True for both ingest-time and cleanup-time blob store failures
    pub fn is_blob_store_failure(&self) -> bool {
        matches!(self, DedupError::BlobStore(_) | DedupError::BlobCleanup { .. })
    }
}

impl From<LedgerError> for DedupError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound { kind, id } => DedupError::NotFound(format!("{} {}", kind, id)),
            other => DedupError::TransientStore(other),
        }
    }
}
