//! Service layer for elohim-dedup
//!
//! The three dedup components share one injected ledger handle and one blob
//! store; none of them holds a process-wide connection.
//!
//! ## Architecture
//!
//! ```text
//! Boundary layer (CLI, HTTP)
//!     ↓
//! IngestCoordinator / GarbageCollector / QuotaAccountant
//!     ↓                               ↓
//! Repository layer (db/*.rs)      BlobStore
//!     ↓
//! SQLite ledger
//! ```

pub mod events;
pub mod gc;
pub mod ingest;
pub mod quota;

// Re-exports
pub use events::{spawn_logging_listener, DedupEvent, EventBus};
pub use gc::{GarbageCollector, RefCountDrift, Removal, SweepReport};
pub use ingest::{IngestCoordinator, IngestDisposition, IngestReceipt, IngestRequest};
pub use quota::{QuotaAccountant, UsageDrift, UsageReport};

use std::sync::Arc;
use std::time::Duration;

use crate::blob_store::{BlobStore, FsBlobStore};
use crate::config::Config;
use crate::db::LedgerDb;
use crate::error::DedupError;

/// Convert a byte count to the ledger's signed column type
pub(crate) fn ledger_size(bytes: u64) -> Result<i64, DedupError> {
    i64::try_from(bytes)
        .map_err(|_| DedupError::InvalidInput(format!("size {} exceeds ledger range", bytes)))
}

/// Service container for dependency injection
///
/// Every service holds a clone of the same [`LedgerDb`] and the same
/// [`BlobStore`].
pub struct Services {
    pub ingest: Arc<IngestCoordinator>,
    pub quota: Arc<QuotaAccountant>,
    pub gc: Arc<GarbageCollector>,
    pub events: Arc<EventBus>,
    pub db: LedgerDb,
}

impl Services {
    /// Create all services over a shared ledger and blob store
    pub fn new(db: LedgerDb, blobs: Arc<dyn BlobStore>, config: &Config) -> Self {
        let events = Arc::new(EventBus::new());

        Self {
            ingest: Arc::new(
                IngestCoordinator::new(
                    db.clone(),
                    blobs.clone(),
                    events.clone(),
                    config.max_ingest_attempts,
                )
                .with_pending_delete_wait(Duration::from_millis(config.pending_delete_wait_ms)),
            ),
            quota: Arc::new(QuotaAccountant::new(db.clone(), config.default_quota_bytes)),
            gc: Arc::new(GarbageCollector::new(db.clone(), blobs, events.clone())),
            events,
            db,
        }
    }

    /// Open the on-disk ledger and filesystem blob store under `config.storage_dir`
    pub async fn open(config: &Config) -> Result<Self, DedupError> {
        let db = LedgerDb::from_config(config)?;
        let blobs = FsBlobStore::new(config.blobs_dir()).await?;
        Ok(Self::new(db, Arc::new(blobs), config))
    }
}
