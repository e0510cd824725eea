//! Link removal and blob garbage collection
//!
//! `remove_link` deletes one Link, releases its charge and drops the blob's
//! `ref_count` in a single `BEGIN IMMEDIATE` transaction. When the count
//! reaches zero the ContentBlob row goes in the same transaction, the hash is
//! marked in `pending_deletes`, and the object is deleted from the blob store
//! after commit. The mark is cleared once the delete succeeds. A failed object
//! delete is reported, never brings the row back, and leaves the mark for
//! [`GarbageCollector::sweep_pending_deletes`].
//!
//! Only the owner link can be removed through this path.

use std::collections::HashMap;
use std::sync::Arc;

use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::events::{DedupEvent, EventBus};
use super::quota::QuotaAccountant;
use crate::blob_store::BlobStore;
use crate::db::{blobs, links, pending, ContentBlob, LedgerDb};
use crate::error::{DedupError, LedgerError, RowKind};

/// Result of a successful `remove_link`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Removal {
    pub content_id: String,
    /// Links left on the blob after this removal
    pub ref_count: i64,
    /// The blob row was deleted and its object removed
    pub collected: bool,
}

/// A blob whose `ref_count` disagrees with its link rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefCountDrift {
    pub content_id: String,
    pub ref_count: i64,
    pub link_rows: i64,
}

/// Outcome of retrying stuck object deletes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub cleared: u64,
    pub failed: u64,
}

enum Unlinked {
    NotOwner,
    Removed { blob: ContentBlob, ref_count: i64 },
}

pub struct GarbageCollector {
    db: LedgerDb,
    blobs: Arc<dyn BlobStore>,
    events: Arc<EventBus>,
}

impl GarbageCollector {
    pub fn new(db: LedgerDb, blobs: Arc<dyn BlobStore>, events: Arc<EventBus>) -> Self {
        Self { db, blobs, events }
    }

    /// Remove `user_id`'s link to `content_id`.
    ///
    /// Fails with `NotFound` when the user holds no such link and with
    /// `PermissionDenied` when the link is not the owner link.
    pub async fn remove_link(&self, user_id: &str, content_id: &str) -> Result<Removal, DedupError> {
        let (uid, cid) = (user_id.to_string(), content_id.to_string());
        let outcome = self.db.run(move |conn| unlink(conn, &uid, &cid)).await?;

        let (blob, ref_count) = match outcome {
            Unlinked::NotOwner => {
                debug!(user_id = %user_id, content_id = %content_id, "Non-owner removal rejected");
                return Err(DedupError::PermissionDenied {
                    user_id: user_id.to_string(),
                    content_id: content_id.to_string(),
                });
            }
            Unlinked::Removed { blob, ref_count } => (blob, ref_count),
        };

        self.events.emit(DedupEvent::LinkRemoved {
            content_id: blob.id.clone(),
            user_id: user_id.to_string(),
            ref_count,
        });

        if ref_count > 0 {
            info!(user_id = %user_id, content_id = %blob.id, ref_count, "Removed link");
            return Ok(Removal {
                content_id: blob.id,
                ref_count,
                collected: false,
            });
        }

        // Row is gone; the object follows
        if let Err(e) = self.blobs.delete(&blob.object_key).await {
            warn!(
                content_id = %blob.id,
                object_key = %blob.object_key,
                error = %e,
                "Blob row collected but object delete failed"
            );
            self.events.emit(DedupEvent::BlobCleanupFailed {
                content_id: blob.id.clone(),
                object_key: blob.object_key.clone(),
                error: e.to_string(),
            });
            return Err(DedupError::BlobCleanup {
                object_key: blob.object_key,
                source: e,
            });
        }

        let hash = blob.hash.clone();
        self.db
            .run(move |conn| pending::clear(conn, &hash))
            .await?;

        info!(
            user_id = %user_id,
            content_id = %blob.id,
            object_key = %blob.object_key,
            "Removed last link, blob collected"
        );
        self.events.emit(DedupEvent::BlobCollected {
            content_id: blob.id.clone(),
            object_key: blob.object_key.clone(),
        });
        Ok(Removal {
            content_id: blob.id,
            ref_count: 0,
            collected: true,
        })
    }

    /// Retry object deletes left behind by failed or interrupted collections.
    ///
    /// Ingest of a marked hash waits until its mark is cleared here or by
    /// the collector that set it.
    pub async fn sweep_pending_deletes(&self) -> Result<SweepReport, DedupError> {
        let marks = self.db.run(|conn| pending::list(conn)).await?;
        let mut report = SweepReport::default();

        for mark in marks {
            if let Err(e) = self.blobs.delete(&mark.object_key).await {
                warn!(hash = %mark.hash, error = %e, "Pending object delete failed again");
                report.failed += 1;
                continue;
            }
            let hash = mark.hash.clone();
            self.db.run(move |conn| pending::clear(conn, &hash)).await?;
            debug!(hash = %mark.hash, "Pending object delete cleared");
            report.cleared += 1;
        }

        if report.cleared + report.failed > 0 {
            info!(cleared = report.cleared, failed = report.failed, "Swept pending deletes");
        }
        Ok(report)
    }

    /// Blobs whose `ref_count` differs from the number of link rows.
    ///
    /// Empty at any quiescent point.
    pub async fn audit_ref_counts(&self) -> Result<Vec<RefCountDrift>, DedupError> {
        let drifts = self
            .db
            .run(|conn| {
                let counts: HashMap<String, i64> =
                    links::counts_by_blob(conn)?.into_iter().collect();
                let drifts = blobs::list_blobs(conn)?
                    .into_iter()
                    .filter_map(|blob| {
                        let link_rows = counts.get(&blob.id).copied().unwrap_or(0);
                        (blob.ref_count != link_rows).then(|| RefCountDrift {
                            content_id: blob.id,
                            ref_count: blob.ref_count,
                            link_rows,
                        })
                    })
                    .collect::<Vec<_>>();
                Ok::<_, LedgerError>(drifts)
            })
            .await?;

        for drift in &drifts {
            warn!(
                content_id = %drift.content_id,
                ref_count = drift.ref_count,
                link_rows = drift.link_rows,
                "Ref count drift"
            );
        }
        Ok(drifts)
    }
}

fn unlink(
    conn: &mut SqliteConnection,
    user_id: &str,
    content_id: &str,
) -> Result<Unlinked, LedgerError> {
    conn.immediate_transaction(|conn| {
        let link = links::find_link(conn, user_id, content_id)?
            .ok_or_else(|| LedgerError::not_found(RowKind::Link, content_id))?;
        if !link.is_owner {
            return Ok(Unlinked::NotOwner);
        }

        let blob = blobs::get_blob(conn, content_id)?
            .ok_or_else(|| LedgerError::not_found(RowKind::Blob, content_id))?;
        let ref_count = links::detach(conn, &link)?;
        QuotaAccountant::release(conn, user_id, &blob)?;

        if ref_count <= 0 {
            blobs::delete_blob(conn, &blob.id)?;
            pending::mark(conn, &blob.hash, &blob.object_key)?;
        }
        Ok(Unlinked::Removed { blob, ref_count })
    })
}
