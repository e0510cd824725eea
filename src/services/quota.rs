//! Quota accountant - per-user storage usage
//!
//! Charges a user's `used_storage` once per distinct blob they link to, using
//! the blob's recorded size, and releases it when the link goes away. The
//! charge and release functions run inside the ingest and GC transactions so
//! the counter moves in lock-step with the links.
//!
//! The quota ceiling is not enforced here. [`QuotaAccountant::check_admission`]
//! is a pre-check for the request boundary, using the advertised length
//! before any bytes are ingested.

use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::db::{links, users, ContentBlob, LedgerDb, User};
use crate::error::{ConflictKind, DedupError, LedgerError};

/// Usage summary for one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageReport {
    pub user_id: String,
    pub total_links: u64,
    /// Σ size over linked blobs, derived from the link rows
    pub linked_bytes: u64,
    /// The running counter
    pub used_storage: u64,
    pub quota: u64,
    pub remaining: u64,
}

/// A user whose counter disagrees with their links
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UsageDrift {
    pub user_id: String,
    pub used_storage: i64,
    pub linked_bytes: i64,
}

pub struct QuotaAccountant {
    db: LedgerDb,
    default_quota_bytes: u64,
}

impl QuotaAccountant {
    pub fn new(db: LedgerDb, default_quota_bytes: u64) -> Self {
        Self {
            db,
            default_quota_bytes,
        }
    }

    // =========================================================================
    // In-transaction accounting
    // =========================================================================

    /// Charge `blob.size` to the user; call inside the linking transaction
    pub(crate) fn charge(
        conn: &mut SqliteConnection,
        user_id: &str,
        blob: &ContentBlob,
    ) -> Result<(), LedgerError> {
        users::adjust_used_storage(conn, user_id, blob.size)
    }

    /// Release `blob.size` from the user; call inside the unlinking transaction
    pub(crate) fn release(
        conn: &mut SqliteConnection,
        user_id: &str,
        blob: &ContentBlob,
    ) -> Result<(), LedgerError> {
        users::adjust_used_storage(conn, user_id, -blob.size)
    }

    // =========================================================================
    // User registry
    // =========================================================================

    /// Register a user; `quota` defaults to the configured ceiling
    pub async fn register_user(
        &self,
        username: &str,
        quota: Option<u64>,
    ) -> Result<User, DedupError> {
        if username.trim().is_empty() {
            return Err(DedupError::InvalidInput("username must not be empty".into()));
        }
        let quota = super::ledger_size(quota.unwrap_or(self.default_quota_bytes))?;
        let username = username.to_string();

        let result = self
            .db
            .run(move |conn| users::create_user(conn, &username, quota))
            .await;

        match result {
            Ok(user) => {
                info!(user_id = %user.id, username = %user.username, quota, "Registered user");
                Ok(user)
            }
            Err(LedgerError::Conflict(ConflictKind::Username)) => {
                Err(DedupError::InvalidInput("username already registered".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User, DedupError> {
        let user_id = user_id.to_string();
        Ok(self
            .db
            .run(move |conn| users::get_user(conn, &user_id))
            .await?)
    }

    pub async fn find_user(&self, username: &str) -> Result<Option<User>, DedupError> {
        let username = username.to_string();
        Ok(self
            .db
            .run(move |conn| users::find_by_username(conn, &username))
            .await?)
    }

    // =========================================================================
    // Reporting
    // =========================================================================

    pub async fn usage(&self, user_id: &str) -> Result<UsageReport, DedupError> {
        let user_id = user_id.to_string();
        let report = self
            .db
            .run(move |conn| {
                let user = users::get_user(conn, &user_id)?;
                let total_links = links::count_for_user(conn, &user_id)?;
                let linked_bytes = links::linked_bytes_for_user(conn, &user_id)?;
                Ok::<_, LedgerError>(UsageReport {
                    user_id,
                    total_links: total_links as u64,
                    linked_bytes: linked_bytes as u64,
                    used_storage: user.used_storage as u64,
                    quota: user.quota as u64,
                    remaining: user.quota.saturating_sub(user.used_storage).max(0) as u64,
                })
            })
            .await?;
        Ok(report)
    }

    /// Reject an upload whose advertised length would exceed the quota.
    ///
    /// `None` (length unknown, e.g. chunked transfer) always passes.
    pub async fn check_admission(
        &self,
        user_id: &str,
        advertised_len: Option<u64>,
    ) -> Result<(), DedupError> {
        let user = self.get_user(user_id).await?;
        let Some(requested) = advertised_len else {
            return Ok(());
        };

        let used = user.used_storage.max(0) as u64;
        let quota = user.quota.max(0) as u64;
        if used.saturating_add(requested) > quota {
            debug!(user_id = %user_id, used, requested, quota, "Admission rejected");
            return Err(DedupError::QuotaExceeded {
                used,
                requested,
                quota,
            });
        }
        Ok(())
    }

    /// Users whose `used_storage` differs from Σ size over their links.
    ///
    /// Empty at any quiescent point.
    pub async fn audit(&self) -> Result<Vec<UsageDrift>, DedupError> {
        let drifts = self
            .db
            .run(|conn| {
                let mut drifts = Vec::new();
                for user in users::list_users(conn)? {
                    let linked_bytes = links::linked_bytes_for_user(conn, &user.id)?;
                    if linked_bytes != user.used_storage {
                        drifts.push(UsageDrift {
                            user_id: user.id,
                            used_storage: user.used_storage,
                            linked_bytes,
                        });
                    }
                }
                Ok::<_, LedgerError>(drifts)
            })
            .await?;

        for drift in &drifts {
            warn!(
                user_id = %drift.user_id,
                used_storage = drift.used_storage,
                linked_bytes = drift.linked_bytes,
                "Usage counter drift"
            );
        }
        Ok(drifts)
    }
}
