//! Content ingest coordinator
//!
//! Turns a fully read, hashed upload into a Link, deciding between three
//! outcomes:
//!
//! | Ledger state                    | Outcome                                   |
//! |---------------------------------|-------------------------------------------|
//! | blob known, user already linked | no-op, same content id                    |
//! | blob known, user not linked     | +1 ref, non-owner link, charge blob size  |
//! | blob unknown                    | write object, create row, owner link      |
//!
//! Each outcome commits as one `BEGIN IMMEDIATE` transaction. The object write
//! for a new blob happens before that transaction, so a failed or cancelled
//! write leaves the ledger untouched.
//!
//! Two uploads of the same new content race on the `files.hash` unique index.
//! The loser sees `Conflict(BlobHash)`, its transaction rolls back, and the
//! next round of the loop finds the winner's row and takes the linking path.
//! No in-process lock guards the hash.
//!
//! A hash whose last blob row was just collected stays marked in
//! `pending_deletes` until the collector's object delete returns. Ingest
//! waits for the mark to clear before it touches the object or creates a new
//! row, so a fresh row never points at an object that is about to go.

use std::sync::Arc;
use std::time::Duration;

use diesel::sqlite::SqliteConnection;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::events::{DedupEvent, EventBus};
use super::quota::QuotaAccountant;
use crate::blob_store::{BlobReader, BlobStore};
use crate::db::{
    blobs, links, pending, users, ContentBlob, LedgerDb, Link, LinkedContent, Visibility,
};
use crate::error::{BlobStoreError, ConflictKind, DedupError, LedgerError, RowKind};

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const DEFAULT_PENDING_DELETE_WAIT: Duration = Duration::from_secs(5);
const PENDING_DELETE_POLL: Duration = Duration::from_millis(10);

/// A finished upload, hashed by the boundary layer
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub user_id: String,
    /// Digest of the already fully read content; also the object key
    pub hash: String,
    /// Exact byte count consumed from the content reader
    pub size: u64,
    pub mime_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestDisposition {
    /// The user already held a link; nothing changed
    AlreadyLinked,
    /// Linked to a blob another user stored earlier
    LinkedExisting,
    /// First copy of this content; object written and owner link created
    StoredNew,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    /// ContentBlob id
    pub content_id: String,
    pub link_id: String,
    pub disposition: IngestDisposition,
    pub ref_count: i64,
}

/// Ledger state for (user, hash) before deciding
enum Lookup {
    Linked { blob: ContentBlob, link: Link },
    Unlinked(ContentBlob),
    /// No row, and a collector is still deleting the old object
    PendingDelete,
    Missing,
}

/// Rows written by a committed linking transaction
struct Committed {
    blob: ContentBlob,
    link: Link,
    ref_count: i64,
}

pub struct IngestCoordinator {
    db: LedgerDb,
    blobs: Arc<dyn BlobStore>,
    events: Arc<EventBus>,
    max_attempts: u32,
    pending_delete_wait: Duration,
}

impl IngestCoordinator {
    pub fn new(
        db: LedgerDb,
        blobs: Arc<dyn BlobStore>,
        events: Arc<EventBus>,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            blobs,
            events,
            max_attempts: max_attempts.max(1),
            pending_delete_wait: DEFAULT_PENDING_DELETE_WAIT,
        }
    }

    /// Bound the wait for an in-flight object delete of the same hash
    pub fn with_pending_delete_wait(mut self, wait: Duration) -> Self {
        self.pending_delete_wait = wait;
        self
    }

    /// Ingest `content` for `request.user_id`, returning the content id.
    ///
    /// Never rejects on quota. Repeating the call for the same user and hash
    /// is a no-op that returns the same content id.
    pub async fn ingest<R>(
        &self,
        request: IngestRequest,
        mut content: R,
    ) -> Result<IngestReceipt, DedupError>
    where
        R: AsyncRead + Send + Unpin,
    {
        if request.hash.trim().is_empty() {
            return Err(DedupError::InvalidInput("content hash must not be empty".into()));
        }
        let size = super::ledger_size(request.size)?;
        let mime_type = if request.mime_type.trim().is_empty() {
            DEFAULT_MIME_TYPE.to_string()
        } else {
            request.mime_type.clone()
        };

        // Set once `content` has been copied into the blob store
        let mut reader_spent = false;
        let mut last_conflict = ConflictKind::BlobHash;
        let wait_deadline = Instant::now() + self.pending_delete_wait;

        // Waiting on a collector does not use up an attempt
        let mut attempt = 0;
        while attempt < self.max_attempts {
            attempt += 1;
            let (user_id, hash) = (request.user_id.clone(), request.hash.clone());
            let lookup = self
                .db
                .run(move |conn| lookup(conn, &user_id, &hash))
                .await?;

            match lookup {
                Lookup::Linked { blob, link } => {
                    debug!(
                        user_id = %request.user_id,
                        content_id = %blob.id,
                        "Content already linked, nothing to do"
                    );
                    return Ok(IngestReceipt {
                        content_id: blob.id,
                        link_id: link.id,
                        disposition: IngestDisposition::AlreadyLinked,
                        ref_count: blob.ref_count,
                    });
                }

                Lookup::Unlinked(blob) => {
                    let user_id = request.user_id.clone();
                    let blob_id = blob.id.clone();
                    let result = self
                        .db
                        .run(move |conn| link_existing(conn, &user_id, &blob_id))
                        .await;

                    match result {
                        Ok(committed) => {
                            info!(
                                user_id = %request.user_id,
                                content_id = %committed.blob.id,
                                ref_count = committed.ref_count,
                                "Linked duplicate content"
                            );
                            return Ok(self.finish(
                                &request.user_id,
                                committed,
                                IngestDisposition::LinkedExisting,
                            ));
                        }
                        // Same user linked concurrently; next lookup reports it
                        Err(LedgerError::Conflict(ConflictKind::Link)) => {
                            debug!(user_id = %request.user_id, attempt, "Link insert raced");
                            last_conflict = ConflictKind::Link;
                        }
                        // Blob collected between lookup and commit
                        Err(e) if e.is_not_found(RowKind::Blob) => {
                            debug!(content_id = %blob.id, attempt, "Blob vanished before linking");
                        }
                        Err(e) => return Err(e.into()),
                    }
                }

                Lookup::PendingDelete => {
                    self.await_collector(&request.hash, wait_deadline).await?;
                    attempt -= 1;
                }

                Lookup::Missing => {
                    if !reader_spent {
                        reader_spent = self.write_object(&request, &mime_type, &mut content).await?;
                    } else if !self.blobs.exists(&request.hash).await? {
                        // The reader is spent and a collector removed the object
                        warn!(hash = %request.hash, "Object removed while ingest was retrying");
                        return Err(BlobStoreError::NotFound(request.hash.clone()).into());
                    }

                    let user_id = request.user_id.clone();
                    let hash = request.hash.clone();
                    let mime = mime_type.clone();
                    let result = self
                        .db
                        .run(move |conn| create_and_link(conn, &user_id, &hash, size, &mime))
                        .await;

                    match result {
                        Ok(committed) => {
                            info!(
                                user_id = %request.user_id,
                                content_id = %committed.blob.id,
                                hash = %request.hash,
                                size = request.size,
                                "Stored new content"
                            );
                            self.events.emit(DedupEvent::BlobStored {
                                content_id: committed.blob.id.clone(),
                                hash: committed.blob.hash.clone(),
                                size: request.size,
                            });
                            return Ok(self.finish(
                                &request.user_id,
                                committed,
                                IngestDisposition::StoredNew,
                            ));
                        }
                        Err(LedgerError::Conflict(ConflictKind::BlobHash)) => {
                            info!(
                                user_id = %request.user_id,
                                hash = %request.hash,
                                attempt,
                                "Lost blob insert race, linking to winner"
                            );
                            last_conflict = ConflictKind::BlobHash;
                        }
                        // Collected after the lookup; an unread reader is
                        // written again once the old object is gone
                        Err(LedgerError::Conflict(ConflictKind::PendingDelete)) => {
                            debug!(hash = %request.hash, attempt, "Hash awaiting object delete");
                            self.await_collector(&request.hash, wait_deadline).await?;
                            attempt -= 1;
                        }
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        warn!(
            user_id = %request.user_id,
            hash = %request.hash,
            attempts = self.max_attempts,
            "Ingest retries exhausted"
        );
        Err(DedupError::TransientStore(LedgerError::Conflict(last_conflict)))
    }

    /// Write the object unless the key is already present.
    ///
    /// Returns true when `content` was consumed.
    async fn write_object<R>(
        &self,
        request: &IngestRequest,
        mime_type: &str,
        content: &mut R,
    ) -> Result<bool, DedupError>
    where
        R: AsyncRead + Send + Unpin,
    {
        if self.blobs.exists(&request.hash).await? {
            debug!(hash = %request.hash, "Object already present, skipping write");
            return Ok(false);
        }
        self.blobs
            .put(&request.hash, mime_type, content, request.size)
            .await?;
        Ok(true)
    }

    /// Sleep one poll interval, or fail once `deadline` has passed
    async fn await_collector(&self, hash: &str, deadline: Instant) -> Result<(), DedupError> {
        if Instant::now() >= deadline {
            warn!(hash = %hash, "Gave up waiting for pending object delete");
            return Err(DedupError::TransientStore(LedgerError::Conflict(
                ConflictKind::PendingDelete,
            )));
        }
        tokio::time::sleep(PENDING_DELETE_POLL).await;
        Ok(())
    }

    fn finish(
        &self,
        user_id: &str,
        committed: Committed,
        disposition: IngestDisposition,
    ) -> IngestReceipt {
        self.events.emit(DedupEvent::LinkCreated {
            content_id: committed.blob.id.clone(),
            user_id: user_id.to_string(),
            is_owner: committed.link.is_owner,
            ref_count: committed.ref_count,
        });
        IngestReceipt {
            content_id: committed.blob.id,
            link_id: committed.link.id,
            disposition,
            ref_count: committed.ref_count,
        }
    }

    // =========================================================================
    // Read path
    // =========================================================================

    /// Every content item the user is linked to, newest first
    pub async fn list_links(&self, user_id: &str) -> Result<Vec<LinkedContent>, DedupError> {
        let user_id = user_id.to_string();
        Ok(self
            .db
            .run(move |conn| {
                users::get_user(conn, &user_id)?;
                links::list_for_user(conn, &user_id)
            })
            .await?)
    }

    /// Open the stored bytes of a content item the user is linked to
    pub async fn open_content(
        &self,
        user_id: &str,
        content_id: &str,
    ) -> Result<(ContentBlob, BlobReader), DedupError> {
        let (user_id, content_id) = (user_id.to_string(), content_id.to_string());
        let blob = self
            .db
            .run(move |conn| {
                links::find_link(conn, &user_id, &content_id)?
                    .ok_or_else(|| LedgerError::not_found(RowKind::Link, content_id.as_str()))?;
                blobs::get_blob(conn, &content_id)?
                    .ok_or_else(|| LedgerError::not_found(RowKind::Blob, content_id.as_str()))
            })
            .await?;

        let reader = self.blobs.get(&blob.object_key).await?;
        Ok((blob, reader))
    }
}

fn lookup(conn: &mut SqliteConnection, user_id: &str, hash: &str) -> Result<Lookup, LedgerError> {
    if !users::user_exists(conn, user_id)? {
        return Err(LedgerError::not_found(RowKind::User, user_id));
    }

    let Some(blob) = blobs::find_by_hash(conn, hash)? else {
        if pending::is_pending(conn, hash)? {
            return Ok(Lookup::PendingDelete);
        }
        return Ok(Lookup::Missing);
    };
    match links::find_link(conn, user_id, &blob.id)? {
        Some(link) => Ok(Lookup::Linked { blob, link }),
        None => Ok(Lookup::Unlinked(blob)),
    }
}

/// Link a user to an existing blob, charging the blob's recorded size
fn link_existing(
    conn: &mut SqliteConnection,
    user_id: &str,
    blob_id: &str,
) -> Result<Committed, LedgerError> {
    conn.immediate_transaction(|conn| {
        let blob = blobs::get_blob(conn, blob_id)?
            .ok_or_else(|| LedgerError::not_found(RowKind::Blob, blob_id))?;
        let (link, ref_count) = links::attach(conn, user_id, &blob.id, false, Visibility::Private)?;
        QuotaAccountant::charge(conn, user_id, &blob)?;
        Ok(Committed {
            blob,
            link,
            ref_count,
        })
    })
}

/// Create the row for a new hash with its owner link and charge.
///
/// Refused with `Conflict(PendingDelete)` while a collector still owns the
/// hash's old object.
fn create_and_link(
    conn: &mut SqliteConnection,
    user_id: &str,
    hash: &str,
    size: i64,
    mime_type: &str,
) -> Result<Committed, LedgerError> {
    conn.immediate_transaction(|conn| {
        if pending::is_pending(conn, hash)? {
            return Err(LedgerError::Conflict(ConflictKind::PendingDelete));
        }
        let blob = blobs::insert_blob(conn, hash, size, mime_type)?;
        let (link, ref_count) = links::attach(conn, user_id, &blob.id, true, Visibility::Private)?;
        QuotaAccountant::charge(conn, user_id, &blob)?;
        Ok(Committed {
            blob,
            link,
            ref_count,
        })
    })
}
