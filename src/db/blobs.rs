//! ContentBlob rows (`files` table)
//!
//! `ref_count` is only ever changed through [`super::links::attach`] and
//! [`super::links::detach`], which pair it with the Link insert or delete in
//! the caller's transaction.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use super::diesel_schema::files;
use super::models::{current_timestamp, new_id, ContentBlob, NewContentBlob};
use crate::error::{ConflictKind, LedgerError, RowKind};

pub fn find_by_hash(
    conn: &mut SqliteConnection,
    hash: &str,
) -> Result<Option<ContentBlob>, LedgerError> {
    Ok(files::table
        .filter(files::hash.eq(hash))
        .select(ContentBlob::as_select())
        .first(conn)
        .optional()?)
}

pub fn get_blob(
    conn: &mut SqliteConnection,
    blob_id: &str,
) -> Result<Option<ContentBlob>, LedgerError> {
    Ok(files::table
        .find(blob_id)
        .select(ContentBlob::as_select())
        .first(conn)
        .optional()?)
}

/// Insert the row for a never-seen hash with no links yet.
///
/// The object key is the hash itself. A concurrent writer that committed the
/// same hash first makes this fail with `Conflict(BlobHash)`.
pub fn insert_blob(
    conn: &mut SqliteConnection,
    hash: &str,
    size: i64,
    mime_type: &str,
) -> Result<ContentBlob, LedgerError> {
    let id = new_id();
    let now = current_timestamp();

    diesel::insert_into(files::table)
        .values(&NewContentBlob {
            id: &id,
            hash,
            object_key: hash,
            size,
            mime_type,
            ref_count: 0,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| LedgerError::on_insert(e, ConflictKind::BlobHash))?;

    get_blob(conn, &id)?.ok_or_else(|| LedgerError::not_found(RowKind::Blob, id.as_str()))
}

/// Add `delta` to the blob's `ref_count` and return the new value
pub(crate) fn adjust_ref_count(
    conn: &mut SqliteConnection,
    blob_id: &str,
    delta: i64,
) -> Result<i64, LedgerError> {
    let updated = diesel::update(files::table.find(blob_id))
        .set(files::ref_count.eq(files::ref_count + delta))
        .execute(conn)?;
    if updated == 0 {
        return Err(LedgerError::not_found(RowKind::Blob, blob_id));
    }

    Ok(files::table
        .find(blob_id)
        .select(files::ref_count)
        .first(conn)?)
}

/// Delete a blob row; returns false if it was already gone
pub fn delete_blob(conn: &mut SqliteConnection, blob_id: &str) -> Result<bool, LedgerError> {
    let deleted = diesel::delete(files::table.find(blob_id)).execute(conn)?;
    Ok(deleted > 0)
}

pub fn list_blobs(conn: &mut SqliteConnection) -> Result<Vec<ContentBlob>, LedgerError> {
    Ok(files::table
        .order(files::created_at.asc())
        .select(ContentBlob::as_select())
        .load(conn)?)
}
