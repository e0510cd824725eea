//! Link rows (`user_files` table) and the ref-count invariant
//!
//! A blob's `ref_count` equals the number of Link rows pointing at it. The
//! only writers of either are [`attach`] and [`detach`], which change both in
//! the same statement sequence; callers wrap them in a transaction together
//! with the quota charge or release.

use diesel::dsl::{count_star, sql};
use diesel::prelude::*;
use diesel::sql_types::BigInt;
use diesel::sqlite::SqliteConnection;

use super::blobs;
use super::diesel_schema::{files, user_files};
use super::models::{
    current_timestamp, new_id, ContentBlob, Link, LinkedContent, NewLink, Visibility,
};
use crate::error::{ConflictKind, LedgerError, RowKind};

pub fn find_link(
    conn: &mut SqliteConnection,
    user_id: &str,
    blob_id: &str,
) -> Result<Option<Link>, LedgerError> {
    Ok(user_files::table
        .filter(user_files::user_id.eq(user_id))
        .filter(user_files::file_id.eq(blob_id))
        .select(Link::as_select())
        .first(conn)
        .optional()?)
}

/// Link `user_id` to `blob_id` and bump the blob's `ref_count`.
///
/// Fails with `Conflict(Link)` if the pair is already linked (checked first,
/// and enforced again by the unique index against concurrent inserts).
pub fn attach(
    conn: &mut SqliteConnection,
    user_id: &str,
    blob_id: &str,
    is_owner: bool,
    visibility: Visibility,
) -> Result<(Link, i64), LedgerError> {
    if find_link(conn, user_id, blob_id)?.is_some() {
        return Err(LedgerError::Conflict(ConflictKind::Link));
    }

    let id = new_id();
    let now = current_timestamp();

    diesel::insert_into(user_files::table)
        .values(&NewLink {
            id: &id,
            user_id,
            file_id: blob_id,
            is_owner,
            visibility: visibility.as_str(),
            downloads: 0,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| LedgerError::on_insert(e, ConflictKind::Link))?;

    let ref_count = blobs::adjust_ref_count(conn, blob_id, 1)?;

    let link = user_files::table
        .find(&id)
        .select(Link::as_select())
        .first(conn)?;
    Ok((link, ref_count))
}

/// Remove a link and drop the blob's `ref_count`, returning the new count
pub fn detach(conn: &mut SqliteConnection, link: &Link) -> Result<i64, LedgerError> {
    let deleted = diesel::delete(user_files::table.find(&link.id)).execute(conn)?;
    if deleted == 0 {
        return Err(LedgerError::not_found(RowKind::Link, link.id.as_str()));
    }
    blobs::adjust_ref_count(conn, &link.file_id, -1)
}

/// Every link a user holds, newest first
pub fn list_for_user(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<Vec<LinkedContent>, LedgerError> {
    let rows: Vec<(Link, ContentBlob)> = user_files::table
        .inner_join(files::table)
        .filter(user_files::user_id.eq(user_id))
        .order((user_files::created_at.desc(), user_files::id.asc()))
        .select((Link::as_select(), ContentBlob::as_select()))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .map(|(link, blob)| LinkedContent { link, blob })
        .collect())
}

/// Sum of blob sizes over the user's links, derived from the rows
pub fn linked_bytes_for_user(
    conn: &mut SqliteConnection,
    user_id: &str,
) -> Result<i64, LedgerError> {
    Ok(user_files::table
        .inner_join(files::table)
        .filter(user_files::user_id.eq(user_id))
        .select(sql::<BigInt>("COALESCE(SUM(files.size), 0)"))
        .first(conn)?)
}

pub fn count_for_user(conn: &mut SqliteConnection, user_id: &str) -> Result<i64, LedgerError> {
    Ok(user_files::table
        .filter(user_files::user_id.eq(user_id))
        .count()
        .get_result(conn)?)
}

/// Link counts grouped by blob id
pub fn counts_by_blob(conn: &mut SqliteConnection) -> Result<Vec<(String, i64)>, LedgerError> {
    Ok(user_files::table
        .group_by(user_files::file_id)
        .select((user_files::file_id, count_star()))
        .load(conn)?)
}
