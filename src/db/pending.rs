//! Pending object deletes (`pending_deletes` table)
//!
//! The collector marks a hash in the same transaction that deletes its last
//! blob row, and clears the mark once the object delete has returned. While a
//! hash is marked, no new blob row may be created for it: the object could
//! vanish underneath the new row.

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use super::diesel_schema::pending_deletes;
use super::models::{current_timestamp, NewPendingDelete, PendingDelete};
use crate::error::LedgerError;

/// Mark `hash` as awaiting its object delete
pub fn mark(conn: &mut SqliteConnection, hash: &str, object_key: &str) -> Result<(), LedgerError> {
    let now = current_timestamp();
    diesel::replace_into(pending_deletes::table)
        .values(&NewPendingDelete {
            hash,
            object_key,
            created_at: &now,
        })
        .execute(conn)?;
    Ok(())
}

pub fn is_pending(conn: &mut SqliteConnection, hash: &str) -> Result<bool, LedgerError> {
    let count: i64 = pending_deletes::table
        .find(hash)
        .count()
        .get_result(conn)?;
    Ok(count > 0)
}

/// Clear the mark; returns false if it was already gone
pub fn clear(conn: &mut SqliteConnection, hash: &str) -> Result<bool, LedgerError> {
    let deleted = diesel::delete(pending_deletes::table.find(hash)).execute(conn)?;
    Ok(deleted > 0)
}

/// Oldest first
pub fn list(conn: &mut SqliteConnection) -> Result<Vec<PendingDelete>, LedgerError> {
    Ok(pending_deletes::table
        .order(pending_deletes::created_at.asc())
        .select(PendingDelete::as_select())
        .load(conn)?)
}
