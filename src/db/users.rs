//! User rows and the `used_storage` counter

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;

use super::diesel_schema::users;
use super::models::{current_timestamp, new_id, NewUser, User};
use crate::error::{ConflictKind, LedgerError, RowKind};

/// Register a user with zero usage
pub fn create_user(
    conn: &mut SqliteConnection,
    username: &str,
    quota: i64,
) -> Result<User, LedgerError> {
    let id = new_id();
    let now = current_timestamp();

    diesel::insert_into(users::table)
        .values(&NewUser {
            id: &id,
            username,
            used_storage: 0,
            quota,
            created_at: &now,
        })
        .execute(conn)
        .map_err(|e| LedgerError::on_insert(e, ConflictKind::Username))?;

    get_user(conn, &id)
}

pub fn get_user(conn: &mut SqliteConnection, user_id: &str) -> Result<User, LedgerError> {
    users::table
        .find(user_id)
        .select(User::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| LedgerError::not_found(RowKind::User, user_id))
}

pub fn find_by_username(
    conn: &mut SqliteConnection,
    username: &str,
) -> Result<Option<User>, LedgerError> {
    Ok(users::table
        .filter(users::username.eq(username))
        .select(User::as_select())
        .first(conn)
        .optional()?)
}

pub fn user_exists(conn: &mut SqliteConnection, user_id: &str) -> Result<bool, LedgerError> {
    let count: i64 = users::table.find(user_id).count().get_result(conn)?;
    Ok(count > 0)
}

pub fn list_users(conn: &mut SqliteConnection) -> Result<Vec<User>, LedgerError> {
    Ok(users::table
        .order(users::created_at.asc())
        .select(User::as_select())
        .load(conn)?)
}

/// Apply a signed delta to `used_storage`; the CHECK constraint rejects
/// a result below zero.
pub fn adjust_used_storage(
    conn: &mut SqliteConnection,
    user_id: &str,
    delta: i64,
) -> Result<(), LedgerError> {
    let updated = diesel::update(users::table.find(user_id))
        .set(users::used_storage.eq(users::used_storage + delta))
        .execute(conn)?;

    if updated == 0 {
        return Err(LedgerError::not_found(RowKind::User, user_id));
    }
    Ok(())
}
