//! Ledger schema definitions

use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::sql_types::Integer;
use diesel::sqlite::SqliteConnection;
use tracing::info;

use crate::error::LedgerError;

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 2;

#[derive(QueryableByName)]
struct VersionRow {
    #[diesel(sql_type = Integer)]
    version: i32,
}

/// Initialize the ledger schema
pub fn init_schema(conn: &mut SqliteConnection) -> Result<(), LedgerError> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new ledger schema v{}", SCHEMA_VERSION);
        conn.immediate_transaction(|conn| {
            conn.batch_execute(LEDGER_SCHEMA)?;
            conn.batch_execute(PENDING_DELETES_SCHEMA)?;
            set_schema_version(conn, SCHEMA_VERSION)
        })?;
    } else if current_version < SCHEMA_VERSION {
        info!("Migrating ledger schema from v{} to v{}", current_version, SCHEMA_VERSION);
        conn.immediate_transaction(|conn| {
            if current_version < 2 {
                conn.batch_execute(PENDING_DELETES_SCHEMA)?;
            }
            set_schema_version(conn, SCHEMA_VERSION)
        })?;
    } else {
        info!("Ledger schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &mut SqliteConnection) -> Result<i32, LedgerError> {
    conn.batch_execute("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")?;

    let row = diesel::sql_query("SELECT version FROM schema_version LIMIT 1")
        .get_result::<VersionRow>(conn)
        .optional()?;

    Ok(row.map(|r| r.version).unwrap_or(0))
}

/// Set schema version
fn set_schema_version(conn: &mut SqliteConnection, version: i32) -> Result<(), LedgerError> {
    diesel::sql_query("DELETE FROM schema_version").execute(conn)?;
    diesel::sql_query("INSERT INTO schema_version (version) VALUES (?)")
        .bind::<Integer, _>(version)
        .execute(conn)?;
    Ok(())
}

/// Users, unique content blobs, and the links between them.
///
/// `files.hash` and `user_files(user_id, file_id)` are the uniqueness
/// constraints the ingest race resolution relies on.
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY NOT NULL,
    username TEXT NOT NULL UNIQUE,
    used_storage BIGINT NOT NULL DEFAULT 0 CHECK (used_storage >= 0),
    quota BIGINT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY NOT NULL,
    hash TEXT NOT NULL UNIQUE,
    object_key TEXT NOT NULL,
    size BIGINT NOT NULL CHECK (size >= 0),
    mime_type TEXT NOT NULL,
    ref_count BIGINT NOT NULL CHECK (ref_count >= 0),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_files (
    id TEXT PRIMARY KEY NOT NULL,
    user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    file_id TEXT NOT NULL REFERENCES files(id),
    is_owner BOOLEAN NOT NULL DEFAULT 0,
    visibility TEXT NOT NULL DEFAULT 'private',
    downloads BIGINT NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    UNIQUE (user_id, file_id)
);

CREATE INDEX IF NOT EXISTS idx_user_files_user ON user_files(user_id);
CREATE INDEX IF NOT EXISTS idx_user_files_file ON user_files(file_id);
"#;

/// v2: hashes whose blob row is collected but whose object delete is still
/// in flight. A new blob row for such a hash must wait for the marker to go.
const PENDING_DELETES_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pending_deletes (
    hash TEXT PRIMARY KEY NOT NULL,
    object_key TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;
