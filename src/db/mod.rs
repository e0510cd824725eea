//! SQLite reference ledger
//!
//! Holds the relational record of users, unique content blobs and the links
//! between them. Every component that mutates the ledger receives the same
//! [`LedgerDb`] handle at construction time; there is no process-wide
//! connection.
//!
//! ## Tables
//!
//! - `users` - per-user `used_storage` counter and `quota` ceiling
//! - `files` - one row per distinct content hash, with `ref_count`
//! - `user_files` - links, unique per (user, file)
//! - `pending_deletes` - collected hashes whose object delete is in flight
//!
//! ## Concurrency
//!
//! Connections come from an r2d2 pool. Mutating units run inside
//! `BEGIN IMMEDIATE` transactions, so writers are serialized by SQLite and
//! a losing insert surfaces as [`LedgerError::Conflict`]. Readers never block
//! writers (WAL mode).

pub mod blobs;
pub mod diesel_schema;
pub mod links;
pub mod models;
pub mod pending;
pub mod schema;
pub mod users;

use std::path::Path;

use diesel::connection::SimpleConnection;
use diesel::dsl::sql;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::LedgerError;

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type PooledConn = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Pool sizing and lock-wait settings
#[derive(Debug, Clone, Copy)]
pub struct LedgerOptions {
    pub pool_size: u32,
    pub busy_timeout_ms: u64,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            busy_timeout_ms: 5_000,
        }
    }
}

impl From<&Config> for LedgerOptions {
    fn from(config: &Config) -> Self {
        Self {
            pool_size: config.pool_size.max(1),
            busy_timeout_ms: config.busy_timeout_ms,
        }
    }
}

/// Per-connection pragmas applied when the pool hands out a connection
#[derive(Debug)]
struct ConnectionPragmas {
    busy_timeout_ms: u64,
}

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        conn.batch_execute(&format!(
            "PRAGMA busy_timeout = {}; PRAGMA foreign_keys = ON; PRAGMA synchronous = NORMAL;",
            self.busy_timeout_ms
        ))
        .map_err(diesel::r2d2::Error::QueryError)
    }
}

/// Shared handle to the ledger database
#[derive(Clone)]
pub struct LedgerDb {
    pool: DbPool,
}

impl LedgerDb {
    /// Open or create the ledger at `db_path`
    pub fn open(db_path: &Path, options: LedgerOptions) -> Result<Self, LedgerError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = db_path.to_string_lossy().to_string();
        info!("Opening ledger database at {:?}", db_path);

        // Journal mode and schema are set up once on a dedicated connection
        // before the pool opens its own.
        {
            let mut conn = SqliteConnection::establish(&url)
                .map_err(|e| LedgerError::Pool(format!("Failed to open SQLite: {}", e)))?;
            conn.batch_execute(&format!(
                "PRAGMA busy_timeout = {}; PRAGMA journal_mode = WAL;",
                options.busy_timeout_ms
            ))?;
            schema::init_schema(&mut conn)?;
        }

        let manager = ConnectionManager::<SqliteConnection>::new(url);
        let pool = Pool::builder()
            .max_size(options.pool_size)
            .connection_customizer(Box::new(ConnectionPragmas {
                busy_timeout_ms: options.busy_timeout_ms,
            }))
            .build(manager)
            .map_err(|e| LedgerError::Pool(format!("Failed to build pool: {}", e)))?;

        debug!(pool_size = options.pool_size, "Ledger pool ready");
        Ok(Self { pool })
    }

    /// Open the ledger described by `config`
    pub fn from_config(config: &Config) -> Result<Self, LedgerError> {
        Self::open(&config.database_path(), LedgerOptions::from(config))
    }

    /// Get a connection from the pool
    pub fn conn(&self) -> Result<PooledConn, LedgerError> {
        self.pool
            .get()
            .map_err(|e| LedgerError::Pool(format!("Failed to get connection: {}", e)))
    }

    /// Run `f` on a pooled connection on the current thread
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, LedgerError>,
    {
        let mut conn = self.conn()?;
        f(&mut conn)
    }

    /// Run blocking ledger work on the blocking thread pool
    ///
    /// Dropping the returned future does not abort `f`; a transaction started
    /// inside it still commits or rolls back as a whole.
    pub async fn run<F, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut SqliteConnection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<LedgerError> + Send + 'static,
    {
        let pool = self.pool.clone();
        let joined = tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| LedgerError::Pool(format!("Failed to get connection: {}", e)))?;
            f(&mut conn)
        })
        .await;

        match joined {
            Ok(result) => result,
            Err(e) => Err(E::from(LedgerError::Join(e.to_string()))),
        }
    }

    /// Get ledger statistics
    pub fn stats(&self) -> Result<LedgerStats, LedgerError> {
        self.with_conn(|conn| {
            use diesel::sql_types::BigInt;
            use diesel_schema::{files, user_files};

            let user_count: i64 = diesel_schema::users::table.count().get_result(conn)?;
            let blob_count: i64 = files::table.count().get_result(conn)?;
            let link_count: i64 = user_files::table.count().get_result(conn)?;
            let stored_bytes: i64 = files::table
                .select(sql::<BigInt>("COALESCE(SUM(files.size), 0)"))
                .first(conn)?;
            let linked_bytes: i64 = user_files::table
                .inner_join(files::table)
                .select(sql::<BigInt>("COALESCE(SUM(files.size), 0)"))
                .first(conn)?;

            Ok(LedgerStats {
                user_count: user_count as u64,
                blob_count: blob_count as u64,
                link_count: link_count as u64,
                stored_bytes: stored_bytes as u64,
                linked_bytes: linked_bytes as u64,
            })
        })
    }
}

/// Ledger statistics
///
/// `linked_bytes - stored_bytes` is the space saved by deduplication.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LedgerStats {
    pub user_count: u64,
    pub blob_count: u64,
    pub link_count: u64,
    pub stored_bytes: u64,
    pub linked_bytes: u64,
}

// Re-exports
pub use models::{ContentBlob, Link, LinkedContent, PendingDelete, User, Visibility};


#[cfg(test)]
mod tests {
    use super::test_support::temp_ledger;
    use super::*;

    #[test]
    fn test_open_creates_empty_ledger() {
        let (db, _temp) = temp_ledger();
        let stats = db.stats().unwrap();
        assert_eq!(stats.user_count, 0);
        assert_eq!(stats.blob_count, 0);
        assert_eq!(stats.stored_bytes, 0);
    }

    #[test]
    fn test_reopen_keeps_rows() {
        let (db, temp) = temp_ledger();
        db.with_conn(|conn| users::create_user(conn, "alice", 100)).unwrap();
        drop(db);

        let reopened =
            LedgerDb::open(&temp.path().join("ledger.db"), LedgerOptions::default()).unwrap();
        assert_eq!(reopened.stats().unwrap().user_count, 1);
    }

    #[tokio::test]
    async fn test_run_moves_work_off_the_executor() {
        let (db, _temp) = temp_ledger();
        let user = db
            .run(|conn| users::create_user(conn, "bob", 10))
            .await
            .unwrap();
        let fetched: Result<User, LedgerError> = db
            .run(move |conn| users::get_user(conn, &user.id))
            .await;
        assert_eq!(fetched.unwrap().username, "bob");
    }
}
