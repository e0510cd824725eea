//! Diesel model definitions for ledger tables
//!
//! - Queryable structs: for SELECT queries (reading data)
//! - Insertable structs: for INSERT queries (writing data)

use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::diesel_schema::*;

// ============================================================================
// Timestamp Helpers (SQLite stores timestamps as TEXT)
// ============================================================================

/// Get current UTC timestamp as ISO 8601 string for SQLite TEXT columns
pub fn current_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Fresh opaque row identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

// ============================================================================
// User Models
// ============================================================================

#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct User {
    pub id: String,
    pub username: String,
    /// Bytes charged for every distinct blob the user links to
    pub used_storage: i64,
    /// Ceiling checked by the admission pre-check, not by ingest
    pub quota: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = users)]
pub struct NewUser<'a> {
    pub id: &'a str,
    pub username: &'a str,
    pub used_storage: i64,
    pub quota: i64,
    pub created_at: &'a str,
}

// ============================================================================
// ContentBlob Models
// ============================================================================

/// One physically stored, uniquely hashed piece of content
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = files)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct ContentBlob {
    pub id: String,
    pub hash: String,
    pub object_key: String,
    pub size: i64,
    pub mime_type: String,
    /// Number of Link rows pointing at this blob
    pub ref_count: i64,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = files)]
pub struct NewContentBlob<'a> {
    pub id: &'a str,
    pub hash: &'a str,
    pub object_key: &'a str,
    pub size: i64,
    pub mime_type: &'a str,
    pub ref_count: i64,
    pub created_at: &'a str,
}

// ============================================================================
// Link Models
// ============================================================================

/// Association between a user and a blob
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = user_files)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Link {
    pub id: String,
    pub user_id: String,
    pub file_id: String,
    /// Set only on the link created by the first-ever ingest of the blob
    pub is_owner: bool,
    pub visibility: String,
    pub downloads: i64,
    pub created_at: String,
}

impl Link {
    pub fn visibility(&self) -> Visibility {
        self.visibility.parse().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = user_files)]
pub struct NewLink<'a> {
    pub id: &'a str,
    pub user_id: &'a str,
    pub file_id: &'a str,
    pub is_owner: bool,
    pub visibility: &'a str,
    pub downloads: i64,
    pub created_at: &'a str,
}

/// A link joined with the blob it points at
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedContent {
    #[serde(flatten)]
    pub link: Link,
    pub blob: ContentBlob,
}

// ============================================================================
// Pending object deletes
// ============================================================================

/// A collected blob whose object delete has not been confirmed
#[derive(Debug, Clone, Queryable, Selectable, Serialize, Deserialize)]
#[diesel(table_name = pending_deletes)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct PendingDelete {
    pub hash: String,
    pub object_key: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = pending_deletes)]
pub struct NewPendingDelete<'a> {
    pub hash: &'a str,
    pub object_key: &'a str,
    pub created_at: &'a str,
}

// ============================================================================
// Visibility
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Public,
    Shared,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Public => "public",
            Visibility::Shared => "shared",
        }
    }
}

impl FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Visibility::Private),
            "public" => Ok(Visibility::Public),
            "shared" => Ok(Visibility::Shared),
            other => Err(format!("unknown visibility: {}", other)),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
