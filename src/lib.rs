//! Elohim Dedup - content-addressed deduplication and quota ledger
//!
//! Every distinct upload is stored once. Users hold Links to shared content
//! blobs, each blob carries a reference count, and each user is charged once
//! per distinct blob they link to.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`IngestCoordinator`] | hashed upload -> new blob, extra link, or no-op |
//! | [`QuotaAccountant`] | `used_storage` charge/release, usage reports, admission pre-check |
//! | [`GarbageCollector`] | owner link removal, blob row and object collection |
//! | [`LedgerDb`] | SQLite ledger of users, blobs and links |
//! | [`BlobStore`] | put/get/delete capability over an object store |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/elohim-dedup/
//! ├── ledger.db              # users, files, user_files
//! ├── blobs/                 # Content-addressed objects
//! │   └── abcd/sha256-abcd...  # First 4 hex chars as subdir
//! └── config.toml
//! ```

pub mod blob_store;
pub mod config;
pub mod db;
pub mod error;
pub mod hashing;
pub mod services;

pub use blob_store::{BlobReader, BlobStore, FsBlobStore, MemoryBlobStore, StorageStats};
pub use config::Config;
pub use db::{
    ContentBlob, LedgerDb, LedgerOptions, LedgerStats, Link, LinkedContent, PendingDelete, User,
    Visibility,
};
pub use error::{BlobStoreError, ConflictKind, DedupError, LedgerError, RowKind};
pub use hashing::{compute_hash, hash_file, hash_reader, HashedContent};
pub use services::{
    DedupEvent, EventBus, GarbageCollector, IngestCoordinator, IngestDisposition, IngestReceipt,
    IngestRequest, QuotaAccountant, RefCountDrift, Removal, Services, SweepReport, UsageDrift,
    UsageReport,
};
