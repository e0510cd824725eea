//! Elohim Dedup operator CLI
//!
//! Thin boundary layer over the dedup services. Every command prints JSON on
//! stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! # Register a user with the default quota
//! elohim-dedup add-user alice
//!
//! # Ingest a file (hashed, admission-checked, then deduplicated)
//! elohim-dedup ingest --user alice ./photo.png --mime image/png
//!
//! # Remove the owner link (collects the blob if it was the last link)
//! elohim-dedup remove --user alice <content-id>
//!
//! # Inspect
//! elohim-dedup list --user alice
//! elohim-dedup usage --user alice
//! elohim-dedup audit
//!
//! # Retry object deletes left by failed collections
//! elohim-dedup sweep
//! ```

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use elohim_dedup::{hash_file, Config, IngestRequest, Services};
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "elohim-dedup")]
#[command(about = "Content-addressed deduplication and quota ledger")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "ELOHIM_DEDUP_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory (ledger database and blob objects)
    #[arg(long, env = "ELOHIM_DEDUP_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a user
    AddUser {
        username: String,
        /// Quota in bytes (defaults to `default_quota_bytes`)
        #[arg(long)]
        quota: Option<u64>,
    },

    /// Hash a file and ingest it for a user
    Ingest {
        /// User id or username
        #[arg(long)]
        user: String,
        path: PathBuf,
        #[arg(long, default_value = "application/octet-stream")]
        mime: String,
        /// Skip the quota admission pre-check
        #[arg(long)]
        no_admission: bool,
    },

    /// Remove the user's owner link to a content item
    Remove {
        #[arg(long)]
        user: String,
        content_id: String,
    },

    /// Copy a linked content item's bytes to a file
    Get {
        #[arg(long)]
        user: String,
        content_id: String,
        #[arg(short, long)]
        out: PathBuf,
    },

    /// List a user's linked content
    List {
        #[arg(long)]
        user: String,
    },

    /// Show a user's storage usage
    Usage {
        #[arg(long)]
        user: String,
    },

    /// Check usage counters and ref counts against the link rows
    Audit,

    /// Retry object deletes that failed after their blob was collected
    Sweep,

    /// Ledger totals and space saved
    Stats,
}

#[derive(Serialize)]
struct AuditReport {
    usage: Vec<elohim_dedup::UsageDrift>,
    ref_counts: Vec<elohim_dedup::RefCountDrift>,
}

#[derive(Serialize)]
struct StatsReport {
    #[serde(flatten)]
    ledger: elohim_dedup::LedgerStats,
    saved_bytes: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("elohim_dedup=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    tokio::fs::create_dir_all(&config.storage_dir).await?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let services = Services::open(&config).await?;
    let _listener = elohim_dedup::services::spawn_logging_listener(services.events.clone());

    match args.command {
        Command::AddUser { username, quota } => {
            let user = services.quota.register_user(&username, quota).await?;
            print_json(&user)
        }

        Command::Ingest {
            user,
            path,
            mime,
            no_admission,
        } => {
            let user_id = resolve_user(&services, &user).await?;
            let hashed = hash_file(&path)
                .await
                .with_context(|| format!("hashing {}", path.display()))?;
            debug!(hash = %hashed.hash, size = hashed.size, "Hashed upload");

            if !no_admission {
                services
                    .quota
                    .check_admission(&user_id, Some(hashed.size))
                    .await?;
            }

            let file = tokio::fs::File::open(&path).await?;
            let receipt = services
                .ingest
                .ingest(
                    IngestRequest {
                        user_id,
                        hash: hashed.hash,
                        size: hashed.size,
                        mime_type: mime,
                    },
                    file,
                )
                .await?;
            print_json(&receipt)
        }

        Command::Remove { user, content_id } => {
            let user_id = resolve_user(&services, &user).await?;
            let removal = services.gc.remove_link(&user_id, &content_id).await?;
            print_json(&removal)
        }

        Command::Get {
            user,
            content_id,
            out,
        } => {
            let user_id = resolve_user(&services, &user).await?;
            let (blob, mut reader) = services.ingest.open_content(&user_id, &content_id).await?;
            let mut file = tokio::fs::File::create(&out).await?;
            let written = tokio::io::copy(&mut reader, &mut file).await?;
            info!(content_id = %blob.id, bytes = written, path = %out.display(), "Wrote content");
            print_json(&blob)
        }

        Command::List { user } => {
            let user_id = resolve_user(&services, &user).await?;
            print_json(&services.ingest.list_links(&user_id).await?)
        }

        Command::Usage { user } => {
            let user_id = resolve_user(&services, &user).await?;
            print_json(&services.quota.usage(&user_id).await?)
        }

        Command::Audit => {
            let report = AuditReport {
                usage: services.quota.audit().await?,
                ref_counts: services.gc.audit_ref_counts().await?,
            };
            print_json(&report)
        }

        Command::Sweep => print_json(&services.gc.sweep_pending_deletes().await?),

        Command::Stats => {
            let ledger = services.db.stats()?;
            let saved_bytes = ledger.linked_bytes.saturating_sub(ledger.stored_bytes);
            print_json(&StatsReport { ledger, saved_bytes })
        }
    }
}

/// Accept either a username or a user id
async fn resolve_user(services: &Services, user: &str) -> anyhow::Result<String> {
    match services.quota.find_user(user).await? {
        Some(found) => Ok(found.id),
        None => Ok(user.to_string()),
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
