//! SQLite connection management.
//!
//! The store is an explicitly constructed pool handed to the run
//! controller; nothing here is global. WAL mode lets the CRM application
//! keep reading and writing while a pass is running.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use crate::config::Config;

/// Create a pool, creating the database file and parent directories if needed.
///
/// Used by `vectorize init`.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    open(config, true).await
}

/// Open a pool on an existing database. A missing file is an error.
pub async fn connect_existing(config: &Config) -> Result<SqlitePool> {
    open(config, false).await
}

async fn open(config: &Config, create: bool) -> Result<SqlitePool> {
    let db_path = &config.db.path;

    let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", db_path.display()))?
        .create_if_missing(create)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database at {}", db_path.display()))?;

    Ok(pool)
}
