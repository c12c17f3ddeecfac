//! Database initialization
//!
//! The keg database is shared by the web application and the flow monitor.
//! Whichever process starts first creates the schema; every statement here is
//! idempotent.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Initialize database connection and create tables if needed
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    // Create parent directory if it doesn't exist
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Pragmas go on the connect options so every pooled connection gets them
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_millis(5000));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }

    create_schema(&pool).await?;

    Ok(pool)
}

/// Create all tables and indexes (idempotent)
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_settings_table(pool).await?;
    create_kegs_table(pool).await?;
    create_pour_events_table(pool).await?;
    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT OR IGNORE INTO schema_version (version) VALUES (1)")
        .execute(pool)
        .await?;

    Ok(())
}

/// Create the settings table
///
/// Stores runtime configuration key-value pairs.
pub async fn create_settings_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT,
            updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_kegs_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS kegs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            style TEXT NOT NULL,
            brewer TEXT NOT NULL DEFAULT '',
            abv REAL NOT NULL,
            volume_remaining REAL NOT NULL CHECK (volume_remaining >= 0),
            original_volume REAL,
            tap_position INTEGER,
            status TEXT NOT NULL DEFAULT 'untapped'
                CHECK (status IN ('untapped', 'tapped', 'off_tap')),
            date_created TIMESTAMP NOT NULL,
            date_last_tapped TIMESTAMP,
            date_finished TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one tapped keg per tap position
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_kegs_tapped_position
        ON kegs (tap_position) WHERE status = 'tapped'
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn create_pour_events_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pour_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            keg_id INTEGER NOT NULL,
            volume_dispensed REAL NOT NULL CHECK (volume_dispensed > 0),
            timestamp TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_pour_events_keg_time ON pour_events (keg_id, timestamp)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
