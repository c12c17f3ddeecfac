//! Tests for database initialization and runtime settings

use superkeg_common::db::{get_or_init_setting, get_setting, init_database, set_setting};
use tempfile::TempDir;

#[tokio::test]
async fn test_database_creation_when_missing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("nested").join("kegs.db");

    let pool = init_database(&db_path).await;
    assert!(pool.is_ok(), "Database initialization failed: {:?}", pool.err());
    assert!(db_path.exists(), "Database file was not created");
}

#[tokio::test]
async fn test_database_opens_existing() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("kegs.db");

    let pool1 = init_database(&db_path).await.unwrap();
    pool1.close().await;

    // Schema creation is idempotent
    let pool2 = init_database(&db_path).await;
    assert!(pool2.is_ok(), "Failed to open existing database: {:?}", pool2.err());
}

#[tokio::test]
async fn test_tables_created() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("kegs.db")).await.unwrap();

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .fetch_all(&pool)
            .await
            .unwrap();

    for expected in ["kegs", "pour_events", "settings"] {
        assert!(tables.iter().any(|t| t == expected), "missing table {}", expected);
    }
}

#[tokio::test]
async fn test_journal_mode_is_wal() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("kegs.db")).await.unwrap();

    let mode: String = sqlx::query_scalar("PRAGMA journal_mode")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[tokio::test]
async fn test_setting_round_trip() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("kegs.db")).await.unwrap();

    assert_eq!(get_setting::<u64>(&pool, "pour_timeout_ms").await.unwrap(), None);

    set_setting(&pool, "pour_timeout_ms", 4000u64).await.unwrap();
    assert_eq!(get_setting::<u64>(&pool, "pour_timeout_ms").await.unwrap(), Some(4000));

    set_setting(&pool, "pour_timeout_ms", 6000u64).await.unwrap();
    assert_eq!(get_setting::<u64>(&pool, "pour_timeout_ms").await.unwrap(), Some(6000));
}

#[tokio::test]
async fn test_unparsable_setting_is_error() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("kegs.db")).await.unwrap();

    set_setting(&pool, "min_pour_ml", "lots").await.unwrap();
    assert!(get_setting::<f64>(&pool, "min_pour_ml").await.is_err());
}

#[tokio::test]
async fn test_default_written_back() {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("kegs.db")).await.unwrap();

    let value = get_or_init_setting(&pool, "debounce_us", 1000u64).await.unwrap();
    assert_eq!(value, 1000);
    assert_eq!(get_setting::<u64>(&pool, "debounce_us").await.unwrap(), Some(1000));

    // Corrupt values are reset to the default
    set_setting(&pool, "debounce_us", "fast").await.unwrap();
    let value = get_or_init_setting(&pool, "debounce_us", 1000u64).await.unwrap();
    assert_eq!(value, 1000);
    assert_eq!(get_setting::<u64>(&pool, "debounce_us").await.unwrap(), Some(1000));
}
