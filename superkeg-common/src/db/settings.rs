//! Runtime settings stored in the `settings` table

use crate::{Error, Result};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

/// Read a setting and parse it
///
/// Returns `Ok(None)` when the key is absent. A stored value that does not
/// parse is a configuration error.
pub async fn get_setting<T: FromStr>(db: &Pool<Sqlite>, key: &str) -> Result<Option<T>> {
    let value: Option<String> = sqlx::query_scalar::<_, Option<String>>("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?
        .flatten();

    match value {
        Some(s) => match s.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(Error::Config(format!(
                "Failed to parse setting '{}' value: {}",
                key, s
            ))),
        },
        None => Ok(None),
    }
}

/// Insert or replace a setting
pub async fn set_setting<T: ToString>(db: &Pool<Sqlite>, key: &str, value: T) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value.to_string())
    .execute(db)
    .await?;

    Ok(())
}

/// Read a setting, writing `default` back when it is missing or unparsable
pub async fn get_or_init_setting<T>(db: &Pool<Sqlite>, key: &str, default: T) -> Result<T>
where
    T: FromStr + ToString,
{
    match get_setting::<T>(db, key).await {
        Ok(Some(value)) => Ok(value),
        Ok(None) => {
            set_setting(db, key, default.to_string()).await?;
            Ok(default)
        }
        Err(Error::Config(msg)) => {
            tracing::warn!("{}; resetting to default {}", msg, default.to_string());
            set_setting(db, key, default.to_string()).await?;
            Ok(default)
        }
        Err(e) => Err(e),
    }
}
