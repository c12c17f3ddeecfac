//! Keg store: tap lookups, clamped volume subtraction, and the pour ledger
//!
//! The flow monitor reaches keg data only through [`KegStore`]. The SQLite
//! implementation performs every volume mutation as a single
//! `UPDATE ... MAX(0, ...)` so concurrent commits from several taps never lose
//! an update.

use crate::db::models::{
    CommitOutcome, CommitReceipt, Keg, KegStatus, NewKeg, PourEvent, SubtractOutcome, TappedKeg,
};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Keg persistence operations consumed by the flow monitor
#[async_trait]
pub trait KegStore: Send + Sync {
    /// The keg currently tapped at `tap_position`, if any
    async fn find_tapped_keg_by_tap_position(&self, tap_position: u8) -> Result<Option<TappedKeg>>;

    /// Every tap position that has a tapped keg
    async fn tap_assignments(&self) -> Result<BTreeMap<u8, TappedKeg>>;

    /// Subtract `volume` liters from a tapped keg, clamping at zero
    async fn subtract_volume(&self, keg_id: i64, volume: f64) -> Result<SubtractOutcome>;

    /// Append a pour event, returning its id
    async fn append_pour_event(&self, keg_id: i64, volume: f64, at: DateTime<Utc>) -> Result<i64>;

    /// Subtract and append as one transaction
    async fn commit_pour(&self, keg_id: i64, volume: f64, at: DateTime<Utc>) -> Result<CommitOutcome>;
}

/// SQLite-backed keg store
#[derive(Clone)]
pub struct SqliteKegStore {
    pool: SqlitePool,
}

impl SqliteKegStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // Administrative operations
    // ========================================================================

    /// Insert a new untapped keg
    pub async fn create_keg(&self, new_keg: &NewKeg) -> Result<Keg> {
        if new_keg.volume < 0.0 {
            return Err(Error::InvalidInput(format!(
                "Keg volume must not be negative: {}",
                new_keg.volume
            )));
        }

        let now = Utc::now();
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO kegs (name, style, brewer, abv, volume_remaining, original_volume,
                              status, date_created)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&new_keg.name)
        .bind(&new_keg.style)
        .bind(&new_keg.brewer)
        .bind(new_keg.abv)
        .bind(new_keg.volume)
        .bind(new_keg.volume)
        .bind(KegStatus::Untapped.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        info!("Created keg {} ({})", id, new_keg.name);

        self.get_keg(id)
            .await?
            .ok_or_else(|| Error::Internal(format!("Keg {} vanished after insert", id)))
    }

    /// Load a keg by id
    pub async fn get_keg(&self, keg_id: i64) -> Result<Option<Keg>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, style, brewer, abv, volume_remaining, original_volume,
                   tap_position, status, date_created, date_last_tapped, date_finished
            FROM kegs
            WHERE id = ?
            "#,
        )
        .bind(keg_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| keg_from_row(&r)).transpose()
    }

    /// Put a keg on a tap
    ///
    /// Refuses with [`Error::TapConflict`] when another keg is already tapped
    /// at that position; the occupant is left untouched.
    pub async fn tap_keg(&self, keg_id: i64, tap_position: u8) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let occupant: Option<i64> =
            sqlx::query_scalar("SELECT id FROM kegs WHERE tap_position = ? AND status = 'tapped'")
                .bind(i64::from(tap_position))
                .fetch_optional(&mut *tx)
                .await?;

        if let Some(occupant) = occupant {
            if occupant != keg_id {
                return Err(Error::TapConflict {
                    tap: tap_position,
                    occupant,
                });
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE kegs
            SET status = 'tapped', tap_position = ?, date_last_tapped = ?
            WHERE id = ?
            "#,
        )
        .bind(i64::from(tap_position))
        .bind(Utc::now())
        .bind(keg_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Keg {}", keg_id)));
        }

        tx.commit().await?;
        info!("Keg {} tapped at position {}", keg_id, tap_position);
        Ok(())
    }

    /// Take a keg off its tap
    pub async fn take_off_tap(&self, keg_id: i64) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE kegs
            SET status = 'off_tap', tap_position = NULL, date_finished = ?
            WHERE id = ?
            "#,
        )
        .bind(Utc::now())
        .bind(keg_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("Keg {}", keg_id)));
        }

        info!("Keg {} taken off tap", keg_id);
        Ok(())
    }

    /// Most recent pour events, newest first
    pub async fn recent_pour_events(&self, limit: u32) -> Result<Vec<PourEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, keg_id, volume_dispensed, timestamp
            FROM pour_events
            ORDER BY timestamp DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pour_event_from_row).collect()
    }

    /// Pour events recorded for one keg, oldest first
    pub async fn pour_events_for_keg(&self, keg_id: i64) -> Result<Vec<PourEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, keg_id, volume_dispensed, timestamp
            FROM pour_events
            WHERE keg_id = ?
            ORDER BY timestamp ASC, id ASC
            "#,
        )
        .bind(keg_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(pour_event_from_row).collect()
    }
}

#[async_trait]
impl KegStore for SqliteKegStore {
    async fn find_tapped_keg_by_tap_position(&self, tap_position: u8) -> Result<Option<TappedKeg>> {
        let row = sqlx::query(
            "SELECT id, name, tap_position FROM kegs WHERE tap_position = ? AND status = 'tapped'",
        )
        .bind(i64::from(tap_position))
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| tapped_keg_from_row(&r)).transpose()
    }

    async fn tap_assignments(&self) -> Result<BTreeMap<u8, TappedKeg>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, tap_position FROM kegs
            WHERE status = 'tapped' AND tap_position IS NOT NULL
            ORDER BY tap_position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut assignments = BTreeMap::new();
        for row in &rows {
            let keg = tapped_keg_from_row(row)?;
            assignments.insert(keg.tap_position, keg);
        }
        Ok(assignments)
    }

    async fn subtract_volume(&self, keg_id: i64, volume: f64) -> Result<SubtractOutcome> {
        validate_volume(volume)?;

        let remaining: Option<f64> = sqlx::query_scalar(
            r#"
            UPDATE kegs
            SET volume_remaining = MAX(0.0, volume_remaining - ?)
            WHERE id = ? AND status = 'tapped'
            RETURNING volume_remaining
            "#,
        )
        .bind(volume)
        .bind(keg_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match remaining {
            Some(v) => SubtractOutcome::Remaining(v),
            None => SubtractOutcome::NotFoundOrNotTapped,
        })
    }

    async fn append_pour_event(&self, keg_id: i64, volume: f64, at: DateTime<Utc>) -> Result<i64> {
        validate_volume(volume)?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO pour_events (keg_id, volume_dispensed, timestamp) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(keg_id)
        .bind(volume)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    async fn commit_pour(&self, keg_id: i64, volume: f64, at: DateTime<Utc>) -> Result<CommitOutcome> {
        validate_volume(volume)?;

        let mut tx = self.pool.begin().await?;

        let remaining: Option<f64> = sqlx::query_scalar(
            r#"
            UPDATE kegs
            SET volume_remaining = MAX(0.0, volume_remaining - ?)
            WHERE id = ? AND status = 'tapped'
            RETURNING volume_remaining
            "#,
        )
        .bind(volume)
        .bind(keg_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(volume_remaining) = remaining else {
            // Dropping the transaction rolls it back
            debug!(keg_id, "Commit skipped: keg not found or not tapped");
            return Ok(CommitOutcome::NotFoundOrNotTapped);
        };

        let event_id: i64 = sqlx::query_scalar(
            "INSERT INTO pour_events (keg_id, volume_dispensed, timestamp) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(keg_id)
        .bind(volume)
        .bind(at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(CommitOutcome::Committed(CommitReceipt {
            keg_id,
            event_id,
            volume_dispensed: volume,
            volume_remaining,
            timestamp: at,
        }))
    }
}

fn validate_volume(volume: f64) -> Result<()> {
    if !volume.is_finite() || volume <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "Pour volume must be positive: {}",
            volume
        )));
    }
    Ok(())
}

fn tap_position_from_column(raw: i64) -> Result<u8> {
    u8::try_from(raw).map_err(|_| Error::Internal(format!("Invalid tap position in database: {}", raw)))
}

fn tapped_keg_from_row(row: &SqliteRow) -> Result<TappedKeg> {
    let raw: i64 = row.try_get("tap_position")?;
    Ok(TappedKeg {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        tap_position: tap_position_from_column(raw)?,
    })
}

fn keg_from_row(row: &SqliteRow) -> Result<Keg> {
    let status: String = row.try_get("status")?;
    let tap_position: Option<i64> = row.try_get("tap_position")?;

    Ok(Keg {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        style: row.try_get("style")?,
        brewer: row.try_get("brewer")?,
        abv: row.try_get("abv")?,
        volume_remaining: row.try_get("volume_remaining")?,
        original_volume: row.try_get("original_volume")?,
        tap_position: tap_position.map(tap_position_from_column).transpose()?,
        status: status.parse()?,
        date_created: row.try_get("date_created")?,
        date_last_tapped: row.try_get("date_last_tapped")?,
        date_finished: row.try_get("date_finished")?,
    })
}

fn pour_event_from_row(row: &SqliteRow) -> Result<PourEvent> {
    Ok(PourEvent {
        id: row.try_get("id")?,
        keg_id: row.try_get("keg_id")?,
        volume_dispensed: row.try_get("volume_dispensed")?,
        timestamp: row.try_get("timestamp")?,
    })
}
