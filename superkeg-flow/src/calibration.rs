//! Per-tap calibration persistence
//!
//! One JSON file per tap (`tap_<n>_config.json`) under the calibration
//! directory, written atomically.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use superkeg_common::config::write_atomic;
use tracing::{debug, info};

/// Calibration of one flow meter channel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationProfile {
    pub channel_id: u32,
    pub pulses_per_liter: f64,
}

impl CalibrationProfile {
    pub fn new(channel_id: u32, pulses_per_liter: f64) -> Result<Self> {
        if !(pulses_per_liter.is_finite() && pulses_per_liter > 0.0) {
            return Err(Error::CalibrationInvalid(format!(
                "pulses per liter must be positive, got {}",
                pulses_per_liter
            )));
        }
        Ok(Self {
            channel_id,
            pulses_per_liter,
        })
    }
}

/// On-disk calibration record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub tap_number: u8,
    pub channel_id: u32,
    pub pulses_per_liter: f64,
    pub calibrated_at: DateTime<Utc>,
}

impl CalibrationRecord {
    pub fn profile(&self) -> Result<CalibrationProfile> {
        CalibrationProfile::new(self.channel_id, self.pulses_per_liter)
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationStore {
    dir: PathBuf,
}

impl CalibrationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, tap_number: u8) -> PathBuf {
        self.dir.join(format!("tap_{}_config.json", tap_number))
    }

    /// Load a tap's record; `Ok(None)` when never calibrated
    pub fn load(&self, tap_number: u8) -> Result<Option<CalibrationRecord>> {
        let path = self.path_for(tap_number);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(tap = tap_number, "No calibration file at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let record: CalibrationRecord = serde_json::from_str(&text)?;
        if record.tap_number != tap_number {
            return Err(Error::CalibrationInvalid(format!(
                "{} belongs to tap {}",
                path.display(),
                record.tap_number
            )));
        }
        record.profile()?;
        Ok(Some(record))
    }

    pub fn save(&self, record: &CalibrationRecord) -> Result<()> {
        CalibrationProfile::new(record.channel_id, record.pulses_per_liter)?;
        let json = serde_json::to_vec_pretty(record)?;
        let path = self.path_for(record.tap_number);
        write_atomic(&path, &json)?;
        info!(
            tap = record.tap_number,
            "Saved calibration ({:.2} pulses/L) to {}",
            record.pulses_per_liter,
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(tap_number: u8, ppl: f64) -> CalibrationRecord {
        CalibrationRecord {
            tap_number,
            channel_id: 17,
            pulses_per_liter: ppl,
            calibrated_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path());
        assert!(store.load(1).unwrap().is_none());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path().join("calibration"));

        let saved = record(2, 512.5);
        store.save(&saved).unwrap();

        assert!(store.path_for(2).ends_with("tap_2_config.json"));
        assert_eq!(store.load(2).unwrap(), Some(saved));
    }

    #[test]
    fn test_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path());
        std::fs::write(store.path_for(3), "{ not json").unwrap();
        assert!(matches!(store.load(3), Err(Error::Json(_))));
    }

    #[test]
    fn test_invalid_factor_rejected() {
        let dir = TempDir::new().unwrap();
        let store = CalibrationStore::new(dir.path());
        assert!(store.save(&record(1, 0.0)).is_err());
        assert!(!store.path_for(1).exists());

        std::fs::write(
            store.path_for(4),
            r#"{"tap_number":4,"channel_id":22,"pulses_per_liter":-3.0,"calibrated_at":"2026-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(matches!(store.load(4), Err(Error::CalibrationInvalid(_))));
    }
}
