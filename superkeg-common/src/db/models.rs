//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Keg lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KegStatus {
    Untapped,
    Tapped,
    OffTap,
}

impl KegStatus {
    /// Column value stored in `kegs.status`
    pub fn as_str(&self) -> &'static str {
        match self {
            KegStatus::Untapped => "untapped",
            KegStatus::Tapped => "tapped",
            KegStatus::OffTap => "off_tap",
        }
    }
}

impl fmt::Display for KegStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KegStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "untapped" => Ok(KegStatus::Untapped),
            "tapped" => Ok(KegStatus::Tapped),
            "off_tap" => Ok(KegStatus::OffTap),
            other => Err(Error::InvalidInput(format!("Unknown keg status: {}", other))),
        }
    }
}

/// A keg record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Keg {
    pub id: i64,
    pub name: String,
    pub style: String,
    pub brewer: String,
    pub abv: f64,
    /// Liters left in the keg, never negative
    pub volume_remaining: f64,
    /// Liters when the keg was added (None for legacy rows)
    pub original_volume: Option<f64>,
    pub tap_position: Option<u8>,
    pub status: KegStatus,
    pub date_created: DateTime<Utc>,
    pub date_last_tapped: Option<DateTime<Utc>>,
    pub date_finished: Option<DateTime<Utc>>,
}

impl Keg {
    /// Less than 10% of the original volume left
    pub fn is_low_volume(&self) -> bool {
        let original = match self.original_volume {
            Some(v) if v > 0.0 => v,
            _ => self.volume_remaining,
        };
        original > 0.0 && self.volume_remaining < 0.1 * original
    }
}

/// Fields for a new keg
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewKeg {
    pub name: String,
    pub style: String,
    pub brewer: String,
    pub abv: f64,
    /// Initial volume in liters
    pub volume: f64,
}

/// The keg currently tapped at a tap position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TappedKeg {
    pub id: i64,
    pub name: String,
    pub tap_position: u8,
}

/// An entry in the append-only pour ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PourEvent {
    pub id: i64,
    pub keg_id: i64,
    /// Liters dispensed
    pub volume_dispensed: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of a clamped volume subtraction
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SubtractOutcome {
    /// New `volume_remaining` in liters
    Remaining(f64),
    /// No tapped keg with that id
    NotFoundOrNotTapped,
}

/// Proof of a committed pour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitReceipt {
    pub keg_id: i64,
    pub event_id: i64,
    pub volume_dispensed: f64,
    pub volume_remaining: f64,
    pub timestamp: DateTime<Utc>,
}

/// Result of an atomic pour commit
#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(CommitReceipt),
    NotFoundOrNotTapped,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keg(remaining: f64, original: Option<f64>) -> Keg {
        Keg {
            id: 1,
            name: "Pale".to_string(),
            style: "APA".to_string(),
            brewer: "Local".to_string(),
            abv: 5.2,
            volume_remaining: remaining,
            original_volume: original,
            tap_position: Some(1),
            status: KegStatus::Tapped,
            date_created: Utc::now(),
            date_last_tapped: None,
            date_finished: None,
        }
    }

    #[test]
    fn test_status_round_trip() {
        for status in [KegStatus::Untapped, KegStatus::Tapped, KegStatus::OffTap] {
            assert_eq!(status.as_str().parse::<KegStatus>().unwrap(), status);
        }
        assert!("TAPPED".parse::<KegStatus>().is_err());
    }

    #[test]
    fn test_low_volume_uses_original() {
        assert!(keg(1.0, Some(19.5)).is_low_volume());
        assert!(!keg(5.0, Some(19.5)).is_low_volume());
    }

    #[test]
    fn test_low_volume_without_original() {
        // Falls back to the remaining volume, which is never below 10% of itself
        assert!(!keg(3.0, None).is_low_volume());
        assert!(!keg(0.0, None).is_low_volume());
    }
}
