//! Event types for the SuperKeg event system
//!
//! Provides the shared [`KegEvent`] enum and the [`EventBus`] used to fan
//! events out to SSE listeners and in-process observers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// A pour in progress as shown on the display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivePour {
    pub keg_id: i64,
    pub keg_name: String,
    /// Measured liters so far
    pub current_volume: f64,
    /// Display-only guess at the final pour size, not a measurement
    pub total_volume_estimate: f64,
}

/// A pour that just ended, shown once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedPour {
    pub keg_id: i64,
    pub keg_name: String,
    pub final_volume: f64,
}

/// Snapshot pushed to the display endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub active_pours: Vec<ActivePour>,
    pub completed_pours: Vec<CompletedPour>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn is_empty(&self) -> bool {
        self.active_pours.is_empty() && self.completed_pours.is_empty()
    }
}

/// How a committed pour reached the keg store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPath {
    /// Keg web API acknowledged the pour
    Remote,
    /// Written directly to the shared database after the remote call failed
    LocalFallback,
}

/// SuperKeg event types
///
/// Serialized with a `type` tag for SSE transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum KegEvent {
    /// First flow seen on an idle tap
    PourStarted {
        tap: u8,
        keg_id: i64,
        session_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    /// Volume accumulated in an active session
    PourProgress {
        tap: u8,
        keg_id: i64,
        session_id: Uuid,
        volume: f64,
        flow_rate: f64,
        timestamp: DateTime<Utc>,
    },

    /// Session ended at or above the minimum pour size
    PourCompleted {
        tap: u8,
        keg_id: i64,
        session_id: Uuid,
        volume: f64,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Session ended below the minimum pour size
    PourDiscarded {
        tap: u8,
        keg_id: i64,
        session_id: Uuid,
        volume: f64,
        timestamp: DateTime<Utc>,
    },

    /// Pour recorded against the keg
    PourCommitted {
        keg_id: i64,
        session_id: Uuid,
        volume: f64,
        volume_remaining: Option<f64>,
        path: CommitPath,
        timestamp: DateTime<Utc>,
    },

    /// Pour could not be recorded
    PourDropped {
        keg_id: i64,
        session_id: Uuid,
        volume: f64,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Tap calibration changed
    CalibrationUpdated {
        tap: u8,
        pulses_per_liter: f64,
        timestamp: DateTime<Utc>,
    },

    /// Tap channel configured for a keg
    TapConfigured {
        tap: u8,
        keg_id: i64,
        keg_name: String,
        channel_id: u32,
        timestamp: DateTime<Utc>,
    },

    /// Tap channel stopped
    TapStopped {
        tap: u8,
        timestamp: DateTime<Utc>,
    },

    /// Progress board snapshot (same payload as the display push)
    ProgressSnapshot(ProgressSnapshot),
}

impl KegEvent {
    /// Event type name, used as the SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            KegEvent::PourStarted { .. } => "PourStarted",
            KegEvent::PourProgress { .. } => "PourProgress",
            KegEvent::PourCompleted { .. } => "PourCompleted",
            KegEvent::PourDiscarded { .. } => "PourDiscarded",
            KegEvent::PourCommitted { .. } => "PourCommitted",
            KegEvent::PourDropped { .. } => "PourDropped",
            KegEvent::CalibrationUpdated { .. } => "CalibrationUpdated",
            KegEvent::TapConfigured { .. } => "TapConfigured",
            KegEvent::TapStopped { .. } => "TapStopped",
            KegEvent::ProgressSnapshot(_) => "ProgressSnapshot",
        }
    }
}

/// Central event distribution bus
///
/// Thin wrapper over a tokio broadcast channel. Slow subscribers lag and
/// lose the oldest events; emitters never block.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<KegEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<KegEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: KegEvent) -> Result<usize, broadcast::error::SendError<KegEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: KegEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(KegEvent::TapStopped {
            tap: 2,
            timestamp: Utc::now(),
        })
        .unwrap();

        match rx.recv().await.unwrap() {
            KegEvent::TapStopped { tap, .. } => assert_eq!(tap, 2),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus
            .emit(KegEvent::TapStopped {
                tap: 1,
                timestamp: Utc::now()
            })
            .is_err());

        // Lossy emit never fails
        bus.emit_lossy(KegEvent::TapStopped {
            tap: 1,
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn test_serialized_with_type_tag() {
        let event = KegEvent::PourCommitted {
            keg_id: 7,
            session_id: Uuid::nil(),
            volume: 0.2,
            volume_remaining: Some(18.5),
            path: CommitPath::LocalFallback,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "PourCommitted");
        assert_eq!(json["path"], "local_fallback");
        assert_eq!(event.event_type(), "PourCommitted");
    }

    #[test]
    fn test_snapshot_event_flattens_payload() {
        let event = KegEvent::ProgressSnapshot(ProgressSnapshot {
            active_pours: vec![ActivePour {
                keg_id: 1,
                keg_name: "Stout".to_string(),
                current_volume: 0.1,
                total_volume_estimate: 0.2,
            }],
            completed_pours: vec![],
            timestamp: Utc::now(),
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ProgressSnapshot");
        assert_eq!(json["active_pours"][0]["keg_name"], "Stout");
    }
}
