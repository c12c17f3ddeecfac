//! Live pour progress for the display
//!
//! The board holds at most one entry per keg. Completed pours are reported
//! once in the next snapshot and then forgotten. Entries that stop updating
//! for the staleness interval are converted to completed notices, so a
//! crashed session never leaves a pour stuck on screen.

use crate::reconcile::remote::DisplayPublisher;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use superkeg_common::events::{ActivePour, CompletedPour, EventBus, KegEvent, ProgressSnapshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Upper bound of the display estimate, in liters
pub const DISPLAY_ESTIMATE_CAP: f64 = 0.5;

/// Guess at the final pour size for the UI
///
/// Twice the current volume, capped at half a liter. Not a measurement.
pub fn display_estimate(current_volume: f64) -> f64 {
    (current_volume * 2.0).min(DISPLAY_ESTIMATE_CAP)
}

#[derive(Debug, Clone)]
struct ActiveEntry {
    keg_name: String,
    current_volume: f64,
    total_volume_estimate: f64,
    updated_at: Instant,
}

#[derive(Debug, Default)]
struct BoardState {
    active: BTreeMap<i64, ActiveEntry>,
    completed: Vec<CompletedPour>,
}

pub struct ProgressBoard {
    stale_after: Duration,
    state: Mutex<BoardState>,
}

impl ProgressBoard {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            state: Mutex::new(BoardState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the live entry for a keg, superseding the previous one
    pub fn publish(&self, keg_id: i64, keg_name: &str, current_volume: f64, estimate: f64, now: Instant) {
        self.lock().active.insert(
            keg_id,
            ActiveEntry {
                keg_name: keg_name.to_string(),
                current_volume,
                total_volume_estimate: estimate,
                updated_at: now,
            },
        );
    }

    /// Replace the live entry with a one-shot completed notice
    ///
    /// Nothing is added when the entry already expired, since the staleness
    /// sweep reported it.
    pub fn finish(&self, keg_id: i64, final_volume: f64) {
        let mut state = self.lock();
        let Some(entry) = state.active.remove(&keg_id) else {
            debug!(keg_id, "No live progress entry to finish");
            return;
        };
        state.completed.push(CompletedPour {
            keg_id,
            keg_name: entry.keg_name,
            final_volume,
        });
    }

    /// Drop the live entry without a notice
    pub fn discard(&self, keg_id: i64) {
        self.lock().active.remove(&keg_id);
    }

    /// Current view; drains completed notices and expires stale entries
    pub fn snapshot(&self, now: Instant) -> ProgressSnapshot {
        let mut state = self.lock();

        let stale: Vec<i64> = state
            .active
            .iter()
            .filter(|(_, e)| now.saturating_duration_since(e.updated_at) >= self.stale_after)
            .map(|(id, _)| *id)
            .collect();
        for keg_id in stale {
            if let Some(entry) = state.active.remove(&keg_id) {
                debug!(keg_id, "Stale progress entry converted to completed");
                state.completed.push(CompletedPour {
                    keg_id,
                    keg_name: entry.keg_name,
                    final_volume: entry.current_volume,
                });
            }
        }

        let active_pours = state
            .active
            .iter()
            .map(|(keg_id, e)| ActivePour {
                keg_id: *keg_id,
                keg_name: e.keg_name.clone(),
                current_volume: e.current_volume,
                total_volume_estimate: e.total_volume_estimate,
            })
            .collect();

        ProgressSnapshot {
            active_pours,
            completed_pours: std::mem::take(&mut state.completed),
            timestamp: Utc::now(),
        }
    }
}

/// Periodically push board snapshots to the display and the event bus
///
/// Empty snapshots are skipped. Failed pushes are logged, never retried.
pub async fn run_publisher(
    board: Arc<ProgressBoard>,
    publisher: Option<Arc<dyn DisplayPublisher>>,
    event_bus: EventBus,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut consecutive_failures: u32 = 0;

    info!("Progress publisher started ({}ms interval)", interval.as_millis());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let snapshot = board.snapshot(Instant::now());
        if snapshot.is_empty() {
            continue;
        }

        event_bus.emit_lossy(KegEvent::ProgressSnapshot(snapshot.clone()));

        if let Some(publisher) = &publisher {
            match publisher.publish(&snapshot).await {
                Ok(()) => {
                    if consecutive_failures > 0 {
                        info!("Display publish recovered after {} failures", consecutive_failures);
                    }
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    if consecutive_failures == 1 {
                        warn!("Display publish failed: {}", e);
                    } else {
                        debug!("Display publish failed ({} in a row): {}", consecutive_failures, e);
                    }
                }
            }
        }
    }

    info!("Progress publisher stopped");
}
