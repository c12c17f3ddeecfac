//! Commit finished pours to persistent keg state
//!
//! The keg web API is the preferred path. When it cannot be reached (or
//! answers with something other than success or not-found), the pour is
//! committed once against the shared database. Nothing is queued or retried
//! beyond that.
//!
//! A remote success whose acknowledgement is lost, followed by the local
//! fallback, records the pour twice. Every attempt logs the session id so
//! such duplicates can be traced.

use crate::error::{Error, Result};
use crate::reconcile::progress::{display_estimate, ProgressBoard};
use crate::reconcile::remote::{KegApi, RemoteOutcome};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use superkeg_common::db::{CommitOutcome, CommitReceipt, KegStore};
use superkeg_common::events::{CommitPath, EventBus, KegEvent};
use tracing::{error, info, warn};
use uuid::Uuid;

/// How a commit ended
#[derive(Debug, Clone, PartialEq)]
pub enum CommitReport {
    /// Keg API recorded the pour
    Remote { volume_remaining: Option<f64> },
    /// Local database recorded the pour after the remote path failed
    Local(CommitReceipt),
    /// Keg missing or not tapped; nothing recorded
    KegNotTapped,
}

pub struct VolumeReconciler {
    remote: Option<Arc<dyn KegApi>>,
    store: Arc<dyn KegStore>,
    board: Arc<ProgressBoard>,
    event_bus: EventBus,
}

impl VolumeReconciler {
    /// `remote = None` commits straight to the local store
    pub fn new(
        remote: Option<Arc<dyn KegApi>>,
        store: Arc<dyn KegStore>,
        board: Arc<ProgressBoard>,
        event_bus: EventBus,
    ) -> Self {
        Self {
            remote,
            store,
            board,
            event_bus,
        }
    }

    /// Record a finished pour of `volume` liters against `keg_id`
    ///
    /// Returns `Err` only when both paths failed (or the volume is invalid).
    pub async fn commit(&self, keg_id: i64, volume: f64, session_id: Uuid) -> Result<CommitReport> {
        if !(volume.is_finite() && volume > 0.0) {
            return Err(Error::BadRequest(format!("Pour volume must be positive: {}", volume)));
        }

        if let Some(remote) = &self.remote {
            match remote.record_pour(keg_id, volume).await {
                Ok(RemoteOutcome::Recorded { volume_remaining }) => {
                    info!(
                        keg_id, %session_id,
                        "Recorded {:.3} L pour via keg API (remaining: {:?})",
                        volume, volume_remaining
                    );
                    self.emit_committed(keg_id, session_id, volume, volume_remaining, CommitPath::Remote);
                    return Ok(CommitReport::Remote { volume_remaining });
                }
                Ok(RemoteOutcome::NotFound) => {
                    warn!(keg_id, %session_id, "Keg API: keg not found or not tapped, dropping {:.3} L pour", volume);
                    self.emit_dropped(keg_id, session_id, volume, "keg not found or not tapped");
                    return Ok(CommitReport::KegNotTapped);
                }
                Err(e) => {
                    warn!(keg_id, %session_id, "Keg API commit failed ({}), falling back to database", e);
                }
            }
        }

        self.commit_local(keg_id, volume, session_id).await
    }

    async fn commit_local(&self, keg_id: i64, volume: f64, session_id: Uuid) -> Result<CommitReport> {
        match self.store.commit_pour(keg_id, volume, Utc::now()).await {
            Ok(CommitOutcome::Committed(receipt)) => {
                info!(
                    keg_id, %session_id, event_id = receipt.event_id,
                    "Recorded {:.3} L pour in database (remaining: {:.3} L)",
                    volume, receipt.volume_remaining
                );
                self.emit_committed(
                    keg_id,
                    session_id,
                    volume,
                    Some(receipt.volume_remaining),
                    CommitPath::LocalFallback,
                );
                Ok(CommitReport::Local(receipt))
            }
            Ok(CommitOutcome::NotFoundOrNotTapped) => {
                warn!(keg_id, %session_id, "Keg not found or not tapped, dropping {:.3} L pour", volume);
                self.emit_dropped(keg_id, session_id, volume, "keg not found or not tapped");
                Ok(CommitReport::KegNotTapped)
            }
            Err(e) => {
                error!(keg_id, %session_id, "Pour of {:.3} L lost: database commit failed: {}", volume, e);
                self.emit_dropped(keg_id, session_id, volume, &e.to_string());
                Err(e.into())
            }
        }
    }

    /// Update the live display entry for a keg
    pub fn publish_progress(&self, keg_id: i64, keg_name: &str, current_volume: f64) {
        self.board.publish(
            keg_id,
            keg_name,
            current_volume,
            display_estimate(current_volume),
            Instant::now(),
        );
    }

    /// Turn the live entry into a completed notice
    pub fn finish_progress(&self, keg_id: i64, final_volume: f64) {
        self.board.finish(keg_id, final_volume);
    }

    /// Remove the live entry silently (pour below threshold)
    pub fn discard_progress(&self, keg_id: i64) {
        self.board.discard(keg_id);
    }

    fn emit_committed(
        &self,
        keg_id: i64,
        session_id: Uuid,
        volume: f64,
        volume_remaining: Option<f64>,
        path: CommitPath,
    ) {
        self.event_bus.emit_lossy(KegEvent::PourCommitted {
            keg_id,
            session_id,
            volume,
            volume_remaining,
            path,
            timestamp: Utc::now(),
        });
    }

    fn emit_dropped(&self, keg_id: i64, session_id: Uuid, volume: f64, reason: &str) {
        self.event_bus.emit_lossy(KegEvent::PourDropped {
            keg_id,
            session_id,
            volume,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
    }
}
