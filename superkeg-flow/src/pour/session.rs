//! Pour session tracking for one tap
//!
//! A session opens on the first positive volume increment and closes when no
//! flow has been seen for the pour timeout. Closed sessions at or above the
//! minimum pour size are completed pours; smaller ones are noise.
//!
//! The edge consumer and the timeout checker both go through one mutex, so a
//! timeout decision always sees a consistent `(volume, last_activity)` pair.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use superkeg_common::units::liters_to_ml;
use tracing::debug;
use uuid::Uuid;

/// Active session state (never persisted)
#[derive(Debug, Clone, PartialEq)]
pub struct PourSession {
    pub session_id: Uuid,
    pub keg_id: i64,
    /// Liters measured so far
    pub volume_accumulated: f64,
    pub started_at: Instant,
    pub last_activity_at: Instant,
}

/// Progress after an increment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PourProgress {
    pub session_id: Uuid,
    pub keg_id: i64,
    /// Cumulative liters in this session
    pub volume: f64,
    /// True for the increment that opened the session
    pub started: bool,
}

/// A session that has ended
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinishedPour {
    pub session_id: Uuid,
    pub keg_id: i64,
    /// Liters
    pub volume: f64,
    pub duration: Duration,
}

impl FinishedPour {
    pub fn volume_ml(&self) -> f64 {
        liters_to_ml(self.volume)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionOutcome {
    /// At or above the minimum pour size
    Completed(FinishedPour),
    /// Below the minimum pour size
    Discarded(FinishedPour),
}

pub struct PourSessionTracker {
    tap: u8,
    timeout: Duration,
    min_pour_ml: f64,
    session: Mutex<Option<PourSession>>,
}

impl PourSessionTracker {
    pub fn new(tap: u8, timeout: Duration, min_pour_ml: f64) -> Self {
        Self {
            tap,
            timeout,
            min_pour_ml,
            session: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<PourSession>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn min_pour_ml(&self) -> f64 {
        self.min_pour_ml
    }

    /// Add measured volume, opening a session if idle
    ///
    /// Non-positive increments are ignored.
    pub fn record_volume(&self, keg_id: i64, increment: f64, at: Instant) -> Option<PourProgress> {
        if increment.is_nan() || increment <= 0.0 {
            return None;
        }

        let mut guard = self.lock();
        let started = guard.is_none();
        let session = guard.get_or_insert_with(|| {
            let session_id = Uuid::new_v4();
            debug!(tap = self.tap, keg_id, %session_id, "Pour session opened");
            PourSession {
                session_id,
                keg_id,
                volume_accumulated: 0.0,
                started_at: at,
                last_activity_at: at,
            }
        });

        session.volume_accumulated += increment;
        if at > session.last_activity_at {
            session.last_activity_at = at;
        }

        Some(PourProgress {
            session_id: session.session_id,
            keg_id: session.keg_id,
            volume: session.volume_accumulated,
            started,
        })
    }

    /// Close the session if idle for longer than the timeout
    pub fn check_timeout(&self, now: Instant) -> Option<SessionOutcome> {
        let mut guard = self.lock();
        let expired = guard
            .as_ref()
            .map(|s| now.saturating_duration_since(s.last_activity_at) > self.timeout)
            .unwrap_or(false);
        if !expired {
            return None;
        }
        guard.take().map(|s| self.classify(s))
    }

    /// Close any active session immediately (stop, keg reassignment)
    pub fn finish_now(&self) -> Option<SessionOutcome> {
        self.lock().take().map(|s| self.classify(s))
    }

    /// Copy of the active session, if any
    pub fn active(&self) -> Option<PourSession> {
        self.lock().clone()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    fn classify(&self, session: PourSession) -> SessionOutcome {
        let pour = FinishedPour {
            session_id: session.session_id,
            keg_id: session.keg_id,
            volume: session.volume_accumulated,
            duration: session
                .last_activity_at
                .saturating_duration_since(session.started_at),
        };
        if pour.volume_ml() >= self.min_pour_ml {
            SessionOutcome::Completed(pour)
        } else {
            SessionOutcome::Discarded(pour)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PourSessionTracker {
        PourSessionTracker::new(1, Duration::from_secs(5), 50.0)
    }

    #[test]
    fn test_first_increment_opens_session() {
        let t = tracker();
        let t0 = Instant::now();

        let first = t.record_volume(7, 0.01, t0).unwrap();
        assert!(first.started);
        assert_eq!(first.keg_id, 7);

        let second = t.record_volume(7, 0.01, t0 + Duration::from_millis(50)).unwrap();
        assert!(!second.started);
        assert_eq!(second.session_id, first.session_id);
        assert!((second.volume - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_zero_increment_does_not_open_session() {
        let t = tracker();
        assert!(t.record_volume(1, 0.0, Instant::now()).is_none());
        assert!(t.record_volume(1, -0.5, Instant::now()).is_none());
        assert!(!t.is_active());
    }

    #[test]
    fn test_no_timeout_while_flowing() {
        let t = tracker();
        let t0 = Instant::now();
        t.record_volume(1, 0.1, t0);
        t.record_volume(1, 0.1, t0 + Duration::from_secs(4));

        assert!(t.check_timeout(t0 + Duration::from_secs(8)).is_none());
        assert!(t.is_active());
    }

    #[test]
    fn test_timeout_completes_large_pour() {
        let t = tracker();
        let t0 = Instant::now();
        t.record_volume(3, 0.1, t0);
        t.record_volume(3, 0.1, t0 + Duration::from_secs(2));

        // Exactly at the timeout is still active
        assert!(t.check_timeout(t0 + Duration::from_secs(7)).is_none());

        match t.check_timeout(t0 + Duration::from_millis(7001)) {
            Some(SessionOutcome::Completed(pour)) => {
                assert_eq!(pour.keg_id, 3);
                assert!((pour.volume - 0.2).abs() < 1e-12);
                assert_eq!(pour.duration, Duration::from_secs(2));
            }
            other => panic!("expected completed pour, got {:?}", other),
        }
        assert!(!t.is_active());
    }

    #[test]
    fn test_timeout_discards_small_pour() {
        let t = tracker();
        let t0 = Instant::now();
        t.record_volume(1, 0.03, t0);

        let outcome = t.check_timeout(t0 + Duration::from_secs(6)).unwrap();
        assert!(matches!(outcome, SessionOutcome::Discarded(_)));
        assert!(!t.is_active());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let t = tracker();
        let t0 = Instant::now();
        t.record_volume(1, 0.05, t0);
        assert!(matches!(t.finish_now(), Some(SessionOutcome::Completed(_))));
    }

    #[test]
    fn test_finish_now_when_idle() {
        let t = tracker();
        assert!(t.finish_now().is_none());
        assert!(t.check_timeout(Instant::now()).is_none());
    }

    #[test]
    fn test_new_session_after_close() {
        let t = tracker();
        let t0 = Instant::now();
        let first = t.record_volume(1, 0.1, t0).unwrap();
        t.finish_now();

        let second = t.record_volume(1, 0.1, t0 + Duration::from_secs(1)).unwrap();
        assert!(second.started);
        assert_ne!(second.session_id, first.session_id);
        assert!((second.volume - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_late_timestamp_does_not_rewind_activity() {
        let t = tracker();
        let t0 = Instant::now();
        t.record_volume(1, 0.1, t0 + Duration::from_secs(3));
        t.record_volume(1, 0.1, t0);

        let session = t.active().unwrap();
        assert_eq!(session.last_activity_at, t0 + Duration::from_secs(3));
    }
}
