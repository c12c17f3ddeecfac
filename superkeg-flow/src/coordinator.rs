//! Multi-tap coordination
//!
//! Owns one [`TapChannel`] per configured tap. Each running channel has two
//! tasks:
//! - an edge consumer draining the edge queue in arrival order (debounce,
//!   counting, session updates, progress publishing)
//! - a timeout checker closing idle sessions and committing finished pours
//!
//! Taps are independent: a failure or panic in one tap's tasks does not
//! reach another tap.
//!
//! Stop order for a tap: release the edge subscription, let the consumer
//! drain the queue and exit, cancel and await the checker, then finalize any
//! session still open.
//!
//! Lock order inside a channel is keg, then session. Opening a session and
//! switching kegs both happen under the keg lock, so a session is always
//! bound to the keg the tap held when it opened.

use crate::calibration::{CalibrationRecord, CalibrationStore};
use crate::config::{FlowSettings, TapConfig};
use crate::error::{Error, Result};
use crate::pour::{PourSessionTracker, SessionOutcome};
use crate::reconcile::VolumeReconciler;
use crate::sensor::{EdgeSink, EdgeSource, EdgeSubscription, PulseCounter, PulseCounterStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use superkeg_common::db::{KegStore, TappedKeg};
use superkeg_common::events::{EventBus, KegEvent};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How long a stopping tap waits for its edge queue to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============================================================================
// Status types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub session_id: Uuid,
    pub keg_id: i64,
    pub volume_liters: f64,
    pub seconds_since_start: f64,
    pub seconds_since_flow: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TapStatus {
    pub tap_number: u8,
    pub channel_id: u32,
    pub keg_id: i64,
    pub keg_name: String,
    pub running: bool,
    pub raw_edges: u64,
    pub counter: PulseCounterStatus,
    pub active_session: Option<SessionStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub active_taps: usize,
    pub configured_taps: usize,
    pub edge_source: String,
    pub taps: BTreeMap<u8, TapStatus>,
}

/// Changes made by [`MultiTapCoordinator::refresh_assignments`]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RefreshReport {
    pub added: Vec<u8>,
    pub switched: Vec<u8>,
    pub removed: Vec<u8>,
}

// ============================================================================
// Tap channel
// ============================================================================

struct RunningTasks {
    subscription: EdgeSubscription,
    consumer: JoinHandle<()>,
    checker: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Everything one tap needs
pub struct TapChannel {
    tap: u8,
    channel_id: u32,
    keg: Mutex<TappedKeg>,
    counter: Mutex<PulseCounter>,
    tracker: PourSessionTracker,
    raw_edges: Arc<AtomicU64>,
    running: tokio::sync::Mutex<Option<RunningTasks>>,
}

impl TapChannel {
    fn keg(&self) -> TappedKeg {
        lock(&self.keg).clone()
    }

    /// Close the open session and move the tap to `keg` in one step
    fn switch_keg(&self, keg: TappedKeg) -> Option<SessionOutcome> {
        let mut current = lock(&self.keg);
        let outcome = self.tracker.finish_now();
        *current = keg;
        outcome
    }

    /// Edge consumer: runs until every sink clone is gone
    async fn consume_edges(
        self: Arc<Self>,
        mut edges: mpsc::UnboundedReceiver<Instant>,
        reconciler: Arc<VolumeReconciler>,
        event_bus: EventBus,
    ) {
        while let Some(at) = edges.recv().await {
            self.handle_edge(at, &reconciler, &event_bus);
        }
        debug!(tap = self.tap, "Edge consumer finished");
    }

    fn handle_edge(&self, at: Instant, reconciler: &VolumeReconciler, event_bus: &EventBus) {
        let Some(sample) = lock(&self.counter).on_edge(at) else {
            return;
        };
        if sample.increment <= 0.0 {
            return;
        }

        // The board entry is written under the keg lock too, so a keg switch
        // cannot finalize the session between recording and publishing
        let (keg, progress) = {
            let keg = lock(&self.keg);
            let Some(progress) = self.tracker.record_volume(keg.id, sample.increment, at) else {
                return;
            };
            reconciler.publish_progress(keg.id, &keg.name, progress.volume);
            (keg.clone(), progress)
        };

        if progress.started {
            info!(tap = self.tap, keg_id = keg.id, session_id = %progress.session_id, "Pour started");
            event_bus.emit_lossy(KegEvent::PourStarted {
                tap: self.tap,
                keg_id: keg.id,
                session_id: progress.session_id,
                timestamp: Utc::now(),
            });
        }

        event_bus.emit_lossy(KegEvent::PourProgress {
            tap: self.tap,
            keg_id: keg.id,
            session_id: progress.session_id,
            volume: progress.volume,
            flow_rate: sample.flow_rate,
            timestamp: Utc::now(),
        });
    }

    /// Timeout checker: closes idle sessions until cancelled
    async fn check_sessions(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        reconciler: Arc<VolumeReconciler>,
        event_bus: EventBus,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            // Cancellation only interrupts the wait, never a commit in flight
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Some(outcome) = self.tracker.check_timeout(Instant::now()) {
                self.finalize(outcome, &reconciler, &event_bus).await;
            }
        }
        debug!(tap = self.tap, "Session checker finished");
    }

    /// Apply the threshold decision for a closed session
    async fn finalize(&self, outcome: SessionOutcome, reconciler: &VolumeReconciler, event_bus: &EventBus) {
        match outcome {
            SessionOutcome::Completed(pour) => {
                info!(
                    tap = self.tap, keg_id = pour.keg_id, session_id = %pour.session_id,
                    "Pour completed: {:.1} mL in {:.1}s",
                    pour.volume_ml(),
                    pour.duration.as_secs_f64()
                );
                event_bus.emit_lossy(KegEvent::PourCompleted {
                    tap: self.tap,
                    keg_id: pour.keg_id,
                    session_id: pour.session_id,
                    volume: pour.volume,
                    duration_ms: u64::try_from(pour.duration.as_millis()).unwrap_or(u64::MAX),
                    timestamp: Utc::now(),
                });
                reconciler.finish_progress(pour.keg_id, pour.volume);

                if let Err(e) = reconciler.commit(pour.keg_id, pour.volume, pour.session_id).await {
                    error!(tap = self.tap, keg_id = pour.keg_id, session_id = %pour.session_id, "Pour not recorded: {}", e);
                }
            }
            SessionOutcome::Discarded(pour) => {
                debug!(
                    tap = self.tap, keg_id = pour.keg_id, session_id = %pour.session_id,
                    "Pour of {:.1} mL below threshold, ignored",
                    pour.volume_ml()
                );
                event_bus.emit_lossy(KegEvent::PourDiscarded {
                    tap: self.tap,
                    keg_id: pour.keg_id,
                    session_id: pour.session_id,
                    volume: pour.volume,
                    timestamp: Utc::now(),
                });
                reconciler.discard_progress(pour.keg_id);
            }
        }
    }

    async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    fn status(&self, running: bool, now: Instant) -> TapStatus {
        let keg = self.keg();
        let active_session = self.tracker.active().map(|s| SessionStatus {
            session_id: s.session_id,
            keg_id: s.keg_id,
            volume_liters: s.volume_accumulated,
            seconds_since_start: now.saturating_duration_since(s.started_at).as_secs_f64(),
            seconds_since_flow: now.saturating_duration_since(s.last_activity_at).as_secs_f64(),
        });

        TapStatus {
            tap_number: self.tap,
            channel_id: self.channel_id,
            keg_id: keg.id,
            keg_name: keg.name,
            running,
            raw_edges: self.raw_edges.load(Ordering::Relaxed),
            counter: lock(&self.counter).status(now),
            active_session,
        }
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Owns every tap channel
///
/// Created by `main` and shared through `Arc` with the HTTP API and
/// background tasks.
pub struct MultiTapCoordinator {
    store: Arc<dyn KegStore>,
    source: Arc<dyn EdgeSource>,
    reconciler: Arc<VolumeReconciler>,
    calibration: CalibrationStore,
    settings: FlowSettings,
    event_bus: EventBus,
    wiring: BTreeMap<u8, TapConfig>,
    taps: RwLock<BTreeMap<u8, Arc<TapChannel>>>,
}

impl MultiTapCoordinator {
    pub fn new(
        store: Arc<dyn KegStore>,
        source: Arc<dyn EdgeSource>,
        reconciler: Arc<VolumeReconciler>,
        calibration: CalibrationStore,
        settings: FlowSettings,
        event_bus: EventBus,
        wiring: Vec<TapConfig>,
    ) -> Self {
        Self {
            store,
            source,
            reconciler,
            calibration,
            settings,
            event_bus,
            wiring: wiring.into_iter().map(|t| (t.tap_number, t)).collect(),
            taps: RwLock::new(BTreeMap::new()),
        }
    }

    async fn channel(&self, tap: u8) -> Result<Arc<TapChannel>> {
        self.taps
            .read()
            .await
            .get(&tap)
            .cloned()
            .ok_or(Error::TapNotConfigured(tap))
    }

    pub async fn configured_taps(&self) -> Vec<u8> {
        self.taps.read().await.keys().copied().collect()
    }

    /// Configure a tap for the keg currently on it
    ///
    /// Returns `Ok(false)` without opening anything when no keg is tapped
    /// there or the tap is already configured.
    pub async fn setup_tap(&self, tap: u8, channel_id: u32, default_pulses_per_liter: f64) -> Result<bool> {
        if self.taps.read().await.contains_key(&tap) {
            warn!(tap, "Tap already configured, leaving existing channel untouched");
            return Ok(false);
        }

        let Some(keg) = self.store.find_tapped_keg_by_tap_position(tap).await? else {
            info!(tap, "No keg tapped, skipping");
            return Ok(false);
        };

        let pulses_per_liter = match self.calibration.load(tap) {
            Ok(Some(record)) if record.channel_id == channel_id => {
                info!(tap, "Using saved calibration: {:.2} pulses/L", record.pulses_per_liter);
                record.pulses_per_liter
            }
            Ok(Some(record)) => {
                warn!(
                    tap,
                    "Saved calibration is for channel {}, not {}; using default",
                    record.channel_id, channel_id
                );
                default_pulses_per_liter
            }
            Ok(None) => default_pulses_per_liter,
            Err(e) => {
                warn!(tap, "Ignoring unreadable calibration: {}", e);
                default_pulses_per_liter
            }
        };

        let channel = Arc::new(TapChannel {
            tap,
            channel_id,
            keg: Mutex::new(keg.clone()),
            counter: Mutex::new(PulseCounter::new(
                channel_id,
                pulses_per_liter,
                self.settings.debounce(),
                self.settings.flow_rate_window(),
            )),
            tracker: PourSessionTracker::new(tap, self.settings.pour_timeout(), self.settings.min_pour_ml),
            raw_edges: Arc::new(AtomicU64::new(0)),
            running: tokio::sync::Mutex::new(None),
        });

        {
            let mut taps = self.taps.write().await;
            if taps.contains_key(&tap) {
                warn!(tap, "Tap configured concurrently, leaving existing channel untouched");
                return Ok(false);
            }
            taps.insert(tap, channel);
        }

        info!(tap, keg_id = keg.id, "Tap configured for '{}' on channel {}", keg.name, channel_id);
        self.event_bus.emit_lossy(KegEvent::TapConfigured {
            tap,
            keg_id: keg.id,
            keg_name: keg.name,
            channel_id,
            timestamp: Utc::now(),
        });
        Ok(true)
    }

    /// Configure every wired tap that has a keg; returns the configured taps
    pub async fn setup_all(&self) -> Vec<u8> {
        let mut configured = Vec::new();
        for wiring in self.wiring.values() {
            match self
                .setup_tap(wiring.tap_number, wiring.gpio_pin, wiring.pulses_per_liter)
                .await
            {
                Ok(true) => configured.push(wiring.tap_number),
                Ok(false) => {}
                Err(e) => error!(tap = wiring.tap_number, "Tap setup failed: {}", e),
            }
        }
        configured
    }

    /// Subscribe to edges and spawn the tap's tasks
    pub async fn start_tap(&self, tap: u8) -> Result<()> {
        let channel = self.channel(tap).await?;
        let mut running = channel.running.lock().await;
        if running.is_some() {
            warn!(tap, "Tap already running");
            return Ok(());
        }

        let (sink, edges) = EdgeSink::with_counter(Arc::clone(&channel.raw_edges));
        let subscription = self.source.subscribe(channel.channel_id, sink)?;

        lock(&channel.counter).start();

        let cancel = CancellationToken::new();
        let consumer = tokio::spawn(Arc::clone(&channel).consume_edges(
            edges,
            Arc::clone(&self.reconciler),
            self.event_bus.clone(),
        ));
        let checker = tokio::spawn(Arc::clone(&channel).check_sessions(
            self.settings.session_check_interval(),
            cancel.clone(),
            Arc::clone(&self.reconciler),
            self.event_bus.clone(),
        ));

        *running = Some(RunningTasks {
            subscription,
            consumer,
            checker,
            cancel,
        });

        info!(tap, "Monitoring started on channel {} ({})", channel.channel_id, self.source.name());
        Ok(())
    }

    /// Start every configured tap; returns how many are running
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for tap in self.configured_taps().await {
            match self.start_tap(tap).await {
                Ok(()) => started += 1,
                Err(e) => error!(tap, "Failed to start tap: {}", e),
            }
        }
        info!("{} tap(s) monitoring", started);
        started
    }

    /// Stop a tap and finalize its open session
    ///
    /// The channel stays configured and can be started again.
    pub async fn stop_tap(&self, tap: u8) -> Result<()> {
        let channel = self.channel(tap).await?;
        let mut running = channel.running.lock().await;
        let Some(tasks) = running.take() else {
            debug!(tap, "Tap not running");
            return Ok(());
        };

        let RunningTasks {
            subscription,
            mut consumer,
            checker,
            cancel,
        } = tasks;

        // Hardware sources join their polling thread on release
        if let Err(e) = tokio::task::spawn_blocking(move || subscription.release()).await {
            warn!(tap, "Edge subscription release failed: {}", e);
        }

        let mut failure: Option<Error> = None;
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut consumer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(tap, "Edge consumer ended abnormally: {}", e);
                failure = Some(Error::Internal(format!("tap {} edge consumer: {}", tap, e)));
            }
            Err(_) => {
                warn!(tap, "Edge queue did not drain in {:?}, aborting consumer", DRAIN_TIMEOUT);
                consumer.abort();
            }
        }

        cancel.cancel();
        if let Err(e) = checker.await {
            error!(tap, "Session checker ended abnormally: {}", e);
            failure.get_or_insert(Error::Internal(format!("tap {} session checker: {}", tap, e)));
        }

        lock(&channel.counter).stop();

        if let Some(outcome) = channel.tracker.finish_now() {
            channel.finalize(outcome, &self.reconciler, &self.event_bus).await;
        }

        self.event_bus.emit_lossy(KegEvent::TapStopped {
            tap,
            timestamp: Utc::now(),
        });
        info!(tap, "Monitoring stopped");

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop every tap, continuing past failures
    pub async fn stop_all(&self) -> Result<()> {
        let mut failures = Vec::new();
        for tap in self.configured_taps().await {
            if let Err(e) = self.stop_tap(tap).await {
                failures.push(format!("tap {}: {}", tap, e));
            }
        }

        if failures.is_empty() {
            info!("All taps stopped");
            Ok(())
        } else {
            let summary = failures.join("; ");
            error!("{} tap(s) failed to stop cleanly: {}", failures.len(), summary);
            Err(Error::Internal(summary))
        }
    }

    /// Recalibrate a tap from a measured pour and persist the result
    pub async fn calibrate_tap(&self, tap: u8, known_volume: f64) -> Result<f64> {
        let channel = self.channel(tap).await?;
        let pulses_per_liter = lock(&channel.counter).calibrate(known_volume)?;

        self.calibration.save(&CalibrationRecord {
            tap_number: tap,
            channel_id: channel.channel_id,
            pulses_per_liter,
            calibrated_at: Utc::now(),
        })?;

        self.event_bus.emit_lossy(KegEvent::CalibrationUpdated {
            tap,
            pulses_per_liter,
            timestamp: Utc::now(),
        });
        Ok(pulses_per_liter)
    }

    /// Zero a tap's counter (calibration kept)
    pub async fn reset_tap(&self, tap: u8) -> Result<()> {
        let channel = self.channel(tap).await?;
        lock(&channel.counter).reset();
        Ok(())
    }

    /// Re-read tap assignments from the keg store
    ///
    /// A tap whose keg changed finalizes its open session against the old
    /// keg before switching. A tap that lost its keg is stopped and removed.
    /// Wired taps that gained a keg are configured and started.
    pub async fn refresh_assignments(&self) -> Result<RefreshReport> {
        let assignments = self.store.tap_assignments().await?;
        let mut report = RefreshReport::default();

        let current: Vec<(u8, Arc<TapChannel>)> = self
            .taps
            .read()
            .await
            .iter()
            .map(|(tap, channel)| (*tap, Arc::clone(channel)))
            .collect();

        for (tap, channel) in current {
            match assignments.get(&tap) {
                Some(keg) if keg.id == channel.keg().id => {}
                Some(keg) => {
                    if let Some(outcome) = channel.switch_keg(keg.clone()) {
                        channel.finalize(outcome, &self.reconciler, &self.event_bus).await;
                    }
                    info!(tap, keg_id = keg.id, "Tap switched to '{}'", keg.name);
                    self.event_bus.emit_lossy(KegEvent::TapConfigured {
                        tap,
                        keg_id: keg.id,
                        keg_name: keg.name.clone(),
                        channel_id: channel.channel_id,
                        timestamp: Utc::now(),
                    });
                    report.switched.push(tap);
                }
                None => {
                    if let Err(e) = self.stop_tap(tap).await {
                        warn!(tap, "Error stopping tap that lost its keg: {}", e);
                    }
                    self.taps.write().await.remove(&tap);
                    info!(tap, "Tap removed: no keg tapped");
                    report.removed.push(tap);
                }
            }
        }

        for tap in assignments.keys() {
            if self.taps.read().await.contains_key(tap) {
                continue;
            }
            let Some(wiring) = self.wiring.get(tap) else {
                debug!(tap, "Keg tapped on unwired tap position");
                continue;
            };
            if self
                .setup_tap(wiring.tap_number, wiring.gpio_pin, wiring.pulses_per_liter)
                .await?
            {
                if let Err(e) = self.start_tap(*tap).await {
                    error!(tap, "Failed to start newly tapped keg: {}", e);
                }
                report.added.push(*tap);
            }
        }

        Ok(report)
    }

    pub async fn status(&self) -> CoordinatorStatus {
        let now = Instant::now();
        let channels: Vec<Arc<TapChannel>> = self.taps.read().await.values().cloned().collect();

        let mut taps = BTreeMap::new();
        for channel in channels {
            let running = channel.is_running().await;
            taps.insert(channel.tap, channel.status(running, now));
        }
        let active_taps = taps.values().filter(|t| t.running).count();

        CoordinatorStatus {
            running: active_taps > 0,
            active_taps,
            configured_taps: taps.len(),
            edge_source: self.source.name().to_string(),
            taps,
        }
    }
}

/// Log a one-line summary of every tap on an interval
pub async fn run_status_log(coordinator: Arc<MultiTapCoordinator>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let status = coordinator.status().await;
        info!("Status: {} of {} tap(s) monitoring", status.active_taps, status.configured_taps);
        for tap in status.taps.values() {
            info!(
                tap = tap.tap_number,
                "'{}': {} pulses, {:.3} L, {:.2} L/min{}",
                tap.keg_name,
                tap.counter.pulse_count,
                tap.counter.total_volume_liters,
                tap.counter.flow_rate_lpm,
                if tap.active_session.is_some() { ", pouring" } else { "" }
            );
        }
    }
}
