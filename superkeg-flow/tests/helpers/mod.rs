//! Shared fixtures for flow monitor integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};
use superkeg_common::db::{init_database, NewKeg, SqliteKegStore};
use superkeg_common::events::{EventBus, KegEvent};
use superkeg_flow::calibration::CalibrationStore;
use superkeg_flow::config::{FlowSettings, TapConfig};
use superkeg_flow::coordinator::MultiTapCoordinator;
use superkeg_flow::reconcile::{KegApi, ProgressBoard, VolumeReconciler};
use superkeg_flow::sensor::ManualSource;
use tempfile::TempDir;
use tokio::sync::broadcast;

pub const PPL: f64 = 450.0;

/// Edge spacing used for synthetic pours (well above the 1 ms debounce)
pub const SPACING: Duration = Duration::from_millis(2);

/// Short timeouts so sessions close quickly in tests
pub fn fast_settings() -> FlowSettings {
    FlowSettings {
        pour_timeout_ms: 300,
        session_check_interval_ms: 20,
        ..FlowSettings::default()
    }
}

/// Sessions never time out on their own; only stop/refresh close them
pub fn manual_close_settings() -> FlowSettings {
    FlowSettings {
        pour_timeout_ms: 60_000,
        session_check_interval_ms: 20,
        ..FlowSettings::default()
    }
}

/// Tap N on channel `channel`
pub fn wiring(taps: &[(u8, u32)]) -> Vec<TapConfig> {
    taps.iter()
        .map(|&(tap_number, gpio_pin)| TapConfig {
            tap_number,
            gpio_pin,
            pulses_per_liter: PPL,
        })
        .collect()
}

pub fn new_keg(name: &str, volume: f64) -> NewKeg {
    NewKeg {
        name: name.to_string(),
        style: "Pale Ale".to_string(),
        brewer: "House".to_string(),
        abv: 5.2,
        volume,
    }
}

pub fn assert_close(actual: f64, expected: f64) {
    assert!((actual - expected).abs() < 1e-9, "expected {}, got {}", expected, actual);
}

/// Database, manual edge source and a coordinator wired to both
pub struct Harness {
    pub dir: TempDir,
    pub store: Arc<SqliteKegStore>,
    pub source: ManualSource,
    pub event_bus: EventBus,
    pub board: Arc<ProgressBoard>,
    pub coordinator: Arc<MultiTapCoordinator>,
}

impl Harness {
    pub async fn new(settings: FlowSettings, taps: &[(u8, u32)]) -> Self {
        Self::with_remote(settings, taps, None).await
    }

    pub async fn with_remote(settings: FlowSettings, taps: &[(u8, u32)], remote: Option<Arc<dyn KegApi>>) -> Self {
        let dir = TempDir::new().unwrap();
        let pool = init_database(&dir.path().join("kegs.db")).await.unwrap();
        let store = Arc::new(SqliteKegStore::new(pool));
        let source = ManualSource::new();
        let event_bus = EventBus::new(1000);
        let board = Arc::new(ProgressBoard::new(settings.progress_stale()));

        let reconciler = Arc::new(VolumeReconciler::new(
            remote,
            store.clone(),
            Arc::clone(&board),
            event_bus.clone(),
        ));
        let coordinator = Arc::new(MultiTapCoordinator::new(
            store.clone(),
            Arc::new(source.clone()),
            reconciler,
            CalibrationStore::new(dir.path().join("calibration")),
            settings,
            event_bus.clone(),
            wiring(taps),
        ));

        Self {
            dir,
            store,
            source,
            event_bus,
            board,
            coordinator,
        }
    }

    pub fn calibration(&self) -> CalibrationStore {
        CalibrationStore::new(self.dir.path().join("calibration"))
    }

    /// Create a keg and tap it at `tap`
    pub async fn tapped_keg(&self, name: &str, volume: f64, tap: u8) -> i64 {
        let keg = self.store.create_keg(&new_keg(name, volume)).await.unwrap();
        self.store.tap_keg(keg.id, tap).await.unwrap();
        keg.id
    }

    /// Emit `count` well-spaced edges on `channel` starting now
    pub fn pour(&self, channel: u32, count: u64) -> u64 {
        self.source.emit_train(channel, Instant::now(), count, SPACING)
    }

    /// Wait until the tap's counter has accepted `pulses` edges
    pub async fn wait_for_pulses(&self, tap: u8, pulses: u64) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let status = self.coordinator.status().await;
            if status.taps.get(&tap).map(|t| t.counter.pulse_count) >= Some(pulses) {
                return;
            }
            assert!(Instant::now() < deadline, "tap {} never reached {} pulses", tap, pulses);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Receive events until one matches, failing after five seconds
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<KegEvent>, matches: F) -> KegEvent
where
    F: Fn(&KegEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        if matches(&event) {
            return event;
        }
    }
}

/// Receive events until one matches; returns all of them, the match last
pub async fn collect_until<F>(rx: &mut broadcast::Receiver<KegEvent>, matches: F) -> Vec<KegEvent>
where
    F: Fn(&KegEvent) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout_at(deadline, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event bus closed");
        let done = matches(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

/// Every event currently buffered, without waiting
pub fn drain(rx: &mut broadcast::Receiver<KegEvent>) -> Vec<KegEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
