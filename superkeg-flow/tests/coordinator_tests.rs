//! Tap management: calibration, counter reset and keg reassignment

mod helpers;

use helpers::{assert_close, drain, manual_close_settings, new_keg, wait_for, wiring, Harness};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use superkeg_common::db::{init_database, SqliteKegStore};
use superkeg_common::events::{EventBus, KegEvent};
use superkeg_flow::calibration::CalibrationStore;
use superkeg_flow::coordinator::MultiTapCoordinator;
use superkeg_flow::reconcile::{ProgressBoard, VolumeReconciler};
use superkeg_flow::sensor::SysfsGpioSource;
use superkeg_flow::Error;
use tempfile::TempDir;

#[tokio::test]
async fn test_calibrate_tap_persists_and_survives_restart() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    h.tapped_keg("Helles", 19.5, 1).await;
    let mut rx = h.event_bus.subscribe();

    h.coordinator.setup_all().await;
    h.coordinator.start_all().await;
    h.pour(4, 100);
    h.wait_for_pulses(1, 100).await;

    // 100 pulses measured as 250 mL
    let ppl = h.coordinator.calibrate_tap(1, 0.25).await.unwrap();
    assert_close(ppl, 400.0);

    let event = wait_for(&mut rx, |e| matches!(e, KegEvent::CalibrationUpdated { .. })).await;
    assert!(matches!(event, KegEvent::CalibrationUpdated { tap: 1, .. }));

    let saved = h.calibration().load(1).unwrap().unwrap();
    assert_eq!(saved.channel_id, 4);
    assert_close(saved.pulses_per_liter, 400.0);

    let status = h.coordinator.status().await;
    assert_close(status.taps[&1].counter.total_volume_liters, 0.25);

    h.coordinator.stop_all().await.unwrap();

    // A fresh coordinator sharing the calibration directory picks it up
    let restarted = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    std::fs::create_dir_all(restarted.dir.path().join("calibration")).unwrap();
    std::fs::copy(
        h.calibration().path_for(1),
        restarted.calibration().path_for(1),
    )
    .unwrap();
    restarted.tapped_keg("Helles", 19.5, 1).await;
    restarted.coordinator.setup_all().await;

    let status = restarted.coordinator.status().await;
    assert_close(status.taps[&1].counter.pulses_per_liter, 400.0);
}

#[tokio::test]
async fn test_calibrate_without_pulses_is_rejected() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    h.tapped_keg("Helles", 19.5, 1).await;
    h.coordinator.setup_all().await;

    let result = h.coordinator.calibrate_tap(1, 0.5).await;
    assert!(matches!(result, Err(Error::CalibrationInvalid(_))));
    assert!(h.calibration().load(1).unwrap().is_none());

    let status = h.coordinator.status().await;
    assert_eq!(status.taps[&1].counter.pulses_per_liter, helpers::PPL);
}

#[tokio::test]
async fn test_calibrate_unknown_tap() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    let result = h.coordinator.calibrate_tap(3, 0.5).await;
    assert!(matches!(result, Err(Error::TapNotConfigured(3))));
}

#[tokio::test]
async fn test_saved_calibration_for_other_channel_is_ignored() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    h.calibration()
        .save(&superkeg_flow::calibration::CalibrationRecord {
            tap_number: 1,
            channel_id: 27,
            pulses_per_liter: 380.0,
            calibrated_at: chrono::Utc::now(),
        })
        .unwrap();
    h.tapped_keg("Helles", 19.5, 1).await;
    h.coordinator.setup_all().await;

    let status = h.coordinator.status().await;
    assert_eq!(status.taps[&1].counter.pulses_per_liter, helpers::PPL);
}

#[tokio::test]
async fn test_reset_keeps_calibration() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    h.tapped_keg("Helles", 19.5, 1).await;

    h.coordinator.setup_all().await;
    h.coordinator.start_all().await;
    h.pour(4, 100);
    h.wait_for_pulses(1, 100).await;
    h.coordinator.calibrate_tap(1, 0.25).await.unwrap();

    h.coordinator.reset_tap(1).await.unwrap();

    let status = h.coordinator.status().await;
    assert_eq!(status.taps[&1].counter.pulse_count, 0);
    assert_eq!(status.taps[&1].counter.total_volume_liters, 0.0);
    assert_close(status.taps[&1].counter.pulses_per_liter, 400.0);

    h.coordinator.stop_all().await.unwrap();
}

#[tokio::test]
async fn test_refresh_switches_keg_and_finalizes_old_session() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    let old = h.tapped_keg("Old", 19.5, 1).await;
    let mut rx = h.event_bus.subscribe();

    h.coordinator.setup_all().await;
    h.coordinator.start_all().await;
    h.pour(4, 90);
    h.wait_for_pulses(1, 90).await;

    // Old keg replaced while its pour is still open
    h.store.take_off_tap(old).await.unwrap();
    let new = h.tapped_keg("New", 19.5, 1).await;

    let report = h.coordinator.refresh_assignments().await.unwrap();
    assert_eq!(report.switched, vec![1]);
    assert!(report.added.is_empty() && report.removed.is_empty());

    // Finalized against the old keg, which is no longer tapped
    let dropped = wait_for(&mut rx, |e| matches!(e, KegEvent::PourDropped { .. })).await;
    assert!(matches!(dropped, KegEvent::PourDropped { keg_id, .. } if keg_id == old));
    assert!(h.store.pour_events_for_keg(old).await.unwrap().is_empty());

    let status = h.coordinator.status().await;
    assert_eq!(status.taps[&1].keg_id, new);
    assert!(status.taps[&1].running);

    h.pour(4, 90);
    h.coordinator.stop_all().await.unwrap();

    let events = h.store.pour_events_for_keg(new).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_close(events[0].volume_dispensed, 0.2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_refresh_during_flow_binds_later_pour_to_new_keg() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    let old = h.tapped_keg("Old", 19.5, 1).await;

    h.coordinator.setup_all().await;
    h.coordinator.start_all().await;

    // Edges keep arriving while the keg is switched
    let stop = Arc::new(AtomicBool::new(false));
    let flowing = {
        let source = h.source.clone();
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                source.emit(4, Instant::now());
                std::thread::sleep(Duration::from_millis(2));
            }
        })
    };
    h.wait_for_pulses(1, 20).await;

    h.store.take_off_tap(old).await.unwrap();
    let new = h.tapped_keg("New", 19.5, 1).await;
    let report = h.coordinator.refresh_assignments().await.unwrap();
    assert_eq!(report.switched, vec![1]);

    // 40 more pulses (89 mL) after the switch
    let counted = h.coordinator.status().await.taps[&1].counter.pulse_count;
    h.wait_for_pulses(1, counted + 40).await;
    stop.store(true, Ordering::Relaxed);
    flowing.join().unwrap();

    let status = h.coordinator.status().await;
    let session = status.taps[&1].active_session.as_ref().expect("pour still open");
    assert_eq!(session.keg_id, new);

    h.coordinator.stop_all().await.unwrap();

    assert!(h.store.pour_events_for_keg(old).await.unwrap().is_empty());
    assert_eq!(h.store.pour_events_for_keg(new).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stop_tap_releases_sysfs_poller() {
    let dir = TempDir::new().unwrap();
    let gpio_root = dir.path().join("gpio");
    let pin_dir = gpio_root.join("gpio4");
    std::fs::create_dir_all(&pin_dir).unwrap();
    std::fs::write(pin_dir.join("value"), "0\n").unwrap();

    let pool = init_database(&dir.path().join("kegs.db")).await.unwrap();
    let store = Arc::new(SqliteKegStore::new(pool));
    let keg = store.create_keg(&new_keg("Gose", 19.5)).await.unwrap();
    store.tap_keg(keg.id, 1).await.unwrap();

    let settings = manual_close_settings();
    let event_bus = EventBus::new(100);
    let reconciler = Arc::new(VolumeReconciler::new(
        None,
        store.clone(),
        Arc::new(ProgressBoard::new(settings.progress_stale())),
        event_bus.clone(),
    ));
    let source = SysfsGpioSource::new(gpio_root.clone()).with_poll_interval(Duration::from_millis(1));
    let coordinator = MultiTapCoordinator::new(
        store.clone(),
        Arc::new(source),
        reconciler,
        CalibrationStore::new(dir.path().join("calibration")),
        settings,
        event_bus,
        wiring(&[(1, 4)]),
    );

    coordinator.setup_all().await;
    coordinator.start_tap(1).await.unwrap();

    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(pin_dir.join("value"), "1\n").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        std::fs::write(pin_dir.join("value"), "0\n").unwrap();
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    coordinator.stop_tap(1).await.unwrap();

    let status = coordinator.status().await;
    let tap = &status.taps[&1];
    assert!(!tap.running);
    assert!(tap.raw_edges >= 1 && tap.raw_edges <= 3);
    assert_eq!(tap.counter.pulse_count, tap.raw_edges);

    // The poller is gone: later edges are not seen
    std::fs::write(pin_dir.join("value"), "1\n").unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(coordinator.status().await.taps[&1].raw_edges, tap.raw_edges);
}

#[tokio::test]
async fn test_refresh_removes_tap_without_keg() {
    let h = Harness::new(manual_close_settings(), &[(1, 4)]).await;
    let keg_id = h.tapped_keg("Gone", 19.5, 1).await;

    h.coordinator.setup_all().await;
    h.coordinator.start_all().await;

    h.store.take_off_tap(keg_id).await.unwrap();
    let report = h.coordinator.refresh_assignments().await.unwrap();

    assert_eq!(report.removed, vec![1]);
    assert!(h.coordinator.configured_taps().await.is_empty());
    assert!(!h.source.is_subscribed(4));
}

#[tokio::test]
async fn test_refresh_adds_newly_tapped_keg() {
    let h = Harness::new(manual_close_settings(), &[(1, 4), (2, 17)]).await;
    h.tapped_keg("First", 19.5, 1).await;

    h.coordinator.setup_all().await;
    h.coordinator.start_all().await;
    let mut rx = h.event_bus.subscribe();

    let second = h.tapped_keg("Second", 19.5, 2).await;
    // Tap 3 is not wired and is left alone
    h.tapped_keg("Unwired", 19.5, 3).await;

    let report = h.coordinator.refresh_assignments().await.unwrap();
    assert_eq!(report.added, vec![2]);
    assert!(report.switched.is_empty());

    let status = h.coordinator.status().await;
    assert_eq!(status.active_taps, 2);
    assert_eq!(status.taps[&2].keg_id, second);
    assert!(h.source.is_subscribed(17));

    assert!(drain(&mut rx).iter().any(|e| matches!(
        e,
        KegEvent::TapConfigured { tap: 2, keg_id, .. } if *keg_id == second
    )));

    h.coordinator.stop_all().await.unwrap();
}
