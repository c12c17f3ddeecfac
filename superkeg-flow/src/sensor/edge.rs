//! Edge sources: where flow-meter rising edges come from
//!
//! An [`EdgeSource`] delivers rising edges for a channel into an [`EdgeSink`].
//! The sink is the interrupt-like entry point: it bumps a lock-free counter
//! and enqueues the timestamp, nothing else. All derived work (debounce,
//! volume, rate, sessions) happens on the tap's consumer task.

use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receiving end handed to an edge source
///
/// Cloning shares the same queue. The tap's consumer sees the queue close
/// once every clone has been dropped.
#[derive(Clone)]
pub struct EdgeSink {
    tx: mpsc::UnboundedSender<Instant>,
    raw_edges: Arc<AtomicU64>,
}

impl EdgeSink {
    /// Create a sink and the receiver its edges arrive on
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Instant>) {
        Self::with_counter(Arc::new(AtomicU64::new(0)))
    }

    /// Like [`channel`](Self::channel), counting raw edges into `raw_edges`
    pub fn with_counter(raw_edges: Arc<AtomicU64>) -> (Self, mpsc::UnboundedReceiver<Instant>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, raw_edges }, rx)
    }

    /// Record a rising edge
    ///
    /// Never blocks. Returns false once the consumer has gone away.
    pub fn on_edge(&self, at: Instant) -> bool {
        self.raw_edges.fetch_add(1, Ordering::Relaxed);
        self.tx.send(at).is_ok()
    }

    /// Shared count of every edge seen, before debounce
    pub fn raw_edge_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.raw_edges)
    }
}

/// Handle to an active edge subscription
///
/// Releases the hardware on [`release`](Self::release) or drop.
pub struct EdgeSubscription {
    channel_id: u32,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl EdgeSubscription {
    pub fn new(channel_id: u32, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            channel_id,
            release: Some(Box::new(release)),
        }
    }

    /// Stop delivering edges and free the channel
    ///
    /// Blocks while a polling thread is joined (about one poll interval for
    /// sysfs); async callers run it on the blocking pool.
    pub fn release(mut self) {
        self.run_release();
    }

    fn run_release(&mut self) {
        if let Some(release) = self.release.take() {
            release();
            debug!(channel = self.channel_id, "Edge subscription released");
        }
    }
}

impl Drop for EdgeSubscription {
    fn drop(&mut self) {
        self.run_release();
    }
}

impl std::fmt::Debug for EdgeSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeSubscription")
            .field("channel_id", &self.channel_id)
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Source of rising edges for numbered channels
pub trait EdgeSource: Send + Sync {
    /// Start delivering edges for `channel_id` into `sink`
    fn subscribe(&self, channel_id: u32, sink: EdgeSink) -> Result<EdgeSubscription>;

    /// Short name for logs
    fn name(&self) -> &'static str;
}

// ============================================================================
// Linux sysfs GPIO
// ============================================================================

/// Edge source backed by `/sys/class/gpio`
///
/// Exports the pin, sets it as an input, and polls its `value` file on a
/// dedicated thread, reporting 0 -> 1 transitions.
#[derive(Debug, Clone)]
pub struct SysfsGpioSource {
    root: PathBuf,
    poll_interval: Duration,
}

impl SysfsGpioSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            poll_interval: Duration::from_micros(500),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    /// Export and configure the pin; returns true if this call exported it
    fn export(&self, pin: u32) -> Result<bool> {
        let hw_err = |message: String| Error::Hardware {
            channel: pin,
            message,
        };

        let mut exported = false;
        if !self.pin_dir(pin).exists() {
            std::fs::write(self.root.join("export"), pin.to_string())
                .map_err(|e| hw_err(format!("export failed: {}", e)))?;
            exported = true;
        }

        std::fs::write(self.pin_dir(pin).join("direction"), "in")
            .map_err(|e| hw_err(format!("setting input direction failed: {}", e)))?;

        Ok(exported)
    }

    fn unexport(root: &Path, pin: u32) {
        if let Err(e) = std::fs::write(root.join("unexport"), pin.to_string()) {
            warn!(pin, "Failed to unexport GPIO: {}", e);
        }
    }
}

fn read_level(path: &Path) -> Option<bool> {
    let text = std::fs::read_to_string(path).ok()?;
    match text.trim() {
        "1" => Some(true),
        "0" => Some(false),
        _ => None,
    }
}

impl EdgeSource for SysfsGpioSource {
    fn subscribe(&self, channel_id: u32, sink: EdgeSink) -> Result<EdgeSubscription> {
        let exported = self.export(channel_id)?;
        let value_path = self.pin_dir(channel_id).join("value");

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let poll_interval = self.poll_interval;

        let handle: JoinHandle<()> = std::thread::Builder::new()
            .name(format!("gpio{}-edges", channel_id))
            .spawn(move || {
                let mut last = read_level(&value_path).unwrap_or(false);
                let mut read_failures: u64 = 0;
                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::sleep(poll_interval);
                    match read_level(&value_path) {
                        Some(level) => {
                            if level && !last && !sink.on_edge(Instant::now()) {
                                break;
                            }
                            last = level;
                        }
                        None => {
                            read_failures += 1;
                            if read_failures == 1 {
                                warn!(pin = channel_id, "Unreadable GPIO value file");
                            }
                        }
                    }
                }
            })
            .map_err(|e| Error::Hardware {
                channel: channel_id,
                message: format!("failed to spawn polling thread: {}", e),
            })?;

        info!(pin = channel_id, "GPIO edge polling started");

        let root = self.root.clone();
        Ok(EdgeSubscription::new(channel_id, move || {
            stop.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                warn!(pin = channel_id, "GPIO polling thread panicked");
            }
            if exported {
                SysfsGpioSource::unexport(&root, channel_id);
            }
        }))
    }

    fn name(&self) -> &'static str {
        "sysfs"
    }
}

// ============================================================================
// Simulation
// ============================================================================

/// Synthetic flow: bursts of evenly spaced pulses, repeating
///
/// Defaults to 10 Hz for 2 s out of every 5 s.
#[derive(Debug, Clone)]
pub struct SimulatedSource {
    pulse_hz: f64,
    burst: Duration,
    period: Duration,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self {
            pulse_hz: 10.0,
            burst: Duration::from_secs(2),
            period: Duration::from_secs(5),
        }
    }
}

impl SimulatedSource {
    pub fn new(pulse_hz: f64, burst: Duration, period: Duration) -> Self {
        Self {
            pulse_hz,
            burst,
            period,
        }
    }

    /// Pulses emitted in one burst
    pub fn pulses_per_burst(&self) -> u64 {
        (self.burst.as_secs_f64() * self.pulse_hz).floor() as u64
    }
}

impl EdgeSource for SimulatedSource {
    fn subscribe(&self, channel_id: u32, sink: EdgeSink) -> Result<EdgeSubscription> {
        if !(self.pulse_hz.is_finite() && self.pulse_hz > 0.0) {
            return Err(Error::Hardware {
                channel: channel_id,
                message: format!("invalid simulated pulse rate {}", self.pulse_hz),
            });
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| Error::Hardware {
            channel: channel_id,
            message: format!("simulation needs a tokio runtime: {}", e),
        })?;

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let spacing = Duration::from_secs_f64(1.0 / self.pulse_hz);
        let pulses = self.pulses_per_burst();
        let idle = self.period.saturating_sub(self.burst);

        runtime.spawn(async move {
            loop {
                for _ in 0..pulses {
                    tokio::select! {
                        _ = task_cancel.cancelled() => return,
                        _ = tokio::time::sleep(spacing) => {}
                    }
                    if !sink.on_edge(Instant::now()) {
                        return;
                    }
                }
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        });

        info!(channel = channel_id, "Simulated flow started ({} Hz bursts)", self.pulse_hz);

        Ok(EdgeSubscription::new(channel_id, move || cancel.cancel()))
    }

    fn name(&self) -> &'static str {
        "simulated"
    }
}

// ============================================================================
// Programmatic injection
// ============================================================================

#[derive(Default)]
struct ManualState {
    sinks: HashMap<u32, EdgeSink>,
    failing: HashSet<u32>,
}

/// Edge source driven by code (tests, replay of recorded pulse logs)
#[derive(Clone, Default)]
pub struct ManualSource {
    state: Arc<Mutex<ManualState>>,
}

impl ManualSource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make future subscriptions to `channel_id` fail like a missing pin
    pub fn fail_channel(&self, channel_id: u32) {
        self.lock().failing.insert(channel_id);
    }

    pub fn is_subscribed(&self, channel_id: u32) -> bool {
        self.lock().sinks.contains_key(&channel_id)
    }

    /// Deliver one edge; false when nobody is subscribed
    pub fn emit(&self, channel_id: u32, at: Instant) -> bool {
        let sink = self.lock().sinks.get(&channel_id).cloned();
        match sink {
            Some(sink) => sink.on_edge(at),
            None => false,
        }
    }

    /// Deliver `count` edges spaced `spacing` apart starting at `start`
    ///
    /// Returns how many were delivered.
    pub fn emit_train(&self, channel_id: u32, start: Instant, count: u64, spacing: Duration) -> u64 {
        let mut delivered = 0;
        let mut at = start;
        for _ in 0..count {
            if !self.emit(channel_id, at) {
                break;
            }
            delivered += 1;
            at += spacing;
        }
        delivered
    }
}

impl EdgeSource for ManualSource {
    fn subscribe(&self, channel_id: u32, sink: EdgeSink) -> Result<EdgeSubscription> {
        {
            let mut state = self.lock();
            if state.failing.contains(&channel_id) {
                return Err(Error::Hardware {
                    channel: channel_id,
                    message: "channel unavailable".to_string(),
                });
            }
            if state.sinks.contains_key(&channel_id) {
                return Err(Error::Hardware {
                    channel: channel_id,
                    message: "channel already subscribed".to_string(),
                });
            }
            state.sinks.insert(channel_id, sink);
        }

        let state = Arc::clone(&self.state);
        Ok(EdgeSubscription::new(channel_id, move || {
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .sinks
                .remove(&channel_id);
        }))
    }

    fn name(&self) -> &'static str {
        "manual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sink_counts_raw_edges() {
        let (sink, mut rx) = EdgeSink::channel();
        let raw = sink.raw_edge_counter();
        let now = Instant::now();

        assert!(sink.on_edge(now));
        assert!(sink.on_edge(now));
        assert_eq!(raw.load(Ordering::Relaxed), 2);
        assert_eq!(rx.try_recv().unwrap(), now);
    }

    #[test]
    fn test_sink_reports_closed_consumer() {
        let (sink, rx) = EdgeSink::channel();
        drop(rx);
        assert!(!sink.on_edge(Instant::now()));
    }

    #[test]
    fn test_manual_source_release_closes_queue() {
        let source = ManualSource::new();
        let (sink, mut rx) = EdgeSink::channel();

        let subscription = source.subscribe(4, sink).unwrap();
        assert!(source.is_subscribed(4));
        assert!(source.emit(4, Instant::now()));

        subscription.release();
        assert!(!source.is_subscribed(4));
        assert!(!source.emit(4, Instant::now()));

        // One queued edge, then closed
        assert!(rx.try_recv().is_ok());
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn test_manual_source_rejects_double_subscribe() {
        let source = ManualSource::new();
        let (sink_a, _rx_a) = EdgeSink::channel();
        let (sink_b, _rx_b) = EdgeSink::channel();

        let _first = source.subscribe(17, sink_a).unwrap();
        assert!(matches!(
            source.subscribe(17, sink_b),
            Err(Error::Hardware { channel: 17, .. })
        ));
    }

    #[test]
    fn test_manual_source_failing_channel() {
        let source = ManualSource::new();
        source.fail_channel(27);
        let (sink, _rx) = EdgeSink::channel();
        assert!(source.subscribe(27, sink).is_err());
        assert!(!source.is_subscribed(27));
    }

    #[test]
    fn test_emit_train_spacing() {
        let source = ManualSource::new();
        let (sink, mut rx) = EdgeSink::channel();
        let _sub = source.subscribe(1, sink).unwrap();

        let start = Instant::now();
        let delivered = source.emit_train(1, start, 3, Duration::from_millis(5));
        assert_eq!(delivered, 3);
        assert_eq!(rx.try_recv().unwrap(), start);
        assert_eq!(rx.try_recv().unwrap(), start + Duration::from_millis(5));
        assert_eq!(rx.try_recv().unwrap(), start + Duration::from_millis(10));
    }

    #[test]
    fn test_sysfs_detects_rising_edge() {
        let dir = TempDir::new().unwrap();
        let pin_dir = dir.path().join("gpio4");
        std::fs::create_dir_all(&pin_dir).unwrap();
        std::fs::write(pin_dir.join("value"), "0\n").unwrap();

        let source = SysfsGpioSource::new(dir.path()).with_poll_interval(Duration::from_millis(1));
        let (sink, mut rx) = EdgeSink::channel();
        let subscription = source.subscribe(4, sink).unwrap();

        assert_eq!(std::fs::read_to_string(pin_dir.join("direction")).unwrap(), "in");

        std::thread::sleep(Duration::from_millis(20));
        std::fs::write(pin_dir.join("value"), "1\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        subscription.release();

        // Already exported, so release must not unexport
        assert!(!dir.path().join("unexport").exists());

        let mut edges = 0;
        while rx.try_recv().is_ok() {
            edges += 1;
        }
        assert_eq!(edges, 1);
    }

    #[test]
    fn test_sysfs_missing_root_is_hardware_error() {
        let dir = TempDir::new().unwrap();
        let source = SysfsGpioSource::new(dir.path().join("no-such-gpio"));
        let (sink, _rx) = EdgeSink::channel();
        assert!(matches!(
            source.subscribe(22, sink),
            Err(Error::Hardware { channel: 22, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_source_burst() {
        let source = SimulatedSource::default();
        assert_eq!(source.pulses_per_burst(), 20);

        let (sink, mut rx) = EdgeSink::channel();
        let subscription = source.subscribe(1, sink).unwrap();

        tokio::time::sleep(Duration::from_millis(2050)).await;
        let mut edges = 0;
        while rx.try_recv().is_ok() {
            edges += 1;
        }
        assert_eq!(edges, 20);

        // Idle part of the period
        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert!(rx.try_recv().is_err());

        subscription.release();
    }
}
