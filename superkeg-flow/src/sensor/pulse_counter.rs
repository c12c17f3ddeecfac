//! Pulse counting for one flow meter
//!
//! Turns accepted rising edges into cumulative volume and a sliding-window
//! flow rate. Edges closer than the debounce interval to the previous
//! accepted edge are sensor noise and are dropped silently.
//!
//! Not internally synchronized: each tap owns its counter behind a mutex and
//! only the tap's consumer task feeds it edges.

use crate::error::{Error, Result};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use superkeg_common::units::{liters_to_ml, liters_to_oz};
use tracing::{debug, info, warn};

/// Result of an accepted edge
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PulseSample {
    /// Liters since the last reset
    pub total_volume: f64,
    /// Liters added by this edge
    pub increment: f64,
    /// Liters per minute over the trailing window
    pub flow_rate: f64,
}

/// Snapshot for the status API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PulseCounterStatus {
    pub channel_id: u32,
    pub pulse_count: u64,
    pub total_volume_liters: f64,
    pub total_volume_ml: f64,
    pub total_volume_oz: f64,
    pub flow_rate_lpm: f64,
    pub flow_rate_mlpm: f64,
    pub pulses_per_liter: f64,
    pub is_monitoring: bool,
    pub uptime_seconds: f64,
}

pub struct PulseCounter {
    channel_id: u32,
    pulses_per_liter: f64,
    debounce: Duration,
    window: Duration,

    total_pulses: u64,
    total_volume: f64,
    flow_rate: f64,
    last_pulse_at: Option<Instant>,
    recent_pulses: VecDeque<Instant>,

    monitoring: bool,
    started_at: Option<Instant>,
}

impl PulseCounter {
    /// Create a stopped counter
    ///
    /// `pulses_per_liter` must be positive; callers validate configuration
    /// before building counters.
    pub fn new(channel_id: u32, pulses_per_liter: f64, debounce: Duration, window: Duration) -> Self {
        Self {
            channel_id,
            pulses_per_liter,
            debounce,
            window,
            total_pulses: 0,
            total_volume: 0.0,
            flow_rate: 0.0,
            last_pulse_at: None,
            recent_pulses: VecDeque::new(),
            monitoring: false,
            started_at: None,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn pulses_per_liter(&self) -> f64 {
        self.pulses_per_liter
    }

    pub fn total_pulses(&self) -> u64 {
        self.total_pulses
    }

    pub fn total_volume(&self) -> f64 {
        self.total_volume
    }

    pub fn flow_rate(&self) -> f64 {
        self.flow_rate
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Begin accepting edges; returns false if already running
    pub fn start(&mut self) -> bool {
        if self.monitoring {
            warn!(channel = self.channel_id, "Pulse counter already running");
            return false;
        }
        self.monitoring = true;
        self.started_at = Some(Instant::now());
        info!(channel = self.channel_id, "Pulse counter started");
        true
    }

    /// Stop accepting edges; returns false if it was not running
    pub fn stop(&mut self) -> bool {
        if !self.monitoring {
            return false;
        }
        self.monitoring = false;
        self.started_at = None;
        info!(channel = self.channel_id, "Pulse counter stopped");
        true
    }

    /// Handle one rising edge
    ///
    /// Returns `None` for debounced edges and while stopped.
    pub fn on_edge(&mut self, at: Instant) -> Option<PulseSample> {
        if !self.monitoring {
            return None;
        }

        if let Some(last) = self.last_pulse_at {
            if at.saturating_duration_since(last) < self.debounce {
                debug!(channel = self.channel_id, "Edge debounced");
                return None;
            }
        }

        let previous_volume = self.total_volume;
        self.total_pulses += 1;
        self.total_volume = self.total_pulses as f64 / self.pulses_per_liter;
        self.last_pulse_at = Some(at);

        self.recent_pulses.push_back(at);
        self.prune(at);
        self.flow_rate = self.rate_of(self.recent_pulses.iter().copied());

        Some(PulseSample {
            total_volume: self.total_volume,
            increment: (self.total_volume - previous_volume).max(0.0),
            flow_rate: self.flow_rate,
        })
    }

    /// Recalibrate from a measured pour
    ///
    /// Sets `pulses_per_liter = total_pulses / known_volume` and adopts
    /// `known_volume` as the total. The previous factor is kept on error.
    pub fn calibrate(&mut self, known_volume: f64) -> Result<f64> {
        if self.total_pulses == 0 {
            warn!(channel = self.channel_id, "Calibration skipped: no pulses counted");
            return Err(Error::CalibrationInvalid(
                "no pulses counted since last reset".to_string(),
            ));
        }
        if !(known_volume.is_finite() && known_volume > 0.0) {
            warn!(channel = self.channel_id, known_volume, "Calibration skipped: bad volume");
            return Err(Error::CalibrationInvalid(format!(
                "known volume must be positive, got {}",
                known_volume
            )));
        }

        let old = self.pulses_per_liter;
        self.pulses_per_liter = self.total_pulses as f64 / known_volume;
        self.total_volume = known_volume;

        info!(
            channel = self.channel_id,
            "Calibrated: {:.2} -> {:.2} pulses/L ({} pulses for {:.3} L)",
            old,
            self.pulses_per_liter,
            self.total_pulses,
            known_volume
        );
        Ok(self.pulses_per_liter)
    }

    /// Replace the factor outright (persisted calibration)
    pub fn set_pulses_per_liter(&mut self, pulses_per_liter: f64) -> Result<()> {
        if !(pulses_per_liter.is_finite() && pulses_per_liter > 0.0) {
            return Err(Error::CalibrationInvalid(format!(
                "pulses per liter must be positive, got {}",
                pulses_per_liter
            )));
        }
        self.pulses_per_liter = pulses_per_liter;
        self.total_volume = self.total_pulses as f64 / pulses_per_liter;
        Ok(())
    }

    /// Zero counts, volume, rate, and history; calibration is kept
    pub fn reset(&mut self) {
        self.total_pulses = 0;
        self.total_volume = 0.0;
        self.flow_rate = 0.0;
        self.last_pulse_at = None;
        self.recent_pulses.clear();
        info!(channel = self.channel_id, "Pulse counter reset");
    }

    /// Status as of `now`
    ///
    /// The reported rate only counts edges still inside the window, so it
    /// falls to zero once flow stops.
    pub fn status(&self, now: Instant) -> PulseCounterStatus {
        let window = self.window;
        let rate = self.rate_of(
            self.recent_pulses
                .iter()
                .copied()
                .filter(|t| now.saturating_duration_since(*t) <= window),
        );

        PulseCounterStatus {
            channel_id: self.channel_id,
            pulse_count: self.total_pulses,
            total_volume_liters: self.total_volume,
            total_volume_ml: liters_to_ml(self.total_volume),
            total_volume_oz: liters_to_oz(self.total_volume),
            flow_rate_lpm: rate,
            flow_rate_mlpm: liters_to_ml(rate),
            pulses_per_liter: self.pulses_per_liter,
            is_monitoring: self.monitoring,
            uptime_seconds: self
                .started_at
                .map(|s| now.saturating_duration_since(s).as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.recent_pulses.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                self.recent_pulses.pop_front();
            } else {
                break;
            }
        }
    }

    /// L/min from pulse timestamps: (n - 1) intervals over the span
    fn rate_of(&self, pulses: impl Iterator<Item = Instant>) -> f64 {
        let mut count: u64 = 0;
        let mut first: Option<Instant> = None;
        let mut last: Option<Instant> = None;
        for t in pulses {
            count += 1;
            first.get_or_insert(t);
            last = Some(t);
        }

        let (Some(first), Some(last)) = (first, last) else {
            return 0.0;
        };
        let span = last.saturating_duration_since(first).as_secs_f64();
        if count < 2 || span <= 0.0 {
            return 0.0;
        }

        let pulses_per_second = (count - 1) as f64 / span;
        pulses_per_second / self.pulses_per_liter * 60.0
    }
}
