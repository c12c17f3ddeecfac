//! Configuration management for the flow monitor
//!
//! Two tiers:
//! 1. **TOML bootstrap**: database path, port, peer URLs, tap wiring, logging.
//!    Read once at startup.
//! 2. **Database runtime**: timing and threshold settings from the `settings`
//!    table. Missing values are initialized with built-in defaults and written
//!    back.
//!
//! # Settings Sources Priority
//!
//! 1. Command-line arguments (--port, --database, --root-folder, --simulate)
//! 2. Environment variables (SUPERKEG_ROOT, SUPERKEG_CONFIG)
//! 3. TOML configuration file
//! 4. Database settings table
//! 5. Built-in defaults (code constants)

use crate::error::{Error, Result};
use serde::Deserialize;
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use superkeg_common::config::{database_path, resolve_root_folder, ROOT_FOLDER_ENV};
use superkeg_common::db::get_or_init_setting;
use tracing::{info, warn};

/// Default HTTP port for the control API
pub const DEFAULT_PORT: u16 = 5741;

/// YF-S201 nominal calibration
pub const DEFAULT_PULSES_PER_LITER: f64 = 450.0;

/// Bootstrap configuration loaded from TOML file
///
/// Application must restart to pick up changes.
#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database and calibration files
    #[serde(default)]
    pub root_folder: Option<PathBuf>,

    /// Explicit database file (defaults to `<root>/kegs.db`)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL of the keg web application
    #[serde(default = "default_keg_api_url")]
    pub keg_api_url: String,

    /// Base URL receiving live pour progress (usually the keg web application)
    #[serde(default = "default_keg_api_url")]
    pub display_url: String,

    /// Directory for per-tap calibration files (defaults to `<root>/calibration`)
    #[serde(default)]
    pub calibration_dir: Option<PathBuf>,

    #[serde(default)]
    pub edge_source: EdgeSourceKind,

    /// sysfs GPIO root
    #[serde(default = "default_gpio_root")]
    pub gpio_root: PathBuf,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tap wiring
    #[serde(default = "default_taps")]
    pub taps: Vec<TapConfig>,
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            root_folder: None,
            database_path: None,
            port: default_port(),
            keg_api_url: default_keg_api_url(),
            display_url: default_keg_api_url(),
            calibration_dir: None,
            edge_source: EdgeSourceKind::default(),
            gpio_root: default_gpio_root(),
            logging: LoggingConfig::default(),
            taps: default_taps(),
        }
    }
}

/// Where flow-meter edges come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSourceKind {
    /// Linux sysfs GPIO
    #[default]
    Sysfs,
    /// Synthetic pulse bursts, no hardware
    Simulated,
}

/// One tap's wiring
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TapConfig {
    pub tap_number: u8,
    /// BCM GPIO pin of the flow meter signal line
    pub gpio_pin: u32,
    /// Factor used until the tap is calibrated
    #[serde(default = "default_pulses_per_liter")]
    pub pulses_per_liter: f64,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log file path (optional, logs to stderr if not specified)
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_keg_api_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_gpio_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pulses_per_liter() -> f64 {
    DEFAULT_PULSES_PER_LITER
}

/// Four taps wired to BCM pins 4, 17, 27, 22
pub fn default_taps() -> Vec<TapConfig> {
    [(1, 4), (2, 17), (3, 27), (4, 22)]
        .into_iter()
        .map(|(tap_number, gpio_pin)| TapConfig {
            tap_number,
            gpio_pin,
            pulses_per_liter: DEFAULT_PULSES_PER_LITER,
        })
        .collect()
}

impl TomlConfig {
    /// Parse and validate TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: TomlConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a file, or fall back to defaults when `path` is None
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
                })?;
                let config = Self::from_toml_str(&text)?;
                info!("Loaded TOML configuration from {}", path.display());
                Ok(config)
            }
            None => {
                warn!("No config file found, using built-in defaults");
                Ok(Self::default())
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for tap in &self.taps {
            if tap.tap_number == 0 {
                return Err(Error::Config("Tap numbers start at 1".to_string()));
            }
            if !seen.insert(tap.tap_number) {
                return Err(Error::Config(format!("Tap {} configured twice", tap.tap_number)));
            }
            if !(tap.pulses_per_liter.is_finite() && tap.pulses_per_liter > 0.0) {
                return Err(Error::Config(format!(
                    "Tap {} pulses_per_liter must be positive",
                    tap.tap_number
                )));
            }
        }
        Ok(())
    }
}

/// Command-line configuration overrides
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub root_folder: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub port: Option<u16>,
    pub simulate: bool,
}

/// Resolved bootstrap configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub root_folder: PathBuf,
    pub database_path: PathBuf,
    pub port: u16,
    pub keg_api_url: String,
    pub display_url: String,
    pub calibration_dir: PathBuf,
    pub edge_source: EdgeSourceKind,
    pub gpio_root: PathBuf,
    pub logging: LoggingConfig,
    pub taps: Vec<TapConfig>,
}

impl Config {
    /// Apply overrides and derive paths from the root folder
    pub fn resolve(toml_config: TomlConfig, overrides: ConfigOverrides) -> Self {
        let root_folder = resolve_root_folder(
            overrides.root_folder.as_deref(),
            ROOT_FOLDER_ENV,
            toml_config.root_folder.as_deref(),
        );

        let database_path = overrides
            .database_path
            .or(toml_config.database_path)
            .unwrap_or_else(|| database_path(&root_folder));

        let calibration_dir = toml_config
            .calibration_dir
            .unwrap_or_else(|| root_folder.join("calibration"));

        let edge_source = if overrides.simulate {
            EdgeSourceKind::Simulated
        } else {
            toml_config.edge_source
        };

        Self {
            root_folder,
            database_path,
            port: overrides.port.unwrap_or(toml_config.port),
            keg_api_url: toml_config.keg_api_url,
            display_url: toml_config.display_url,
            calibration_dir,
            edge_source,
            gpio_root: toml_config.gpio_root,
            logging: toml_config.logging,
            taps: toml_config.taps,
        }
    }

    pub fn tap(&self, tap_number: u8) -> Option<&TapConfig> {
        self.taps.iter().find(|t| t.tap_number == tap_number)
    }
}

/// Runtime settings loaded from database
///
/// All values have built-in defaults. Missing database values are
/// initialized with defaults and written back.
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSettings {
    // === Pour sessions ===
    pub pour_timeout_ms: u64,
    pub min_pour_ml: f64,
    pub session_check_interval_ms: u64,

    // === Progress display ===
    pub progress_publish_interval_ms: u64,
    pub progress_stale_ms: u64,

    // === Pulse counting ===
    pub debounce_us: u64,
    pub flow_rate_window_ms: u64,

    // === Peers ===
    pub keg_api_timeout_ms: u64,
    pub display_timeout_ms: u64,

    pub status_log_interval_s: u64,
}

/// Timeout checks must run at least this often
const MAX_CHECK_INTERVAL_MS: u64 = 200;

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            pour_timeout_ms: 5000,
            min_pour_ml: 50.0,
            session_check_interval_ms: 100,
            progress_publish_interval_ms: 250,
            progress_stale_ms: 10_000,
            debounce_us: 1000,
            flow_rate_window_ms: 10_000,
            keg_api_timeout_ms: 5000,
            display_timeout_ms: 1000,
            status_log_interval_s: 30,
        }
    }
}

impl FlowSettings {
    /// Load runtime settings from database, writing defaults back
    pub async fn load(pool: &SqlitePool) -> Result<Self> {
        let d = Self::default();

        let mut settings = Self {
            pour_timeout_ms: get_or_init_setting(pool, "pour_timeout_ms", d.pour_timeout_ms).await?,
            min_pour_ml: get_or_init_setting(pool, "min_pour_ml", d.min_pour_ml).await?,
            session_check_interval_ms: get_or_init_setting(
                pool,
                "session_check_interval_ms",
                d.session_check_interval_ms,
            )
            .await?,
            progress_publish_interval_ms: get_or_init_setting(
                pool,
                "progress_publish_interval_ms",
                d.progress_publish_interval_ms,
            )
            .await?,
            progress_stale_ms: get_or_init_setting(pool, "progress_stale_ms", d.progress_stale_ms).await?,
            debounce_us: get_or_init_setting(pool, "debounce_us", d.debounce_us).await?,
            flow_rate_window_ms: get_or_init_setting(pool, "flow_rate_window_ms", d.flow_rate_window_ms)
                .await?,
            keg_api_timeout_ms: get_or_init_setting(pool, "keg_api_timeout_ms", d.keg_api_timeout_ms)
                .await?,
            display_timeout_ms: get_or_init_setting(pool, "display_timeout_ms", d.display_timeout_ms)
                .await?,
            status_log_interval_s: get_or_init_setting(
                pool,
                "status_log_interval_s",
                d.status_log_interval_s,
            )
            .await?,
        };

        settings.clamp_invalid();
        info!("Loaded runtime settings from database");
        Ok(settings)
    }

    /// Replace out-of-range values with defaults
    fn clamp_invalid(&mut self) {
        let d = Self::default();
        if self.session_check_interval_ms == 0 || self.session_check_interval_ms > MAX_CHECK_INTERVAL_MS {
            warn!(
                "session_check_interval_ms {} out of range (1..={}), using {}",
                self.session_check_interval_ms, MAX_CHECK_INTERVAL_MS, d.session_check_interval_ms
            );
            self.session_check_interval_ms = d.session_check_interval_ms;
        }
        if !(self.min_pour_ml.is_finite() && self.min_pour_ml >= 0.0) {
            warn!("min_pour_ml {} invalid, using {}", self.min_pour_ml, d.min_pour_ml);
            self.min_pour_ml = d.min_pour_ml;
        }
        if self.pour_timeout_ms == 0 {
            self.pour_timeout_ms = d.pour_timeout_ms;
        }
        if self.progress_publish_interval_ms == 0 {
            self.progress_publish_interval_ms = d.progress_publish_interval_ms;
        }
        if self.progress_stale_ms <= self.min_progress_stale_ms() {
            let raised = self.effective_progress_stale_ms();
            warn!(
                "progress_stale_ms {} must exceed pour timeout plus two checks ({}ms), using {}",
                self.progress_stale_ms,
                self.min_progress_stale_ms(),
                raised
            );
            self.progress_stale_ms = raised;
        }
        if self.flow_rate_window_ms == 0 {
            self.flow_rate_window_ms = d.flow_rate_window_ms;
        }
        if self.status_log_interval_s == 0 {
            self.status_log_interval_s = d.status_log_interval_s;
        }
    }

    pub fn pour_timeout(&self) -> Duration {
        Duration::from_millis(self.pour_timeout_ms)
    }

    pub fn session_check_interval(&self) -> Duration {
        Duration::from_millis(self.session_check_interval_ms)
    }

    pub fn progress_publish_interval(&self) -> Duration {
        Duration::from_millis(self.progress_publish_interval_ms)
    }

    /// Display entries may only expire after their session could have closed
    fn min_progress_stale_ms(&self) -> u64 {
        self.pour_timeout_ms
            .saturating_add(self.session_check_interval_ms.saturating_mul(2))
    }

    fn effective_progress_stale_ms(&self) -> u64 {
        let floor = self.min_progress_stale_ms();
        if self.progress_stale_ms > floor {
            self.progress_stale_ms
        } else {
            self.pour_timeout_ms.saturating_mul(2).max(floor.saturating_add(1))
        }
    }

    /// Staleness window for the progress board
    ///
    /// Always longer than `pour_timeout` plus two check intervals, so a live
    /// session is finalized before its display entry can expire.
    pub fn progress_stale(&self) -> Duration {
        Duration::from_millis(self.effective_progress_stale_ms())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_micros(self.debounce_us)
    }

    pub fn flow_rate_window(&self) -> Duration {
        Duration::from_millis(self.flow_rate_window_ms)
    }

    pub fn keg_api_timeout(&self) -> Duration {
        Duration::from_millis(self.keg_api_timeout_ms)
    }

    pub fn display_timeout(&self) -> Duration {
        Duration::from_millis(self.display_timeout_ms)
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_secs(self.status_log_interval_s)
    }
}
