//! Loader configuration via `backfill.toml`
//!
//! Every tuning knob has a default, so an empty file is a valid
//! configuration. The playback window is optional in the file because it
//! usually comes from the session; when present its bounds are RFC 3339
//! timestamps.

use backfill_core::{BackfillError, BackfillResult, Timespan, Timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name.
pub const CONFIG_FILE_NAME: &str = "backfill.toml";

/// Playback window bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    /// First instant of the window
    pub start: DateTime<Utc>,
    /// Last instant of the window
    pub end: DateTime<Utc>,
}

impl WindowConfig {
    /// The window as a [`Timespan`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `end` is before `start`.
    pub fn timespan(&self) -> BackfillResult<Timespan> {
        Timespan::new(
            Timestamp::from_datetime(&self.start),
            Timestamp::from_datetime(&self.end),
        )
        .ok_or_else(|| {
            BackfillError::invalid_config(format!(
                "window end {} is before window start {}",
                self.end, self.start
            ))
        })
    }
}

/// Tuning of the initialization and buffering phases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoaderConfig {
    /// Target wall time of the very first round, in ms
    #[serde(default = "default_first_round_target_ms")]
    pub first_round_target_ms: u64,
    /// Target wall time of every later round, in ms
    #[serde(default = "default_round_target_ms")]
    pub round_target_ms: u64,
    /// Least history fetched per key and round, in ms
    #[serde(default = "default_min_span_per_key_ms")]
    pub min_span_per_key_ms: u64,
    /// A round covers at most `1 / min_frames` of the whole window
    #[serde(default = "default_min_frames")]
    pub min_frames: f64,
    /// Round ends within this fraction of the per-key span of a midnight
    /// are moved onto it
    #[serde(default = "default_day_snap_tolerance")]
    pub day_snap_tolerance: f64,
    /// Buffering stops once memory use exceeds this fraction
    #[serde(default = "default_memory_ceiling")]
    pub memory_ceiling: f64,
    /// Failed rounds in a row before buffering gives up
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Parallel provider calls per round
    #[serde(default = "default_fetch_partitions")]
    pub fetch_partitions: usize,
    /// Speed assumed before the first measurement (history-ms per wall-ms)
    #[serde(default = "default_initial_speed")]
    pub initial_speed: f64,
    /// Pull of a fresh speed measurement
    #[serde(default = "default_measurement_weight")]
    pub measurement_weight: f64,
    /// Pause after a failed round, in ms
    #[serde(default = "default_failure_retry_delay_ms")]
    pub failure_retry_delay_ms: u64,
    /// Longest wait for another round to release its keys, in ms
    #[serde(default = "default_claim_retry_interval_ms")]
    pub claim_retry_interval_ms: u64,
    /// Longest wait of `stop_loading`, in ms
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
    /// Number of buffering loops sharing the store
    #[serde(default = "default_buffering_workers")]
    pub buffering_workers: usize,
    /// Fetch the value of every tag at window start during initialization
    #[serde(default = "default_load_initial_values")]
    pub load_initial_values: bool,
}

fn default_first_round_target_ms() -> u64 {
    700
}

fn default_round_target_ms() -> u64 {
    5_000
}

fn default_min_span_per_key_ms() -> u64 {
    4 * 60 * 1000
}

fn default_min_frames() -> f64 {
    10.0
}

fn default_day_snap_tolerance() -> f64 {
    0.5
}

fn default_memory_ceiling() -> f64 {
    0.75
}

fn default_max_consecutive_failures() -> u32 {
    2
}

fn default_fetch_partitions() -> usize {
    1
}

fn default_initial_speed() -> f64 {
    backfill_concurrency::DEFAULT_SPEED
}

fn default_measurement_weight() -> f64 {
    backfill_concurrency::DEFAULT_MEASUREMENT_WEIGHT
}

fn default_failure_retry_delay_ms() -> u64 {
    3_000
}

fn default_claim_retry_interval_ms() -> u64 {
    5_000
}

fn default_stop_timeout_ms() -> u64 {
    30_000
}

fn default_buffering_workers() -> usize {
    1
}

fn default_load_initial_values() -> bool {
    true
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            first_round_target_ms: default_first_round_target_ms(),
            round_target_ms: default_round_target_ms(),
            min_span_per_key_ms: default_min_span_per_key_ms(),
            min_frames: default_min_frames(),
            day_snap_tolerance: default_day_snap_tolerance(),
            memory_ceiling: default_memory_ceiling(),
            max_consecutive_failures: default_max_consecutive_failures(),
            fetch_partitions: default_fetch_partitions(),
            initial_speed: default_initial_speed(),
            measurement_weight: default_measurement_weight(),
            failure_retry_delay_ms: default_failure_retry_delay_ms(),
            claim_retry_interval_ms: default_claim_retry_interval_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
            buffering_workers: default_buffering_workers(),
            load_initial_values: default_load_initial_values(),
        }
    }
}

impl LoaderConfig {
    /// Check the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> BackfillResult<()> {
        let fail = |msg: &str| Err(BackfillError::invalid_config(msg.to_string()));
        if self.first_round_target_ms == 0 || self.round_target_ms == 0 {
            return fail("round targets must be greater than zero");
        }
        if self.fetch_partitions == 0 {
            return fail("fetch_partitions must be at least 1");
        }
        if self.buffering_workers == 0 {
            return fail("buffering_workers must be at least 1");
        }
        if self.max_consecutive_failures == 0 {
            return fail("max_consecutive_failures must be at least 1");
        }
        if !(self.min_frames >= 1.0) {
            return fail("min_frames must be at least 1");
        }
        if !(self.measurement_weight >= 1.0) {
            return fail("measurement_weight must be at least 1");
        }
        if !(self.memory_ceiling > 0.0 && self.memory_ceiling <= 1.0) {
            return fail("memory_ceiling must be in (0, 1]");
        }
        if !(self.initial_speed > 0.0) || !self.initial_speed.is_finite() {
            return fail("initial_speed must be a positive number");
        }
        if !(self.day_snap_tolerance >= 0.0) {
            return fail("day_snap_tolerance must not be negative");
        }
        Ok(())
    }

    /// Pause after a failed round
    pub fn failure_retry_delay(&self) -> Duration {
        Duration::from_millis(self.failure_retry_delay_ms)
    }

    /// Longest wait for a claim to be released
    pub fn claim_retry_interval(&self) -> Duration {
        Duration::from_millis(self.claim_retry_interval_ms)
    }

    /// Longest wait of `stop_loading`
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}

/// Contents of `backfill.toml`.
///
/// # Example
///
/// ```toml
/// [window]
/// start = "2024-03-01T00:00:00Z"
/// end = "2024-03-08T00:00:00Z"
///
/// [loader]
/// round_target_ms = 5000
/// fetch_partitions = 2
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackfillConfig {
    /// Playback window, if fixed by the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<WindowConfig>,
    /// Loader tuning
    #[serde(default)]
    pub loader: LoaderConfig,
}

impl BackfillConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Backfill configuration
#
# Playback window (RFC 3339). Usually supplied by the session instead.
# [window]
# start = "2024-03-01T00:00:00Z"
# end = "2024-03-08T00:00:00Z"

[loader]
# Target wall time of the first round (short, for a fast first paint)
first_round_target_ms = 700
# Target wall time of every later round
round_target_ms = 5000
# Least history fetched per key and round (4 minutes)
min_span_per_key_ms = 240000
# A round covers at most 1/min_frames of the window
min_frames = 10.0
# Snap round ends onto midnight when this close (fraction of the span)
day_snap_tolerance = 0.5
# Stop buffering above this fraction of memory in use
memory_ceiling = 0.75
# Give up after this many failed rounds in a row
max_consecutive_failures = 2
# Parallel provider calls per round
fetch_partitions = 1
# Speed guess before any measurement: one day of history per second
initial_speed = 86400.0
measurement_weight = 3.0
failure_retry_delay_ms = 3000
claim_retry_interval_ms = 5000
stop_timeout_ms = 30000
buffering_workers = 1
load_initial_values = true
"#
    }

    /// Parse config from TOML text and validate it.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the text does not parse or fails
    /// validation.
    pub fn from_toml_str(content: &str) -> BackfillResult<Self> {
        let config: BackfillConfig = toml::from_str(content).map_err(|e| {
            BackfillError::invalid_config(format!("Failed to parse config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate config from a file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file(path: &Path) -> BackfillResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackfillError::invalid_config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content).map_err(|e| match e {
            BackfillError::InvalidConfig(msg) => {
                BackfillError::invalid_config(format!("{} ({})", msg, path.display()))
            }
            other => other,
        })
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> BackfillResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> BackfillResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| BackfillError::internal(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate window and loader settings.
    pub fn validate(&self) -> BackfillResult<()> {
        if let Some(window) = &self.window {
            window.timespan()?;
        }
        self.loader.validate()
    }

    /// The configured window.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if no window is configured or it is inverted.
    pub fn timespan(&self) -> BackfillResult<Timespan> {
        self.window
            .as_ref()
            .ok_or_else(|| BackfillError::invalid_config("no [window] configured"))?
            .timespan()
    }
}
