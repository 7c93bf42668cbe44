//! Configuration for the engine and the service binary.
//!
//! Thresholds come from a [`ThresholdProvider`] and are read once when a
//! session is configured. Engine timings and service settings are read from
//! the environment at startup.

use std::ops::RangeInclusive;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::SessionError;
use crate::model::PreparationData;

/// Default port if not specified via environment variable.
pub const DEFAULT_PORT: u16 = 3000;

/// Default database path if not specified via environment variable.
pub const DEFAULT_DB_PATH: &str = "sqlite:walktest.db?mode=rwc";

/// Fixed length of a six-minute walk test.
pub const DEFAULT_TEST_DURATION: Duration = Duration::from_secs(6 * 60);

/// Wait between test end and the final vitals capture.
pub const DEFAULT_RECOVERY_PERIOD: Duration = Duration::from_secs(60);

/// Seconds the operator has to cancel a manual stop.
pub const DEFAULT_STOP_COUNTDOWN_SECS: u8 = 5;

/// How long a critical-alarm message stays visible.
pub const DEFAULT_ALARM_DISPLAY: Duration = Duration::from_secs(5);

/// Upper bound on a force-reconnect attempt.
pub const DEFAULT_RECONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause between tearing a link down and opening it again.
pub const DEFAULT_RECONNECT_SETTLE: Duration = Duration::from_millis(700);

/// SpO2 alarm thresholds, in percent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spo2Thresholds {
    /// Readings below this are a warning.
    pub warning: i32,
    /// Readings at or below this are critical.
    pub critical: i32,
}

/// Heart-rate alarm bands, in beats per minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartRateThresholds {
    pub warning_low: i32,
    pub warning_high: i32,
    pub critical_low: i32,
    pub critical_high: i32,
}

/// Accepted ranges for preparation data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputRanges {
    pub spo2: RangeInclusive<i32>,
    pub heart_rate: RangeInclusive<i32>,
    pub stride_length_m: RangeInclusive<f32>,
}

/// Everything the alarm classification and input validation needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    pub spo2: Spo2Thresholds,
    pub heart_rate: HeartRateThresholds,
    pub input_ranges: InputRanges,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            spo2: Spo2Thresholds {
                warning: 92,
                critical: 88,
            },
            heart_rate: HeartRateThresholds {
                warning_low: 50,
                warning_high: 120,
                critical_low: 40,
                critical_high: 150,
            },
            input_ranges: InputRanges {
                spo2: 70..=100,
                heart_rate: 30..=220,
                stride_length_m: 0.2..=1.5,
            },
        }
    }
}

impl ThresholdConfig {
    /// Check that the thresholds are internally consistent.
    ///
    /// Critical bands must be stricter than warning bands, and every low
    /// bound must sit below its high bound.
    pub fn check(&self) -> Result<(), String> {
        let spo2 = &self.spo2;
        if spo2.critical >= spo2.warning {
            return Err(format!(
                "spo2 critical ({}) must be below warning ({})",
                spo2.critical, spo2.warning
            ));
        }

        let hr = &self.heart_rate;
        if hr.warning_low >= hr.warning_high {
            return Err("heart rate warning_low must be below warning_high".to_string());
        }
        if hr.critical_low > hr.warning_low || hr.critical_high < hr.warning_high {
            return Err("heart rate critical band must enclose the warning band".to_string());
        }

        let ranges = &self.input_ranges;
        if ranges.spo2.is_empty() || ranges.heart_rate.is_empty() {
            return Err("input ranges must not be empty".to_string());
        }
        if ranges.stride_length_m.start() <= &0.0 || ranges.stride_length_m.is_empty() {
            return Err("stride length range must be positive and non-empty".to_string());
        }

        Ok(())
    }

    /// Validate preparation data against the input ranges.
    pub fn validate_preparation(&self, prep: &PreparationData) -> Result<(), SessionError> {
        if prep.patient_id.trim().is_empty() {
            return Err(SessionError::invalid_preparation(
                "patient_id",
                "must not be empty",
            ));
        }

        let ranges = &self.input_ranges;
        if !prep.stride_length_m.is_finite() || !ranges.stride_length_m.contains(&prep.stride_length_m)
        {
            return Err(SessionError::invalid_preparation(
                "stride_length_m",
                format!(
                    "{} is outside {:?} m",
                    prep.stride_length_m, ranges.stride_length_m
                ),
            ));
        }

        if let Some(spo2) = prep.basal_spo2 {
            if !ranges.spo2.contains(&spo2) {
                return Err(SessionError::invalid_preparation(
                    "basal_spo2",
                    format!("{spo2} is outside {:?}", ranges.spo2),
                ));
            }
        }

        if let Some(hr) = prep.basal_heart_rate {
            if !ranges.heart_rate.contains(&hr) {
                return Err(SessionError::invalid_preparation(
                    "basal_heart_rate",
                    format!("{hr} is outside {:?}", ranges.heart_rate),
                ));
            }
        }

        Ok(())
    }
}

/// Read-only source of alarm thresholds.
pub trait ThresholdProvider: Send + Sync {
    fn thresholds(&self) -> ThresholdConfig;
}

/// Thresholds that can be replaced at run time.
///
/// Sessions take a copy when they are configured, so an update only affects
/// sessions configured afterwards.
#[derive(Clone, Default)]
pub struct SharedThresholds {
    inner: Arc<RwLock<ThresholdConfig>>,
}

impl SharedThresholds {
    pub fn new(config: ThresholdConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Replace the thresholds after checking them.
    pub fn update(&self, config: ThresholdConfig) -> Result<(), String> {
        config.check()?;
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = config;
        info!("Threshold configuration updated");
        Ok(())
    }
}

impl ThresholdProvider for SharedThresholds {
    fn thresholds(&self) -> ThresholdConfig {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Timings of the session engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub test_duration: Duration,
    pub recovery_period: Duration,
    pub stop_countdown_secs: u8,
    pub alarm_display: Duration,
    /// Stop filling recovery values from live data after this long past
    /// the end of the recovery period. `None` keeps filling until the
    /// session is reset.
    pub recovery_fallback_cutoff: Option<Duration>,
    pub reconnect_settle: Duration,
    pub reconnect_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            test_duration: DEFAULT_TEST_DURATION,
            recovery_period: DEFAULT_RECOVERY_PERIOD,
            stop_countdown_secs: DEFAULT_STOP_COUNTDOWN_SECS,
            alarm_display: DEFAULT_ALARM_DISPLAY,
            recovery_fallback_cutoff: None,
            reconnect_settle: DEFAULT_RECONNECT_SETTLE,
            reconnect_timeout: DEFAULT_RECONNECT_TIMEOUT,
        }
    }
}

/// Service configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub database_url: String,
    pub simulate: bool,
    pub engine: EngineConfig,
}

impl AppConfig {
    /// Load configuration from `WALKTEST_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());
        let secs_or = |key: &str, default: Duration| {
            parse_u64(key)
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(default)
        };

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            test_duration: secs_or("WALKTEST_TEST_DURATION_SECS", defaults.test_duration),
            recovery_period: secs_or("WALKTEST_RECOVERY_PERIOD_SECS", defaults.recovery_period),
            stop_countdown_secs: lookup("WALKTEST_STOP_COUNTDOWN_SECS")
                .and_then(|v| v.trim().parse::<u8>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.stop_countdown_secs),
            alarm_display: secs_or("WALKTEST_ALARM_DISPLAY_SECS", defaults.alarm_display),
            recovery_fallback_cutoff: parse_u64("WALKTEST_RECOVERY_FALLBACK_CUTOFF_SECS")
                .map(Duration::from_secs),
            reconnect_settle: defaults.reconnect_settle,
            reconnect_timeout: secs_or(
                "WALKTEST_RECONNECT_TIMEOUT_SECS",
                defaults.reconnect_timeout,
            ),
        };

        let simulate = lookup("WALKTEST_SIMULATE")
            .map(|v| matches!(v.trim(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            port: lookup("WALKTEST_PORT")
                .and_then(|p| p.parse().ok())
                .unwrap_or(DEFAULT_PORT),
            database_url: lookup("WALKTEST_DATABASE_URL")
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            simulate,
            engine,
        }
    }
}
