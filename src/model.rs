//! Data models for the walk-test engine.
//!
//! Everything in here is plain data: samples handed over by the sensor
//! transport, the records a test produces, and the status enums the rest of
//! the crate classifies readings into. None of these types carries behavior
//! beyond small, pure classification helpers.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{HeartRateThresholds, Spo2Thresholds};

/// Which of the two wireless sensors a connection or sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    /// The pulse-oximeter reporting SpO2 and heart rate.
    Oximeter,
    /// The step-counting wearable.
    Wearable,
}

impl DeviceRole {
    /// Get a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            DeviceRole::Oximeter => "Pulse oximeter",
            DeviceRole::Wearable => "Wearable",
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRole::Oximeter => f.write_str("oximeter"),
            DeviceRole::Wearable => f.write_str("wearable"),
        }
    }
}

impl FromStr for DeviceRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "oximeter" | "pulse_oximeter" => Ok(DeviceRole::Oximeter),
            "wearable" => Ok(DeviceRole::Wearable),
            other => Err(format!("unknown device role '{other}'")),
        }
    }
}

/// Reason a connection ended up in an error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionErrorKind {
    /// No device answered at the requested address.
    DeviceNotFound,
    /// Connected, but enabling notifications failed.
    SubscribeFailed,
    /// The link dropped before reaching a subscribed state.
    Disconnected,
    /// Any other radio-stack failure.
    Ble,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectionErrorKind::DeviceNotFound => "device not found",
            ConnectionErrorKind::SubscribeFailed => "subscription failed",
            ConnectionErrorKind::Disconnected => "link dropped",
            ConnectionErrorKind::Ble => "bluetooth error",
        };
        f.write_str(text)
    }
}

/// Connection state machine of one device role.
///
/// Owned by its [`ConnectionSupervisor`](crate::connection::ConnectionSupervisor);
/// everyone else only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "kind", rename_all = "snake_case")]
pub enum DeviceConnectionState {
    Idle,
    Scanning,
    Connecting,
    Connected,
    Subscribed,
    Reconnecting,
    DisconnectedByUser,
    DisconnectedError,
    Error(ConnectionErrorKind),
}

impl DeviceConnectionState {
    /// Whether samples may currently arrive from the device.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            DeviceConnectionState::Connected | DeviceConnectionState::Subscribed
        )
    }

    /// Whether a link exists or is being set up, so a fresh connect must be
    /// preceded by a disconnect.
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            DeviceConnectionState::Connecting
                | DeviceConnectionState::Connected
                | DeviceConnectionState::Subscribed
        )
    }

    /// Whether a reconnect attempt waiting on this state can stop waiting.
    pub fn ends_reconnect(&self) -> bool {
        matches!(
            self,
            DeviceConnectionState::Subscribed
                | DeviceConnectionState::DisconnectedByUser
                | DeviceConnectionState::DisconnectedError
                | DeviceConnectionState::Error(_)
        )
    }
}

/// A decoded pulse-oximeter reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSample {
    pub spo2: Option<u8>,
    pub heart_rate: Option<u16>,
    #[serde(default)]
    pub finger_absent: bool,
    pub signal_strength: Option<u8>,
    pub timestamp: DateTime<Utc>,
}

/// A decoded wearable reading.
///
/// `total_steps` is the device's running hardware counter. It only grows,
/// except when the wearable reboots and starts again from a small value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WearableSample {
    pub total_steps: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

/// The vital signs tracked by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vital {
    Spo2,
    HeartRate,
}

impl Vital {
    /// Get a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Vital::Spo2 => "SpO2",
            Vital::HeartRate => "Heart rate",
        }
    }

    /// Unit suffix used in messages.
    pub fn unit(&self) -> &'static str {
        match self {
            Vital::Spo2 => "%",
            Vital::HeartRate => " bpm",
        }
    }
}

/// Direction of a vital sign over the trend window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    #[default]
    Stable,
}

/// Alarm classification of a single vital reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmStatus {
    /// No valid reading to classify.
    #[default]
    Unknown,
    Normal,
    Warning,
    Critical,
}

impl AlarmStatus {
    /// Classify an SpO2 reading.
    ///
    /// - `unknown`: value <= 0
    /// - `critical`: value <= critical threshold
    /// - `warning`: value < warning threshold
    /// - `normal`: otherwise
    pub fn from_spo2(value: i32, thresholds: &Spo2Thresholds) -> Self {
        if value <= 0 {
            AlarmStatus::Unknown
        } else if value <= thresholds.critical {
            AlarmStatus::Critical
        } else if value < thresholds.warning {
            AlarmStatus::Warning
        } else {
            AlarmStatus::Normal
        }
    }

    /// Classify a heart-rate reading against its low/high bands.
    pub fn from_heart_rate(value: i32, thresholds: &HeartRateThresholds) -> Self {
        if value <= 0 {
            AlarmStatus::Unknown
        } else if value < thresholds.critical_low || value > thresholds.critical_high {
            AlarmStatus::Critical
        } else if value < thresholds.warning_low || value > thresholds.warning_high {
            AlarmStatus::Warning
        } else {
            AlarmStatus::Normal
        }
    }
}

/// One vital-sign value recorded by the 1 Hz tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Elapsed test time in milliseconds.
    pub time_millis: u64,
    pub value: f32,
    pub distance_at_time: f32,
}

/// Running extremum of a vital sign during the active test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CriticalValueRecord {
    pub value: i32,
    pub time_millis: u64,
    pub distance_at_time: f32,
}

/// Aggregate emitted once per elapsed minute of the test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinuteSnapshot {
    /// 1..=6
    pub minute_mark: u32,
    pub min_spo2_overall: Option<i32>,
    pub max_hr_overall: Option<i32>,
    pub distance_at_minute_end: Option<f32>,
}

/// A pause the patient took during the test.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopRecord {
    pub stop_time_millis: u64,
    pub spo2: i32,
    pub heart_rate: i32,
    pub distance_at_stop_time: f32,
}

/// Final vitals captured after the recovery period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryData {
    pub spo2: Option<i32>,
    pub heart_rate: Option<i32>,
    pub period_over: bool,
    pub captured_during_period: bool,
}

impl RecoveryData {
    /// Both values present.
    pub fn is_complete(&self) -> bool {
        self.spo2.is_some() && self.heart_rate.is_some()
    }
}

/// Lifecycle of a configured session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// No preparation data has been supplied yet.
    #[default]
    Unconfigured,
    /// Configured, waiting for the test to start.
    Idle,
    Running,
    Finished,
}

/// How a finished test ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestOutcome {
    /// The full test duration elapsed.
    Completed,
    /// The operator confirmed a manual stop.
    StoppedByUser,
}

impl TestOutcome {
    /// Get a human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            TestOutcome::Completed => "Completed",
            TestOutcome::StoppedByUser => "Stopped by user",
        }
    }

    /// Stable key used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TestOutcome::Completed => "completed",
            TestOutcome::StoppedByUser => "stopped_by_user",
        }
    }
}

impl FromStr for TestOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(TestOutcome::Completed),
            "stopped_by_user" => Ok(TestOutcome::StoppedByUser),
            other => Err(format!("unknown test outcome '{other}'")),
        }
    }
}

/// Patient data that seeds a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreparationData {
    /// Opaque identifier assigned by the patient registry.
    pub patient_id: String,
    /// Estimated distance covered per step, in meters.
    pub stride_length_m: f32,
    pub basal_spo2: Option<i32>,
    pub basal_heart_rate: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spo2_thresholds() -> Spo2Thresholds {
        Spo2Thresholds {
            warning: 92,
            critical: 88,
        }
    }

    fn hr_thresholds() -> HeartRateThresholds {
        HeartRateThresholds {
            warning_low: 50,
            warning_high: 120,
            critical_low: 40,
            critical_high: 150,
        }
    }

    #[test]
    fn test_spo2_classification() {
        let t = spo2_thresholds();
        assert_eq!(AlarmStatus::from_spo2(0, &t), AlarmStatus::Unknown);
        assert_eq!(AlarmStatus::from_spo2(-3, &t), AlarmStatus::Unknown);
        assert_eq!(AlarmStatus::from_spo2(85, &t), AlarmStatus::Critical);
        assert_eq!(AlarmStatus::from_spo2(88, &t), AlarmStatus::Critical);
        assert_eq!(AlarmStatus::from_spo2(89, &t), AlarmStatus::Warning);
        assert_eq!(AlarmStatus::from_spo2(91, &t), AlarmStatus::Warning);
        assert_eq!(AlarmStatus::from_spo2(92, &t), AlarmStatus::Normal);
        assert_eq!(AlarmStatus::from_spo2(99, &t), AlarmStatus::Normal);
    }

    #[test]
    fn test_heart_rate_classification() {
        let t = hr_thresholds();
        assert_eq!(AlarmStatus::from_heart_rate(0, &t), AlarmStatus::Unknown);
        assert_eq!(AlarmStatus::from_heart_rate(39, &t), AlarmStatus::Critical);
        assert_eq!(AlarmStatus::from_heart_rate(40, &t), AlarmStatus::Warning);
        assert_eq!(AlarmStatus::from_heart_rate(49, &t), AlarmStatus::Warning);
        assert_eq!(AlarmStatus::from_heart_rate(50, &t), AlarmStatus::Normal);
        assert_eq!(AlarmStatus::from_heart_rate(120, &t), AlarmStatus::Normal);
        assert_eq!(AlarmStatus::from_heart_rate(121, &t), AlarmStatus::Warning);
        assert_eq!(AlarmStatus::from_heart_rate(150, &t), AlarmStatus::Warning);
        assert_eq!(AlarmStatus::from_heart_rate(151, &t), AlarmStatus::Critical);
    }

    #[test]
    fn test_device_role_parsing() {
        assert_eq!("oximeter".parse::<DeviceRole>(), Ok(DeviceRole::Oximeter));
        assert_eq!("wearable".parse::<DeviceRole>(), Ok(DeviceRole::Wearable));
        assert!("scale".parse::<DeviceRole>().is_err());
        assert_eq!(DeviceRole::Wearable.to_string(), "wearable");
    }

    #[test]
    fn test_outcome_key_matches_serde() {
        for outcome in [TestOutcome::Completed, TestOutcome::StoppedByUser] {
            let json = serde_json::to_value(outcome).unwrap();
            assert_eq!(json, outcome.as_str());
            assert_eq!(outcome.as_str().parse::<TestOutcome>(), Ok(outcome));
        }
    }

    #[test]
    fn test_connection_state_predicates() {
        assert!(DeviceConnectionState::Subscribed.is_streaming());
        assert!(DeviceConnectionState::Connected.is_streaming());
        assert!(!DeviceConnectionState::Reconnecting.is_streaming());

        assert!(DeviceConnectionState::Connecting.holds_link());
        assert!(!DeviceConnectionState::DisconnectedError.holds_link());

        assert!(DeviceConnectionState::Subscribed.ends_reconnect());
        assert!(DeviceConnectionState::Error(ConnectionErrorKind::Ble).ends_reconnect());
        assert!(!DeviceConnectionState::Connecting.ends_reconnect());
        assert!(!DeviceConnectionState::Connected.ends_reconnect());
    }

    #[test]
    fn test_connection_state_serialization() {
        let json = serde_json::to_value(DeviceConnectionState::Error(
            ConnectionErrorKind::SubscribeFailed,
        ))
        .unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["kind"], "subscribe_failed");

        let json = serde_json::to_value(DeviceConnectionState::Subscribed).unwrap();
        assert_eq!(json["state"], "subscribed");
    }

    #[test]
    fn test_recovery_completeness() {
        let mut data = RecoveryData {
            spo2: Some(95),
            heart_rate: None,
            period_over: true,
            captured_during_period: false,
        };
        assert!(!data.is_complete());
        data.heart_rate = Some(90);
        assert!(data.is_complete());
    }
}
