//! Sample validation and visual-status derivation.
//!
//! [`validate`] decides whether an oximeter sample can be used at all.
//! [`derive_status`] turns a connection state plus the latest sample into the
//! indicator shown next to each device. Both are pure: the same inputs always
//! give the same answer.

use serde::{Deserialize, Serialize};

use crate::model::{DeviceConnectionState, SensorSample};

/// Signal strength the oximeter reports when no finger is inserted.
pub const NO_FINGER_SIGNAL: u8 = 15;

/// Signal strength at or below which the reading is flagged as weak.
pub const POOR_SIGNAL_THRESHOLD: u8 = 4;

/// Largest SpO2 value a real reading can take.
pub const SPO2_MAX_VALID: u8 = 100;

/// Heart-rate value the oximeter sends when it has no pulse reading.
pub const HEART_RATE_OVERFLOW: u16 = 255;

/// Why a sample was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnusableReason {
    FingerAbsent,
    NoFingerSignal,
    InvalidSpo2,
    InvalidHeartRate,
}

impl UnusableReason {
    /// Message shown to the operator.
    pub fn message(&self) -> &'static str {
        match self {
            UnusableReason::FingerAbsent | UnusableReason::NoFingerSignal => {
                "Finger not detected"
            }
            UnusableReason::InvalidSpo2 => "Waiting for a valid SpO2 reading",
            UnusableReason::InvalidHeartRate => "Waiting for a valid pulse reading",
        }
    }
}

/// Vitals taken from a sample that passed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsableReading {
    pub spo2: i32,
    pub heart_rate: i32,
    pub signal_strength: Option<u8>,
}

/// Outcome of [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleValidity {
    Usable(UsableReading),
    Unusable(UnusableReason),
}

impl SampleValidity {
    pub fn is_usable(&self) -> bool {
        matches!(self, SampleValidity::Usable(_))
    }

    pub fn reading(&self) -> Option<UsableReading> {
        match self {
            SampleValidity::Usable(reading) => Some(*reading),
            SampleValidity::Unusable(_) => None,
        }
    }
}

/// Classify a raw oximeter sample.
pub fn validate(sample: &SensorSample) -> SampleValidity {
    if sample.finger_absent {
        return SampleValidity::Unusable(UnusableReason::FingerAbsent);
    }
    if sample.signal_strength == Some(NO_FINGER_SIGNAL) {
        return SampleValidity::Unusable(UnusableReason::NoFingerSignal);
    }

    let spo2 = match sample.spo2 {
        Some(v) if v > 0 && v <= SPO2_MAX_VALID => i32::from(v),
        _ => return SampleValidity::Unusable(UnusableReason::InvalidSpo2),
    };
    let heart_rate = match sample.heart_rate {
        Some(v) if v > 0 && v < HEART_RATE_OVERFLOW => i32::from(v),
        _ => return SampleValidity::Unusable(UnusableReason::InvalidHeartRate),
    };

    SampleValidity::Usable(UsableReading {
        spo2,
        heart_rate,
        signal_strength: sample.signal_strength,
    })
}

/// Indicator colour shown next to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndicatorStatus {
    Green,
    Yellow,
    Red,
    Gray,
    Connecting,
}

impl IndicatorStatus {
    /// Display colour as a hex string.
    pub fn color_hex(&self) -> &'static str {
        match self {
            IndicatorStatus::Green => "#2E7D32",
            IndicatorStatus::Yellow => "#F9A825",
            IndicatorStatus::Red => "#C62828",
            IndicatorStatus::Gray => "#9E9E9E",
            IndicatorStatus::Connecting => "#1565C0",
        }
    }

    /// Whether tapping the indicator should request a reconnect.
    pub fn clickable(&self) -> bool {
        match self {
            IndicatorStatus::Yellow | IndicatorStatus::Red | IndicatorStatus::Gray => true,
            IndicatorStatus::Green | IndicatorStatus::Connecting => false,
        }
    }
}

/// Indicator plus the message that goes with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub indicator: IndicatorStatus,
    pub message: String,
    pub clickable: bool,
}

impl DeviceStatus {
    fn new(indicator: IndicatorStatus, message: impl Into<String>) -> Self {
        Self {
            indicator,
            message: message.into(),
            clickable: indicator.clickable(),
        }
    }

    /// Status shown for the whole duration of a force reconnect.
    pub fn reconnecting() -> Self {
        Self::new(IndicatorStatus::Connecting, "Reconnecting...")
    }
}

/// Status for everything except a subscribed link.
fn link_status(state: DeviceConnectionState, adapter_enabled: bool) -> Option<DeviceStatus> {
    if !adapter_enabled {
        return Some(DeviceStatus::new(IndicatorStatus::Red, "Bluetooth is disabled"));
    }

    let status = match state {
        DeviceConnectionState::Subscribed => return None,
        DeviceConnectionState::Idle => DeviceStatus::new(IndicatorStatus::Gray, "Not connected"),
        DeviceConnectionState::DisconnectedByUser => {
            DeviceStatus::new(IndicatorStatus::Gray, "Disconnected")
        }
        DeviceConnectionState::Scanning => {
            DeviceStatus::new(IndicatorStatus::Connecting, "Searching for device...")
        }
        DeviceConnectionState::Connecting => {
            DeviceStatus::new(IndicatorStatus::Connecting, "Connecting...")
        }
        DeviceConnectionState::Connected => {
            DeviceStatus::new(IndicatorStatus::Connecting, "Connected, starting data stream...")
        }
        DeviceConnectionState::Reconnecting => DeviceStatus::reconnecting(),
        DeviceConnectionState::DisconnectedError => {
            DeviceStatus::new(IndicatorStatus::Red, "Connection lost")
        }
        DeviceConnectionState::Error(kind) => {
            DeviceStatus::new(IndicatorStatus::Red, format!("Connection error: {kind}"))
        }
    };
    Some(status)
}

/// Derive the oximeter indicator.
///
/// Precedence: adapter disabled, then link state, then sample quality, then
/// signal strength.
pub fn derive_status(
    state: DeviceConnectionState,
    last_sample: Option<&SensorSample>,
    adapter_enabled: bool,
) -> DeviceStatus {
    if let Some(status) = link_status(state, adapter_enabled) {
        return status;
    }

    let Some(sample) = last_sample else {
        return DeviceStatus::new(IndicatorStatus::Yellow, "Waiting for data");
    };

    match validate(sample) {
        SampleValidity::Unusable(reason) => {
            DeviceStatus::new(IndicatorStatus::Yellow, reason.message())
        }
        SampleValidity::Usable(reading) => match reading.signal_strength {
            Some(signal) if signal <= POOR_SIGNAL_THRESHOLD => {
                DeviceStatus::new(IndicatorStatus::Yellow, "Weak signal")
            }
            _ => DeviceStatus::new(IndicatorStatus::Green, "Receiving data"),
        },
    }
}

/// Derive the wearable indicator. The wearable has no signal quality, so a
/// subscribed link is always green.
pub fn derive_wearable_status(state: DeviceConnectionState, adapter_enabled: bool) -> DeviceStatus {
    link_status(state, adapter_enabled)
        .unwrap_or_else(|| DeviceStatus::new(IndicatorStatus::Green, "Counting steps"))
}
