//! Trend and alarm analysis over accepted vital-sign readings.
//!
//! Each vital keeps a window of its last [`TREND_WINDOW_SIZE`] accepted
//! values. Once the window is full, every [`TREND_RECOMPUTE_EVERY`] new
//! values the mean of the newer half is compared with the mean of the older
//! half. With a partly filled window the last trend is held; a rejected
//! sample clears the window and resets the trend.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::{HeartRateThresholds, Spo2Thresholds};
use crate::model::{AlarmStatus, Trend, Vital};
use crate::validation::UsableReading;

/// Number of accepted values kept per vital.
pub const TREND_WINDOW_SIZE: usize = 6;

/// New values required between two trend computations.
pub const TREND_RECOMPUTE_EVERY: usize = 3;

/// Compare the mean of the newer half of `values` with the older half.
///
/// Only the grouping matters: reordering within a half gives the same trend.
pub fn compute_trend(values: &[f32]) -> Trend {
    let half = values.len() / 2;
    if half == 0 {
        return Trend::Stable;
    }
    let mean = |slice: &[f32]| slice.iter().sum::<f32>() / slice.len() as f32;
    let older = mean(&values[..half]);
    let newer = mean(&values[values.len() - half..]);

    if newer > older {
        Trend::Up
    } else if newer < older {
        Trend::Down
    } else {
        Trend::Stable
    }
}

/// Bounded window of the most recent accepted values of one vital.
#[derive(Debug, Clone, Default)]
pub struct VitalWindow {
    values: VecDeque<f32>,
    new_since_trend: usize,
}

impl VitalWindow {
    /// Push a value. Returns the recomputed trend when one is due.
    fn push(&mut self, value: f32) -> Option<Trend> {
        if self.values.len() == TREND_WINDOW_SIZE {
            self.values.pop_front();
        }
        self.values.push_back(value);
        self.new_since_trend += 1;

        if self.new_since_trend >= TREND_RECOMPUTE_EVERY && self.values.len() == TREND_WINDOW_SIZE
        {
            self.new_since_trend = 0;
            let values: Vec<f32> = self.values.iter().copied().collect();
            Some(compute_trend(&values))
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.values.clear();
        self.new_since_trend = 0;
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Window, trend and alarm state of a single vital.
#[derive(Debug, Clone)]
struct VitalTracker {
    window: VitalWindow,
    trend: Trend,
    alarm: AlarmStatus,
    last_value: Option<i32>,
}

impl VitalTracker {
    fn new() -> Self {
        Self {
            window: VitalWindow::default(),
            trend: Trend::Stable,
            alarm: AlarmStatus::Unknown,
            last_value: None,
        }
    }

    fn accept(&mut self, value: i32, alarm: AlarmStatus) {
        if let Some(trend) = self.window.push(value as f32) {
            self.trend = trend;
        }
        self.alarm = alarm;
        self.last_value = Some(value);
    }

    fn reject(&mut self) {
        self.window.clear();
        self.trend = Trend::Stable;
        self.alarm = AlarmStatus::Unknown;
        self.last_value = None;
    }
}

/// Result of feeding one value into the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VitalUpdate {
    pub vital: Vital,
    pub value: i32,
    pub trend: Trend,
    pub alarm: AlarmStatus,
    pub previous_alarm: AlarmStatus,
}

impl VitalUpdate {
    /// The reading just moved into the critical band.
    pub fn entered_critical(&self) -> bool {
        self.alarm == AlarmStatus::Critical && self.previous_alarm != AlarmStatus::Critical
    }
}

/// Current analysis of one vital, for the session projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VitalReadout {
    pub value: Option<i32>,
    pub trend: Trend,
    pub alarm: AlarmStatus,
}

/// Trend and alarm state for SpO2 and heart rate.
#[derive(Debug, Clone)]
pub struct TrendAnalyzer {
    spo2_thresholds: Spo2Thresholds,
    hr_thresholds: HeartRateThresholds,
    spo2: VitalTracker,
    heart_rate: VitalTracker,
}

impl TrendAnalyzer {
    pub fn new(spo2_thresholds: Spo2Thresholds, hr_thresholds: HeartRateThresholds) -> Self {
        Self {
            spo2_thresholds,
            hr_thresholds,
            spo2: VitalTracker::new(),
            heart_rate: VitalTracker::new(),
        }
    }

    fn tracker_mut(&mut self, vital: Vital) -> &mut VitalTracker {
        match vital {
            Vital::Spo2 => &mut self.spo2,
            Vital::HeartRate => &mut self.heart_rate,
        }
    }

    fn tracker(&self, vital: Vital) -> &VitalTracker {
        match vital {
            Vital::Spo2 => &self.spo2,
            Vital::HeartRate => &self.heart_rate,
        }
    }

    /// Classify a value against the thresholds this analyzer was built with.
    pub fn classify(&self, vital: Vital, value: i32) -> AlarmStatus {
        match vital {
            Vital::Spo2 => AlarmStatus::from_spo2(value, &self.spo2_thresholds),
            Vital::HeartRate => AlarmStatus::from_heart_rate(value, &self.hr_thresholds),
        }
    }

    /// Feed an accepted value and return the resulting trend and alarm.
    pub fn on_accepted_sample(&mut self, vital: Vital, value: i32) -> (Trend, AlarmStatus) {
        let update = self.accept(vital, value);
        (update.trend, update.alarm)
    }

    fn accept(&mut self, vital: Vital, value: i32) -> VitalUpdate {
        let alarm = self.classify(vital, value);
        let tracker = self.tracker_mut(vital);
        let previous_alarm = tracker.alarm;
        let previous_trend = tracker.trend;
        tracker.accept(value, alarm);

        if tracker.trend != previous_trend {
            debug!(vital = ?vital, trend = ?tracker.trend, "Trend changed");
        }

        VitalUpdate {
            vital,
            value,
            trend: tracker.trend,
            alarm,
            previous_alarm,
        }
    }

    /// Feed both vitals of a usable reading.
    pub fn on_reading(&mut self, reading: &UsableReading) -> [VitalUpdate; 2] {
        [
            self.accept(Vital::Spo2, reading.spo2),
            self.accept(Vital::HeartRate, reading.heart_rate),
        ]
    }

    /// Drop the window of a vital after an unusable sample.
    pub fn on_rejected_sample(&mut self, vital: Vital) {
        self.tracker_mut(vital).reject();
    }

    /// Reject both vitals.
    pub fn on_rejected(&mut self) {
        self.on_rejected_sample(Vital::Spo2);
        self.on_rejected_sample(Vital::HeartRate);
    }

    pub fn readout(&self, vital: Vital) -> VitalReadout {
        let tracker = self.tracker(vital);
        VitalReadout {
            value: tracker.last_value,
            trend: tracker.trend,
            alarm: tracker.alarm,
        }
    }

    pub fn window_len(&self, vital: Vital) -> usize {
        self.tracker(vital).window.len()
    }

    /// Whether any vital is currently critical.
    pub fn any_critical(&self) -> bool {
        self.spo2.alarm == AlarmStatus::Critical || self.heart_rate.alarm == AlarmStatus::Critical
    }
}

/// A critical-alarm message on display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalAlarm {
    pub vital: Vital,
    pub value: i32,
    pub message: String,
}

/// Critical-alarm messages with a display timeout.
///
/// A message appears when a vital enters the critical band. Each message
/// disappears once its own display timeout runs out, and all of them go
/// when no vital is critical any more.
#[derive(Debug, Clone)]
pub struct CriticalAlarmBanner {
    display: Duration,
    shown: Vec<ShownAlarm>,
}

#[derive(Debug, Clone)]
struct ShownAlarm {
    alarm: CriticalAlarm,
    expires_at: Instant,
}

impl CriticalAlarmBanner {
    pub fn new(display: Duration) -> Self {
        Self {
            display,
            shown: Vec::new(),
        }
    }

    /// Apply one analyzer update. Returns the alarm when a new message was
    /// raised.
    pub fn observe(&mut self, update: &VitalUpdate, now: Instant) -> Option<CriticalAlarm> {
        if !update.entered_critical() {
            return None;
        }
        if self.shown.iter().any(|s| s.alarm.vital == update.vital) {
            return None;
        }

        let alarm = CriticalAlarm {
            vital: update.vital,
            value: update.value,
            message: format!(
                "CRITICAL: {} at {}{}",
                update.vital.label(),
                update.value,
                update.vital.unit()
            ),
        };
        warn!(vital = ?update.vital, value = update.value, "Critical alarm raised");
        self.shown.push(ShownAlarm {
            alarm: alarm.clone(),
            expires_at: now + self.display,
        });
        Some(alarm)
    }

    /// Clear every message once no vital is critical.
    pub fn settle(&mut self, any_critical: bool) {
        if !any_critical && !self.shown.is_empty() {
            debug!("Critical alarms cleared, no vital remains critical");
            self.clear();
        }
    }

    /// Drop the messages whose display timeout has passed. Returns whether
    /// any were dropped.
    pub fn expire(&mut self, now: Instant) -> bool {
        let before = self.shown.len();
        self.shown.retain(|s| s.expires_at > now);
        let expired = self.shown.len() < before;
        if expired {
            debug!(remaining = self.shown.len(), "Critical alarm display timed out");
        }
        expired
    }

    pub fn clear(&mut self) {
        self.shown.clear();
    }

    /// Earliest display timeout still pending.
    pub fn deadline(&self) -> Option<Instant> {
        self.shown.iter().map(|s| s.expires_at).min()
    }

    pub fn alarms(&self) -> Vec<CriticalAlarm> {
        self.shown.iter().map(|s| s.alarm.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdConfig;

    fn analyzer() -> TrendAnalyzer {
        let config = ThresholdConfig::default();
        TrendAnalyzer::new(config.spo2, config.heart_rate)
    }

    #[test]
    fn test_descending_spo2_trends_down() {
        let mut analyzer = analyzer();
        let mut last = (Trend::Stable, AlarmStatus::Unknown);
        for value in [98, 97, 96, 95, 94, 93] {
            last = analyzer.on_accepted_sample(Vital::Spo2, value);
        }
        assert_eq!(last, (Trend::Down, AlarmStatus::Normal));
    }

    #[test]
    fn test_trend_held_until_window_full() {
        let mut analyzer = analyzer();
        for value in [90, 92, 94, 96, 98] {
            let (trend, _) = analyzer.on_accepted_sample(Vital::HeartRate, value);
            assert_eq!(trend, Trend::Stable);
        }
        let (trend, _) = analyzer.on_accepted_sample(Vital::HeartRate, 100);
        assert_eq!(trend, Trend::Up);
    }

    #[test]
    fn test_trend_recomputed_every_three_values() {
        let mut analyzer = analyzer();
        for value in [90, 90, 90, 100, 100, 100] {
            analyzer.on_accepted_sample(Vital::HeartRate, value);
        }
        assert_eq!(analyzer.readout(Vital::HeartRate).trend, Trend::Up);

        // Two new low values: not yet due, the trend is held.
        analyzer.on_accepted_sample(Vital::HeartRate, 80);
        analyzer.on_accepted_sample(Vital::HeartRate, 80);
        assert_eq!(analyzer.readout(Vital::HeartRate).trend, Trend::Up);

        // Third value: window is [100, 100, 100, 80, 80, 80].
        let (trend, _) = analyzer.on_accepted_sample(Vital::HeartRate, 80);
        assert_eq!(trend, Trend::Down);
    }

    #[test]
    fn test_equal_means_are_stable() {
        assert_eq!(compute_trend(&[95.0, 96.0, 97.0, 97.0, 95.0, 96.0]), Trend::Stable);
    }

    #[test]
    fn test_trend_ignores_order_within_halves() {
        let base = [96.0, 97.0, 99.0, 94.0, 95.0, 98.0];
        let shuffled = [99.0, 96.0, 97.0, 98.0, 94.0, 95.0];
        assert_eq!(compute_trend(&base), compute_trend(&shuffled));
        assert_eq!(compute_trend(&base), Trend::Down);

        // Moving a value across the halves changes the answer.
        let crossed = [94.0, 97.0, 96.0, 99.0, 95.0, 98.0];
        assert_eq!(compute_trend(&crossed), Trend::Up);
    }

    #[test]
    fn test_rejection_clears_window() {
        let mut analyzer = analyzer();
        for value in [98, 97, 96, 95, 94, 93] {
            analyzer.on_accepted_sample(Vital::Spo2, value);
        }
        assert_eq!(analyzer.readout(Vital::Spo2).trend, Trend::Down);

        analyzer.on_rejected_sample(Vital::Spo2);
        let readout = analyzer.readout(Vital::Spo2);
        assert_eq!(readout.trend, Trend::Stable);
        assert_eq!(readout.alarm, AlarmStatus::Unknown);
        assert_eq!(readout.value, None);
        assert_eq!(analyzer.window_len(Vital::Spo2), 0);

        // A fresh window needs six values again.
        for value in [90, 91, 92, 93, 94] {
            let (trend, _) = analyzer.on_accepted_sample(Vital::Spo2, value);
            assert_eq!(trend, Trend::Stable);
        }
    }

    #[test]
    fn test_window_is_bounded() {
        let mut analyzer = analyzer();
        for value in 60..80 {
            analyzer.on_accepted_sample(Vital::HeartRate, value);
        }
        assert_eq!(analyzer.window_len(Vital::HeartRate), TREND_WINDOW_SIZE);
    }

    #[test]
    fn test_banner_raises_once_per_transition() {
        let mut analyzer = analyzer();
        let mut banner = CriticalAlarmBanner::new(Duration::from_secs(5));
        let now = Instant::now();

        let [spo2, _] = analyzer.on_reading(&UsableReading {
            spo2: 86,
            heart_rate: 90,
            signal_strength: None,
        });
        assert!(banner.observe(&spo2, now).is_some());

        // Still critical on the next reading: no new message.
        let [spo2, _] = analyzer.on_reading(&UsableReading {
            spo2: 85,
            heart_rate: 90,
            signal_strength: None,
        });
        assert!(!spo2.entered_critical());
        assert!(banner.observe(&spo2, now).is_none());
        assert_eq!(banner.alarms().len(), 1);
        assert!(banner.alarms()[0].message.contains("SpO2 at 86%"));
    }

    #[test]
    fn test_banner_clears_when_no_vital_critical() {
        let mut analyzer = analyzer();
        let mut banner = CriticalAlarmBanner::new(Duration::from_secs(5));
        let now = Instant::now();

        for update in analyzer.on_reading(&UsableReading {
            spo2: 86,
            heart_rate: 160,
            signal_strength: None,
        }) {
            banner.observe(&update, now);
        }
        assert_eq!(banner.alarms().len(), 2);
        banner.settle(analyzer.any_critical());
        assert_eq!(banner.alarms().len(), 2);

        analyzer.on_reading(&UsableReading {
            spo2: 96,
            heart_rate: 90,
            signal_strength: None,
        });
        banner.settle(analyzer.any_critical());
        assert!(banner.alarms().is_empty());
        assert!(banner.deadline().is_none());
    }

    #[test]
    fn test_banner_expires() {
        let mut analyzer = analyzer();
        let mut banner = CriticalAlarmBanner::new(Duration::from_secs(5));
        let now = Instant::now();

        let [spo2, _] = analyzer.on_reading(&UsableReading {
            spo2: 80,
            heart_rate: 90,
            signal_strength: None,
        });
        banner.observe(&spo2, now);

        assert!(!banner.expire(now + Duration::from_secs(4)));
        assert!(banner.expire(now + Duration::from_secs(5)));
        assert!(banner.alarms().is_empty());
    }

    #[test]
    fn test_banner_times_out_each_alarm_separately() {
        let mut analyzer = analyzer();
        let mut banner = CriticalAlarmBanner::new(Duration::from_secs(5));
        let now = Instant::now();

        let [spo2, _] = analyzer.on_reading(&UsableReading {
            spo2: 80,
            heart_rate: 90,
            signal_strength: None,
        });
        banner.observe(&spo2, now);

        let later = now + Duration::from_secs(4);
        let [_, heart_rate] = analyzer.on_reading(&UsableReading {
            spo2: 80,
            heart_rate: 170,
            signal_strength: None,
        });
        assert!(banner.observe(&heart_rate, later).is_some());
        assert_eq!(banner.deadline(), Some(now + Duration::from_secs(5)));

        // The SpO2 message goes at its own timeout, the heart-rate one stays.
        assert!(banner.expire(now + Duration::from_secs(5)));
        let alarms = banner.alarms();
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].vital, Vital::HeartRate);
        assert_eq!(banner.deadline(), Some(later + Duration::from_secs(5)));

        assert!(banner.expire(later + Duration::from_secs(5)));
        assert!(banner.alarms().is_empty());
        assert!(banner.deadline().is_none());
    }
}
