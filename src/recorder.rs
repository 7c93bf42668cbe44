//! Per-second recording of the active test.
//!
//! The session's 1 Hz tick is the only writer of this state: each tick
//! advances elapsed time, appends one [`DataPoint`] per vital when the latest
//! reading is usable, tightens the running extrema and emits a
//! [`MinuteSnapshot`] whenever a minute boundary is crossed.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{CriticalValueRecord, DataPoint, MinuteSnapshot};
use crate::validation::UsableReading;

/// Most data points kept per vital.
pub const MAX_DATA_POINTS: usize = 360;

/// Length of one tick.
pub const TICK_MS: u64 = 1_000;

/// Length of one snapshot period.
pub const MINUTE_MS: u64 = 60_000;

/// Running extrema of the active test.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct VitalExtrema {
    pub min_spo2: Option<CriticalValueRecord>,
    pub max_heart_rate: Option<CriticalValueRecord>,
    pub min_heart_rate: Option<CriticalValueRecord>,
}

impl VitalExtrema {
    fn update(&mut self, reading: &UsableReading, time_millis: u64, distance: f32) {
        let record = |value: i32| CriticalValueRecord {
            value,
            time_millis,
            distance_at_time: distance,
        };

        if self.min_spo2.is_none_or(|r| reading.spo2 < r.value) {
            self.min_spo2 = Some(record(reading.spo2));
        }
        if self
            .max_heart_rate
            .is_none_or(|r| reading.heart_rate > r.value)
        {
            self.max_heart_rate = Some(record(reading.heart_rate));
        }
        if self
            .min_heart_rate
            .is_none_or(|r| reading.heart_rate < r.value)
        {
            self.min_heart_rate = Some(record(reading.heart_rate));
        }
    }
}

/// What a single tick produced.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TickOutcome {
    pub elapsed_ms: u64,
    pub snapshots: Vec<MinuteSnapshot>,
    /// The configured test duration has elapsed.
    pub duration_reached: bool,
}

/// Elapsed time, data series, extrema and minute snapshots of one test.
#[derive(Debug, Clone)]
pub struct TestRecorder {
    duration_ms: u64,
    elapsed_ms: u64,
    spo2_points: VecDeque<DataPoint>,
    heart_rate_points: VecDeque<DataPoint>,
    extrema: VitalExtrema,
    snapshots: Vec<MinuteSnapshot>,
}

impl TestRecorder {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration_ms: duration.as_millis() as u64,
            elapsed_ms: 0,
            spo2_points: VecDeque::with_capacity(MAX_DATA_POINTS),
            heart_rate_points: VecDeque::with_capacity(MAX_DATA_POINTS),
            extrema: VitalExtrema::default(),
            snapshots: Vec::new(),
        }
    }

    /// Drop everything recorded so far.
    pub fn reset(&mut self) {
        self.elapsed_ms = 0;
        self.spo2_points.clear();
        self.heart_rate_points.clear();
        self.extrema = VitalExtrema::default();
        self.snapshots.clear();
    }

    /// Advance the test by one second.
    pub fn on_tick(&mut self, reading: Option<&UsableReading>, distance: f32) -> TickOutcome {
        let previous = self.elapsed_ms;
        self.elapsed_ms = (self.elapsed_ms + TICK_MS).min(self.duration_ms);
        let now = self.elapsed_ms;

        if let Some(reading) = reading {
            push_bounded(
                &mut self.spo2_points,
                DataPoint {
                    time_millis: now,
                    value: reading.spo2 as f32,
                    distance_at_time: distance,
                },
            );
            push_bounded(
                &mut self.heart_rate_points,
                DataPoint {
                    time_millis: now,
                    value: reading.heart_rate as f32,
                    distance_at_time: distance,
                },
            );
            self.extrema.update(reading, now, distance);
        }

        let mut outcome = TickOutcome {
            elapsed_ms: now,
            snapshots: Vec::new(),
            duration_reached: now >= self.duration_ms,
        };

        if now / MINUTE_MS > previous / MINUTE_MS {
            let mark = (now / MINUTE_MS) as u32;
            if let Some(snapshot) = self.record_snapshot(mark, distance) {
                outcome.snapshots.push(snapshot);
            }
        }

        if outcome.duration_reached {
            if let Some(snapshot) = self.ensure_final_snapshot(distance) {
                outcome.snapshots.push(snapshot);
            }
        }

        outcome
    }

    /// Make sure the snapshot of the last full minute exists once the test
    /// has run its full duration.
    pub fn ensure_final_snapshot(&mut self, distance: f32) -> Option<MinuteSnapshot> {
        if self.elapsed_ms < self.duration_ms {
            return None;
        }
        let final_mark = (self.duration_ms / MINUTE_MS) as u32;
        if final_mark == 0 {
            return None;
        }
        let snapshot = self.record_snapshot(final_mark, distance);
        if snapshot.is_some() {
            debug!(minute = final_mark, "Final minute snapshot emitted by end-of-test check");
        }
        snapshot
    }

    fn record_snapshot(&mut self, mark: u32, distance: f32) -> Option<MinuteSnapshot> {
        if self.snapshots.iter().any(|s| s.minute_mark >= mark) {
            return None;
        }
        let snapshot = MinuteSnapshot {
            minute_mark: mark,
            min_spo2_overall: self.extrema.min_spo2.map(|r| r.value),
            max_hr_overall: self.extrema.max_heart_rate.map(|r| r.value),
            distance_at_minute_end: Some(distance),
        };
        info!(
            minute = mark,
            min_spo2 = ?snapshot.min_spo2_overall,
            max_hr = ?snapshot.max_hr_overall,
            distance_m = distance,
            "Minute snapshot recorded"
        );
        self.snapshots.push(snapshot);
        Some(snapshot)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.elapsed_ms
    }

    pub fn duration_ms(&self) -> u64 {
        self.duration_ms
    }

    pub fn remaining_ms(&self) -> u64 {
        self.duration_ms.saturating_sub(self.elapsed_ms)
    }

    pub fn spo2_points(&self) -> &VecDeque<DataPoint> {
        &self.spo2_points
    }

    pub fn heart_rate_points(&self) -> &VecDeque<DataPoint> {
        &self.heart_rate_points
    }

    pub fn extrema(&self) -> VitalExtrema {
        self.extrema
    }

    pub fn snapshots(&self) -> &[MinuteSnapshot] {
        &self.snapshots
    }
}

fn push_bounded(points: &mut VecDeque<DataPoint>, point: DataPoint) {
    if points.len() == MAX_DATA_POINTS {
        points.pop_front();
    }
    points.push_back(point);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(spo2: i32, heart_rate: i32) -> UsableReading {
        UsableReading {
            spo2,
            heart_rate,
            signal_strength: Some(8),
        }
    }

    fn six_minutes() -> TestRecorder {
        TestRecorder::new(Duration::from_secs(360))
    }

    #[test]
    fn test_tick_appends_points() {
        let mut recorder = six_minutes();
        recorder.on_tick(Some(&reading(97, 80)), 1.5);
        recorder.on_tick(None, 2.0);
        recorder.on_tick(Some(&reading(96, 84)), 3.0);

        assert_eq!(recorder.elapsed_ms(), 3_000);
        let times: Vec<u64> = recorder.spo2_points().iter().map(|p| p.time_millis).collect();
        assert_eq!(times, vec![1_000, 3_000]);
        assert_eq!(recorder.heart_rate_points().back().unwrap().value, 84.0);
        assert_eq!(recorder.spo2_points()[0].distance_at_time, 1.5);
    }

    #[test]
    fn test_extrema_replaced_only_when_stricter() {
        let mut recorder = six_minutes();
        recorder.on_tick(Some(&reading(95, 100)), 0.0);
        recorder.on_tick(Some(&reading(95, 100)), 5.0);
        recorder.on_tick(Some(&reading(93, 120)), 10.0);
        recorder.on_tick(Some(&reading(94, 70)), 15.0);

        let extrema = recorder.extrema();
        let min_spo2 = extrema.min_spo2.unwrap();
        assert_eq!((min_spo2.value, min_spo2.time_millis), (93, 3_000));
        assert_eq!(min_spo2.distance_at_time, 10.0);

        // Equal values do not replace the first record.
        let max_hr = extrema.max_heart_rate.unwrap();
        assert_eq!((max_hr.value, max_hr.time_millis), (120, 3_000));
        let min_hr = extrema.min_heart_rate.unwrap();
        assert_eq!((min_hr.value, min_hr.time_millis), (70, 4_000));
    }

    #[test]
    fn test_full_test_emits_six_unique_snapshots() {
        let mut recorder = six_minutes();
        let mut emitted = Vec::new();
        let mut finished_at = None;

        for second in 1..=400u32 {
            let outcome = recorder.on_tick(Some(&reading(97, 90 + (second % 7) as i32)), second as f32);
            emitted.extend(outcome.snapshots);
            if outcome.duration_reached {
                finished_at = Some(second);
                break;
            }
        }

        assert_eq!(finished_at, Some(360));
        let marks: Vec<u32> = emitted.iter().map(|s| s.minute_mark).collect();
        assert_eq!(marks, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(recorder.snapshots().len(), 6);
        assert_eq!(emitted[5].distance_at_minute_end, Some(360.0));
        assert_eq!(emitted[0].max_hr_overall, Some(96));
    }

    #[test]
    fn test_snapshot_carries_cumulative_extrema() {
        let mut recorder = TestRecorder::new(Duration::from_secs(180));
        for second in 1..=120 {
            let spo2 = if second == 30 { 89 } else { 96 };
            recorder.on_tick(Some(&reading(spo2, 100)), 0.0);
        }
        let snapshots = recorder.snapshots();
        assert_eq!(snapshots[0].min_spo2_overall, Some(89));
        assert_eq!(snapshots[1].min_spo2_overall, Some(89));
    }

    #[test]
    fn test_snapshot_without_readings() {
        let mut recorder = six_minutes();
        for _ in 0..60 {
            recorder.on_tick(None, 12.0);
        }
        let snapshot = recorder.snapshots()[0];
        assert_eq!(snapshot.minute_mark, 1);
        assert_eq!(snapshot.min_spo2_overall, None);
        assert_eq!(snapshot.distance_at_minute_end, Some(12.0));
    }

    #[test]
    fn test_final_snapshot_check_is_idempotent() {
        let mut recorder = six_minutes();
        for _ in 0..360 {
            recorder.on_tick(None, 0.0);
        }
        assert!(recorder.ensure_final_snapshot(0.0).is_none());
        assert_eq!(recorder.snapshots().len(), 6);
    }

    #[test]
    fn test_final_snapshot_not_emitted_before_end() {
        let mut recorder = six_minutes();
        for _ in 0..200 {
            recorder.on_tick(None, 0.0);
        }
        assert!(recorder.ensure_final_snapshot(0.0).is_none());
    }

    #[test]
    fn test_points_are_bounded() {
        let mut recorder = TestRecorder::new(Duration::from_secs(3_600));
        for _ in 0..500 {
            recorder.on_tick(Some(&reading(97, 80)), 0.0);
        }
        assert_eq!(recorder.spo2_points().len(), MAX_DATA_POINTS);
        assert_eq!(recorder.spo2_points().front().unwrap().time_millis, 141_000);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut recorder = six_minutes();
        for _ in 0..61 {
            recorder.on_tick(Some(&reading(97, 80)), 1.0);
        }
        recorder.reset();
        assert_eq!(recorder.elapsed_ms(), 0);
        assert!(recorder.snapshots().is_empty());
        assert!(recorder.spo2_points().is_empty());
        assert_eq!(recorder.extrema(), VitalExtrema::default());
    }
}
