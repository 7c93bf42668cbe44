//! Post-test recovery capture.
//!
//! When a test ends a single recovery period starts. When it expires the
//! latest oximeter sample is captured if it is usable. Values still missing
//! afterwards are filled from live samples while the oximeter is connected,
//! never overwriting a value already captured.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::{DeviceConnectionState, RecoveryData, SensorSample};
use crate::validation::validate;

#[derive(Debug, Clone)]
pub struct RecoveryCoordinator {
    period: Duration,
    fallback_cutoff: Option<Duration>,
    deadline: Option<Instant>,
    period_over_at: Option<Instant>,
    data: Option<RecoveryData>,
}

impl RecoveryCoordinator {
    pub fn new(period: Duration, fallback_cutoff: Option<Duration>) -> Self {
        Self {
            period,
            fallback_cutoff,
            deadline: None,
            period_over_at: None,
            data: None,
        }
    }

    /// Start the recovery period at test end. Only the first call per test
    /// has an effect.
    pub fn start(&mut self, now: Instant) -> Option<Instant> {
        if self.deadline.is_some() || self.data.is_some() {
            return None;
        }
        let deadline = now + self.period;
        self.deadline = Some(deadline);
        info!(period_secs = self.period.as_secs(), "Recovery period started");
        Some(deadline)
    }

    /// Close the recovery period and capture the final vitals.
    ///
    /// Returns the published data the first time it is called after
    /// [`start`](Self::start), `None` otherwise.
    pub fn on_period_over(
        &mut self,
        latest: Option<&SensorSample>,
        now: Instant,
    ) -> Option<RecoveryData> {
        self.deadline.take()?;

        let reading = latest.and_then(|s| validate(s).reading());
        let data = match reading {
            Some(reading) => RecoveryData {
                spo2: Some(reading.spo2),
                heart_rate: Some(reading.heart_rate),
                period_over: true,
                captured_during_period: true,
            },
            None => RecoveryData {
                spo2: None,
                heart_rate: None,
                period_over: true,
                captured_during_period: false,
            },
        };

        if data.captured_during_period {
            info!(spo2 = ?data.spo2, heart_rate = ?data.heart_rate, "Recovery vitals captured");
        } else {
            warn!("Recovery period over without a usable reading, falling back to live data");
        }

        self.period_over_at = Some(now);
        self.data = Some(data);
        Some(data)
    }

    /// Fill missing recovery values from a live sample.
    ///
    /// Returns the updated data when a field was written.
    pub fn on_live_sample(
        &mut self,
        sample: &SensorSample,
        state: DeviceConnectionState,
        now: Instant,
    ) -> Option<RecoveryData> {
        if !self.fallback_active(now) || !state.is_streaming() {
            return None;
        }
        let reading = validate(sample).reading()?;
        let data = self.data.as_mut()?;

        let mut changed = false;
        if data.spo2.is_none() {
            data.spo2 = Some(reading.spo2);
            changed = true;
        }
        if data.heart_rate.is_none() {
            data.heart_rate = Some(reading.heart_rate);
            changed = true;
        }

        if changed {
            info!(
                spo2 = ?data.spo2,
                heart_rate = ?data.heart_rate,
                "Recovery vitals filled from live data"
            );
            Some(*data)
        } else {
            None
        }
    }

    /// Whether live samples may still fill missing values.
    pub fn fallback_active(&self, now: Instant) -> bool {
        let (Some(data), Some(over_at)) = (self.data, self.period_over_at) else {
            return false;
        };
        if data.is_complete() {
            return false;
        }
        match self.fallback_cutoff {
            Some(cutoff) if now >= over_at + cutoff => {
                debug!("Recovery fallback cutoff reached");
                false
            }
            _ => true,
        }
    }

    pub fn reset(&mut self) {
        self.deadline = None;
        self.period_over_at = None;
        self.data = None;
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn data(&self) -> Option<RecoveryData> {
        self.data
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn sample(spo2: u8, hr: u16, finger_absent: bool) -> SensorSample {
        SensorSample {
            spo2: Some(spo2),
            heart_rate: Some(hr),
            finger_absent,
            signal_strength: Some(8),
            timestamp: Utc::now(),
        }
    }

    fn coordinator() -> RecoveryCoordinator {
        RecoveryCoordinator::new(Duration::from_secs(60), None)
    }

    #[test]
    fn test_capture_usable_sample() {
        let mut recovery = coordinator();
        let now = Instant::now();
        let deadline = recovery.start(now).unwrap();
        assert_eq!(deadline, now + Duration::from_secs(60));

        let data = recovery
            .on_period_over(Some(&sample(95, 92, false)), deadline)
            .unwrap();
        assert_eq!(
            data,
            RecoveryData {
                spo2: Some(95),
                heart_rate: Some(92),
                period_over: true,
                captured_during_period: true,
            }
        );
    }

    #[test]
    fn test_finger_absent_at_expiry() {
        let mut recovery = coordinator();
        let now = Instant::now();
        let deadline = recovery.start(now).unwrap();
        let data = recovery
            .on_period_over(Some(&sample(95, 92, true)), deadline)
            .unwrap();
        assert_eq!(
            data,
            RecoveryData {
                spo2: None,
                heart_rate: None,
                period_over: true,
                captured_during_period: false,
            }
        );
    }

    #[test]
    fn test_period_over_published_once() {
        let mut recovery = coordinator();
        let now = Instant::now();
        assert!(recovery.on_period_over(None, now).is_none());

        recovery.start(now).unwrap();
        assert!(recovery.start(now).is_none());
        assert!(recovery.on_period_over(None, now).is_some());
        assert!(recovery.on_period_over(None, now).is_none());
        assert!(recovery.start(now).is_none());
    }

    #[test]
    fn test_live_fallback_fills_missing_values() {
        let mut recovery = coordinator();
        let now = Instant::now();
        recovery.start(now);
        recovery.on_period_over(None, now);

        // Disconnected oximeter: ignored.
        assert!(
            recovery
                .on_live_sample(&sample(96, 88, false), DeviceConnectionState::Reconnecting, now)
                .is_none()
        );
        // Unusable sample: ignored.
        assert!(
            recovery
                .on_live_sample(&sample(96, 88, true), DeviceConnectionState::Subscribed, now)
                .is_none()
        );

        let data = recovery
            .on_live_sample(&sample(96, 88, false), DeviceConnectionState::Subscribed, now)
            .unwrap();
        assert_eq!((data.spo2, data.heart_rate), (Some(96), Some(88)));
        assert!(!data.captured_during_period);

        // Complete: later samples never overwrite.
        assert!(
            recovery
                .on_live_sample(&sample(90, 120, false), DeviceConnectionState::Subscribed, now)
                .is_none()
        );
        assert_eq!(recovery.data().unwrap().spo2, Some(96));
    }

    #[test]
    fn test_fallback_cutoff() {
        let mut recovery = RecoveryCoordinator::new(
            Duration::from_secs(60),
            Some(Duration::from_secs(120)),
        );
        let now = Instant::now();
        recovery.start(now);
        let over = now + Duration::from_secs(60);
        recovery.on_period_over(None, over);

        assert!(recovery.fallback_active(over + Duration::from_secs(119)));
        assert!(
            recovery
                .on_live_sample(
                    &sample(96, 88, false),
                    DeviceConnectionState::Subscribed,
                    over + Duration::from_secs(120),
                )
                .is_none()
        );
    }

    #[test]
    fn test_reset_allows_new_period() {
        let mut recovery = coordinator();
        let now = Instant::now();
        recovery.start(now);
        recovery.on_period_over(None, now);
        recovery.reset();
        assert!(recovery.data().is_none());
        assert!(recovery.start(now).is_some());
        assert!(recovery.is_pending());
    }
}
