//! Stops taken during the test and the manual-termination countdown.

use tracing::info;

use crate::error::SessionError;
use crate::model::StopRecord;

/// Append-only list of stops; only the newest one can be taken back.
#[derive(Debug, Clone, Default)]
pub struct StopRecorder {
    stops: Vec<StopRecord>,
}

impl StopRecorder {
    pub fn add(&mut self, record: StopRecord) {
        info!(
            at_ms = record.stop_time_millis,
            spo2 = record.spo2,
            heart_rate = record.heart_rate,
            distance_m = record.distance_at_stop_time,
            "Stop recorded"
        );
        self.stops.push(record);
    }

    /// Remove the most recent stop.
    pub fn delete_last(&mut self) -> Result<StopRecord, SessionError> {
        let removed = self.stops.pop().ok_or(SessionError::NoStopsToDelete)?;
        info!(at_ms = removed.stop_time_millis, "Last stop deleted");
        Ok(removed)
    }

    pub fn clear(&mut self) {
        self.stops.clear();
    }

    pub fn stops(&self) -> &[StopRecord] {
        &self.stops
    }
}

/// Countdown the operator can cancel before a manual stop takes effect.
#[derive(Debug, Clone)]
pub struct StopCountdown {
    seconds: u8,
    remaining: Option<u8>,
}

/// Result of one countdown step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountdownStep {
    Remaining(u8),
    Confirmed,
}

impl StopCountdown {
    pub fn new(seconds: u8) -> Self {
        Self {
            seconds: seconds.max(1),
            remaining: None,
        }
    }

    pub fn start(&mut self) -> Result<u8, SessionError> {
        if self.remaining.is_some() {
            return Err(SessionError::CountdownActive);
        }
        self.remaining = Some(self.seconds);
        Ok(self.seconds)
    }

    /// Advance by one second.
    pub fn step(&mut self) -> Option<CountdownStep> {
        let remaining = self.remaining?.saturating_sub(1);
        if remaining == 0 {
            self.remaining = None;
            Some(CountdownStep::Confirmed)
        } else {
            self.remaining = Some(remaining);
            Some(CountdownStep::Remaining(remaining))
        }
    }

    pub fn cancel(&mut self) -> Result<(), SessionError> {
        self.remaining.take().map(|_| ()).ok_or(SessionError::NoCountdown)
    }

    /// Stop counting without reporting an error, e.g. on restart.
    pub fn reset(&mut self) {
        self.remaining = None;
    }

    pub fn remaining(&self) -> Option<u8> {
        self.remaining
    }

    pub fn is_active(&self) -> bool {
        self.remaining.is_some()
    }
}
