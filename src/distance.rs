//! Step-count to distance conversion.
//!
//! The wearable reports its running hardware step counter. Distance is
//! accumulated per *segment*: a segment starts at a baseline reading and
//! contributes `(steps - baseline) * stride` meters. A new segment begins
//! when the counter resets (device reboot) or the wearable reconnects after a
//! drop. Finished segments are folded into `accumulated_distance_m`, which
//! never decreases.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Segment bookkeeping, owned by the [`DistanceAccumulator`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DistanceState {
    pub segment_baseline_steps: Option<u32>,
    pub accumulated_distance_m: f32,
    pub last_known_steps: Option<u32>,
}

/// Why a segment was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentReset {
    /// The hardware counter dropped below the baseline.
    CounterReset,
    /// The wearable link dropped.
    ConnectionLost,
}

/// Converts wearable step readings into walked distance.
#[derive(Debug, Clone)]
pub struct DistanceAccumulator {
    stride_length_m: f32,
    running: bool,
    state: DistanceState,
    resets: Vec<SegmentReset>,
}

impl DistanceAccumulator {
    pub fn new(stride_length_m: f32) -> Self {
        Self {
            stride_length_m,
            running: false,
            state: DistanceState::default(),
            resets: Vec::new(),
        }
    }

    /// Begin accumulating. `latest_steps` is the most recent reading seen
    /// before the start; when present it becomes the first baseline.
    pub fn on_test_start(&mut self, latest_steps: Option<u32>) {
        self.clear();
        self.running = true;
        self.state.segment_baseline_steps = latest_steps;
        self.state.last_known_steps = latest_steps;
        info!(baseline = ?latest_steps, "Distance accumulation started");
    }

    /// Stop accumulating and keep the final distance readable.
    pub fn on_test_end(&mut self) {
        if self.running {
            self.state.accumulated_distance_m = self.total_distance();
            self.state.segment_baseline_steps = None;
            self.state.last_known_steps = None;
            self.running = false;
        }
    }

    /// Forget everything, e.g. when a new session is configured.
    pub fn clear(&mut self) {
        self.running = false;
        self.state = DistanceState::default();
        self.resets.clear();
    }

    /// Feed a step reading and return the total distance in meters.
    pub fn on_step_sample(&mut self, total_steps: Option<u32>) -> f32 {
        if !self.running {
            return self.state.accumulated_distance_m;
        }
        let Some(steps) = total_steps else {
            return self.total_distance();
        };

        let (Some(baseline), Some(last)) = (
            self.state.segment_baseline_steps,
            self.state.last_known_steps,
        ) else {
            debug!(baseline = steps, "New distance segment");
            self.state.segment_baseline_steps = Some(steps);
            self.state.last_known_steps = Some(steps);
            return self.state.accumulated_distance_m;
        };

        if steps < last && steps < baseline {
            let frozen = self.total_distance();
            warn!(
                previous = last,
                current = steps,
                distance_m = frozen,
                "Step counter reset detected, starting new segment"
            );
            self.state.accumulated_distance_m = frozen;
            self.state.segment_baseline_steps = Some(steps);
            self.state.last_known_steps = Some(steps);
            self.resets.push(SegmentReset::CounterReset);
            return frozen;
        }

        if steps < last {
            debug!(previous = last, current = steps, "Ignoring step regression");
            return self.total_distance();
        }

        self.state.last_known_steps = Some(steps);
        self.total_distance()
    }

    /// Freeze the distance walked so far; no steps are attributed to the gap.
    pub fn on_connection_lost(&mut self) {
        if !self.running {
            return;
        }
        let frozen = self.total_distance();
        self.state.accumulated_distance_m = frozen;
        self.state.segment_baseline_steps = None;
        self.state.last_known_steps = None;
        self.resets.push(SegmentReset::ConnectionLost);
        info!(distance_m = frozen, "Wearable lost, distance frozen");
    }

    /// The next reading after a reconnect starts a new segment.
    pub fn on_connection_restored(&mut self) {
        if self.running {
            self.state.segment_baseline_steps = None;
            self.state.last_known_steps = None;
            info!("Wearable restored, awaiting new baseline");
        }
    }

    /// Distance of finished segments plus the open one.
    pub fn total_distance(&self) -> f32 {
        let segment = match (
            self.state.segment_baseline_steps,
            self.state.last_known_steps,
        ) {
            (Some(baseline), Some(last)) if last > baseline => {
                (last - baseline) as f32 * self.stride_length_m
            }
            _ => 0.0,
        };
        self.state.accumulated_distance_m + segment
    }

    pub fn state(&self) -> DistanceState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Segment resets seen during the current test.
    pub fn resets(&self) -> &[SegmentReset] {
        &self.resets
    }
}
