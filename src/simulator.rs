//! Simulated sensors for demos and end-to-end tests.
//!
//! Each simulated device consumes the [`LinkCommand`]s of its role, walks
//! its supervisor through the connection handshake and, once subscribed,
//! streams samples into the session engine. The wearable's step counter keeps
//! running while disconnected, like the real device, and can reboot.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::connection::ConnectionSupervisor;
use crate::link::LinkCommand;
use crate::model::{DeviceConnectionState, DeviceRole, SensorSample, WearableSample};
use crate::session::SessionHandle;

/// Shortest interval between two counted steps.
pub const STEP_DEBOUNCE: Duration = Duration::from_millis(350);

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Delay before the simulated device reports `Connected`, and again
    /// before it reports `Subscribed`.
    pub handshake_delay: Duration,
    pub oximeter_period: Duration,
    pub wearable_period: Duration,
    /// Walking cadence. Never faster than [`STEP_DEBOUNCE`].
    pub step_interval: Duration,
    /// Reboot the wearable once, this long after the simulator starts.
    pub wearable_reboot_after: Option<Duration>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            handshake_delay: Duration::from_millis(250),
            oximeter_period: Duration::from_secs(1),
            wearable_period: Duration::from_secs(1),
            step_interval: Duration::from_millis(550),
            wearable_reboot_after: None,
        }
    }
}

/// Deterministic oximeter signal: SpO2 sags and heart rate climbs with
/// effort, with the odd finger-off reading.
#[derive(Debug, Clone, Default)]
pub struct OximeterSignal {
    second: u32,
}

impl OximeterSignal {
    pub fn next_sample(&mut self) -> SensorSample {
        let second = self.second;
        self.second += 1;

        let effort = (second / 30).min(6) as i32;
        let wobble = [0, 1, 0, -1][(second % 4) as usize];
        let spo2 = (97 - effort + wobble).clamp(85, 100) as u8;
        let heart_rate = (78 + effort * 7 + wobble * 2).clamp(40, 200) as u16;
        let finger_absent = second > 0 && second % 97 == 0;

        SensorSample {
            spo2: Some(spo2),
            heart_rate: Some(heart_rate),
            finger_absent,
            signal_strength: Some(if finger_absent { 0 } else { 8 }),
            timestamp: Utc::now(),
        }
    }
}

/// Hardware-style step counter: counts from its power-on instant and starts
/// again from zero after a reboot.
#[derive(Debug, Clone)]
pub struct StepCounter {
    powered_on: Instant,
    interval: Duration,
}

impl StepCounter {
    pub fn new(now: Instant, step_interval: Duration) -> Self {
        Self {
            powered_on: now,
            interval: step_interval.max(STEP_DEBOUNCE),
        }
    }

    pub fn total_steps(&self, now: Instant) -> u32 {
        let walked = now.saturating_duration_since(self.powered_on);
        (walked.as_millis() / self.interval.as_millis()) as u32
    }

    pub fn reboot(&mut self, now: Instant) {
        self.powered_on = now;
    }
}

/// Running simulator tasks.
pub struct Simulator {
    tasks: Vec<JoinHandle<()>>,
}

impl Simulator {
    /// Spawn both simulated devices.
    pub fn spawn(
        config: SimulatorConfig,
        session: SessionHandle,
        oximeter_commands: mpsc::UnboundedReceiver<LinkCommand>,
        wearable_commands: mpsc::UnboundedReceiver<LinkCommand>,
    ) -> Self {
        info!("Starting simulated devices");
        let oximeter = tokio::spawn(run_oximeter(
            config.clone(),
            session.clone(),
            oximeter_commands,
        ));
        let wearable = tokio::spawn(run_wearable(config, session, wearable_commands));
        Self {
            tasks: vec![oximeter, wearable],
        }
    }

    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn handshake(supervisor: &ConnectionSupervisor, delay: Duration) {
    tokio::time::sleep(delay).await;
    supervisor.report_state(DeviceConnectionState::Connected);
    tokio::time::sleep(delay).await;
    supervisor.report_state(DeviceConnectionState::Subscribed);
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn run_oximeter(
    config: SimulatorConfig,
    session: SessionHandle,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let supervisor: Arc<ConnectionSupervisor> = session.supervisor(DeviceRole::Oximeter).clone();
    let mut signal = OximeterSignal::default();
    let mut streaming = false;
    let mut ticker = ticker(config.oximeter_period);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Connect { address }) => {
                    debug!(address = %address, "Simulated oximeter connecting");
                    handshake(&supervisor, config.handshake_delay).await;
                    streaming = true;
                    ticker.reset();
                }
                Some(LinkCommand::Disconnect { address }) => {
                    debug!(address = %address, "Simulated oximeter disconnecting");
                    streaming = false;
                }
                None => break,
            },
            _ = ticker.tick(), if streaming => {
                if session.oximeter_sample(signal.next_sample()).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Simulated oximeter stopped");
}

async fn run_wearable(
    config: SimulatorConfig,
    session: SessionHandle,
    mut commands: mpsc::UnboundedReceiver<LinkCommand>,
) {
    let supervisor: Arc<ConnectionSupervisor> = session.supervisor(DeviceRole::Wearable).clone();
    let started = Instant::now();
    let mut counter = StepCounter::new(started, config.step_interval);
    let mut reboot_at = config.wearable_reboot_after.map(|after| started + after);
    let mut streaming = false;
    let mut ticker = ticker(config.wearable_period);

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(LinkCommand::Connect { address }) => {
                    debug!(address = %address, "Simulated wearable connecting");
                    handshake(&supervisor, config.handshake_delay).await;
                    streaming = true;
                    ticker.reset();
                }
                Some(LinkCommand::Disconnect { address }) => {
                    debug!(address = %address, "Simulated wearable disconnecting");
                    streaming = false;
                }
                None => break,
            },
            _ = ticker.tick(), if streaming => {
                let now = Instant::now();
                if reboot_at.is_some_and(|at| now >= at) {
                    info!("Simulated wearable rebooting, step counter reset");
                    counter.reboot(now);
                    reboot_at = None;
                }
                let sample = WearableSample {
                    total_steps: Some(counter.total_steps(now)),
                    timestamp: Utc::now(),
                };
                if session.wearable_sample(sample).await.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Simulated wearable stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::validate;

    #[test]
    fn test_step_counter_respects_debounce() {
        let now = Instant::now();
        let counter = StepCounter::new(now, Duration::from_millis(100));
        assert_eq!(counter.total_steps(now + Duration::from_secs(7)), 20);
    }

    #[test]
    fn test_step_counter_reboot_restarts_from_zero() {
        let now = Instant::now();
        let mut counter = StepCounter::new(now, Duration::from_millis(500));
        let later = now + Duration::from_secs(30);
        assert_eq!(counter.total_steps(later), 60);

        counter.reboot(later);
        assert_eq!(counter.total_steps(later + Duration::from_secs(2)), 4);
    }

    #[test]
    fn test_oximeter_signal_mostly_usable() {
        let mut signal = OximeterSignal::default();
        let samples: Vec<_> = (0..360).map(|_| signal.next_sample()).collect();
        let usable = samples.iter().filter(|s| validate(s).is_usable()).count();
        assert_eq!(usable, 360 - 3);

        // Effort shows as a lower SpO2 late in the test.
        assert!(samples[350].spo2 < samples[5].spo2);
    }
}
