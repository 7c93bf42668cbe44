//! Session orchestration.
//!
//! A single tokio task owns the whole [`Session`]: commands, sample arrivals,
//! connection-state changes and timer expiries are each processed to
//! completion before the next one is looked at. Every timer is an optional
//! deadline polled by the task's `select!` loop, so cancelling one is just
//! clearing its deadline and a cancelled timer can never fire late.
//!
//! Callers talk to the task through a cloneable [`SessionHandle`]. The latest
//! [`SessionView`] is published on a `watch` channel after every step and
//! discrete [`SessionEvent`]s go out on a `broadcast` channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{EngineConfig, ThresholdProvider};
use crate::connection::{ConnectionSupervisor, LinkStatus, ReconnectOutcome};
use crate::distance::{DistanceAccumulator, SegmentReset};
use crate::error::{ConnectionError, SessionError};
use crate::model::{
    DataPoint, DeviceRole, MinuteSnapshot, PreparationData, RecoveryData, SensorSample,
    SessionPhase, StopRecord, TestOutcome, Vital, WearableSample,
};
use crate::recorder::{TICK_MS, TestRecorder, VitalExtrema};
use crate::recovery::RecoveryCoordinator;
use crate::stops::{CountdownStep, StopCountdown, StopRecorder};
use crate::trend::{CriticalAlarm, CriticalAlarmBanner, TrendAnalyzer, VitalReadout};
use crate::validation::{DeviceStatus, SampleValidity, UnusableReason, UsableReading, validate};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;
const TICK: Duration = Duration::from_millis(TICK_MS);
const COUNTDOWN_STEP: Duration = Duration::from_secs(1);

/// What happened to a sample handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum SampleDisposition {
    Accepted,
    Rejected { reason: UnusableReason },
    /// The device is not connected; the sample was dropped.
    Ignored,
}

/// Discrete notifications for UI and persistence layers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Configured { patient_id: String },
    TestStarted { started_at: DateTime<Utc> },
    SnapshotRecorded { snapshot: MinuteSnapshot },
    StopAdded { stop: StopRecord },
    StopDeleted { stop: StopRecord },
    CountdownStarted { remaining: u8 },
    CountdownTick { remaining: u8 },
    CountdownCancelled,
    TestFinished {
        outcome: TestOutcome,
        elapsed_ms: u64,
        distance_m: f32,
    },
    RecoveryPublished { data: RecoveryData },
    RecoveryUpdated { data: RecoveryData },
    CriticalAlarm { alarm: CriticalAlarm },
    DistanceSegmentReset { reason: SegmentReset, distance_m: f32 },
    Restarted,
}

/// Connection and indicator state of one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub role: DeviceRole,
    pub address: Option<String>,
    pub link: LinkStatus,
    pub status: DeviceStatus,
}

/// Everything a finished test produced, ready for reporting and storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub preparation: PreparationData,
    pub outcome: TestOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub distance_m: f32,
    pub spo2_points: Vec<DataPoint>,
    pub heart_rate_points: Vec<DataPoint>,
    pub extrema: VitalExtrema,
    pub snapshots: Vec<MinuteSnapshot>,
    pub stops: Vec<StopRecord>,
    pub recovery: Option<RecoveryData>,
    pub distance_resets: Vec<SegmentReset>,
}

/// Read-only projection of the session, republished after every change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub phase: SessionPhase,
    pub patient_id: Option<String>,
    pub outcome: Option<TestOutcome>,
    pub elapsed_ms: u64,
    pub remaining_ms: u64,
    pub distance_m: f32,
    pub total_steps: Option<u32>,
    pub spo2: VitalReadout,
    pub heart_rate: VitalReadout,
    pub critical_alarms: Vec<CriticalAlarm>,
    pub oximeter: DeviceView,
    pub wearable: DeviceView,
    pub extrema: VitalExtrema,
    pub snapshots: Vec<MinuteSnapshot>,
    pub stops: Vec<StopRecord>,
    pub stop_countdown: Option<u8>,
    pub recovery: Option<RecoveryData>,
    pub recovery_pending: bool,
    pub summary: Option<SessionSummary>,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Configure {
        preparation: PreparationData,
        reply: Reply<()>,
    },
    Start {
        reply: Reply<()>,
    },
    Restart {
        reply: Reply<()>,
    },
    OximeterSample {
        sample: SensorSample,
        reply: Reply<SampleDisposition>,
    },
    WearableSample {
        sample: WearableSample,
        reply: Reply<SampleDisposition>,
    },
    AddStop {
        reply: Reply<StopRecord>,
    },
    DeleteLastStop {
        reply: Reply<StopRecord>,
    },
    StartCountdown {
        reply: Reply<u8>,
    },
    CancelCountdown {
        reply: Reply<()>,
    },
    ConfirmStop {
        reply: Reply<()>,
    },
    Summary {
        reply: Reply<SessionSummary>,
    },
    View {
        reply: Reply<SessionView>,
    },
}

/// The session state machine. Mutated only by the engine task.
struct Session {
    config: EngineConfig,
    thresholds: Arc<dyn ThresholdProvider>,
    oximeter: Arc<ConnectionSupervisor>,
    wearable: Arc<ConnectionSupervisor>,
    oximeter_link: LinkStatus,
    wearable_link: LinkStatus,

    phase: SessionPhase,
    preparation: Option<PreparationData>,
    analyzer: TrendAnalyzer,
    banner: CriticalAlarmBanner,
    distance: DistanceAccumulator,
    recorder: TestRecorder,
    stops: StopRecorder,
    countdown: StopCountdown,
    recovery: RecoveryCoordinator,

    latest_sample: Option<SensorSample>,
    latest_reading: Option<UsableReading>,
    latest_steps: Option<u32>,

    next_tick: Option<Instant>,
    last_tick_at: Option<Instant>,
    countdown_deadline: Option<Instant>,

    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    final_elapsed_ms: u64,
    outcome: Option<TestOutcome>,
    summary: Option<SessionSummary>,

    outbox: Vec<SessionEvent>,
}

impl Session {
    fn new(
        config: EngineConfig,
        thresholds: Arc<dyn ThresholdProvider>,
        oximeter: Arc<ConnectionSupervisor>,
        wearable: Arc<ConnectionSupervisor>,
    ) -> Self {
        let snapshot = thresholds.thresholds();
        Self {
            analyzer: TrendAnalyzer::new(snapshot.spo2, snapshot.heart_rate),
            banner: CriticalAlarmBanner::new(config.alarm_display),
            distance: DistanceAccumulator::new(0.0),
            recorder: TestRecorder::new(config.test_duration),
            stops: StopRecorder::default(),
            countdown: StopCountdown::new(config.stop_countdown_secs),
            recovery: RecoveryCoordinator::new(
                config.recovery_period,
                config.recovery_fallback_cutoff,
            ),
            oximeter_link: oximeter.status(),
            wearable_link: wearable.status(),
            config,
            thresholds,
            oximeter,
            wearable,
            phase: SessionPhase::Unconfigured,
            preparation: None,
            latest_sample: None,
            latest_reading: None,
            latest_steps: None,
            next_tick: None,
            last_tick_at: None,
            countdown_deadline: None,
            started_at: None,
            finished_at: None,
            final_elapsed_ms: 0,
            outcome: None,
            summary: None,
            outbox: Vec::new(),
        }
    }

    fn emit(&mut self, event: SessionEvent) {
        self.outbox.push(event);
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.outbox)
    }

    fn handle(&mut self, command: Command, now: Instant) {
        match command {
            Command::Configure { preparation, reply } => {
                let _ = reply.send(self.configure(preparation));
            }
            Command::Start { reply } => {
                let _ = reply.send(self.start(now));
            }
            Command::Restart { reply } => {
                let _ = reply.send(self.restart());
            }
            Command::OximeterSample { sample, reply } => {
                let _ = reply.send(Ok(self.on_oximeter_sample(sample, now)));
            }
            Command::WearableSample { sample, reply } => {
                let _ = reply.send(Ok(self.on_wearable_sample(sample)));
            }
            Command::AddStop { reply } => {
                let _ = reply.send(self.add_stop(now));
            }
            Command::DeleteLastStop { reply } => {
                let _ = reply.send(self.delete_last_stop());
            }
            Command::StartCountdown { reply } => {
                let _ = reply.send(self.start_countdown(now));
            }
            Command::CancelCountdown { reply } => {
                let _ = reply.send(self.cancel_countdown());
            }
            Command::ConfirmStop { reply } => {
                let _ = reply.send(self.confirm_stop(now));
            }
            Command::Summary { reply } => {
                let _ = reply.send(self.summary());
            }
            Command::View { reply } => {
                let _ = reply.send(Ok(self.project()));
            }
        }
    }

    /// Pick up connection-state changes from both supervisors.
    ///
    /// Drops are detected through the supervisors' drop counters, so a drop
    /// that was restored before the engine looked is still applied.
    fn sync_links(&mut self) {
        let oximeter = self.oximeter.status();
        if oximeter.drops != self.oximeter_link.drops {
            info!(state = ?oximeter.state, "Oximeter stopped streaming, discarding latest sample");
            self.latest_sample = None;
            self.latest_reading = None;
            self.analyzer.on_rejected();
            self.banner.settle(self.analyzer.any_critical());
        }
        self.oximeter_link = oximeter;

        let wearable = self.wearable.status();
        let dropped = wearable.drops != self.wearable_link.drops;
        let was_streaming = self.wearable_link.state.is_streaming();
        let is_streaming = wearable.state.is_streaming();
        if dropped {
            self.latest_steps = None;
            let before = self.distance.resets().len();
            self.distance.on_connection_lost();
            self.note_resets(before);
        }
        if is_streaming && (dropped || !was_streaming) {
            self.distance.on_connection_restored();
        }
        self.wearable_link = wearable;
    }

    fn note_resets(&mut self, before: usize) {
        let new: Vec<SegmentReset> = self.distance.resets()[before..].to_vec();
        let distance_m = self.distance.total_distance();
        for reason in new {
            self.emit(SessionEvent::DistanceSegmentReset { reason, distance_m });
        }
    }

    /// Cancel every test timer and drop everything the test recorded.
    fn clear_test(&mut self) {
        self.next_tick = None;
        self.last_tick_at = None;
        self.countdown.reset();
        self.countdown_deadline = None;
        self.recovery.reset();
        self.recorder.reset();
        self.stops.clear();
        self.distance.clear();
        self.started_at = None;
        self.finished_at = None;
        self.final_elapsed_ms = 0;
        self.outcome = None;
        self.summary = None;
    }

    fn configure(&mut self, preparation: PreparationData) -> Result<(), SessionError> {
        if self.phase == SessionPhase::Running {
            return Err(SessionError::AlreadyRunning);
        }
        let thresholds = self.thresholds.thresholds();
        thresholds.validate_preparation(&preparation)?;

        self.oximeter.cancel_reconnect();
        self.wearable.cancel_reconnect();
        self.clear_test();
        self.analyzer = TrendAnalyzer::new(thresholds.spo2, thresholds.heart_rate);
        self.banner.clear();
        self.distance = DistanceAccumulator::new(preparation.stride_length_m);
        self.phase = SessionPhase::Idle;

        info!(
            patient_id = %preparation.patient_id,
            stride_length_m = preparation.stride_length_m,
            "Session configured"
        );
        self.emit(SessionEvent::Configured {
            patient_id: preparation.patient_id.clone(),
        });
        self.preparation = Some(preparation);
        Ok(())
    }

    fn start(&mut self, now: Instant) -> Result<(), SessionError> {
        match self.phase {
            SessionPhase::Unconfigured => return Err(SessionError::NotConfigured),
            SessionPhase::Running => return Err(SessionError::AlreadyRunning),
            SessionPhase::Finished => return Err(SessionError::AlreadyFinished),
            SessionPhase::Idle => {}
        }

        self.clear_test();
        let baseline = if self.wearable_link.state.is_streaming() {
            self.latest_steps
        } else {
            None
        };
        self.distance.on_test_start(baseline);

        let started_at = Utc::now();
        self.phase = SessionPhase::Running;
        self.started_at = Some(started_at);
        self.last_tick_at = Some(now);
        self.next_tick = Some(now + TICK);

        info!(
            duration_secs = self.config.test_duration.as_secs(),
            "Test started"
        );
        self.emit(SessionEvent::TestStarted { started_at });
        Ok(())
    }

    fn restart(&mut self) -> Result<(), SessionError> {
        if self.phase == SessionPhase::Unconfigured {
            return Err(SessionError::NotConfigured);
        }
        self.oximeter.cancel_reconnect();
        self.wearable.cancel_reconnect();
        self.clear_test();
        self.phase = SessionPhase::Idle;
        info!("Session restarted");
        self.emit(SessionEvent::Restarted);
        Ok(())
    }

    fn on_oximeter_sample(&mut self, sample: SensorSample, now: Instant) -> SampleDisposition {
        if !self.oximeter_link.state.is_streaming() {
            debug!(state = ?self.oximeter_link.state, "Dropping sample from idle oximeter");
            return SampleDisposition::Ignored;
        }

        let disposition = match validate(&sample) {
            SampleValidity::Usable(reading) => {
                for update in self.analyzer.on_reading(&reading) {
                    if let Some(alarm) = self.banner.observe(&update, now) {
                        self.emit(SessionEvent::CriticalAlarm { alarm });
                    }
                }
                self.latest_reading = Some(reading);
                SampleDisposition::Accepted
            }
            SampleValidity::Unusable(reason) => {
                debug!(reason = ?reason, "Oximeter sample rejected");
                self.analyzer.on_rejected();
                self.latest_reading = None;
                SampleDisposition::Rejected { reason }
            }
        };
        self.banner.settle(self.analyzer.any_critical());

        if self.phase == SessionPhase::Finished {
            if let Some(data) =
                self.recovery
                    .on_live_sample(&sample, self.oximeter_link.state, now)
            {
                self.emit(SessionEvent::RecoveryUpdated { data });
                self.refresh_summary();
            }
        }

        self.latest_sample = Some(sample);
        disposition
    }

    fn on_wearable_sample(&mut self, sample: WearableSample) -> SampleDisposition {
        if !self.wearable_link.state.is_streaming() {
            debug!(state = ?self.wearable_link.state, "Dropping sample from idle wearable");
            return SampleDisposition::Ignored;
        }
        if let Some(steps) = sample.total_steps {
            self.latest_steps = Some(steps);
        }
        let before = self.distance.resets().len();
        self.distance.on_step_sample(sample.total_steps);
        self.note_resets(before);
        SampleDisposition::Accepted
    }

    /// Elapsed test time at `now`, including the part of the current second.
    fn elapsed_at(&self, now: Instant) -> u64 {
        let since_tick = self
            .last_tick_at
            .map(|at| now.saturating_duration_since(at).as_millis() as u64)
            .unwrap_or(0)
            .min(TICK_MS - 1);
        (self.recorder.elapsed_ms() + since_tick).min(self.recorder.duration_ms())
    }

    fn add_stop(&mut self, now: Instant) -> Result<StopRecord, SessionError> {
        if self.phase != SessionPhase::Running {
            return Err(SessionError::NotRunning);
        }
        let reading = self.latest_reading.ok_or(SessionError::NoUsableSample)?;
        let stop = StopRecord {
            stop_time_millis: self.elapsed_at(now),
            spo2: reading.spo2,
            heart_rate: reading.heart_rate,
            distance_at_stop_time: self.distance.total_distance(),
        };
        self.stops.add(stop);
        self.emit(SessionEvent::StopAdded { stop });
        Ok(stop)
    }

    fn delete_last_stop(&mut self) -> Result<StopRecord, SessionError> {
        let stop = self.stops.delete_last()?;
        self.emit(SessionEvent::StopDeleted { stop });
        self.refresh_summary();
        Ok(stop)
    }

    fn start_countdown(&mut self, now: Instant) -> Result<u8, SessionError> {
        if self.phase != SessionPhase::Running {
            return Err(SessionError::NotRunning);
        }
        let remaining = self.countdown.start()?;
        self.countdown_deadline = Some(now + COUNTDOWN_STEP);
        info!(remaining, "Stop countdown started");
        self.emit(SessionEvent::CountdownStarted { remaining });
        Ok(remaining)
    }

    fn cancel_countdown(&mut self) -> Result<(), SessionError> {
        self.countdown.cancel()?;
        self.countdown_deadline = None;
        info!("Stop countdown cancelled");
        self.emit(SessionEvent::CountdownCancelled);
        Ok(())
    }

    fn confirm_stop(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.phase != SessionPhase::Running {
            return Err(SessionError::NotRunning);
        }
        self.finish(TestOutcome::StoppedByUser, now);
        Ok(())
    }

    fn on_tick(&mut self, at: Instant) {
        if self.phase != SessionPhase::Running {
            self.next_tick = None;
            return;
        }
        let distance = self.distance.total_distance();
        let outcome = self.recorder.on_tick(self.latest_reading.as_ref(), distance);
        self.last_tick_at = Some(at);

        for snapshot in outcome.snapshots {
            self.emit(SessionEvent::SnapshotRecorded { snapshot });
        }

        if outcome.duration_reached {
            self.finish(TestOutcome::Completed, at);
        } else {
            self.next_tick = Some(at + TICK);
        }
    }

    fn on_countdown_step(&mut self, at: Instant) {
        match self.countdown.step() {
            Some(CountdownStep::Remaining(remaining)) => {
                self.countdown_deadline = Some(at + COUNTDOWN_STEP);
                self.emit(SessionEvent::CountdownTick { remaining });
            }
            Some(CountdownStep::Confirmed) => {
                self.countdown_deadline = None;
                info!("Stop countdown elapsed, ending test");
                self.finish(TestOutcome::StoppedByUser, at);
            }
            None => self.countdown_deadline = None,
        }
    }

    fn on_recovery_over(&mut self, at: Instant) {
        if let Some(data) = self.recovery.on_period_over(self.latest_sample.as_ref(), at) {
            self.emit(SessionEvent::RecoveryPublished { data });
            self.refresh_summary();
        }
    }

    fn on_alarm_display_over(&mut self, at: Instant) {
        self.banner.expire(at);
    }

    /// The single termination path for natural completion and manual stops.
    fn finish(&mut self, outcome: TestOutcome, at: Instant) {
        let elapsed_ms = self.elapsed_at(at);
        self.next_tick = None;
        self.countdown.reset();
        self.countdown_deadline = None;
        self.distance.on_test_end();

        self.phase = SessionPhase::Finished;
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
        self.final_elapsed_ms = elapsed_ms;
        self.recovery.start(at);

        let distance_m = self.distance.total_distance();
        info!(
            outcome = outcome.label(),
            elapsed_ms,
            distance_m,
            stops = self.stops.stops().len(),
            "Test finished"
        );
        self.refresh_summary();
        self.emit(SessionEvent::TestFinished {
            outcome,
            elapsed_ms,
            distance_m,
        });
    }

    fn summary(&self) -> Result<SessionSummary, SessionError> {
        self.summary.clone().ok_or(SessionError::NotFinished)
    }

    /// Rebuild the cached summary. Only the finished test has one, and it
    /// changes afterwards only through recovery data and stop deletion.
    fn refresh_summary(&mut self) {
        self.summary = self.build_summary();
    }

    fn build_summary(&self) -> Option<SessionSummary> {
        if self.phase != SessionPhase::Finished {
            return None;
        }
        let (Some(preparation), Some(outcome), Some(started_at), Some(finished_at)) = (
            self.preparation.clone(),
            self.outcome,
            self.started_at,
            self.finished_at,
        ) else {
            warn!("Finished session is missing its bookkeeping");
            return None;
        };

        Some(SessionSummary {
            preparation,
            outcome,
            started_at,
            finished_at,
            elapsed_ms: self.final_elapsed_ms,
            distance_m: self.distance.total_distance(),
            spo2_points: self.recorder.spo2_points().iter().copied().collect(),
            heart_rate_points: self.recorder.heart_rate_points().iter().copied().collect(),
            extrema: self.recorder.extrema(),
            snapshots: self.recorder.snapshots().to_vec(),
            stops: self.stops.stops().to_vec(),
            recovery: self.recovery.data(),
            distance_resets: self.distance.resets().to_vec(),
        })
    }

    fn device_view(&self, supervisor: &ConnectionSupervisor) -> DeviceView {
        let link = supervisor.status();
        let last_sample = match supervisor.role() {
            DeviceRole::Oximeter => self.latest_sample.as_ref(),
            DeviceRole::Wearable => None,
        };
        DeviceView {
            role: supervisor.role(),
            address: supervisor.last_address(),
            link,
            status: link.visual(supervisor.role(), last_sample),
        }
    }

    fn project(&self) -> SessionView {
        let elapsed_ms = match self.phase {
            SessionPhase::Finished => self.final_elapsed_ms,
            _ => self.recorder.elapsed_ms(),
        };
        SessionView {
            phase: self.phase,
            patient_id: self.preparation.as_ref().map(|p| p.patient_id.clone()),
            outcome: self.outcome,
            elapsed_ms,
            remaining_ms: self.recorder.duration_ms().saturating_sub(elapsed_ms),
            distance_m: self.distance.total_distance(),
            total_steps: self.latest_steps,
            spo2: self.analyzer.readout(Vital::Spo2),
            heart_rate: self.analyzer.readout(Vital::HeartRate),
            critical_alarms: self.banner.alarms(),
            oximeter: self.device_view(&self.oximeter),
            wearable: self.device_view(&self.wearable),
            extrema: self.recorder.extrema(),
            snapshots: self.recorder.snapshots().to_vec(),
            stops: self.stops.stops().to_vec(),
            stop_countdown: self.countdown.remaining(),
            recovery: self.recovery.data(),
            recovery_pending: self.recovery.is_pending(),
            summary: self.summary.clone(),
        }
    }
}

async fn wait_until(deadline: Option<Instant>) -> Instant {
    match deadline {
        Some(deadline) => {
            tokio::time::sleep_until(deadline).await;
            deadline
        }
        None => std::future::pending().await,
    }
}

async fn run(
    mut session: Session,
    mut commands: mpsc::Receiver<Command>,
    view_tx: watch::Sender<SessionView>,
    events: broadcast::Sender<SessionEvent>,
) {
    let mut oximeter_rx = session.oximeter.subscribe();
    let mut wearable_rx = session.wearable.subscribe();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else {
                    info!("All session handles dropped, engine stopping");
                    break;
                };
                session.sync_links();
                session.handle(command, Instant::now());
            }
            Ok(()) = oximeter_rx.changed() => session.sync_links(),
            Ok(()) = wearable_rx.changed() => session.sync_links(),
            at = wait_until(session.next_tick) => {
                session.sync_links();
                session.on_tick(at);
            }
            at = wait_until(session.countdown_deadline) => session.on_countdown_step(at),
            at = wait_until(session.recovery.deadline()) => {
                session.sync_links();
                session.on_recovery_over(at);
            }
            at = wait_until(session.banner.deadline()) => session.on_alarm_display_over(at),
        }

        for event in session.drain_events() {
            // No subscribers is fine.
            let _ = events.send(event);
        }
        view_tx.send_replace(session.project());
    }
}

/// Starts the session engine task.
pub struct SessionEngine;

impl SessionEngine {
    /// Spawn the engine on the current tokio runtime.
    pub fn spawn(
        config: EngineConfig,
        thresholds: Arc<dyn ThresholdProvider>,
        oximeter: Arc<ConnectionSupervisor>,
        wearable: Arc<ConnectionSupervisor>,
    ) -> SessionHandle {
        let reconnect_timeout = config.reconnect_timeout;
        let session = Session::new(config, thresholds, oximeter.clone(), wearable.clone());
        let (view_tx, view) = watch::channel(session.project());
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let (commands, rx) = mpsc::channel(COMMAND_BUFFER);

        tokio::spawn(run(session, rx, view_tx, events.clone()));
        info!("Session engine started");

        SessionHandle {
            commands,
            view,
            events,
            oximeter,
            wearable,
            reconnect_timeout,
        }
    }
}

/// Cloneable handle to the session engine.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<SessionView>,
    events: broadcast::Sender<SessionEvent>,
    oximeter: Arc<ConnectionSupervisor>,
    wearable: Arc<ConnectionSupervisor>,
    reconnect_timeout: Duration,
}

impl SessionHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SessionError::EngineClosed)?;
        rx.await.map_err(|_| SessionError::EngineClosed)?
    }

    /// Supply preparation data, discarding any previous session.
    pub async fn configure(&self, preparation: PreparationData) -> Result<(), SessionError> {
        self.request(|reply| Command::Configure { preparation, reply })
            .await
    }

    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Start { reply }).await
    }

    /// Return to idle, cancelling every timer and dropping recorded data.
    pub async fn restart(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::Restart { reply }).await
    }

    pub async fn oximeter_sample(
        &self,
        sample: SensorSample,
    ) -> Result<SampleDisposition, SessionError> {
        self.request(|reply| Command::OximeterSample { sample, reply })
            .await
    }

    pub async fn wearable_sample(
        &self,
        sample: WearableSample,
    ) -> Result<SampleDisposition, SessionError> {
        self.request(|reply| Command::WearableSample { sample, reply })
            .await
    }

    pub async fn add_stop(&self) -> Result<StopRecord, SessionError> {
        self.request(|reply| Command::AddStop { reply }).await
    }

    pub async fn delete_last_stop(&self) -> Result<StopRecord, SessionError> {
        self.request(|reply| Command::DeleteLastStop { reply }).await
    }

    /// Begin the manual-stop countdown. Returns the seconds remaining.
    pub async fn start_stop_countdown(&self) -> Result<u8, SessionError> {
        self.request(|reply| Command::StartCountdown { reply }).await
    }

    pub async fn cancel_stop_countdown(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::CancelCountdown { reply }).await
    }

    /// End the test now as stopped by the user.
    pub async fn confirm_stop(&self) -> Result<(), SessionError> {
        self.request(|reply| Command::ConfirmStop { reply }).await
    }

    pub async fn summary(&self) -> Result<SessionSummary, SessionError> {
        self.request(|reply| Command::Summary { reply }).await
    }

    /// Projection computed by the engine after every command queued so far.
    pub async fn current_view(&self) -> Result<SessionView, SessionError> {
        self.request(|reply| Command::View { reply }).await
    }

    /// Latest published projection.
    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn supervisor(&self, role: DeviceRole) -> &Arc<ConnectionSupervisor> {
        match role {
            DeviceRole::Oximeter => &self.oximeter,
            DeviceRole::Wearable => &self.wearable,
        }
    }

    /// Force a reconnect of one device with the configured timeout.
    pub async fn force_reconnect(
        &self,
        role: DeviceRole,
        address: Option<&str>,
    ) -> Result<ReconnectOutcome, ConnectionError> {
        self.supervisor(role)
            .force_reconnect(address, self.reconnect_timeout)
            .await
    }
}
