//! Connection supervision for one device role.
//!
//! A [`ConnectionSupervisor`] owns the [`DeviceConnectionState`] of its
//! device and publishes it, together with the adapter state and the
//! force-reconnect flag, on a `watch` channel. State changes reported by the
//! transport and the supervisor's own commands are the only writers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, watch};
use tracing::{debug, info, instrument, warn};

use crate::error::ConnectionError;
use crate::link::DeviceLink;
use crate::model::{ConnectionErrorKind, DeviceConnectionState, DeviceRole, SensorSample};
use crate::validation::{DeviceStatus, derive_status, derive_wearable_status};

/// Everything a reader needs to know about a device link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: DeviceConnectionState,
    pub adapter_enabled: bool,
    pub force_reconnecting: bool,
    /// Number of times the link stopped streaming. Readers compare it with
    /// the last value they saw, since the watch channel only keeps the
    /// latest status and a drop followed by a quick restore would otherwise
    /// go unnoticed.
    pub drops: u64,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: DeviceConnectionState::Idle,
            adapter_enabled: true,
            force_reconnecting: false,
            drops: 0,
        }
    }
}

impl LinkStatus {
    /// Indicator for this device. A force reconnect in progress always shows
    /// as reconnecting, whatever the underlying state.
    pub fn visual(&self, role: DeviceRole, last_sample: Option<&SensorSample>) -> DeviceStatus {
        if self.force_reconnecting {
            return DeviceStatus::reconnecting();
        }
        match role {
            DeviceRole::Oximeter => derive_status(self.state, last_sample, self.adapter_enabled),
            DeviceRole::Wearable => derive_wearable_status(self.state, self.adapter_enabled),
        }
    }
}

/// Result of a force-reconnect request that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectOutcome {
    Reconnected,
    /// Another reconnect is still running; nothing was done.
    AlreadyInProgress,
}

/// Clears the force-reconnect flag however the attempt ends, including when
/// the future is dropped.
struct ReconnectGuard<'a> {
    tx: &'a watch::Sender<LinkStatus>,
}

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.tx.send_modify(|s| s.force_reconnecting = false);
    }
}

pub struct ConnectionSupervisor {
    role: DeviceRole,
    link: Arc<dyn DeviceLink>,
    status_tx: watch::Sender<LinkStatus>,
    last_address: Mutex<Option<String>>,
    settle_delay: Duration,
    cancel: Notify,
}

impl ConnectionSupervisor {
    pub fn new(role: DeviceRole, link: Arc<dyn DeviceLink>, settle_delay: Duration) -> Self {
        let (status_tx, _) = watch::channel(LinkStatus::default());
        Self {
            role,
            link,
            status_tx,
            last_address: Mutex::new(None),
            settle_delay,
            cancel: Notify::new(),
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn status(&self) -> LinkStatus {
        *self.status_tx.borrow()
    }

    pub fn state(&self) -> DeviceConnectionState {
        self.status().state
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_force_reconnecting(&self) -> bool {
        self.status().force_reconnecting
    }

    pub fn last_address(&self) -> Option<String> {
        self.last_address
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn remember(&self, address: &str) {
        *self.last_address.lock().unwrap_or_else(|e| e.into_inner()) = Some(address.to_string());
    }

    fn resolve_address(&self, address: Option<&str>) -> Result<String, ConnectionError> {
        match address {
            Some(address) => Ok(address.to_string()),
            None => self.last_address().ok_or(ConnectionError::NoPriorDeviceKnown),
        }
    }

    fn transition(&self, next: DeviceConnectionState) {
        let role = self.role;
        self.status_tx.send_if_modified(|status| {
            if status.state == next {
                return false;
            }
            debug!(role = %role, from = ?status.state, to = ?next, "Connection state transition");
            if status.state.is_streaming() && !next.is_streaming() {
                status.drops += 1;
            }
            status.state = next;
            true
        });
    }

    /// Record a state change reported by the transport.
    pub fn report_state(&self, state: DeviceConnectionState) {
        if matches!(
            state,
            DeviceConnectionState::DisconnectedError | DeviceConnectionState::Error(_)
        ) {
            warn!(role = %self.role, state = ?state, "Device link failed");
        }
        self.transition(state);
    }

    /// Record the bluetooth adapter being switched on or off.
    pub fn report_adapter(&self, enabled: bool) {
        let role = self.role;
        self.status_tx.send_if_modified(|status| {
            if status.adapter_enabled == enabled {
                return false;
            }
            info!(role = %role, enabled, "Bluetooth adapter state changed");
            status.adapter_enabled = enabled;
            true
        });
    }

    /// Start connecting to `address`.
    pub fn connect(&self, address: &str) -> Result<(), ConnectionError> {
        if !self.status().adapter_enabled {
            return Err(ConnectionError::BluetoothDisabled);
        }
        self.remember(address);
        self.transition(DeviceConnectionState::Connecting);
        info!(role = %self.role, address, "Connecting");
        self.link.connect(address).map_err(|kind| {
            self.transition(DeviceConnectionState::Error(kind));
            ConnectionError::ConnectError(kind)
        })
    }

    /// Disconnect on the user's request.
    pub fn disconnect(&self, address: Option<&str>) -> Result<(), ConnectionError> {
        let address = self.resolve_address(address)?;
        self.link.disconnect(&address);
        self.transition(DeviceConnectionState::DisconnectedByUser);
        info!(role = %self.role, address = %address, "Disconnected by user");
        Ok(())
    }

    /// Abort a running force reconnect. Does nothing when none is running.
    pub fn cancel_reconnect(&self) {
        if self.is_force_reconnecting() {
            debug!(role = %self.role, "Cancelling reconnect");
            self.cancel.notify_waiters();
        }
    }

    fn abandon(&self, address: &str) -> Result<ReconnectOutcome, ConnectionError> {
        warn!(address, "Reconnect cancelled, dropping link");
        self.link.disconnect(address);
        self.transition(DeviceConnectionState::DisconnectedByUser);
        Err(ConnectionError::Cancelled)
    }

    /// Tear the link down and bring it back up, waiting at most `timeout`
    /// for the device to report a subscribed (or failed) state.
    ///
    /// A call made while another reconnect is running returns
    /// [`ReconnectOutcome::AlreadyInProgress`] straight away.
    #[instrument(skip(self), fields(role = %self.role))]
    pub async fn force_reconnect(
        &self,
        address: Option<&str>,
        timeout: Duration,
    ) -> Result<ReconnectOutcome, ConnectionError> {
        let acquired = self.status_tx.send_if_modified(|status| {
            if status.force_reconnecting {
                false
            } else {
                status.force_reconnecting = true;
                true
            }
        });
        if !acquired {
            info!("Reconnection already in progress");
            return Ok(ReconnectOutcome::AlreadyInProgress);
        }
        let _guard = ReconnectGuard {
            tx: &self.status_tx,
        };
        let cancelled = self.cancel.notified();
        tokio::pin!(cancelled);

        let status = self.status();
        if !status.adapter_enabled {
            warn!("Cannot reconnect, bluetooth adapter is disabled");
            return Err(ConnectionError::BluetoothDisabled);
        }
        let address = self.resolve_address(address)?;
        self.remember(&address);

        if status.state.holds_link() {
            debug!(address = %address, "Dropping current link before reconnecting");
            self.link.disconnect(&address);
            tokio::select! {
                _ = tokio::time::sleep(self.settle_delay) => {}
                _ = &mut cancelled => return self.abandon(&address),
            }
        }

        self.transition(DeviceConnectionState::Reconnecting);
        let mut rx = self.status_tx.subscribe();
        if let Err(kind) = self.link.connect(&address) {
            self.transition(DeviceConnectionState::Error(kind));
            return Err(ConnectionError::ConnectError(kind));
        }

        let waited = tokio::select! {
            waited = tokio::time::timeout(timeout, rx.wait_for(|s| s.state.ends_reconnect())) => waited,
            _ = &mut cancelled => return self.abandon(&address),
        };
        let outcome = match waited {
            Ok(Ok(status)) => Ok(status.state),
            Ok(Err(_)) => Err(ConnectionError::ConnectError(ConnectionErrorKind::Ble)),
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        };

        match outcome {
            Ok(DeviceConnectionState::Subscribed) => {
                info!(address = %address, "Reconnected");
                Ok(ReconnectOutcome::Reconnected)
            }
            Ok(DeviceConnectionState::Error(kind)) => {
                warn!(address = %address, error = %kind, "Reconnect failed");
                Err(ConnectionError::ConnectError(kind))
            }
            Ok(state) => {
                warn!(address = %address, state = ?state, "Reconnect ended without a link");
                Err(ConnectionError::ConnectError(ConnectionErrorKind::Disconnected))
            }
            Err(ConnectionError::Timeout(limit)) => {
                warn!(address = %address, timeout = ?limit, "Reconnect timed out, dropping link");
                self.link.disconnect(&address);
                self.transition(DeviceConnectionState::DisconnectedError);
                Err(ConnectionError::Timeout(limit))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;

    use tokio::sync::mpsc;
    use tokio::time::Instant;

    use super::*;
    use crate::link::{ChannelLink, LinkCommand};
    use crate::validation::IndicatorStatus;

    const SETTLE: Duration = Duration::from_millis(700);

    fn supervisor() -> (Arc<ConnectionSupervisor>, mpsc::UnboundedReceiver<LinkCommand>) {
        let (link, rx) = ChannelLink::new(DeviceRole::Oximeter);
        let supervisor = ConnectionSupervisor::new(DeviceRole::Oximeter, Arc::new(link), SETTLE);
        (Arc::new(supervisor), rx)
    }

    /// Answer every connect with the given final state after a short delay.
    /// Holds only a weak reference so dropping the supervisor closes the
    /// command channel.
    fn spawn_bridge(
        supervisor: &Arc<ConnectionSupervisor>,
        mut rx: mpsc::UnboundedReceiver<LinkCommand>,
        answer: Option<DeviceConnectionState>,
    ) -> tokio::task::JoinHandle<Vec<(LinkCommand, Instant)>> {
        let supervisor: Weak<ConnectionSupervisor> = Arc::downgrade(supervisor);
        tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(command) = rx.recv().await {
                seen.push((command.clone(), Instant::now()));
                if let (LinkCommand::Connect { .. }, Some(answer)) = (&command, answer) {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    if let Some(supervisor) = supervisor.upgrade() {
                        supervisor.report_state(DeviceConnectionState::Connected);
                        supervisor.report_state(answer);
                    }
                }
            }
            seen
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_success() {
        let (supervisor, rx) = supervisor();
        let bridge = spawn_bridge(
            &supervisor,
            rx,
            Some(DeviceConnectionState::Subscribed),
        );

        let outcome = supervisor
            .force_reconnect(Some("AA:BB"), Duration::from_secs(5))
            .await;
        assert_eq!(outcome, Ok(ReconnectOutcome::Reconnected));
        assert_eq!(supervisor.state(), DeviceConnectionState::Subscribed);
        assert!(!supervisor.is_force_reconnecting());
        assert_eq!(supervisor.last_address().as_deref(), Some("AA:BB"));

        drop(supervisor);
        let seen = bridge.await.unwrap();
        assert_eq!(seen.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_drops_existing_link_and_settles() {
        let (supervisor, rx) = supervisor();
        supervisor.report_state(DeviceConnectionState::Subscribed);
        let bridge = spawn_bridge(
            &supervisor,
            rx,
            Some(DeviceConnectionState::Subscribed),
        );

        let outcome = supervisor
            .force_reconnect(Some("AA:BB"), Duration::from_secs(5))
            .await;
        assert_eq!(outcome, Ok(ReconnectOutcome::Reconnected));

        drop(supervisor);
        let seen = bridge.await.unwrap();
        assert!(matches!(seen[0].0, LinkCommand::Disconnect { .. }));
        assert!(matches!(seen[1].0, LinkCommand::Connect { .. }));
        assert!(seen[1].1 - seen[0].1 >= SETTLE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_reconnect_is_rejected() {
        let (supervisor, rx) = supervisor();
        let _bridge = spawn_bridge(&supervisor, rx, None);

        let first = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .force_reconnect(Some("AA:BB"), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(supervisor.is_force_reconnecting());

        let second = supervisor
            .force_reconnect(Some("AA:BB"), Duration::from_secs(5))
            .await;
        assert_eq!(second, Ok(ReconnectOutcome::AlreadyInProgress));

        let first = first.await.unwrap();
        assert_eq!(first, Err(ConnectionError::Timeout(Duration::from_secs(5))));
        assert!(!supervisor.is_force_reconnecting());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_can_be_cancelled() {
        let (supervisor, rx) = supervisor();
        let bridge = spawn_bridge(&supervisor, rx, None);

        let attempt = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                supervisor
                    .force_reconnect(Some("AA:BB"), Duration::from_secs(10))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(500)).await;
        supervisor.cancel_reconnect();

        assert_eq!(attempt.await.unwrap(), Err(ConnectionError::Cancelled));
        assert_eq!(supervisor.state(), DeviceConnectionState::DisconnectedByUser);
        assert!(!supervisor.is_force_reconnecting());

        drop(supervisor);
        let commands: Vec<_> = bridge.await.unwrap().into_iter().map(|(c, _)| c).collect();
        assert!(matches!(commands.last(), Some(LinkCommand::Disconnect { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_timeout_forces_disconnect() {
        let (supervisor, rx) = supervisor();
        let bridge = spawn_bridge(&supervisor, rx, None);

        let started = Instant::now();
        let outcome = supervisor
            .force_reconnect(Some("AA:BB"), Duration::from_secs(3))
            .await;
        assert_eq!(outcome, Err(ConnectionError::Timeout(Duration::from_secs(3))));
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert_eq!(supervisor.state(), DeviceConnectionState::DisconnectedError);
        assert!(!supervisor.is_force_reconnecting());

        drop(supervisor);
        let seen = bridge.await.unwrap();
        let commands: Vec<_> = seen.into_iter().map(|(c, _)| c).collect();
        assert!(matches!(commands.as_slice(), [
            LinkCommand::Connect { .. },
            LinkCommand::Disconnect { .. }
        ]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_reports_device_error() {
        let (supervisor, rx) = supervisor();
        let _bridge = spawn_bridge(
            &supervisor,
            rx,
            Some(DeviceConnectionState::Error(ConnectionErrorKind::DeviceNotFound)),
        );

        let outcome = supervisor
            .force_reconnect(Some("AA:BB"), Duration::from_secs(5))
            .await;
        assert_eq!(
            outcome,
            Err(ConnectionError::ConnectError(ConnectionErrorKind::DeviceNotFound))
        );
    }

    #[tokio::test]
    async fn test_reconnect_preconditions() {
        let (supervisor, _rx) = supervisor();
        assert_eq!(
            supervisor.force_reconnect(None, Duration::from_secs(1)).await,
            Err(ConnectionError::NoPriorDeviceKnown)
        );
        assert!(!supervisor.is_force_reconnecting());

        supervisor.report_adapter(false);
        assert_eq!(
            supervisor
                .force_reconnect(Some("AA:BB"), Duration::from_secs(1))
                .await,
            Err(ConnectionError::BluetoothDisabled)
        );
        assert_eq!(
            supervisor.connect("AA:BB"),
            Err(ConnectionError::BluetoothDisabled)
        );
        assert!(!supervisor.is_force_reconnecting());
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (supervisor, mut rx) = supervisor();
        supervisor.connect("AA:BB").unwrap();
        assert_eq!(supervisor.state(), DeviceConnectionState::Connecting);

        supervisor.disconnect(None).unwrap();
        assert_eq!(supervisor.state(), DeviceConnectionState::DisconnectedByUser);

        assert!(matches!(rx.recv().await, Some(LinkCommand::Connect { .. })));
        assert!(matches!(rx.recv().await, Some(LinkCommand::Disconnect { .. })));
    }

    #[tokio::test]
    async fn test_reconnect_flag_overrides_visual_status() {
        let status = LinkStatus {
            state: DeviceConnectionState::DisconnectedError,
            adapter_enabled: true,
            force_reconnecting: true,
            drops: 0,
        };
        let visual = status.visual(DeviceRole::Oximeter, None);
        assert_eq!(visual.indicator, IndicatorStatus::Connecting);
        assert_eq!(visual.message, "Reconnecting...");

        let status = LinkStatus {
            force_reconnecting: false,
            ..status
        };
        assert_eq!(
            status.visual(DeviceRole::Oximeter, None).indicator,
            IndicatorStatus::Red
        );
    }

    #[tokio::test]
    async fn test_status_watch_notifies_on_transition() {
        let (supervisor, _rx) = supervisor();
        let mut watcher = supervisor.subscribe();
        supervisor.report_state(DeviceConnectionState::Scanning);
        watcher.changed().await.unwrap();
        assert_eq!(watcher.borrow().state, DeviceConnectionState::Scanning);

        // Re-reporting the same state does not notify.
        supervisor.report_state(DeviceConnectionState::Scanning);
        assert!(!watcher.has_changed().unwrap());
    }

    #[test]
    fn test_drop_counter_survives_quick_restore() {
        let (supervisor, _rx) = supervisor();
        let watcher = supervisor.subscribe();
        supervisor.report_state(DeviceConnectionState::Subscribed);
        assert_eq!(supervisor.status().drops, 0);

        // Both transitions land before the watcher looks.
        supervisor.report_state(DeviceConnectionState::DisconnectedError);
        supervisor.report_state(DeviceConnectionState::Subscribed);

        let status = *watcher.borrow();
        assert_eq!(status.state, DeviceConnectionState::Subscribed);
        assert_eq!(status.drops, 1);

        supervisor.report_state(DeviceConnectionState::Idle);
        assert_eq!(supervisor.status().drops, 2);

        // Moving between non-streaming states is not another drop.
        supervisor.report_state(DeviceConnectionState::Scanning);
        assert_eq!(supervisor.status().drops, 2);
    }
}
