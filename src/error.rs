//! Error types for the walk-test engine.
//!
//! Nothing here is fatal to a session. Connection failures are reported to
//! the caller that asked for the connection; session errors are rejected
//! commands that leave the session exactly as it was.

use std::time::Duration;

use thiserror::Error;

use crate::model::ConnectionErrorKind;

/// Failure of a connect or force-reconnect request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("bluetooth adapter is disabled")]
    BluetoothDisabled,

    #[error("no device address known for this role")]
    NoPriorDeviceKnown,

    #[error("device did not reach a subscribed state within {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    ConnectError(ConnectionErrorKind),

    #[error("reconnect was cancelled")]
    Cancelled,
}

/// A session command that was rejected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("no preparation data has been supplied")]
    NotConfigured,

    #[error("the test is not running")]
    NotRunning,

    #[error("the test is already running")]
    AlreadyRunning,

    #[error("the test has not finished yet")]
    NotFinished,

    #[error("the test has already finished, restart the session first")]
    AlreadyFinished,

    #[error("no usable oximeter reading is available")]
    NoUsableSample,

    #[error("there are no stops to delete")]
    NoStopsToDelete,

    #[error("a stop countdown is already running")]
    CountdownActive,

    #[error("no stop countdown is running")]
    NoCountdown,

    #[error("invalid preparation data: {field} {reason}")]
    InvalidPreparation { field: &'static str, reason: String },

    #[error("the session engine has shut down")]
    EngineClosed,
}

impl SessionError {
    /// Create an invalid preparation error.
    pub fn invalid_preparation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidPreparation {
            field,
            reason: reason.into(),
        }
    }
}
