//! HTTP API for the walk-test service.
//!
//! The session projection and every engine command are exposed over HTTP so
//! that a UI process and a sensor-transport bridge can attach to the same
//! engine. Sample timestamps are always assigned by the server.
//!
//! All logging uses structured tracing. Patients appear only by the opaque
//! identifier supplied with the preparation data.

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument, warn};

use crate::config::{SharedThresholds, ThresholdConfig, ThresholdProvider};
use crate::connection::{LinkStatus, ReconnectOutcome};
use crate::error::{ConnectionError, SessionError};
use crate::link::LinkCommand;
use crate::model::{
    DeviceConnectionState, DeviceRole, PreparationData, SensorSample, StopRecord, WearableSample,
};
use crate::session::{
    DeviceView, SampleDisposition, SessionHandle, SessionSummary, SessionView,
};
use crate::storage::{DEFAULT_LIST_LIMIT, Storage, StoredSummary, SummaryRecord};

/// Error returned by every handler, rendered as a JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// JSON error response body.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
}

impl ApiError {
    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Session(SessionError::InvalidPreparation { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::Session(SessionError::EngineClosed) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Session(_) => StatusCode::CONFLICT,
            Self::Connection(ConnectionError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
            Self::Connection(ConnectionError::ConnectError(_)) => StatusCode::BAD_GATEWAY,
            Self::Connection(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Session(e) => match e {
                SessionError::NotConfigured => "not_configured",
                SessionError::NotRunning => "not_running",
                SessionError::AlreadyRunning => "already_running",
                SessionError::NotFinished => "not_finished",
                SessionError::AlreadyFinished => "already_finished",
                SessionError::NoUsableSample => "no_usable_sample",
                SessionError::NoStopsToDelete => "no_stops_to_delete",
                SessionError::CountdownActive => "countdown_active",
                SessionError::NoCountdown => "no_countdown",
                SessionError::InvalidPreparation { .. } => "invalid_preparation",
                SessionError::EngineClosed => "engine_closed",
            },
            Self::Connection(e) => match e {
                ConnectionError::BluetoothDisabled => "bluetooth_disabled",
                ConnectionError::NoPriorDeviceKnown => "no_prior_device_known",
                ConnectionError::Timeout(_) => "timeout",
                ConnectionError::ConnectError(_) => "connect_error",
                ConnectionError::Cancelled => "cancelled",
            },
            Self::BadRequest(_) => "bad_request",
            Self::NotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        } else {
            info!(error = %self, "Request rejected");
        }
        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

/// Link commands waiting for an external transport bridge.
///
/// A queue is `None` when its commands are consumed in-process, e.g. by the
/// simulator.
#[derive(Default)]
pub struct CommandQueues {
    oximeter: Mutex<Option<mpsc::UnboundedReceiver<LinkCommand>>>,
    wearable: Mutex<Option<mpsc::UnboundedReceiver<LinkCommand>>>,
}

impl CommandQueues {
    pub fn new(
        oximeter: Option<mpsc::UnboundedReceiver<LinkCommand>>,
        wearable: Option<mpsc::UnboundedReceiver<LinkCommand>>,
    ) -> Self {
        Self {
            oximeter: Mutex::new(oximeter),
            wearable: Mutex::new(wearable),
        }
    }

    /// Take every queued command for `role`.
    pub fn drain(&self, role: DeviceRole) -> Option<Vec<LinkCommand>> {
        let queue = match role {
            DeviceRole::Oximeter => &self.oximeter,
            DeviceRole::Wearable => &self.wearable,
        };
        let mut guard = queue.lock().unwrap_or_else(|e| e.into_inner());
        let rx = guard.as_mut()?;
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        Some(commands)
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub session: SessionHandle,
    pub storage: Storage,
    pub thresholds: SharedThresholds,
    pub commands: Arc<CommandQueues>,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/session", get(get_session))
        .route("/session/configure", post(configure_session))
        .route("/session/start", post(start_test))
        .route("/session/restart", post(restart_session))
        .route("/session/summary", get(get_session_summary))
        .route("/session/summary/archive", post(archive_summary))
        .route("/session/stops", post(add_stop))
        .route("/session/stops/last", delete(delete_last_stop))
        .route(
            "/session/stop-countdown",
            post(start_stop_countdown).delete(cancel_stop_countdown),
        )
        .route("/session/stop-confirm", post(confirm_stop))
        .route("/devices/:role/samples", post(post_sample))
        .route("/devices/:role/state", post(post_device_state))
        .route("/devices/:role/adapter", post(post_adapter))
        .route("/devices/:role/connect", post(connect_device))
        .route("/devices/:role/disconnect", post(disconnect_device))
        .route("/devices/:role/reconnect", post(reconnect_device))
        .route("/devices/:role/status", get(get_device_status))
        .route("/devices/:role/commands", get(drain_commands))
        .route("/config/thresholds", get(get_thresholds).put(put_thresholds))
        .route("/summaries", get(list_summaries))
        .route("/summaries/:id", get(get_archived_summary))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn parse_role(raw: &str) -> Result<DeviceRole, ApiError> {
    raw.parse().map_err(ApiError::BadRequest)
}

/// GET /health - Simple health check endpoint.
pub async fn health_check() -> impl IntoResponse {
    StatusCode::OK
}

// ============================================================================
// Session handlers
// ============================================================================

/// GET /session - Current session projection.
#[instrument(skip(state))]
pub async fn get_session(State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    Ok(Json(state.session.current_view().await?))
}

/// POST /session/configure - Supply preparation data for a new session.
///
/// # Request Body
///
/// ```json
/// {
///     "patient_id": "p-001",
///     "stride_length_m": 0.65,
///     "basal_spo2": 97,
///     "basal_heart_rate": 72
/// }
/// ```
#[instrument(skip(state, preparation), fields(patient_id = %preparation.patient_id))]
pub async fn configure_session(
    State(state): State<AppState>,
    Json(preparation): Json<PreparationData>,
) -> Result<Json<SessionView>, ApiError> {
    state.session.configure(preparation).await?;
    Ok(Json(state.session.current_view().await?))
}

/// POST /session/start - Start the test.
#[instrument(skip(state))]
pub async fn start_test(State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    state.session.start().await?;
    Ok(Json(state.session.current_view().await?))
}

/// POST /session/restart - Return to idle and discard the test.
#[instrument(skip(state))]
pub async fn restart_session(
    State(state): State<AppState>,
) -> Result<Json<SessionView>, ApiError> {
    state.session.restart().await?;
    Ok(Json(state.session.current_view().await?))
}

/// GET /session/summary - Summary of the finished test.
#[instrument(skip(state))]
pub async fn get_session_summary(
    State(state): State<AppState>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.session.summary().await?))
}

/// Response of POST /session/summary/archive.
#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveResponse {
    pub id: i64,
}

/// POST /session/summary/archive - Store the finished test's summary.
///
/// # Response
///
/// Returns `201 Created` with the id of the stored summary.
#[instrument(skip(state))]
pub async fn archive_summary(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<ArchiveResponse>), ApiError> {
    let summary = state.session.summary().await?;
    let id = state
        .storage
        .insert_summary(&summary)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;

    info!(
        id,
        patient_id = %summary.preparation.patient_id,
        outcome = summary.outcome.label(),
        "Session summary archived"
    );
    Ok((StatusCode::CREATED, Json(ArchiveResponse { id })))
}

/// POST /session/stops - Record a stop at the current instant.
#[instrument(skip(state))]
pub async fn add_stop(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<StopRecord>), ApiError> {
    let stop = state.session.add_stop().await?;
    Ok((StatusCode::CREATED, Json(stop)))
}

/// DELETE /session/stops/last - Remove the most recent stop.
#[instrument(skip(state))]
pub async fn delete_last_stop(
    State(state): State<AppState>,
) -> Result<Json<StopRecord>, ApiError> {
    Ok(Json(state.session.delete_last_stop().await?))
}

/// Response of POST /session/stop-countdown.
#[derive(Debug, Serialize, Deserialize)]
pub struct CountdownResponse {
    pub remaining: u8,
}

/// POST /session/stop-countdown - Begin the manual-stop countdown.
#[instrument(skip(state))]
pub async fn start_stop_countdown(
    State(state): State<AppState>,
) -> Result<Json<CountdownResponse>, ApiError> {
    let remaining = state.session.start_stop_countdown().await?;
    Ok(Json(CountdownResponse { remaining }))
}

/// DELETE /session/stop-countdown - Cancel the manual-stop countdown.
#[instrument(skip(state))]
pub async fn cancel_stop_countdown(
    State(state): State<AppState>,
) -> Result<StatusCode, ApiError> {
    state.session.cancel_stop_countdown().await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /session/stop-confirm - End the test immediately.
#[instrument(skip(state))]
pub async fn confirm_stop(State(state): State<AppState>) -> Result<Json<SessionView>, ApiError> {
    state.session.confirm_stop().await?;
    Ok(Json(state.session.current_view().await?))
}

// ============================================================================
// Device handlers
// ============================================================================

/// A decoded sample posted by the transport bridge.
///
/// Oximeter samples use `spo2`, `heart_rate`, `finger_absent` and
/// `signal_strength`; wearable samples use `total_steps`.
#[derive(Debug, Default, Deserialize)]
pub struct SampleRequest {
    pub spo2: Option<u8>,
    pub heart_rate: Option<u16>,
    #[serde(default)]
    pub finger_absent: bool,
    pub signal_strength: Option<u8>,
    pub total_steps: Option<u32>,
}

/// POST /devices/:role/samples - Hand a decoded sample to the engine.
#[instrument(skip(state, request))]
pub async fn post_sample(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Json(request): Json<SampleRequest>,
) -> Result<Json<SampleDisposition>, ApiError> {
    let timestamp = Utc::now();
    let disposition = match parse_role(&role)? {
        DeviceRole::Oximeter => {
            state
                .session
                .oximeter_sample(SensorSample {
                    spo2: request.spo2,
                    heart_rate: request.heart_rate,
                    finger_absent: request.finger_absent,
                    signal_strength: request.signal_strength,
                    timestamp,
                })
                .await?
        }
        DeviceRole::Wearable => {
            state
                .session
                .wearable_sample(WearableSample {
                    total_steps: request.total_steps,
                    timestamp,
                })
                .await?
        }
    };
    Ok(Json(disposition))
}

/// POST /devices/:role/state - Report a connection-state transition.
///
/// # Request Body
///
/// ```json
/// { "state": "subscribed" }
/// { "state": "error", "kind": "device_not_found" }
/// ```
#[instrument(skip(state))]
pub async fn post_device_state(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Json(next): Json<DeviceConnectionState>,
) -> Result<Json<LinkStatus>, ApiError> {
    let supervisor = state.session.supervisor(parse_role(&role)?);
    supervisor.report_state(next);
    Ok(Json(supervisor.status()))
}

#[derive(Debug, Deserialize)]
pub struct AdapterRequest {
    pub enabled: bool,
}

/// POST /devices/:role/adapter - Report the bluetooth adapter state.
#[instrument(skip(state))]
pub async fn post_adapter(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Json(request): Json<AdapterRequest>,
) -> Result<Json<LinkStatus>, ApiError> {
    let supervisor = state.session.supervisor(parse_role(&role)?);
    supervisor.report_adapter(request.enabled);
    Ok(Json(supervisor.status()))
}

#[derive(Debug, Deserialize)]
pub struct ConnectRequest {
    pub address: String,
}

/// POST /devices/:role/connect - Connect to a device.
#[instrument(skip(state))]
pub async fn connect_device(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Json(request): Json<ConnectRequest>,
) -> Result<Json<LinkStatus>, ApiError> {
    let supervisor = state.session.supervisor(parse_role(&role)?);
    supervisor.connect(&request.address)?;
    Ok(Json(supervisor.status()))
}

/// Body of disconnect and reconnect requests. Without an address the last
/// known one is used.
#[derive(Debug, Default, Deserialize)]
pub struct AddressRequest {
    #[serde(default)]
    pub address: Option<String>,
}

/// POST /devices/:role/disconnect - Disconnect a device.
#[instrument(skip(state))]
pub async fn disconnect_device(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Json(request): Json<AddressRequest>,
) -> Result<Json<LinkStatus>, ApiError> {
    let supervisor = state.session.supervisor(parse_role(&role)?);
    supervisor.disconnect(request.address.as_deref())?;
    Ok(Json(supervisor.status()))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReconnectResponse {
    pub outcome: ReconnectOutcome,
}

/// POST /devices/:role/reconnect - Force a reconnect.
///
/// Waits for the device to come back, up to the configured timeout. A request
/// made while another reconnect is running answers `already_in_progress`
/// straight away.
#[instrument(skip(state))]
pub async fn reconnect_device(
    State(state): State<AppState>,
    Path(role): Path<String>,
    Json(request): Json<AddressRequest>,
) -> Result<Json<ReconnectResponse>, ApiError> {
    let role = parse_role(&role)?;
    let outcome = state
        .session
        .force_reconnect(role, request.address.as_deref())
        .await?;
    info!(role = %role, outcome = ?outcome, "Force reconnect finished");
    Ok(Json(ReconnectResponse { outcome }))
}

/// GET /devices/:role/status - Connection and indicator state.
#[instrument(skip(state))]
pub async fn get_device_status(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<Json<DeviceView>, ApiError> {
    let role = parse_role(&role)?;
    let view = state.session.current_view().await?;
    Ok(Json(match role {
        DeviceRole::Oximeter => view.oximeter,
        DeviceRole::Wearable => view.wearable,
    }))
}

/// GET /devices/:role/commands - Drain link commands for the transport bridge.
#[instrument(skip(state))]
pub async fn drain_commands(
    State(state): State<AppState>,
    Path(role): Path<String>,
) -> Result<Json<Vec<LinkCommand>>, ApiError> {
    let role = parse_role(&role)?;
    state
        .commands
        .drain(role)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("command queue for {role}")))
}

// ============================================================================
// Configuration and archive handlers
// ============================================================================

/// GET /config/thresholds - Current alarm thresholds.
pub async fn get_thresholds(State(state): State<AppState>) -> Json<ThresholdConfig> {
    Json(state.thresholds.thresholds())
}

/// PUT /config/thresholds - Replace the alarm thresholds.
///
/// Only sessions configured afterwards use the new values.
#[instrument(skip(state, config))]
pub async fn put_thresholds(
    State(state): State<AppState>,
    Json(config): Json<ThresholdConfig>,
) -> Result<Json<ThresholdConfig>, ApiError> {
    state
        .thresholds
        .update(config)
        .map_err(ApiError::BadRequest)?;
    Ok(Json(state.thresholds.thresholds()))
}

/// Query parameters for GET /summaries.
#[derive(Debug, Deserialize)]
pub struct SummariesQuery {
    pub patient_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    DEFAULT_LIST_LIMIT
}

/// GET /summaries - Archived sessions, newest first.
#[instrument(skip(state))]
pub async fn list_summaries(
    State(state): State<AppState>,
    Query(query): Query<SummariesQuery>,
) -> Result<Json<Vec<SummaryRecord>>, ApiError> {
    let records = state
        .storage
        .list_recent(query.patient_id.as_deref(), query.limit)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(records))
}

/// GET /summaries/:id - One archived session.
#[instrument(skip(state))]
pub async fn get_archived_summary(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<StoredSummary>, ApiError> {
    state
        .storage
        .get_summary(id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("summary {id}")))
}
