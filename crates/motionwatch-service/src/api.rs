//! REST API endpoints for motionwatch.
//!
//! Devices call check-in, sensor and status; operators call record-mode,
//! new-set, the status overview and the chart.
//!
//! # Concurrency
//!
//! Handlers never touch the device table directly. Every read and write goes
//! through [`DeviceRegistry`](motionwatch_core::DeviceRegistry), which owns
//! the lock discipline. Chart aggregation reads whole log files and runs on the
//! blocking pool.
//!
//! ## Error Handling
//!
//! All endpoints return structured JSON errors via [`AppError`]. Core errors
//! are mapped by kind: unknown devices are 404, duplicate check-ins 409, bad
//! names and malformed input 400, storage and log failures 500.
//!
//! # Example
//!
//! ```ignore
//! use motionwatch_service::api;
//!
//! let app = api::app(state);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info};

use motionwatch_core::{
    Chart, CheckInStatus, DeviceInstruction, DeviceRecord, MotionEvent, NewSetOutcome, ParseError,
    StatusOverview, TimeMeasure,
};

use crate::middleware::password_gate;
use crate::state::AppState;

/// Create the API router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Health and status
        .route("/api/health", get(health))
        .route("/api/status", get(get_status))
        // Device-facing
        .route("/api/devices/check-in", post(check_in))
        .route("/api/sensor", post(sensor))
        .route("/api/devices/{name}/status", get(device_status))
        // Operator-facing
        .route("/api/devices", get(list_devices))
        .route("/api/devices/{name}/log", put(replace_log))
        .route("/api/record-mode", post(record_mode))
        .route("/api/new-set", post(new_set))
        .route("/api/chart", get(chart))
}

/// The API router with the password gate applied and state attached.
pub fn app(state: Arc<AppState>) -> Router {
    router()
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.security),
            password_gate,
        ))
        .with_state(state)
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Health check endpoint.
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: OffsetDateTime::now_utc(),
    })
}

/// Service status with the per-device overview.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    pub uptime_seconds: i64,
    pub check_in_timeout_seconds: u64,
    #[serde(flatten)]
    pub overview: StatusOverview,
    /// Archived set numbers per device.
    pub archived_sets: BTreeMap<String, Vec<u32>>,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, AppError> {
    let overview = state.registry.status_overview().await;

    let mut archived_sets = BTreeMap::new();
    for device in &overview.devices {
        let sets = state.logs().list_sets(&device.device_name)?;
        archived_sets.insert(device.device_name.clone(), sets);
    }

    let check_in_timeout_seconds = state.config.read().await.checkin.timeout_secs;

    Ok(Json(StatusResponse {
        started_at: state.started_at,
        uptime_seconds: (OffsetDateTime::now_utc() - state.started_at)
            .whole_seconds()
            .max(0),
        check_in_timeout_seconds,
        overview,
        archived_sets,
    }))
}

/// Check-in request body.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckInRequest {
    pub device_name: String,
}

/// Register a device or check a known one back in.
async fn check_in(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CheckInRequest>,
) -> Result<Json<CheckInStatus>, AppError> {
    let status = state.registry.check_in(&request.device_name).await?;
    Ok(Json(status))
}

/// Sensor ping body.
///
/// `time_stamp` is one log line: `name,YYYY-MM-DD,HH:MM:SS,movement`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SensorRequest {
    pub time_stamp: String,
}

/// Instruction returned to a device.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionResponse {
    pub is_recording: bool,
    pub new_set: bool,
    /// Line-protocol form, e.g. `"Record,Continue Set"`.
    pub message: String,
}

impl From<DeviceInstruction> for InstructionResponse {
    fn from(instruction: DeviceInstruction) -> Self {
        Self {
            is_recording: instruction.is_recording,
            new_set: instruction.new_set,
            message: instruction.message(),
        }
    }
}

/// Record a sensor ping.
async fn sensor(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SensorRequest>,
) -> Result<Json<InstructionResponse>, AppError> {
    let event: MotionEvent = request.time_stamp.parse()?;
    let instruction = state.registry.record_sensor_ping(&event).await?;
    Ok(Json(instruction.into()))
}

/// Poll whether a non-recording device may record or must start a new set.
async fn device_status(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<InstructionResponse>, AppError> {
    let instruction = state.registry.poll_status(&name).await?;
    Ok(Json(instruction.into()))
}

/// All devices, sorted by name.
async fn list_devices(State(state): State<Arc<AppState>>) -> Json<Vec<DeviceRecord>> {
    Json(state.registry.snapshot().await)
}

/// Replace a device's active log with the request body.
async fn replace_log(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    state.logs().replace_active(&name, &body)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Record-mode request body.
#[derive(Debug, Deserialize)]
pub struct RecordModeRequest {
    pub devices: Vec<String>,
    pub record: bool,
}

/// Resulting recording flag per known device.
#[derive(Debug, Serialize)]
pub struct RecordModeResponse {
    pub devices: BTreeMap<String, bool>,
}

/// Start or stop recording on a batch of devices.
async fn record_mode(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RecordModeRequest>,
) -> Result<Json<RecordModeResponse>, AppError> {
    if request.devices.is_empty() {
        return Err(AppError::BadRequest("No devices given".to_string()));
    }

    let devices = state
        .registry
        .set_recording(&request.devices, request.record)
        .await?;
    Ok(Json(RecordModeResponse { devices }))
}

/// New-set request body.
#[derive(Debug, Deserialize)]
pub struct NewSetRequest {
    pub devices: Vec<String>,
}

/// Rotate the log sets of a batch of devices.
///
/// Always 200: per-device refusals are listed in the outcome message.
async fn new_set(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewSetRequest>,
) -> Result<Json<NewSetOutcome>, AppError> {
    if request.devices.is_empty() {
        return Err(AppError::BadRequest("No devices given".to_string()));
    }

    let outcome = state.registry.request_new_set(&request.devices).await;
    info!(
        "New set requested for {} device(s), {} started",
        request.devices.len(),
        outcome.results.len()
    );
    Ok(Json(outcome))
}

/// Query parameters for the chart endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartQuery {
    /// `hour`, `day` (default) or `all`.
    pub time_measure: Option<String>,
}

/// Motion histograms of every device's active log.
async fn chart(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChartQuery>,
) -> Result<Json<Vec<Chart>>, AppError> {
    let measure = match query.time_measure.as_deref() {
        Some(value) => value.parse::<TimeMeasure>()?,
        None => TimeMeasure::default(),
    };

    let charts = state.charts.clone();
    let result = tokio::task::spawn_blocking(move || charts.aggregate(measure))
        .await
        .map_err(|e| AppError::Internal(format!("Chart task failed: {}", e)))??;

    Ok(Json(result))
}

/// Application error type.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Core(motionwatch_core::Error),
    Internal(String),
}

impl From<motionwatch_core::Error> for AppError {
    fn from(e: motionwatch_core::Error) -> Self {
        use motionwatch_core::Error;

        match e {
            Error::UnknownDevice(_) => AppError::NotFound(e.to_string()),
            Error::AlreadyCheckedIn(_) | Error::InvalidStateForRotation { .. } => {
                AppError::Conflict(e.to_string())
            }
            Error::InvalidDeviceName(_) => AppError::BadRequest(e.to_string()),
            other => AppError::Core(other),
        }
    }
}

impl From<ParseError> for AppError {
    fn from(e: ParseError) -> Self {
        AppError::BadRequest(e.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Core(e) => {
                error!("Request failed: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
            AppError::Internal(msg) => {
                error!("Request failed: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, Json(body)).into_response()
    }
}
