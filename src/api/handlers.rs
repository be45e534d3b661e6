use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tracing::{info, warn};
use utoipa::OpenApi;

use super::{
    dto::{ControlModeDto, DeviceStateDto, HandleAlertResponse, HandleResult, NewScheduleRequest},
    errors::AppError,
    operator::Caller,
    AppState,
};
use crate::db::models::{
    parse_schedule_time, Alert, AlertFilter, Band, Device, DeviceStatus, HandleOutcome,
    HistoryPoint, Parameter, ScheduledTask, SensorSample, Threshold,
};

const DEFAULT_HISTORY_HOURS: u32 = 24;
const MAX_HISTORY_HOURS: u32 = 168;
const DEFAULT_ALERT_LIMIT: u32 = 100;
const MAX_ALERT_LIMIT: u32 = 1000;

// ---------------------------------------------------------------------------
// Query parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct LatestParams {
    pub greenhouse_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub hours: Option<u32>,
    pub greenhouse_id: Option<i32>,
}

#[derive(Debug, Deserialize)]
pub struct AlertParams {
    pub status: Option<AlertFilter>,
    pub limit: Option<u32>,
}

fn parse_status(raw: &str) -> Result<DeviceStatus, AppError> {
    match raw.to_ascii_uppercase().as_str() {
        "ON" => Ok(DeviceStatus::On),
        "OFF" => Ok(DeviceStatus::Off),
        _ => Err(AppError::bad_request(format!("status must be ON or OFF, got {raw:?}"))),
    }
}

// ---------------------------------------------------------------------------
// Sensors
// ---------------------------------------------------------------------------

/// Latest sample, served from the in-memory cache when possible.
#[utoipa::path(
    get,
    path = "/sensors/latest",
    params(
        ("greenhouse_id" = Option<i32>, Query, description = "Restrict to one greenhouse"),
    ),
    responses(
        (status = 200, description = "Latest sample, or null before the first one", body = SensorSample),
        (status = 500, description = "Internal server error"),
        (status = 503, description = "Storage unavailable"),
    ),
    tag = "sensors"
)]
pub async fn get_latest_sample(
    State(state): State<AppState>,
    Query(params): Query<LatestParams>,
) -> Result<Json<Option<SensorSample>>, AppError> {
    match state.stores.samples.latest_sample(params.greenhouse_id).await {
        Ok(sample) => Ok(Json(sample)),
        Err(e) => match state.cache.latest(params.greenhouse_id).await {
            Some(sample) => {
                warn!(error = %e, "Storage unavailable; serving cached sensor sample");
                Ok(Json(Some(sample)))
            }
            None => Err(e.into()),
        },
    }
}

/// Samples from the last `hours` (default 24, clamped to 1..=168), ordered
/// by `recorded_at ASC`. Windows over 48 hours are returned as hourly
/// averages.
#[utoipa::path(
    get,
    path = "/sensors/history",
    params(
        ("hours" = Option<u32>, Query, description = "Window length in hours"),
        ("greenhouse_id" = Option<i32>, Query, description = "Restrict to one greenhouse"),
    ),
    responses(
        (status = 200, description = "History points", body = Vec<HistoryPoint>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "sensors"
)]
pub async fn get_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<HistoryPoint>>, AppError> {
    let hours = params.hours.unwrap_or(DEFAULT_HISTORY_HOURS).clamp(1, MAX_HISTORY_HOURS);
    let points = state.stores.samples.history(hours, params.greenhouse_id).await?;
    Ok(Json(points))
}

// ---------------------------------------------------------------------------
// Devices
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/devices",
    responses(
        (status = 200, description = "Current status per device", body = Vec<DeviceStateDto>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "devices"
)]
pub async fn list_devices(State(state): State<AppState>) -> Result<Json<Vec<DeviceStateDto>>, AppError> {
    let records = state.stores.devices.current_states().await?;
    Ok(Json(records.into_iter().map(Into::into).collect()))
}

/// Manual device command. While auto mode is on only admins may override
/// the control loop.
#[utoipa::path(
    post,
    path = "/devices/{device}/{status}",
    params(
        ("device" = Device, Path, description = "Device name"),
        ("status" = DeviceStatus, Path, description = "ON or OFF"),
        ("x-operator-role" = Option<String>, Header, description = "admin or operator"),
    ),
    responses(
        (status = 200, description = "State written", body = DeviceStateDto),
        (status = 400, description = "Unknown device or status"),
        (status = 403, description = "Auto mode is on and caller is not an admin"),
    ),
    tag = "devices"
)]
pub async fn set_device_state(
    State(state): State<AppState>,
    caller: Caller,
    Path((device, status)): Path<(String, String)>,
) -> Result<Json<DeviceStateDto>, AppError> {
    let device: Device = device.parse()?;
    let status = parse_status(&status)?;

    if state.mode.is_auto().await && !caller.is_admin() {
        return Err(AppError::forbidden("auto mode is on; only an admin can override devices"));
    }

    let record = state.stores.devices.write_device_state(device, status).await?;
    info!(%device, %status, operator = %caller.name, "Manual device command");
    Ok(Json(record.into()))
}

// ---------------------------------------------------------------------------
// Control mode
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/control/mode",
    responses(
        (status = 200, description = "Current control mode", body = ControlModeDto),
    ),
    tag = "control"
)]
pub async fn get_control_mode(State(state): State<AppState>) -> Json<ControlModeDto> {
    Json(ControlModeDto { auto_mode: state.mode.is_auto().await })
}

#[utoipa::path(
    post,
    path = "/control/mode/toggle",
    params(
        ("x-operator-role" = Option<String>, Header, description = "Must be admin"),
    ),
    responses(
        (status = 200, description = "Mode after the toggle", body = ControlModeDto),
        (status = 403, description = "Caller is not an admin"),
        (status = 503, description = "Storage unavailable; mode unchanged"),
    ),
    tag = "control"
)]
pub async fn toggle_control_mode(
    State(state): State<AppState>,
    caller: Caller,
) -> Result<Json<ControlModeDto>, AppError> {
    if !caller.is_admin() {
        return Err(AppError::forbidden("only an admin can change the control mode"));
    }
    let auto_mode = state.mode.toggle().await?;
    info!(auto_mode, operator = %caller.name, "Control mode changed");
    Ok(Json(ControlModeDto { auto_mode }))
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

/// Effective band for every parameter, defaults filled in.
#[utoipa::path(
    get,
    path = "/thresholds",
    responses(
        (status = 200, description = "Effective thresholds", body = Vec<Threshold>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "control"
)]
pub async fn list_thresholds(State(state): State<AppState>) -> Result<Json<Vec<Threshold>>, AppError> {
    let thresholds = state.stores.thresholds.get_thresholds().await?;
    Ok(Json(thresholds.effective()))
}

#[utoipa::path(
    put,
    path = "/thresholds/{parameter}",
    params(
        ("parameter" = Parameter, Path, description = "Parameter name"),
        ("x-operator-role" = Option<String>, Header, description = "Must be admin"),
    ),
    request_body = Band,
    responses(
        (status = 200, description = "Threshold stored", body = Threshold),
        (status = 400, description = "Unknown parameter or invalid band"),
        (status = 403, description = "Caller is not an admin"),
    ),
    tag = "control"
)]
pub async fn set_threshold(
    State(state): State<AppState>,
    caller: Caller,
    Path(parameter): Path<String>,
    Json(band): Json<Band>,
) -> Result<Json<Threshold>, AppError> {
    if !caller.is_admin() {
        return Err(AppError::forbidden("only an admin can change thresholds"));
    }
    let parameter: Parameter = parameter.parse()?;
    let band = band.validate(parameter)?;

    state.stores.thresholds.set_threshold(parameter, band).await?;
    info!(%parameter, min = band.min, max = band.max, operator = %caller.name, "Threshold updated");
    Ok(Json(Threshold { parameter, min: band.min, max: band.max }))
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

/// Alerts newest first. `status` is `all` (default), `unhandled` or
/// `handled`.
#[utoipa::path(
    get,
    path = "/alerts",
    params(
        ("status" = Option<AlertFilter>, Query, description = "Filter by handled status"),
        ("limit" = Option<u32>, Query, description = "Maximum number of alerts (default 100)"),
    ),
    responses(
        (status = 200, description = "Alerts", body = Vec<Alert>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "alerts"
)]
pub async fn list_alerts(
    State(state): State<AppState>,
    Query(params): Query<AlertParams>,
) -> Result<Json<Vec<Alert>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_ALERT_LIMIT).clamp(1, MAX_ALERT_LIMIT);
    let alerts = state
        .stores
        .alerts
        .list_alerts(params.status.unwrap_or_default(), limit)
        .await?;
    Ok(Json(alerts))
}

#[utoipa::path(
    post,
    path = "/alerts/{id}/handle",
    params(
        ("id" = i64, Path, description = "Alert id"),
        ("x-operator" = Option<String>, Header, description = "Recorded as handled_by"),
    ),
    responses(
        (status = 200, description = "Alert handled, or already handled earlier", body = HandleAlertResponse),
        (status = 404, description = "No such alert"),
    ),
    tag = "alerts"
)]
pub async fn handle_alert(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<Json<HandleAlertResponse>, AppError> {
    let result = match state.stores.alerts.handle_alert(id, &caller.name).await? {
        HandleOutcome::Handled => {
            info!(alert_id = id, operator = %caller.name, "Alert handled");
            HandleResult::Handled
        }
        HandleOutcome::AlreadyHandled => HandleResult::AlreadyHandled,
        HandleOutcome::NotFound => return Err(AppError::not_found(format!("alert {id} not found"))),
    };
    Ok(Json(HandleAlertResponse { id, result }))
}

// ---------------------------------------------------------------------------
// Scheduled tasks
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/schedules",
    responses(
        (status = 200, description = "All scheduled tasks by time", body = Vec<ScheduledTask>),
        (status = 500, description = "Internal server error"),
    ),
    tag = "schedules"
)]
pub async fn list_schedules(State(state): State<AppState>) -> Result<Json<Vec<ScheduledTask>>, AppError> {
    Ok(Json(state.stores.schedules.list_tasks().await?))
}

#[utoipa::path(
    post,
    path = "/schedules",
    request_body = NewScheduleRequest,
    responses(
        (status = 201, description = "Task created (enabled)", body = ScheduledTask),
        (status = 400, description = "Unknown device or invalid time"),
    ),
    tag = "schedules"
)]
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(req): Json<NewScheduleRequest>,
) -> Result<(StatusCode, Json<ScheduledTask>), AppError> {
    let device: Device = req.device_name.parse()?;
    let schedule_time = parse_schedule_time(&req.schedule_time)?;

    let task = state
        .stores
        .schedules
        .add_task(device, req.action, &schedule_time)
        .await?;
    info!(task_id = task.id, %device, action = %task.action, %schedule_time, "Scheduled task created");
    Ok((StatusCode::CREATED, Json(task)))
}

#[utoipa::path(
    post,
    path = "/schedules/{id}/toggle",
    params(
        ("id" = i64, Path, description = "Task id"),
    ),
    responses(
        (status = 200, description = "Task after the toggle", body = ScheduledTask),
        (status = 404, description = "No such task"),
    ),
    tag = "schedules"
)]
pub async fn toggle_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ScheduledTask>, AppError> {
    state
        .stores
        .schedules
        .toggle_task(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::not_found(format!("scheduled task {id} not found")))
}

#[utoipa::path(
    delete,
    path = "/schedules/{id}",
    params(
        ("id" = i64, Path, description = "Task id"),
    ),
    responses(
        (status = 204, description = "Task deleted"),
        (status = 404, description = "No such task"),
    ),
    tag = "schedules"
)]
pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if state.stores.schedules.delete_task(id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::not_found(format!("scheduled task {id} not found")))
    }
}

// ---------------------------------------------------------------------------
// Health check
// ---------------------------------------------------------------------------

/// Returns `200 OK` with `{"status":"ok"}` when the server is running.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
    ),
    tag = "system"
)]
pub async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

// ---------------------------------------------------------------------------
// OpenAPI spec
// ---------------------------------------------------------------------------

#[derive(OpenApi)]
#[openapi(
    paths(
        get_latest_sample,
        get_history,
        list_devices,
        set_device_state,
        get_control_mode,
        toggle_control_mode,
        list_thresholds,
        set_threshold,
        list_alerts,
        handle_alert,
        list_schedules,
        create_schedule,
        toggle_schedule,
        delete_schedule,
        health,
    ),
    components(schemas(
        SensorSample,
        HistoryPoint,
        Device,
        DeviceStatus,
        DeviceStateDto,
        ControlModeDto,
        Parameter,
        Band,
        Threshold,
        Alert,
        AlertFilter,
        HandleResult,
        HandleAlertResponse,
        ScheduledTask,
        NewScheduleRequest,
    )),
    tags(
        (name = "sensors",   description = "Sensor sample endpoints"),
        (name = "devices",   description = "Actuator state endpoints"),
        (name = "control",   description = "Control mode and thresholds"),
        (name = "alerts",    description = "Threshold violation alerts"),
        (name = "schedules", description = "Time-of-day device tasks"),
        (name = "system",    description = "System endpoints"),
    ),
    info(
        title = "Greenhouse Control API",
        version = "0.1.0",
        description = "REST API for greenhouse sensors, actuators and control settings"
    )
)]
pub struct ApiDoc;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
