//! API routes for powerd
//!
//! POST only. Bodies are read as raw bytes and parsed here, so malformed
//! JSON is a 400 like any other bad field. Busy is a normal answer, not an
//! error status.

use crate::server::AppState;
use crate::status;
use crate::update::UpdateRequest;
use axum::{
    body::Bytes,
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{post, MethodRouter},
    Json, Router,
};
use power_common::{Marker, PowerError, SystemStatus};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, warn};

type AppStateArc = Arc<AppState>;

// ============================================================================
// Errors
// ============================================================================

/// A [`PowerError`] on its way to the client
#[derive(Debug)]
pub struct ApiError(pub PowerError);

impl From<PowerError> for ApiError {
    fn from(e: PowerError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            PowerError::Busy(reason) => (
                StatusCode::OK,
                Json(json!({ "state": "busy", "reason": reason.to_string() })),
            )
                .into_response(),
            PowerError::FetchFailure(reason) => (
                StatusCode::OK,
                Json(json!({ "state": false, "reason": reason })),
            )
                .into_response(),
            PowerError::Validation(msg) => (StatusCode::BAD_REQUEST, Json(msg)).into_response(),
            PowerError::Unsupported(msg) => (StatusCode::NOT_FOUND, Json(msg)).into_response(),
            other => {
                error!("request failed: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, Json(other.to_string())).into_response()
            }
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(body)
        .map_err(|e| PowerError::validation(format!("invalid request body: {}", e)).into())
}

fn parse_value<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body)
        .map_err(|e| PowerError::validation(format!("invalid request body: {}", e)).into())
}

/// POST route that answers anything else with 404
fn post_only<H, T>(handler: H) -> MethodRouter<AppStateArc>
where
    H: axum::handler::Handler<T, AppStateArc>,
    T: 'static,
{
    post(handler).fallback(not_found)
}

pub async fn not_found(uri: Uri) -> ApiError {
    debug!("no route for {}", uri);
    ApiError(PowerError::Unsupported(format!("no such endpoint: {}", uri.path())))
}

// ============================================================================
// Status Routes
// ============================================================================

pub fn status_routes() -> Router<AppStateArc> {
    Router::new().route("/init", post_only(init))
}

async fn init(State(state): State<AppStateArc>) -> Json<SystemStatus> {
    Json(status::snapshot(&state).await)
}

// ============================================================================
// Clock Routes
// ============================================================================

pub fn clock_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/set-time", post_only(set_time))
        .route("/set-ntp", post_only(set_ntp))
}

#[derive(Debug, Deserialize)]
struct SetTimeRequest {
    hours: Value,
    minutes: Value,
}

/// Time fields arrive as strings from the UI, numbers from scripts
fn time_field(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

async fn set_time(State(state): State<AppStateArc>, body: Bytes) -> Result<Response, ApiError> {
    let req: SetTimeRequest = parse_body(&body)?;
    match state
        .clock
        .set_time(&time_field(&req.hours), &time_field(&req.minutes))
        .await
    {
        Ok((hours, minutes)) => Ok(Json(json!({
            "state": true,
            "hours": hours,
            "minutes": minutes,
        }))
        .into_response()),
        Err(PowerError::Validation(msg)) => Err(PowerError::Validation(msg).into()),
        Err(e) => {
            error!("setting time failed: {}", e);
            Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "state": false })),
            )
                .into_response())
        }
    }
}

#[derive(Debug, Deserialize)]
struct SetNtpRequest {
    ntp: bool,
}

async fn set_ntp(State(state): State<AppStateArc>, body: Bytes) -> ApiResult<String> {
    let req: SetNtpRequest = parse_body(&body)?;
    state.clock.set_ntp(req.ntp).await?;
    Ok(Json(format!("Changed Network Time state to {}", req.ntp)))
}

// ============================================================================
// Power Routes
// ============================================================================

pub fn power_routes() -> Router<AppStateArc> {
    Router::new()
        .route("/shutdown", post_only(shutdown))
        .route("/reboot", post_only(reboot))
        .route("/restart", post_only(restart))
}

async fn shutdown(State(state): State<AppStateArc>) -> ApiResult<&'static str> {
    state.power.shutdown()?;
    Ok(Json("Shutting down"))
}

async fn reboot(State(state): State<AppStateArc>) -> ApiResult<&'static str> {
    state.power.reboot()?;
    Ok(Json("Rebooting"))
}

async fn restart(State(state): State<AppStateArc>) -> ApiResult<&'static str> {
    state.power.restart_gateway()?;
    Ok(Json("Restarting"))
}

// ============================================================================
// Ajax Routes
// ============================================================================

pub fn ajax_routes() -> Router<AppStateArc> {
    Router::new().route("/ajax", post_only(ajax))
}

#[derive(Debug, Default, Deserialize)]
struct ResetRequest {
    #[serde(default)]
    keep_z2m: bool,
    #[serde(default)]
    keep_bluetooth: bool,
}

#[derive(Debug, Default, Deserialize)]
struct AnonymousMqttRequest {
    #[serde(default)]
    allow_anonymous_mqtt: bool,
}

async fn ajax(State(state): State<AppStateArc>, body: Bytes) -> ApiResult<Value> {
    let body: Value = parse_body(&body)?;
    let action = body
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| PowerError::validation("missing 'action'"))?
        .to_string();
    debug!("ajax action: {}", action);

    match action.as_str() {
        "reset" => {
            let req: ResetRequest = parse_value(body)?;
            state
                .updates
                .factory_reset(req.keep_z2m, req.keep_bluetooth)
                .await?;
            Ok(Json(json!({ "state": "ok" })))
        }
        "manual_update" => {
            state.updates.manual_update().await?;
            Ok(Json(json!({ "state": "ok" })))
        }
        "start_system_update" => {
            let req: UpdateRequest = parse_value(body)?;
            let report = state.updates.start_system_update(req).await?;
            Ok(Json(json!(report)))
        }
        "poll" => {
            let dmesg = state.telemetry.poll_dmesg().await;
            Ok(Json(json!({ "state": "ok", "dmesg": dmesg })))
        }
        "files_check" => {
            let output = state.telemetry.files_check().await;
            Ok(Json(json!({ "state": "ok", "files_check_output": output })))
        }
        "backup_init" => Ok(Json(backup_info(&state, "ok"))),
        "create_backup" => {
            let outcome = match state.backups.backup().await {
                Ok(_) => "ok",
                Err(PowerError::Busy(reason)) => return Err(PowerError::Busy(reason).into()),
                Err(e) => {
                    warn!("backup failed: {}", e);
                    "error"
                }
            };
            Ok(Json(backup_info(&state, outcome)))
        }
        "unlink_backup_download_dir" => {
            let outcome = match state.backups.unlink_download_dir() {
                Ok(_) => "ok",
                Err(e) => {
                    warn!("unlink failed: {}", e);
                    "error"
                }
            };
            Ok(Json(json!({ "state": outcome })))
        }
        "anonymous_mqtt" => {
            let req: AnonymousMqttRequest = parse_value(body)?;
            state.mqtt.set_anonymous(req.allow_anonymous_mqtt)?;
            Ok(Json(json!({ "state": true })))
        }
        "get_stats" => {
            let memory = state.telemetry.memory();
            let voltage = state.telemetry.voltage().await;
            Ok(Json(json!({
                "state": true,
                "total_memory": memory.total_memory,
                "available_memory": memory.available_memory,
                "free_memory": memory.free_memory,
                "disk_usage": state.backups.disk_usage(),
                "low_voltage": voltage.any(),
                "low_voltage_now": voltage.low_voltage_now,
                "low_voltage_ever_observed": voltage.low_voltage_ever_observed,
            })))
        }
        "acknowledge_bootup_failure" => {
            state
                .registry
                .markers()
                .clear(Marker::BootupActionsFailed)?;
            Ok(Json(json!({ "state": "ok" })))
        }
        other => Err(PowerError::Unsupported(format!("unknown action '{}'", other)).into()),
    }
}

fn backup_info(state: &AppState, outcome: &str) -> Value {
    json!({
        "state": outcome,
        "backup_exists": state.backups.record().exists,
        "restore_exists": state.backups.restore_exists(),
        "disk_usage": state.backups.disk_usage(),
    })
}

// ============================================================================
// Restore Routes
// ============================================================================

pub fn restore_routes() -> Router<AppStateArc> {
    Router::new().route("/save", post_only(save))
}

#[derive(Debug, Deserialize)]
struct SaveRequest {
    filename: String,
    filedata: String,
}

async fn save(State(state): State<AppStateArc>, body: Bytes) -> ApiResult<Value> {
    let req: SaveRequest = parse_body(&body)?;
    state
        .backups
        .stage_restore(&req.filename, req.filedata)
        .await?;
    Ok(Json(json!({ "state": "ok", "data": [] })))
}
