use crate::extract::{optional_json, UserId};
use crate::{error::AppError, AppState};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use axum_extra::extract::WithRejection;
use chrono::Utc;
use core_types::{Command, CommandKind, CommandPayload, CommandPriority, CommandStatus};
use engine::{DeliveryStats, Dispatched, EmergencyStopReport, ExecutorView, RegisteredExecutor};
use risk::RiskExposure;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct RegisterExecutorRequest {
    pub name: String,
}

/// `{ command, parameters?, priority? }`. Parameters are checked against the
/// command kind by the engine, so a mismatch is a 422 rather than a parse error.
#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub command: CommandKind,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: Option<CommandPriority>,
}

#[derive(Debug, Deserialize)]
pub struct ListCommandsQuery {
    pub status: Option<CommandStatus>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmergencyStopRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// # GET /api/health
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "serverTime": Utc::now() }))
}

/// # GET /api/metrics/delivery
pub async fn delivery_metrics(State(state): State<Arc<AppState>>) -> Json<DeliveryStats> {
    Json(state.control.metrics.snapshot())
}

/// # POST /api/executors
/// The response carries the only copy of the plaintext secret.
pub async fn register_executor(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    WithRejection(Json(request), _): WithRejection<Json<RegisterExecutorRequest>, AppError>,
) -> Result<(StatusCode, Json<RegisteredExecutor>), AppError> {
    let registered = state.control.executors.register(user_id, &request.name).await?;
    Ok((StatusCode::CREATED, Json(registered)))
}

/// # GET /api/executors
pub async fn list_executors(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<Json<Vec<ExecutorView>>, AppError> {
    Ok(Json(state.control.executors.list(user_id).await?))
}

/// # GET /api/executors/:id
pub async fn get_executor(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(executor_id): Path<Uuid>,
) -> Result<Json<ExecutorView>, AppError> {
    Ok(Json(state.control.executors.get(user_id, executor_id).await?))
}

/// # DELETE /api/executors/:id
pub async fn delete_executor(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(executor_id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state.control.executors.delete(user_id, executor_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// # POST /api/executors/:id/commands
pub async fn enqueue_command(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(executor_id): Path<Uuid>,
    WithRejection(Json(request), _): WithRejection<Json<EnqueueRequest>, AppError>,
) -> Result<(StatusCode, Json<Dispatched>), AppError> {
    let payload = CommandPayload::from_parts(request.command, request.parameters)
        .map_err(engine::EngineError::from)?;
    let dispatched = state
        .control
        .dispatcher
        .enqueue(user_id, executor_id, payload, request.priority)
        .await?;
    Ok((StatusCode::CREATED, Json(dispatched)))
}

/// # GET /api/executors/:id/commands?status=&limit=
pub async fn list_commands(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(executor_id): Path<Uuid>,
    WithRejection(Query(query), _): WithRejection<Query<ListCommandsQuery>, AppError>,
) -> Result<Json<Vec<Command>>, AppError> {
    let commands = state
        .control
        .dispatcher
        .list_commands(user_id, executor_id, query.status, query.limit)
        .await?;
    Ok(Json(commands))
}

/// # GET /api/commands/:id
pub async fn get_command(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    Path(command_id): Path<Uuid>,
) -> Result<Json<Command>, AppError> {
    Ok(Json(state.control.dispatcher.get_command(user_id, command_id).await?))
}

/// # POST /api/emergency-stop
/// The body is optional; `{ "reason": "..." }` when given.
pub async fn emergency_stop(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
    body: Bytes,
) -> Result<Json<EmergencyStopReport>, AppError> {
    let request: EmergencyStopRequest = optional_json(&body)?;
    let report = state
        .control
        .emergency
        .emergency_stop(user_id, request.reason)
        .await?;
    Ok(Json(report))
}

/// # GET /api/risk/exposure
pub async fn risk_exposure(
    State(state): State<Arc<AppState>>,
    UserId(user_id): UserId,
) -> Result<Json<RiskExposure>, AppError> {
    Ok(Json(state.control.exposure.compute_exposure(user_id).await?))
}

pub async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "No such route" })))
}
