//! Routes called by the agents themselves. Every one of them authenticates
//! with the executor's API key and secret.

use crate::extract::{optional_json, AgentCredentials};
use crate::{error::AppError, AppState};
use axum::{
    body::Bytes,
    extract::{Path, State},
    Json,
};
use axum_extra::extract::WithRejection;
use core_types::{Command, Position, TradeClose, TradeReport};
use engine::{AgentConfig, EvaluationRequest, HeartbeatRequest, HeartbeatResponse, StatusReport, SupervisorVerdict};
use std::sync::Arc;
use uuid::Uuid;

/// # POST /api/executor/:id/heartbeat
/// An empty body is a bare liveness ping.
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(executor_id): Path<Uuid>,
    AgentCredentials(credentials): AgentCredentials,
    body: Bytes,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let request: HeartbeatRequest = optional_json(&body)?;
    let response = state
        .control
        .heartbeats
        .handle(executor_id, &credentials, request)
        .await?;
    Ok(Json(response))
}

/// # POST /api/executor/:id/commands/:cid/status
pub async fn update_command_status(
    State(state): State<Arc<AppState>>,
    Path((executor_id, command_id)): Path<(Uuid, Uuid)>,
    AgentCredentials(credentials): AgentCredentials,
    WithRejection(Json(report), _): WithRejection<Json<StatusReport>, AppError>,
) -> Result<Json<Command>, AppError> {
    let command = state
        .control
        .agents
        .update_status(executor_id, &credentials, command_id, report)
        .await?;
    Ok(Json(command))
}

/// # POST /api/executor/:id/trades
pub async fn report_trade(
    State(state): State<Arc<AppState>>,
    Path(executor_id): Path<Uuid>,
    AgentCredentials(credentials): AgentCredentials,
    WithRejection(Json(report), _): WithRejection<Json<TradeReport>, AppError>,
) -> Result<Json<Position>, AppError> {
    let position = state
        .control
        .agents
        .report_trade(executor_id, &credentials, report)
        .await?;
    Ok(Json(position))
}

/// # POST /api/executor/:id/trades/:ticket/close
pub async fn close_trade(
    State(state): State<Arc<AppState>>,
    Path((executor_id, ticket)): Path<(Uuid, i64)>,
    AgentCredentials(credentials): AgentCredentials,
    WithRejection(Json(close), _): WithRejection<Json<TradeClose>, AppError>,
) -> Result<Json<Position>, AppError> {
    let position = state
        .control
        .agents
        .report_trade_close(executor_id, &credentials, ticket, close)
        .await?;
    Ok(Json(position))
}

/// # GET /api/executor/:id/config
pub async fn agent_config(
    State(state): State<Arc<AppState>>,
    Path(executor_id): Path<Uuid>,
    AgentCredentials(credentials): AgentCredentials,
) -> Result<Json<AgentConfig>, AppError> {
    Ok(Json(
        state.control.agents.fetch_config(executor_id, &credentials).await?,
    ))
}

/// # POST /api/executor/:id/supervisor/evaluate
pub async fn evaluate(
    State(state): State<Arc<AppState>>,
    Path(executor_id): Path<Uuid>,
    AgentCredentials(credentials): AgentCredentials,
    WithRejection(Json(request), _): WithRejection<Json<EvaluationRequest>, AppError>,
) -> Result<Json<SupervisorVerdict>, AppError> {
    Ok(Json(
        state
            .control
            .agents
            .evaluate(executor_id, &credentials, request)
            .await?,
    ))
}
