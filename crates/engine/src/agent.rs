use crate::auth::{authorize_executor, Authenticator, Credentials, ExecutorIdentity};
use crate::clock::Clock;
use crate::dispatcher::CommandDispatcher;
use crate::error::{or_not_found, EngineError};
use crate::rate_limiter::RateLimiter;
use crate::supervisor::{DecisionContext, Supervisor, SupervisorVerdict};
use chrono::{DateTime, Utc};
use configuration::{DispatchSettings, LivenessSettings};
use core_types::{Command, CommandKind, CommandPriority, CommandStatus, Position, TradeClose, TradeReport};
use database::Store;
use events::Channel;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// What an agent needs to know to run against this server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub executor_id: Uuid,
    pub executor_channel: String,
    pub user_channel: String,
    pub heartbeat_interval_secs: u64,
    pub stale_window_secs: u64,
    pub claim_batch_size: u32,
    pub server_time: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub status: CommandStatus,
    #[serde(default)]
    pub result: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationRequest {
    pub command: CommandKind,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub priority: CommandPriority,
}

/// Every agent-facing operation besides the heartbeat. Each one starts by
/// checking the credentials belong to the executor in the path.
pub struct AgentService {
    authenticator: Arc<dyn Authenticator>,
    collaborator_limiter: Arc<RateLimiter>,
    store: Arc<dyn Store>,
    dispatcher: Arc<CommandDispatcher>,
    supervisor: Arc<Supervisor>,
    clock: Arc<dyn Clock>,
    liveness: LivenessSettings,
    dispatch: DispatchSettings,
}

impl AgentService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        collaborator_limiter: Arc<RateLimiter>,
        store: Arc<dyn Store>,
        dispatcher: Arc<CommandDispatcher>,
        supervisor: Arc<Supervisor>,
        clock: Arc<dyn Clock>,
        liveness: LivenessSettings,
        dispatch: DispatchSettings,
    ) -> Self {
        Self {
            authenticator,
            collaborator_limiter,
            store,
            dispatcher,
            supervisor,
            clock,
            liveness,
            dispatch,
        }
    }

    /// Checks the credentials belong to `executor_id`.
    pub async fn authorize(&self, executor_id: Uuid, credentials: &Credentials) -> Result<ExecutorIdentity, EngineError> {
        authorize_executor(self.authenticator.as_ref(), executor_id, credentials).await
    }

    pub async fn update_status(
        &self,
        executor_id: Uuid,
        credentials: &Credentials,
        command_id: Uuid,
        report: StatusReport,
    ) -> Result<Command, EngineError> {
        self.authorize(executor_id, credentials).await?;
        self.dispatcher
            .update_status(command_id, executor_id, report.status, report.result)
            .await
    }

    /// Mirrors an open trade. Re-reporting the same ticket refreshes it.
    pub async fn report_trade(
        &self,
        executor_id: Uuid,
        credentials: &Credentials,
        report: TradeReport,
    ) -> Result<Position, EngineError> {
        let identity = self.authorize(executor_id, credentials).await?;
        report.validate()?;

        let ticket = report.ticket;
        let position = self
            .store
            .upsert_position(report.into_position(Uuid::new_v4(), identity.user_id, executor_id))
            .await?;
        tracing::info!(%executor_id, ticket, symbol = %position.symbol, "Trade reported.");
        Ok(position)
    }

    pub async fn report_trade_close(
        &self,
        executor_id: Uuid,
        credentials: &Credentials,
        ticket: i64,
        close: TradeClose,
    ) -> Result<Position, EngineError> {
        self.authorize(executor_id, credentials).await?;
        close.validate()?;
        let position = self
            .store
            .close_position(executor_id, ticket, close, self.clock.now())
            .await
            .map_err(or_not_found("Position"))?;
        tracing::info!(%executor_id, ticket, profit = %position.profit, "Trade closed.");
        Ok(position)
    }

    pub async fn fetch_config(
        &self,
        executor_id: Uuid,
        credentials: &Credentials,
    ) -> Result<AgentConfig, EngineError> {
        let identity = self.authorize(executor_id, credentials).await?;
        self.collaborator_limiter.check(executor_id)?;
        Ok(AgentConfig {
            executor_id,
            executor_channel: Channel::Executor(executor_id).to_string(),
            user_channel: Channel::User(identity.user_id).to_string(),
            heartbeat_interval_secs: self.liveness.heartbeat_interval_secs,
            stale_window_secs: self.liveness.stale_window_secs,
            claim_batch_size: self.dispatch.claim_batch_size,
            server_time: self.clock.now(),
        })
    }

    pub async fn evaluate(
        &self,
        executor_id: Uuid,
        credentials: &Credentials,
        request: EvaluationRequest,
    ) -> Result<SupervisorVerdict, EngineError> {
        let identity = self.authorize(executor_id, credentials).await?;
        self.collaborator_limiter.check(executor_id)?;
        let context = DecisionContext {
            user_id: identity.user_id,
            executor_id,
            command: request.command,
            parameters: request.parameters,
            priority: request.priority,
        };
        Ok(self.supervisor.evaluate(&context).await)
    }
}
