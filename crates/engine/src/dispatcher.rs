use crate::clock::Clock;
use crate::error::{or_not_found, EngineError};
use crate::liveness::LivenessTracker;
use crate::metrics::DeliveryMetrics;
use crate::supervisor::{DecisionContext, Supervisor, SupervisorVerdict};
use configuration::DispatchSettings;
use core_types::{
    AuditRecord, Command, CommandPayload, CommandPriority, CommandStatus, Executor,
    ExecutorStatus, NewCommand,
};
use database::{DbError, Store};
use events::{Channel, CommandDelivery, CommandStatusUpdate, FanoutEvent, Publisher};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Newest-first page size when listing an executor's commands.
pub const DEFAULT_LIST_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The agent was online and the push went out. The heartbeat pull still applies.
    Pushed,
    /// Only the next heartbeat will carry the command.
    QueuedForHeartbeat,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryNotice {
    pub mode: DeliveryMode,
    pub message: Option<String>,
}

impl DeliveryNotice {
    fn pushed() -> Self {
        Self {
            mode: DeliveryMode::Pushed,
            message: None,
        }
    }

    fn queued() -> Self {
        Self {
            mode: DeliveryMode::QueuedForHeartbeat,
            message: Some("executor offline, command queued".to_string()),
        }
    }
}

/// The outcome of a successful enqueue.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Dispatched {
    pub command: Command,
    pub executor_status: ExecutorStatus,
    pub delivery: DeliveryNotice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervisor: Option<SupervisorVerdict>,
}

/// Owns the command lifecycle: enqueue, push, claim and status transitions.
pub struct CommandDispatcher {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    liveness: LivenessTracker,
    supervisor: Arc<Supervisor>,
    metrics: Arc<DeliveryMetrics>,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        liveness: LivenessTracker,
        supervisor: Arc<Supervisor>,
        metrics: Arc<DeliveryMetrics>,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            store,
            publisher,
            liveness,
            supervisor,
            metrics,
            clock,
            settings,
        }
    }

    /// Resolves an executor the user owns. Unknown and foreign executors are
    /// indistinguishable to the caller.
    pub async fn owned_executor(&self, user_id: Uuid, executor_id: Uuid) -> Result<Executor, EngineError> {
        let executor = self
            .store
            .get_executor(executor_id)
            .await
            .map_err(or_not_found("Executor"))?;
        if executor.user_id != user_id {
            return Err(EngineError::NotFound("Executor"));
        }
        Ok(executor)
    }

    /// Queues a command for one of the user's executors.
    ///
    /// High-risk kinds are put to the supervisor first; only an enforced
    /// `deny` stops them.
    pub async fn enqueue(
        &self,
        user_id: Uuid,
        executor_id: Uuid,
        payload: CommandPayload,
        priority: Option<CommandPriority>,
    ) -> Result<Dispatched, EngineError> {
        let executor = self.owned_executor(user_id, executor_id).await?;
        payload.validate()?;
        let priority = priority.unwrap_or_default();

        let verdict = if payload.kind().is_high_risk() {
            let context = DecisionContext {
                user_id,
                executor_id,
                command: payload.kind(),
                parameters: payload.parameters(),
                priority,
            };
            let verdict = self.supervisor.evaluate(&context).await;
            if verdict.is_denied() {
                tracing::warn!(%user_id, %executor_id, command = %payload.kind(), risks = ?verdict.risks, "Command denied by the supervisor.");
                let reason = if verdict.risks.is_empty() {
                    "denied".to_string()
                } else {
                    verdict.risks.join(", ")
                };
                return Err(EngineError::PolicyDenied(reason));
            }
            Some(verdict)
        } else {
            None
        };

        let mut dispatched = self.dispatch(&executor, payload, priority, true).await?;
        dispatched.supervisor = verdict;
        Ok(dispatched)
    }

    /// Persists and pushes a command for an executor already resolved and
    /// authorized by the caller.
    pub(crate) async fn dispatch(
        &self,
        executor: &Executor,
        payload: CommandPayload,
        priority: CommandPriority,
        record_audit: bool,
    ) -> Result<Dispatched, EngineError> {
        let now = self.clock.now();
        let new = NewCommand {
            user_id: executor.user_id,
            executor_id: executor.id,
            payload,
            priority,
            created_at: now,
            expires_at: self.settings.command_ttl().map(|ttl| now + ttl),
        };
        let command = self.store.insert_command(new).await?;

        let executor_status = self.liveness.status_at(executor, now);
        let online = self.liveness.is_online_at(executor, now);
        let pushed = match self.publisher.publish(
            Channel::Executor(executor.id),
            FanoutEvent::CommandReceived(CommandDelivery::from(&command)),
        ) {
            Ok(()) => online,
            Err(e) => {
                tracing::debug!(command_id = %command.id, executor_id = %executor.id, error = %e, "Push not delivered; heartbeat will carry the command.");
                false
            }
        };
        self.metrics.record_enqueued(pushed);
        let delivery = if pushed {
            DeliveryNotice::pushed()
        } else {
            DeliveryNotice::queued()
        };

        tracing::info!(
            command_id = %command.id,
            executor_id = %executor.id,
            user_id = %executor.user_id,
            command = %command.kind(),
            priority = %command.priority,
            delivery = ?delivery.mode,
            "Command enqueued."
        );

        if record_audit {
            let record = AuditRecord::new(executor.user_id, "command_issued", now)
                .with_commands(1, vec![command.id])
                .with_detail(json!({
                    "executorId": executor.id,
                    "command": command.kind(),
                    "priority": command.priority,
                }));
            self.audit(record).await;
        }

        Ok(Dispatched {
            command,
            executor_status,
            delivery,
            supervisor: None,
        })
    }

    /// Claims the next batch for a heartbeat and records delivery latency once
    /// per command.
    pub async fn claim(&self, executor_id: Uuid) -> Result<Vec<Command>, EngineError> {
        let now = self.clock.now();
        let claimed = self
            .store
            .claim_pending(executor_id, now, self.settings.claim_batch_size)
            .await?;
        for command in &claimed {
            let claimed_at = command.acknowledged_at.unwrap_or(now);
            let latency = (claimed_at - command.created_at).num_milliseconds().max(0);
            self.metrics.record_claim(u64::try_from(latency).unwrap_or(0));
        }
        if !claimed.is_empty() {
            tracing::debug!(%executor_id, count = claimed.len(), "Commands claimed by heartbeat.");
        }
        Ok(claimed)
    }

    /// Applies an agent's status report as a single conditional write.
    pub async fn update_status(
        &self,
        command_id: Uuid,
        executor_id: Uuid,
        status: CommandStatus,
        result: Option<Value>,
    ) -> Result<Command, EngineError> {
        let now = self.clock.now();
        let command = match self
            .store
            .transition_command(command_id, executor_id, status, result, now)
            .await
        {
            Ok(command) => command,
            Err(DbError::NotFound) => return Err(EngineError::NotFound("Command")),
            Err(DbError::Conflict { current }) => {
                self.metrics.record_conflict();
                tracing::info!(%command_id, %executor_id, %current, requested = %status, "Rejected status transition.");
                return Err(EngineError::ConflictingTransition { current });
            }
            Err(e) => return Err(e.into()),
        };

        tracing::info!(%command_id, %executor_id, status = %command.status, "Command status updated.");
        if command.status.is_terminal() {
            self.metrics
                .record_outcome(command.status == CommandStatus::Executed);
            self.notify_owner(&command);
        }
        Ok(command)
    }

    /// Fire-and-forget `command-status` on the owner's channel.
    pub fn notify_owner(&self, command: &Command) {
        let event = FanoutEvent::CommandStatus(CommandStatusUpdate::from(command));
        if let Err(e) = self.publisher.publish(Channel::User(command.user_id), event) {
            tracing::debug!(command_id = %command.id, error = %e, "Status notification not delivered.");
        }
    }

    pub async fn list_commands(
        &self,
        user_id: Uuid,
        executor_id: Uuid,
        status: Option<CommandStatus>,
        limit: Option<u32>,
    ) -> Result<Vec<Command>, EngineError> {
        self.owned_executor(user_id, executor_id).await?;
        let limit = limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, 1_000);
        Ok(self.store.list_commands(executor_id, status, limit).await?)
    }

    pub async fn get_command(&self, user_id: Uuid, command_id: Uuid) -> Result<Command, EngineError> {
        let command = self
            .store
            .get_command(command_id)
            .await
            .map_err(or_not_found("Command"))?;
        if command.user_id != user_id {
            return Err(EngineError::NotFound("Command"));
        }
        Ok(command)
    }

    /// Appends to the audit trail. Failures are logged and swallowed.
    pub(crate) async fn audit(&self, record: AuditRecord) {
        let action = record.action.clone();
        if let Err(e) = self.store.append_audit(record).await {
            tracing::warn!(%action, error = %e, "Failed to write audit record.");
        }
    }
}
