use crate::clock::Clock;
use crate::dispatcher::{CommandDispatcher, Dispatched};
use crate::error::EngineError;
use core_types::{AuditRecord, CommandPayload, CommandPriority, Executor};
use database::Store;
use events::{Channel, EmergencyStopNotice, FanoutEvent, Publisher};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

/// Which executors were targeted. Says nothing about execution.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopReport {
    pub executors: Vec<Uuid>,
    pub commands: Vec<Dispatched>,
    /// Executors whose stop command could not be queued.
    pub failed: Vec<Uuid>,
    pub notice: String,
}

impl EmergencyStopReport {
    pub fn command_ids(&self) -> Vec<Uuid> {
        self.commands.iter().map(|d| d.command.id).collect()
    }
}

/// Fans one URGENT `EMERGENCY_STOP` out to every executor a user owns.
pub struct EmergencyStopCoordinator {
    store: Arc<dyn Store>,
    dispatcher: Arc<CommandDispatcher>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
}

impl EmergencyStopCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<CommandDispatcher>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            publisher,
            clock,
        }
    }

    pub async fn emergency_stop(
        &self,
        user_id: Uuid,
        reason: Option<String>,
    ) -> Result<EmergencyStopReport, EngineError> {
        let executors = self.store.list_executors(user_id).await?;
        if executors.is_empty() {
            tracing::info!(%user_id, "Emergency stop requested with no executors registered.");
            return Ok(EmergencyStopReport {
                executors: Vec::new(),
                commands: Vec::new(),
                failed: Vec::new(),
                notice: "nothing to stop".to_string(),
            });
        }
        self.stop_executors(user_id, &executors, reason).await
    }

    /// One executor failing does not hold back the others. Errors only when
    /// nothing at all could be queued.
    pub(crate) async fn stop_executors(
        &self,
        user_id: Uuid,
        executors: &[Executor],
        reason: Option<String>,
    ) -> Result<EmergencyStopReport, EngineError> {
        tracing::warn!(%user_id, executors = executors.len(), reason = ?reason, "EMERGENCY STOP issued.");

        let mut commands = Vec::with_capacity(executors.len());
        let mut failed = Vec::new();
        let mut first_error = None;
        for executor in executors {
            let payload = CommandPayload::emergency_stop(reason.clone());
            match self
                .dispatcher
                .dispatch(executor, payload, CommandPriority::Urgent, false)
                .await
            {
                Ok(dispatched) => commands.push(dispatched),
                Err(e) => {
                    tracing::error!(%user_id, executor_id = %executor.id, error = %e, "Emergency stop could not be queued.");
                    failed.push(executor.id);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error.filter(|_| commands.is_empty()) {
            return Err(e);
        }

        let now = self.clock.now();
        let notice = if failed.is_empty() {
            format!("emergency stop sent to {} executor(s)", commands.len())
        } else {
            format!(
                "emergency stop sent to {} executor(s), {} failed",
                commands.len(),
                failed.len()
            )
        };
        let report = EmergencyStopReport {
            executors: executors.iter().map(|e| e.id).collect(),
            commands,
            failed,
            notice,
        };
        let command_ids = report.command_ids();

        let notice = EmergencyStopNotice {
            reason: reason.clone(),
            executor_count: command_ids.len(),
            command_ids: command_ids.clone(),
            issued_at: now,
        };
        if let Err(e) = self
            .publisher
            .publish(Channel::User(user_id), FanoutEvent::EmergencyStop(notice))
        {
            tracing::debug!(%user_id, error = %e, "Emergency-stop broadcast not delivered.");
        }

        let record = AuditRecord::new(user_id, "emergency_stop", now)
            .with_commands(command_ids.len(), command_ids)
            .with_detail(json!({ "reason": reason, "failed": report.failed }));
        self.dispatcher.audit(record).await;

        Ok(report)
    }
}
