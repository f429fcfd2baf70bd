use crate::auth::{generate_credentials, hash_secret};
use crate::clock::Clock;
use crate::dispatcher::CommandDispatcher;
use crate::error::EngineError;
use crate::liveness::{ExecutorView, LivenessTracker};
use core_types::{AuditRecord, NewExecutor};
use database::Store;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const MAX_NAME_LEN: usize = 100;

/// A freshly registered executor. The secret is never shown again.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredExecutor {
    pub executor: ExecutorView,
    pub api_key: String,
    pub api_secret: String,
}

/// Owner-side executor lifecycle.
pub struct ExecutorService {
    store: Arc<dyn Store>,
    dispatcher: Arc<CommandDispatcher>,
    liveness: LivenessTracker,
    clock: Arc<dyn Clock>,
}

impl ExecutorService {
    pub fn new(
        store: Arc<dyn Store>,
        dispatcher: Arc<CommandDispatcher>,
        liveness: LivenessTracker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            liveness,
            clock,
        }
    }

    pub async fn register(&self, user_id: Uuid, name: &str) -> Result<RegisteredExecutor, EngineError> {
        let name = name.trim();
        if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
            return Err(EngineError::Validation(format!(
                "name must be between 1 and {MAX_NAME_LEN} characters"
            )));
        }

        let credentials = generate_credentials();
        let now = self.clock.now();
        let executor = self
            .store
            .insert_executor(NewExecutor {
                user_id,
                name: name.to_string(),
                api_key: credentials.api_key.clone(),
                secret_hash: hash_secret(&credentials.api_key, &credentials.api_secret),
                created_at: now,
            })
            .await?;

        tracing::info!(executor_id = %executor.id, %user_id, "Executor registered.");
        let record = AuditRecord::new(user_id, "executor_registered", now)
            .with_detail(json!({ "executorId": executor.id, "name": executor.name }));
        self.dispatcher.audit(record).await;

        Ok(RegisteredExecutor {
            executor: self.liveness.view(executor),
            api_key: credentials.api_key,
            api_secret: credentials.api_secret,
        })
    }

    pub async fn list(&self, user_id: Uuid) -> Result<Vec<ExecutorView>, EngineError> {
        let executors = self.store.list_executors(user_id).await?;
        Ok(executors.into_iter().map(|e| self.liveness.view(e)).collect())
    }

    pub async fn get(&self, user_id: Uuid, executor_id: Uuid) -> Result<ExecutorView, EngineError> {
        let executor = self.dispatcher.owned_executor(user_id, executor_id).await?;
        Ok(self.liveness.view(executor))
    }

    /// Soft delete. Refused while the agent is online or still holds positions.
    pub async fn delete(&self, user_id: Uuid, executor_id: Uuid) -> Result<(), EngineError> {
        let executor = self.dispatcher.owned_executor(user_id, executor_id).await?;
        if self.liveness.is_online(&executor) {
            return Err(EngineError::Validation(
                "executor is online; stop the agent before deleting it".into(),
            ));
        }
        let open = self.store.count_open_positions(executor_id).await?;
        if open > 0 {
            return Err(EngineError::Validation(format!(
                "executor still has {open} open position(s)"
            )));
        }

        let now = self.clock.now();
        self.store.soft_delete_executor(executor_id, now).await?;
        tracing::info!(%executor_id, %user_id, "Executor deleted.");
        let record = AuditRecord::new(user_id, "executor_deleted", now)
            .with_detail(json!({ "executorId": executor_id }));
        self.dispatcher.audit(record).await;
        Ok(())
    }
}
