use crate::auth::{authorize_executor, Authenticator, Credentials};
use crate::clock::Clock;
use crate::dispatcher::CommandDispatcher;
use crate::error::{or_not_found, EngineError};
use crate::liveness::LivenessTracker;
use crate::rate_limiter::RateLimiter;
use chrono::{DateTime, Utc};
use core_types::{ExecutorStatus, HeartbeatMetadata};
use database::Store;
use events::CommandDelivery;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    #[serde(default)]
    pub status: Option<ExecutorStatus>,
    #[serde(default)]
    pub metadata: Option<HeartbeatMetadata>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub executor_id: Uuid,
    pub status: ExecutorStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub server_time: DateTime<Utc>,
    /// Claimed by this heartbeat, in delivery order.
    pub pending_commands: Vec<CommandDelivery>,
}

/// Authenticates pings, refreshes liveness and piggybacks pending commands.
pub struct HeartbeatHandler {
    authenticator: Arc<dyn Authenticator>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn Store>,
    dispatcher: Arc<CommandDispatcher>,
    liveness: LivenessTracker,
    clock: Arc<dyn Clock>,
}

impl HeartbeatHandler {
    pub fn new(
        authenticator: Arc<dyn Authenticator>,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn Store>,
        dispatcher: Arc<CommandDispatcher>,
        liveness: LivenessTracker,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            authenticator,
            limiter,
            store,
            dispatcher,
            liveness,
            clock,
        }
    }

    /// Nothing is written unless authentication and the rate limit both pass.
    pub async fn handle(
        &self,
        executor_id: Uuid,
        credentials: &Credentials,
        request: HeartbeatRequest,
    ) -> Result<HeartbeatResponse, EngineError> {
        // 1. The credentials must belong to this executor.
        authorize_executor(self.authenticator.as_ref(), executor_id, credentials).await?;

        // 2. Per-executor heartbeat budget.
        self.limiter.check(executor_id)?;
        if let Some(metadata) = &request.metadata {
            metadata.validate()?;
        }

        // 3. Refresh liveness unconditionally.
        let now = self.clock.now();
        let executor = self
            .store
            .record_heartbeat(executor_id, now, request.status, request.metadata)
            .await
            .map_err(or_not_found("Executor"))?;

        // 4. Claim the next batch. Latency is recorded inside the claim.
        let claimed = self.dispatcher.claim(executor_id).await?;

        tracing::debug!(
            %executor_id,
            reported = ?request.status,
            delivered = claimed.len(),
            "Heartbeat received."
        );

        Ok(HeartbeatResponse {
            executor_id,
            status: self.liveness.status_at(&executor, now),
            last_heartbeat: executor.last_heartbeat,
            server_time: now,
            pending_commands: claimed.iter().map(CommandDelivery::from).collect(),
        })
    }
}
