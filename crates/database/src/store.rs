use crate::error::DbError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    AuditRecord, Command, CommandStatus, Executor, ExecutorStatus, HeartbeatMetadata, NewCommand,
    NewExecutor, Position, TradeClose,
};
use serde_json::Value;
use uuid::Uuid;

/// Persistence of registered executors. Soft-deleted executors are invisible
/// to every read here.
#[async_trait]
pub trait ExecutorStore: Send + Sync {
    async fn insert_executor(&self, new: NewExecutor) -> Result<Executor, DbError>;

    async fn get_executor(&self, id: Uuid) -> Result<Executor, DbError>;

    async fn find_executor_by_api_key(&self, api_key: &str) -> Result<Executor, DbError>;

    /// The user's executors, oldest first.
    async fn list_executors(&self, user_id: Uuid) -> Result<Vec<Executor>, DbError>;

    /// Stamps `last_heartbeat = at` and stores the reported hint. Metadata is
    /// only replaced when the agent sent some.
    async fn record_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reported_status: Option<ExecutorStatus>,
        metadata: Option<HeartbeatMetadata>,
    ) -> Result<Executor, DbError>;

    async fn soft_delete_executor(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError>;

    /// Owners of executors that heartbeated at or after `since`.
    async fn users_active_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>, DbError>;
}

/// Persistence of commands. Every mutation is a single conditional write.
#[async_trait]
pub trait CommandStore: Send + Sync {
    async fn insert_command(&self, new: NewCommand) -> Result<Command, DbError>;

    async fn get_command(&self, id: Uuid) -> Result<Command, DbError>;

    /// Newest first.
    async fn list_commands(
        &self,
        executor_id: Uuid,
        status: Option<CommandStatus>,
        limit: u32,
    ) -> Result<Vec<Command>, DbError>;

    /// Atomically marks up to `limit` deliverable commands as claimed
    /// (`acknowledged_at = now`) and returns them in delivery order:
    /// priority descending, then creation time, then sequence.
    ///
    /// A command is returned by at most one call, however many run concurrently.
    async fn claim_pending(
        &self,
        executor_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Command>, DbError>;

    /// Moves a command to `to` if its current status allows it.
    ///
    /// `NotFound` when the command does not exist or targets another
    /// executor; `Conflict` (carrying the current status) when the
    /// transition is not allowed. Either way nothing is written.
    async fn transition_command(
        &self,
        id: Uuid,
        executor_id: Uuid,
        to: CommandStatus,
        result: Option<Value>,
        at: DateTime<Utc>,
    ) -> Result<Command, DbError>;

    /// Fails every unclaimed pending command whose expiry is at or before `now`.
    async fn fail_expired(&self, now: DateTime<Utc>) -> Result<Vec<Command>, DbError>;

    /// Fails claimed, non-terminal commands claimed at or before `claimed_before`.
    async fn fail_unreported(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Command>, DbError>;
}

/// Mirrored trades.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Inserts or refreshes the open position keyed by `(executor_id, ticket)`.
    /// A position that is already closed is returned unchanged.
    async fn upsert_position(&self, position: Position) -> Result<Position, DbError>;

    async fn close_position(
        &self,
        executor_id: Uuid,
        ticket: i64,
        close: TradeClose,
        at: DateTime<Utc>,
    ) -> Result<Position, DbError>;

    async fn open_positions_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, DbError>;

    async fn count_open_positions(&self, executor_id: Uuid) -> Result<i64, DbError>;

    /// Trades opened or closed at or after `since`, ordered by open time.
    async fn trades_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>, DbError>;
}

/// Append-only audit trail.
#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append_audit(&self, record: AuditRecord) -> Result<(), DbError>;

    /// Most recent first.
    async fn list_audit(&self, actor: Uuid, limit: u32) -> Result<Vec<AuditRecord>, DbError>;
}

/// Everything the control plane needs from durable storage.
pub trait Store: ExecutorStore + CommandStore + PositionStore + AuditLog {}

impl<T> Store for T where T: ExecutorStore + CommandStore + PositionStore + AuditLog {}

pub(crate) fn expired_result() -> Value {
    serde_json::json!({ "error": "expired" })
}

pub(crate) fn unreported_result() -> Value {
    serde_json::json!({ "error": "no execution report" })
}
