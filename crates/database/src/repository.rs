use crate::DbError;
use crate::store::{
    AuditLog, CommandStore, ExecutorStore, PositionStore, expired_result, unreported_result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    AuditRecord, Command, CommandKind, CommandPayload, CommandPriority, CommandStatus, Executor,
    ExecutorStatus, HeartbeatMetadata, NewCommand, NewExecutor, Position, TradeClose,
};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use sqlx::FromRow;
use sqlx::postgres::PgPool;
use std::cmp::Reverse;
use uuid::Uuid;

/// The `DbRepository` provides the PostgreSQL implementation of every store
/// trait. It encapsulates all SQL queries and data access logic.
#[derive(Debug, Clone)]
pub struct DbRepository {
    pool: PgPool,
}

const EXECUTOR_COLUMNS: &str = "id, user_id, name, api_key, secret_hash, reported_status, \
     last_heartbeat, metadata, created_at, deleted_at";

const COMMAND_COLUMNS: &str = "id, seq, user_id, executor_id, command, parameters, priority, \
     status, result, created_at, acknowledged_at, executed_at, expires_at";

const POSITION_COLUMNS: &str = "id, user_id, executor_id, ticket, strategy_id, symbol, direction, \
     lots, open_price, open_time, close_price, close_time, stop_loss, take_profit, profit, \
     commission, swap";

/// A row of the `executors` table.
#[derive(Debug, Clone, FromRow)]
pub struct DbExecutor {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub api_key: String,
    pub secret_hash: String,
    pub reported_status: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: JsonValue,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbExecutor> for Executor {
    type Error = DbError;

    fn try_from(row: DbExecutor) -> Result<Self, Self::Error> {
        let reported_status = row
            .reported_status
            .as_deref()
            .map(str::parse::<ExecutorStatus>)
            .transpose()?;
        Ok(Executor {
            id: row.id,
            user_id: row.user_id,
            name: row.name,
            api_key: row.api_key,
            secret_hash: row.secret_hash,
            reported_status,
            last_heartbeat: row.last_heartbeat,
            metadata: serde_json::from_value(row.metadata)?,
            created_at: row.created_at,
            deleted_at: row.deleted_at,
        })
    }
}

/// A row of the `commands` table.
#[derive(Debug, Clone, FromRow)]
pub struct DbCommand {
    pub id: Uuid,
    pub seq: i64,
    pub user_id: Uuid,
    pub executor_id: Uuid,
    pub command: String,
    pub parameters: JsonValue,
    pub priority: i16,
    pub status: String,
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TryFrom<DbCommand> for Command {
    type Error = DbError;

    fn try_from(row: DbCommand) -> Result<Self, Self::Error> {
        let kind: CommandKind = row.command.parse()?;
        Ok(Command {
            id: row.id,
            user_id: row.user_id,
            executor_id: row.executor_id,
            payload: CommandPayload::from_parts(kind, row.parameters)?,
            priority: CommandPriority::from_rank(row.priority)?,
            status: row.status.parse()?,
            result: row.result,
            sequence: row.seq,
            created_at: row.created_at,
            acknowledged_at: row.acknowledged_at,
            executed_at: row.executed_at,
            expires_at: row.expires_at,
        })
    }
}

/// A row of the `positions` table.
#[derive(Debug, Clone, FromRow)]
pub struct DbPosition {
    pub id: Uuid,
    pub user_id: Uuid,
    pub executor_id: Uuid,
    pub ticket: i64,
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub direction: String,
    pub lots: Decimal,
    pub open_price: Decimal,
    pub open_time: DateTime<Utc>,
    pub close_price: Option<Decimal>,
    pub close_time: Option<DateTime<Utc>>,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub profit: Decimal,
    pub commission: Decimal,
    pub swap: Decimal,
}

impl TryFrom<DbPosition> for Position {
    type Error = DbError;

    fn try_from(row: DbPosition) -> Result<Self, Self::Error> {
        Ok(Position {
            id: row.id,
            user_id: row.user_id,
            executor_id: row.executor_id,
            ticket: row.ticket,
            strategy_id: row.strategy_id,
            symbol: row.symbol,
            direction: row.direction.parse()?,
            lots: row.lots,
            open_price: row.open_price,
            open_time: row.open_time,
            close_price: row.close_price,
            close_time: row.close_time,
            stop_loss: row.stop_loss,
            take_profit: row.take_profit,
            profit: row.profit,
            commission: row.commission,
            swap: row.swap,
        })
    }
}

/// A row of the `audit_log` table.
#[derive(Debug, Clone, FromRow)]
pub struct DbAuditRecord {
    pub id: Uuid,
    pub actor: Uuid,
    pub action: String,
    pub executor_count: i32,
    pub command_ids: Vec<Uuid>,
    pub detail: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl From<DbAuditRecord> for AuditRecord {
    fn from(row: DbAuditRecord) -> Self {
        AuditRecord {
            id: row.id,
            actor: row.actor,
            action: row.action,
            executor_count: row.executor_count,
            command_ids: row.command_ids,
            detail: row.detail,
            recorded_at: row.recorded_at,
        }
    }
}

fn not_found(e: sqlx::Error) -> DbError {
    if let sqlx::Error::RowNotFound = e {
        DbError::NotFound
    } else {
        e.into()
    }
}

fn commands_from_rows(rows: Vec<DbCommand>) -> Result<Vec<Command>, DbError> {
    rows.into_iter().map(Command::try_from).collect()
}

fn positions_from_rows(rows: Vec<DbPosition>) -> Result<Vec<Position>, DbError> {
    rows.into_iter().map(Position::try_from).collect()
}

impl DbRepository {
    /// Creates a new `DbRepository` with a shared database connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ExecutorStore for DbRepository {
    async fn insert_executor(&self, new: NewExecutor) -> Result<Executor, DbError> {
        let executor = new.into_executor(Uuid::new_v4());
        let sql = format!(
            "INSERT INTO executors (id, user_id, name, api_key, secret_hash, metadata, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {EXECUTOR_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbExecutor>(&sql)
            .bind(executor.id)
            .bind(executor.user_id)
            .bind(&executor.name)
            .bind(&executor.api_key)
            .bind(&executor.secret_hash)
            .bind(serde_json::to_value(&executor.metadata)?)
            .bind(executor.created_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_executor(&self, id: Uuid) -> Result<Executor, DbError> {
        let sql = format!(
            "SELECT {EXECUTOR_COLUMNS} FROM executors WHERE id = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, DbExecutor>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found)?;
        row.try_into()
    }

    async fn find_executor_by_api_key(&self, api_key: &str) -> Result<Executor, DbError> {
        let sql = format!(
            "SELECT {EXECUTOR_COLUMNS} FROM executors WHERE api_key = $1 AND deleted_at IS NULL"
        );
        let row = sqlx::query_as::<_, DbExecutor>(&sql)
            .bind(api_key)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found)?;
        row.try_into()
    }

    async fn list_executors(&self, user_id: Uuid) -> Result<Vec<Executor>, DbError> {
        let sql = format!(
            "SELECT {EXECUTOR_COLUMNS} FROM executors \
             WHERE user_id = $1 AND deleted_at IS NULL ORDER BY created_at"
        );
        let rows = sqlx::query_as::<_, DbExecutor>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Executor::try_from).collect()
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reported_status: Option<ExecutorStatus>,
        metadata: Option<HeartbeatMetadata>,
    ) -> Result<Executor, DbError> {
        let metadata = metadata.map(|m| serde_json::to_value(&m)).transpose()?;
        let sql = format!(
            "UPDATE executors SET last_heartbeat = $2, reported_status = $3, \
             metadata = COALESCE($4, metadata) \
             WHERE id = $1 AND deleted_at IS NULL RETURNING {EXECUTOR_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbExecutor>(&sql)
            .bind(id)
            .bind(at)
            .bind(reported_status.map(|s| s.as_str()))
            .bind(metadata)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found)?;
        row.try_into()
    }

    async fn soft_delete_executor(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
        let done = sqlx::query(
            "UPDATE executors SET deleted_at = $2 WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if done.rows_affected() == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    async fn users_active_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>, DbError> {
        let users = sqlx::query_scalar::<_, Uuid>(
            "SELECT DISTINCT user_id FROM executors \
             WHERE deleted_at IS NULL AND last_heartbeat >= $1 ORDER BY user_id",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(users)
    }
}

#[async_trait]
impl CommandStore for DbRepository {
    async fn insert_command(&self, new: NewCommand) -> Result<Command, DbError> {
        let sql = format!(
            "INSERT INTO commands (id, user_id, executor_id, command, parameters, priority, \
             status, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, 'pending', $7, $8) RETURNING {COMMAND_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbCommand>(&sql)
            .bind(Uuid::new_v4())
            .bind(new.user_id)
            .bind(new.executor_id)
            .bind(new.payload.kind().as_str())
            .bind(new.payload.parameters())
            .bind(new.priority.rank())
            .bind(new.created_at)
            .bind(new.expires_at)
            .fetch_one(&self.pool)
            .await?;
        row.try_into()
    }

    async fn get_command(&self, id: Uuid) -> Result<Command, DbError> {
        let sql = format!("SELECT {COMMAND_COLUMNS} FROM commands WHERE id = $1");
        let row = sqlx::query_as::<_, DbCommand>(&sql)
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found)?;
        row.try_into()
    }

    async fn list_commands(
        &self,
        executor_id: Uuid,
        status: Option<CommandStatus>,
        limit: u32,
    ) -> Result<Vec<Command>, DbError> {
        let sql = format!(
            "SELECT {COMMAND_COLUMNS} FROM commands \
             WHERE executor_id = $1 AND ($2::TEXT IS NULL OR status = $2) \
             ORDER BY created_at DESC, seq DESC LIMIT $3"
        );
        let rows = sqlx::query_as::<_, DbCommand>(&sql)
            .bind(executor_id)
            .bind(status.map(|s| s.as_str()))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        commands_from_rows(rows)
    }

    async fn claim_pending(
        &self,
        executor_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Command>, DbError> {
        // SKIP LOCKED keeps a concurrent heartbeat from blocking on, or
        // re-claiming, rows another transaction is claiming.
        let sql = format!(
            "UPDATE commands SET acknowledged_at = $2 \
             WHERE id IN ( \
                 SELECT id FROM commands \
                 WHERE executor_id = $1 AND status = 'pending' AND acknowledged_at IS NULL \
                   AND (expires_at IS NULL OR expires_at > $2) \
                 ORDER BY priority DESC, created_at ASC, seq ASC \
                 LIMIT $3 \
                 FOR UPDATE SKIP LOCKED \
             ) AND acknowledged_at IS NULL \
             RETURNING {COMMAND_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, DbCommand>(&sql)
            .bind(executor_id)
            .bind(now)
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;

        // RETURNING does not preserve the subquery's order.
        let mut claimed = commands_from_rows(rows)?;
        claimed.sort_by_key(|c| (Reverse(c.priority), c.created_at, c.sequence));
        Ok(claimed)
    }

    async fn transition_command(
        &self,
        id: Uuid,
        executor_id: Uuid,
        to: CommandStatus,
        result: Option<JsonValue>,
        at: DateTime<Utc>,
    ) -> Result<Command, DbError> {
        let allowed: Vec<String> = to
            .allowed_predecessors()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let sql = format!(
            "UPDATE commands SET status = $3, result = COALESCE($4, result), \
             acknowledged_at = COALESCE(acknowledged_at, $5), \
             executed_at = CASE WHEN $6 THEN $5 ELSE executed_at END \
             WHERE id = $1 AND executor_id = $2 AND status = ANY($7) \
             RETURNING {COMMAND_COLUMNS}"
        );
        let updated = sqlx::query_as::<_, DbCommand>(&sql)
            .bind(id)
            .bind(executor_id)
            .bind(to.as_str())
            .bind(result)
            .bind(at)
            .bind(to.is_terminal())
            .bind(allowed)
            .fetch_optional(&self.pool)
            .await?;

        match updated {
            Some(row) => row.try_into(),
            None => {
                // Nothing matched: tell a missing or foreign command apart from a conflict.
                let current = self.get_command(id).await?;
                if current.executor_id != executor_id {
                    return Err(DbError::NotFound);
                }
                Err(DbError::Conflict {
                    current: current.status,
                })
            }
        }
    }

    async fn fail_expired(&self, now: DateTime<Utc>) -> Result<Vec<Command>, DbError> {
        let sql = format!(
            "UPDATE commands SET status = 'failed', result = $2, executed_at = $1 \
             WHERE status = 'pending' AND acknowledged_at IS NULL \
               AND expires_at IS NOT NULL AND expires_at <= $1 \
             RETURNING {COMMAND_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, DbCommand>(&sql)
            .bind(now)
            .bind(expired_result())
            .fetch_all(&self.pool)
            .await?;
        let mut failed = commands_from_rows(rows)?;
        failed.sort_by_key(|c| c.sequence);
        Ok(failed)
    }

    async fn fail_unreported(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Command>, DbError> {
        let sql = format!(
            "UPDATE commands SET status = 'failed', result = $3, executed_at = $2 \
             WHERE status IN ('pending', 'acknowledged') \
               AND acknowledged_at IS NOT NULL AND acknowledged_at <= $1 \
             RETURNING {COMMAND_COLUMNS}"
        );
        let rows = sqlx::query_as::<_, DbCommand>(&sql)
            .bind(claimed_before)
            .bind(now)
            .bind(unreported_result())
            .fetch_all(&self.pool)
            .await?;
        let mut failed = commands_from_rows(rows)?;
        failed.sort_by_key(|c| c.sequence);
        Ok(failed)
    }
}

#[async_trait]
impl PositionStore for DbRepository {
    async fn upsert_position(&self, position: Position) -> Result<Position, DbError> {
        let sql = format!(
            "INSERT INTO positions ({POSITION_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, NULL, NULL, $11, $12, $13, $14, $15) \
             ON CONFLICT (executor_id, ticket) DO UPDATE SET \
                 strategy_id = EXCLUDED.strategy_id, symbol = EXCLUDED.symbol, \
                 direction = EXCLUDED.direction, lots = EXCLUDED.lots, \
                 open_price = EXCLUDED.open_price, open_time = EXCLUDED.open_time, \
                 stop_loss = EXCLUDED.stop_loss, take_profit = EXCLUDED.take_profit, \
                 profit = EXCLUDED.profit, commission = EXCLUDED.commission, swap = EXCLUDED.swap \
             WHERE positions.close_time IS NULL \
             RETURNING {POSITION_COLUMNS}"
        );
        let upserted = sqlx::query_as::<_, DbPosition>(&sql)
            .bind(position.id)
            .bind(position.user_id)
            .bind(position.executor_id)
            .bind(position.ticket)
            .bind(&position.strategy_id)
            .bind(&position.symbol)
            .bind(position.direction.as_str())
            .bind(position.lots)
            .bind(position.open_price)
            .bind(position.open_time)
            .bind(position.stop_loss)
            .bind(position.take_profit)
            .bind(position.profit)
            .bind(position.commission)
            .bind(position.swap)
            .fetch_optional(&self.pool)
            .await?;

        match upserted {
            Some(row) => row.try_into(),
            None => {
                // The ticket exists and is closed; leave it alone.
                let sql = format!(
                    "SELECT {POSITION_COLUMNS} FROM positions WHERE executor_id = $1 AND ticket = $2"
                );
                let row = sqlx::query_as::<_, DbPosition>(&sql)
                    .bind(position.executor_id)
                    .bind(position.ticket)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(not_found)?;
                row.try_into()
            }
        }
    }

    async fn close_position(
        &self,
        executor_id: Uuid,
        ticket: i64,
        close: TradeClose,
        at: DateTime<Utc>,
    ) -> Result<Position, DbError> {
        let sql = format!(
            "UPDATE positions SET close_price = $3, close_time = $4, profit = $5, \
             commission = COALESCE($6, commission), swap = COALESCE($7, swap) \
             WHERE executor_id = $1 AND ticket = $2 RETURNING {POSITION_COLUMNS}"
        );
        let row = sqlx::query_as::<_, DbPosition>(&sql)
            .bind(executor_id)
            .bind(ticket)
            .bind(close.close_price)
            .bind(close.close_time.unwrap_or(at))
            .bind(close.profit)
            .bind(close.commission)
            .bind(close.swap)
            .fetch_one(&self.pool)
            .await
            .map_err(not_found)?;
        row.try_into()
    }

    async fn open_positions_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, DbError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE user_id = $1 AND close_time IS NULL ORDER BY open_time"
        );
        let rows = sqlx::query_as::<_, DbPosition>(&sql)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;
        positions_from_rows(rows)
    }

    async fn count_open_positions(&self, executor_id: Uuid) -> Result<i64, DbError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM positions WHERE executor_id = $1 AND close_time IS NULL",
        )
        .bind(executor_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn trades_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>, DbError> {
        let sql = format!(
            "SELECT {POSITION_COLUMNS} FROM positions \
             WHERE user_id = $1 AND (open_time >= $2 OR close_time >= $2) ORDER BY open_time"
        );
        let rows = sqlx::query_as::<_, DbPosition>(&sql)
            .bind(user_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        positions_from_rows(rows)
    }
}

#[async_trait]
impl AuditLog for DbRepository {
    async fn append_audit(&self, record: AuditRecord) -> Result<(), DbError> {
        sqlx::query(
            "INSERT INTO audit_log (id, actor, action, executor_count, command_ids, detail, recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id)
        .bind(record.actor)
        .bind(&record.action)
        .bind(record.executor_count)
        .bind(&record.command_ids)
        .bind(&record.detail)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_audit(&self, actor: Uuid, limit: u32) -> Result<Vec<AuditRecord>, DbError> {
        let rows = sqlx::query_as::<_, DbAuditRecord>(
            "SELECT id, actor, action, executor_count, command_ids, detail, recorded_at \
             FROM audit_log WHERE actor = $1 ORDER BY recorded_at DESC LIMIT $2",
        )
        .bind(actor)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(AuditRecord::from).collect())
    }
}
