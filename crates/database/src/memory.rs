use crate::error::DbError;
use crate::store::{
    AuditLog, CommandStore, ExecutorStore, PositionStore, expired_result, unreported_result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{
    AuditRecord, Command, CommandStatus, Executor, ExecutorStatus, HeartbeatMetadata, NewCommand,
    NewExecutor, Position, TradeClose,
};
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    executors: HashMap<Uuid, Executor>,
    commands: HashMap<Uuid, Command>,
    positions: HashMap<Uuid, Position>,
    audit: Vec<AuditRecord>,
    next_sequence: i64,
}

impl Inner {
    fn live_executor(&self, id: Uuid) -> Result<&Executor, DbError> {
        self.executors
            .get(&id)
            .filter(|e| !e.is_deleted())
            .ok_or(DbError::NotFound)
    }
}

/// A store that keeps everything in process memory.
///
/// All state sits behind one lock, so each operation is a single critical
/// section and claims and transitions are as atomic as their SQL
/// counterparts. Used by `serve --in-memory` and by the test suites.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn delivery_order(commands: &mut [Command]) {
    commands.sort_by_key(|c| (Reverse(c.priority), c.created_at, c.sequence));
}

#[async_trait]
impl ExecutorStore for MemoryStore {
    async fn insert_executor(&self, new: NewExecutor) -> Result<Executor, DbError> {
        let mut inner = self.inner.lock().await;
        let executor = new.into_executor(Uuid::new_v4());
        inner.executors.insert(executor.id, executor.clone());
        Ok(executor)
    }

    async fn get_executor(&self, id: Uuid) -> Result<Executor, DbError> {
        let inner = self.inner.lock().await;
        inner.live_executor(id).cloned()
    }

    async fn find_executor_by_api_key(&self, api_key: &str) -> Result<Executor, DbError> {
        let inner = self.inner.lock().await;
        inner
            .executors
            .values()
            .find(|e| !e.is_deleted() && e.api_key == api_key)
            .cloned()
            .ok_or(DbError::NotFound)
    }

    async fn list_executors(&self, user_id: Uuid) -> Result<Vec<Executor>, DbError> {
        let inner = self.inner.lock().await;
        let mut executors: Vec<Executor> = inner
            .executors
            .values()
            .filter(|e| !e.is_deleted() && e.user_id == user_id)
            .cloned()
            .collect();
        executors.sort_by_key(|e| e.created_at);
        Ok(executors)
    }

    async fn record_heartbeat(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        reported_status: Option<ExecutorStatus>,
        metadata: Option<HeartbeatMetadata>,
    ) -> Result<Executor, DbError> {
        let mut inner = self.inner.lock().await;
        let executor = inner
            .executors
            .get_mut(&id)
            .filter(|e| !e.is_deleted())
            .ok_or(DbError::NotFound)?;
        executor.last_heartbeat = Some(at);
        executor.reported_status = reported_status;
        if let Some(metadata) = metadata {
            executor.metadata = metadata;
        }
        Ok(executor.clone())
    }

    async fn soft_delete_executor(&self, id: Uuid, at: DateTime<Utc>) -> Result<(), DbError> {
        let mut inner = self.inner.lock().await;
        let executor = inner
            .executors
            .get_mut(&id)
            .filter(|e| !e.is_deleted())
            .ok_or(DbError::NotFound)?;
        executor.deleted_at = Some(at);
        Ok(())
    }

    async fn users_active_since(&self, since: DateTime<Utc>) -> Result<Vec<Uuid>, DbError> {
        let inner = self.inner.lock().await;
        let mut users: Vec<Uuid> = inner
            .executors
            .values()
            .filter(|e| !e.is_deleted() && e.last_heartbeat.is_some_and(|at| at >= since))
            .map(|e| e.user_id)
            .collect();
        users.sort();
        users.dedup();
        Ok(users)
    }
}

#[async_trait]
impl CommandStore for MemoryStore {
    async fn insert_command(&self, new: NewCommand) -> Result<Command, DbError> {
        let mut inner = self.inner.lock().await;
        inner.live_executor(new.executor_id)?;
        inner.next_sequence += 1;
        let command = new.into_command(Uuid::new_v4(), inner.next_sequence);
        inner.commands.insert(command.id, command.clone());
        Ok(command)
    }

    async fn get_command(&self, id: Uuid) -> Result<Command, DbError> {
        let inner = self.inner.lock().await;
        inner.commands.get(&id).cloned().ok_or(DbError::NotFound)
    }

    async fn list_commands(
        &self,
        executor_id: Uuid,
        status: Option<CommandStatus>,
        limit: u32,
    ) -> Result<Vec<Command>, DbError> {
        let inner = self.inner.lock().await;
        let mut commands: Vec<Command> = inner
            .commands
            .values()
            .filter(|c| c.executor_id == executor_id)
            .filter(|c| status.is_none_or(|s| c.status == s))
            .cloned()
            .collect();
        commands.sort_by_key(|c| Reverse((c.created_at, c.sequence)));
        commands.truncate(limit as usize);
        Ok(commands)
    }

    async fn claim_pending(
        &self,
        executor_id: Uuid,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Command>, DbError> {
        let mut inner = self.inner.lock().await;
        let mut deliverable: Vec<Command> = inner
            .commands
            .values()
            .filter(|c| c.executor_id == executor_id && c.is_deliverable(now))
            .cloned()
            .collect();
        delivery_order(&mut deliverable);
        deliverable.truncate(limit as usize);

        for command in &mut deliverable {
            command.acknowledged_at = Some(now);
            if let Some(stored) = inner.commands.get_mut(&command.id) {
                stored.acknowledged_at = Some(now);
            }
        }
        Ok(deliverable)
    }

    async fn transition_command(
        &self,
        id: Uuid,
        executor_id: Uuid,
        to: CommandStatus,
        result: Option<Value>,
        at: DateTime<Utc>,
    ) -> Result<Command, DbError> {
        let mut inner = self.inner.lock().await;
        let command = inner
            .commands
            .get_mut(&id)
            .filter(|c| c.executor_id == executor_id)
            .ok_or(DbError::NotFound)?;

        if !command.status.can_transition_to(to) {
            return Err(DbError::Conflict {
                current: command.status,
            });
        }
        command.status = to;
        if result.is_some() {
            command.result = result;
        }
        command.acknowledged_at.get_or_insert(at);
        if to.is_terminal() {
            command.executed_at = Some(at);
        }
        Ok(command.clone())
    }

    async fn fail_expired(&self, now: DateTime<Utc>) -> Result<Vec<Command>, DbError> {
        let mut inner = self.inner.lock().await;
        let mut failed = Vec::new();
        for command in inner.commands.values_mut() {
            if command.status == CommandStatus::Pending
                && !command.is_claimed()
                && command.is_expired(now)
            {
                command.status = CommandStatus::Failed;
                command.result = Some(expired_result());
                command.executed_at = Some(now);
                failed.push(command.clone());
            }
        }
        failed.sort_by_key(|c| c.sequence);
        Ok(failed)
    }

    async fn fail_unreported(
        &self,
        claimed_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Command>, DbError> {
        let mut inner = self.inner.lock().await;
        let mut failed = Vec::new();
        for command in inner.commands.values_mut() {
            let stale_claim = command.acknowledged_at.is_some_and(|at| at <= claimed_before);
            if !command.status.is_terminal() && stale_claim {
                command.status = CommandStatus::Failed;
                command.result = Some(unreported_result());
                command.executed_at = Some(now);
                failed.push(command.clone());
            }
        }
        failed.sort_by_key(|c| c.sequence);
        Ok(failed)
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn upsert_position(&self, position: Position) -> Result<Position, DbError> {
        let mut inner = self.inner.lock().await;
        let existing = inner
            .positions
            .values_mut()
            .find(|p| p.executor_id == position.executor_id && p.ticket == position.ticket);

        match existing {
            Some(stored) if !stored.is_open() => Ok(stored.clone()),
            Some(stored) => {
                let id = stored.id;
                *stored = Position { id, ..position };
                Ok(stored.clone())
            }
            None => {
                inner.positions.insert(position.id, position.clone());
                Ok(position)
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
        let mut inner = self.inner.lock().await;
        let stored = inner
            .positions
            .values_mut()
            .find(|p| p.executor_id == executor_id && p.ticket == ticket)
            .ok_or(DbError::NotFound)?;

        stored.close_price = Some(close.close_price);
        stored.close_time = Some(close.close_time.unwrap_or(at));
        stored.profit = close.profit;
        if let Some(commission) = close.commission {
            stored.commission = commission;
        }
        if let Some(swap) = close.swap {
            stored.swap = swap;
        }
        Ok(stored.clone())
    }

    async fn open_positions_for_user(&self, user_id: Uuid) -> Result<Vec<Position>, DbError> {
        let inner = self.inner.lock().await;
        let mut open: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.user_id == user_id && p.is_open())
            .cloned()
            .collect();
        open.sort_by_key(|p| p.open_time);
        Ok(open)
    }

    async fn count_open_positions(&self, executor_id: Uuid) -> Result<i64, DbError> {
        let inner = self.inner.lock().await;
        let count = inner
            .positions
            .values()
            .filter(|p| p.executor_id == executor_id && p.is_open())
            .count();
        Ok(count as i64)
    }

    async fn trades_since(
        &self,
        user_id: Uuid,
        since: DateTime<Utc>,
    ) -> Result<Vec<Position>, DbError> {
        let inner = self.inner.lock().await;
        let mut trades: Vec<Position> = inner
            .positions
            .values()
            .filter(|p| p.user_id == user_id)
            .filter(|p| p.open_time >= since || p.close_time.is_some_and(|t| t >= since))
            .cloned()
            .collect();
        trades.sort_by_key(|p| p.open_time);
        Ok(trades)
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append_audit(&self, record: AuditRecord) -> Result<(), DbError> {
        self.inner.lock().await.audit.push(record);
        Ok(())
    }

    async fn list_audit(&self, actor: Uuid, limit: u32) -> Result<Vec<AuditRecord>, DbError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .audit
            .iter()
            .rev()
            .filter(|r| r.actor == actor)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use core_types::{CommandPayload, CommandPriority};

    async fn executor(store: &MemoryStore) -> Executor {
        store
            .insert_executor(NewExecutor {
                user_id: Uuid::new_v4(),
                name: "vps-1".into(),
                api_key: Uuid::new_v4().to_string(),
                secret_hash: "hash".into(),
                created_at: Utc::now(),
            })
            .await
            .unwrap()
    }

    fn new_command(executor: &Executor, priority: CommandPriority, at: DateTime<Utc>) -> NewCommand {
        NewCommand {
            user_id: executor.user_id,
            executor_id: executor.id,
            payload: CommandPayload::GetStatus,
            priority,
            created_at: at,
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age_then_sequence() {
        let store = MemoryStore::new();
        let exec = executor(&store).await;
        let t0 = Utc::now();

        let normal = store.insert_command(new_command(&exec, CommandPriority::Normal, t0)).await.unwrap();
        let urgent_early = store
            .insert_command(new_command(&exec, CommandPriority::Urgent, t0 + Duration::seconds(1)))
            .await
            .unwrap();
        let low = store
            .insert_command(new_command(&exec, CommandPriority::Low, t0 + Duration::seconds(2)))
            .await
            .unwrap();
        let urgent_late = store
            .insert_command(new_command(&exec, CommandPriority::Urgent, t0 + Duration::seconds(3)))
            .await
            .unwrap();

        let claimed = store.claim_pending(exec.id, t0 + Duration::seconds(5), 10).await.unwrap();
        let ids: Vec<Uuid> = claimed.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![urgent_early.id, urgent_late.id, normal.id, low.id]);
        assert!(claimed.iter().all(|c| c.status == CommandStatus::Pending && c.is_claimed()));

        // a second pull finds nothing left
        let again = store.claim_pending(exec.id, t0 + Duration::seconds(6), 10).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn claim_respects_the_batch_limit() {
        let store = MemoryStore::new();
        let exec = executor(&store).await;
        let now = Utc::now();
        for _ in 0..3 {
            store.insert_command(new_command(&exec, CommandPriority::Normal, now)).await.unwrap();
        }

        assert_eq!(store.claim_pending(exec.id, now, 2).await.unwrap().len(), 2);
        assert_eq!(store.claim_pending(exec.id, now, 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn transitions_are_conditional() {
        let store = MemoryStore::new();
        let exec = executor(&store).await;
        let now = Utc::now();
        let cmd = store.insert_command(new_command(&exec, CommandPriority::High, now)).await.unwrap();

        let executed = store
            .transition_command(cmd.id, exec.id, CommandStatus::Executed, Some(Value::Bool(true)), now)
            .await
            .unwrap();
        assert_eq!(executed.status, CommandStatus::Executed);
        assert_eq!(executed.executed_at, Some(now));

        let err = store
            .transition_command(cmd.id, exec.id, CommandStatus::Failed, None, now)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict { current: CommandStatus::Executed }));

        let stored = store.get_command(cmd.id).await.unwrap();
        assert_eq!(stored.status, CommandStatus::Executed);
        assert_eq!(stored.result, Some(Value::Bool(true)));

        let foreign = store
            .transition_command(cmd.id, Uuid::new_v4(), CommandStatus::Failed, None, now)
            .await
            .unwrap_err();
        assert!(matches!(foreign, DbError::NotFound));
    }

    #[tokio::test]
    async fn expired_commands_are_skipped_then_failed() {
        let store = MemoryStore::new();
        let exec = executor(&store).await;
        let now = Utc::now();
        let mut new = new_command(&exec, CommandPriority::Urgent, now);
        new.expires_at = Some(now + Duration::seconds(10));
        let cmd = store.insert_command(new).await.unwrap();

        let later = now + Duration::seconds(11);
        assert!(store.claim_pending(exec.id, later, 10).await.unwrap().is_empty());

        let failed = store.fail_expired(later).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, cmd.id);
        assert_eq!(failed[0].result, Some(serde_json::json!({ "error": "expired" })));
        assert!(store.fail_expired(later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claimed_commands_outlive_their_ttl() {
        let store = MemoryStore::new();
        let exec = executor(&store).await;
        let now = Utc::now();
        let mut new = new_command(&exec, CommandPriority::Normal, now);
        new.expires_at = Some(now + Duration::hours(24));
        let cmd = store.insert_command(new).await.unwrap();

        let claimed = store.claim_pending(exec.id, now + Duration::seconds(1), 10).await.unwrap();
        assert_eq!(claimed.len(), 1);

        assert!(store.fail_expired(now + Duration::hours(25)).await.unwrap().is_empty());
        let executed = store
            .transition_command(cmd.id, exec.id, CommandStatus::Executed, None, now + Duration::hours(26))
            .await
            .unwrap();
        assert_eq!(executed.status, CommandStatus::Executed);
    }

    #[tokio::test]
    async fn closed_positions_are_not_reopened_by_a_late_report() {
        use core_types::{TradeDirection, TradeReport};
        use rust_decimal_macros::dec;

        let store = MemoryStore::new();
        let exec = executor(&store).await;
        let now = Utc::now();
        let report = TradeReport {
            ticket: 55,
            symbol: "XAUUSD".into(),
            direction: TradeDirection::Sell,
            lots: dec!(0.5),
            open_price: dec!(2300),
            open_time: now,
            stop_loss: None,
            take_profit: None,
            strategy_id: None,
            profit: dec!(0),
            commission: dec!(0),
            swap: dec!(0),
        };
        store
            .upsert_position(report.clone().into_position(Uuid::new_v4(), exec.user_id, exec.id))
            .await
            .unwrap();
        store
            .close_position(
                exec.id,
                55,
                TradeClose {
                    close_price: dec!(2290),
                    profit: dec!(500),
                    commission: None,
                    swap: None,
                    close_time: None,
                },
                now,
            )
            .await
            .unwrap();

        let late = store
            .upsert_position(report.into_position(Uuid::new_v4(), exec.user_id, exec.id))
            .await
            .unwrap();
        assert!(!late.is_open());
        assert_eq!(store.count_open_positions(exec.id).await.unwrap(), 0);
    }
}
