use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Append-only trail of control actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: Uuid,
    pub actor: Uuid,
    pub action: String,
    pub executor_count: i32,
    pub command_ids: Vec<Uuid>,
    pub detail: Value,
    pub recorded_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(actor: Uuid, action: impl Into<String>, recorded_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            actor,
            action: action.into(),
            executor_count: 0,
            command_ids: Vec::new(),
            detail: Value::Null,
            recorded_at,
        }
    }

    pub fn with_commands(mut self, executor_count: usize, command_ids: Vec<Uuid>) -> Self {
        self.executor_count = i32::try_from(executor_count).unwrap_or(i32::MAX);
        self.command_ids = command_ids;
        self
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}
