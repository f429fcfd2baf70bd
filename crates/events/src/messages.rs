use chrono::{DateTime, Utc};
use core_types::{
    Command, CommandKind, CommandPriority, CommandStatus, Severity, ViolationKind,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A command as handed to an agent, either pushed or carried by a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandDelivery {
    pub id: Uuid,
    pub command: CommandKind,
    pub parameters: Value,
    pub priority: CommandPriority,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<&Command> for CommandDelivery {
    fn from(command: &Command) -> Self {
        Self {
            id: command.id,
            command: command.kind(),
            parameters: command.payload.parameters(),
            priority: command.priority,
            created_at: command.created_at,
            expires_at: command.expires_at,
        }
    }
}

/// Tells the owner a command reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandStatusUpdate {
    pub command_id: Uuid,
    pub executor_id: Uuid,
    pub command: CommandKind,
    pub priority: CommandPriority,
    pub status: CommandStatus,
    pub result: Option<Value>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl From<&Command> for CommandStatusUpdate {
    fn from(command: &Command) -> Self {
        Self {
            command_id: command.id,
            executor_id: command.executor_id,
            command: command.kind(),
            priority: command.priority,
            status: command.status,
            result: command.result.clone(),
            executed_at: command.executed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopNotice {
    pub reason: Option<String>,
    pub executor_count: usize,
    pub command_ids: Vec<Uuid>,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViolationNotice {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
}

/// Periodic risk snapshot, published only when something is in breach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskAlert {
    pub user_id: Uuid,
    pub risk_score: u32,
    pub risk_level: Severity,
    pub violations: Vec<ViolationNotice>,
    pub computed_at: DateTime<Utc>,
}

/// Everything that travels over a fan-out channel.
///
/// Serialized adjacently tagged, with the event name as the tag:
/// `{ "type": "command-received", "payload": { ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum FanoutEvent {
    #[serde(rename = "command-received")]
    CommandReceived(CommandDelivery),
    #[serde(rename = "command-status")]
    CommandStatus(CommandStatusUpdate),
    #[serde(rename = "emergency-stop")]
    EmergencyStop(EmergencyStopNotice),
    #[serde(rename = "risk-update")]
    RiskUpdate(RiskAlert),
    /// Sent once to a new WebSocket subscriber.
    #[serde(rename = "connected")]
    Connected,
}

impl FanoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FanoutEvent::CommandReceived(_) => "command-received",
            FanoutEvent::CommandStatus(_) => "command-status",
            FanoutEvent::EmergencyStop(_) => "emergency-stop",
            FanoutEvent::RiskUpdate(_) => "risk-update",
            FanoutEvent::Connected => "connected",
        }
    }
}
