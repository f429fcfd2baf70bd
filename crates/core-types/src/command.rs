use crate::enums::{CommandKind, CommandPriority, CommandStatus, TradeDirection};
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// --- Parameter shapes ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PositionTarget {
    pub ticket: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OpenPositionParams {
    pub symbol: String,
    pub direction: TradeDirection,
    pub lots: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModifyPositionParams {
    pub ticket: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StrategyTarget {
    pub strategy_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateStrategyParams {
    pub strategy_id: String,
    pub config: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SymbolTarget {
    pub symbol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EmergencyStopParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The untyped `{ "command": ..., "parameters": ... }` form used on the wire
/// and in storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawCommand {
    pub command: CommandKind,
    #[serde(default)]
    pub parameters: Value,
}

/// A command together with its typed parameters.
///
/// Values of this type are always valid: deserialization goes through
/// [`CommandPayload::from_parts`], which rejects unknown fields, missing
/// fields and out-of-range values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCommand", into = "RawCommand")]
pub enum CommandPayload {
    StopAll,
    Pause,
    Resume,
    CloseAllPositions,
    ClosePosition(PositionTarget),
    OpenPosition(OpenPositionParams),
    ModifyPosition(ModifyPositionParams),
    GetStatus,
    Restart,
    StartStrategy(StrategyTarget),
    StopStrategy(StrategyTarget),
    PauseStrategy(StrategyTarget),
    ResumeStrategy(StrategyTarget),
    UpdateStrategy(UpdateStrategyParams),
    CloseProfitable,
    CloseLosing,
    CloseByStrategy(StrategyTarget),
    CloseBySymbol(SymbolTarget),
    EmergencyStop(EmergencyStopParams),
}

impl CommandPayload {
    pub fn emergency_stop(reason: Option<String>) -> Self {
        CommandPayload::EmergencyStop(EmergencyStopParams { reason })
    }

    /// Builds a typed payload from a kind and its JSON parameters, then validates it.
    pub fn from_parts(kind: CommandKind, parameters: Value) -> Result<Self, CoreError> {
        let payload = match kind {
            CommandKind::StopAll => no_parameters(kind, parameters, CommandPayload::StopAll)?,
            CommandKind::Pause => no_parameters(kind, parameters, CommandPayload::Pause)?,
            CommandKind::Resume => no_parameters(kind, parameters, CommandPayload::Resume)?,
            CommandKind::CloseAllPositions => {
                no_parameters(kind, parameters, CommandPayload::CloseAllPositions)?
            }
            CommandKind::GetStatus => no_parameters(kind, parameters, CommandPayload::GetStatus)?,
            CommandKind::Restart => no_parameters(kind, parameters, CommandPayload::Restart)?,
            CommandKind::CloseProfitable => {
                no_parameters(kind, parameters, CommandPayload::CloseProfitable)?
            }
            CommandKind::CloseLosing => {
                no_parameters(kind, parameters, CommandPayload::CloseLosing)?
            }
            CommandKind::ClosePosition => {
                CommandPayload::ClosePosition(parse_parameters(kind, parameters)?)
            }
            CommandKind::OpenPosition => {
                CommandPayload::OpenPosition(parse_parameters(kind, parameters)?)
            }
            CommandKind::ModifyPosition => {
                CommandPayload::ModifyPosition(parse_parameters(kind, parameters)?)
            }
            CommandKind::StartStrategy => {
                CommandPayload::StartStrategy(parse_parameters(kind, parameters)?)
            }
            CommandKind::StopStrategy => {
                CommandPayload::StopStrategy(parse_parameters(kind, parameters)?)
            }
            CommandKind::PauseStrategy => {
                CommandPayload::PauseStrategy(parse_parameters(kind, parameters)?)
            }
            CommandKind::ResumeStrategy => {
                CommandPayload::ResumeStrategy(parse_parameters(kind, parameters)?)
            }
            CommandKind::UpdateStrategy => {
                CommandPayload::UpdateStrategy(parse_parameters(kind, parameters)?)
            }
            CommandKind::CloseByStrategy => {
                CommandPayload::CloseByStrategy(parse_parameters(kind, parameters)?)
            }
            CommandKind::CloseBySymbol => {
                CommandPayload::CloseBySymbol(parse_parameters(kind, parameters)?)
            }
            CommandKind::EmergencyStop => {
                CommandPayload::EmergencyStop(parse_parameters(kind, parameters)?)
            }
        };
        payload.validate()?;
        Ok(payload)
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            CommandPayload::StopAll => CommandKind::StopAll,
            CommandPayload::Pause => CommandKind::Pause,
            CommandPayload::Resume => CommandKind::Resume,
            CommandPayload::CloseAllPositions => CommandKind::CloseAllPositions,
            CommandPayload::ClosePosition(_) => CommandKind::ClosePosition,
            CommandPayload::OpenPosition(_) => CommandKind::OpenPosition,
            CommandPayload::ModifyPosition(_) => CommandKind::ModifyPosition,
            CommandPayload::GetStatus => CommandKind::GetStatus,
            CommandPayload::Restart => CommandKind::Restart,
            CommandPayload::StartStrategy(_) => CommandKind::StartStrategy,
            CommandPayload::StopStrategy(_) => CommandKind::StopStrategy,
            CommandPayload::PauseStrategy(_) => CommandKind::PauseStrategy,
            CommandPayload::ResumeStrategy(_) => CommandKind::ResumeStrategy,
            CommandPayload::UpdateStrategy(_) => CommandKind::UpdateStrategy,
            CommandPayload::CloseProfitable => CommandKind::CloseProfitable,
            CommandPayload::CloseLosing => CommandKind::CloseLosing,
            CommandPayload::CloseByStrategy(_) => CommandKind::CloseByStrategy,
            CommandPayload::CloseBySymbol(_) => CommandKind::CloseBySymbol,
            CommandPayload::EmergencyStop(_) => CommandKind::EmergencyStop,
        }
    }

    /// The parameters as a JSON object. Kinds without parameters yield `{}`.
    pub fn parameters(&self) -> Value {
        let value = match self {
            CommandPayload::ClosePosition(p) => serde_json::to_value(p),
            CommandPayload::OpenPosition(p) => serde_json::to_value(p),
            CommandPayload::ModifyPosition(p) => serde_json::to_value(p),
            CommandPayload::StartStrategy(p)
            | CommandPayload::StopStrategy(p)
            | CommandPayload::PauseStrategy(p)
            | CommandPayload::ResumeStrategy(p)
            | CommandPayload::CloseByStrategy(p) => serde_json::to_value(p),
            CommandPayload::UpdateStrategy(p) => serde_json::to_value(p),
            CommandPayload::CloseBySymbol(p) => serde_json::to_value(p),
            CommandPayload::EmergencyStop(p) => serde_json::to_value(p),
            CommandPayload::StopAll
            | CommandPayload::Pause
            | CommandPayload::Resume
            | CommandPayload::CloseAllPositions
            | CommandPayload::GetStatus
            | CommandPayload::Restart
            | CommandPayload::CloseProfitable
            | CommandPayload::CloseLosing => Ok(Value::Object(Map::new())),
        };
        value.unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// Range and presence checks that serde alone cannot express.
    pub fn validate(&self) -> Result<(), CoreError> {
        match self {
            CommandPayload::ClosePosition(p) => check_ticket(p.ticket),
            CommandPayload::OpenPosition(p) => {
                check_not_blank("symbol", &p.symbol)?;
                if p.lots <= Decimal::ZERO {
                    return Err(invalid("lots", "must be greater than zero"));
                }
                if let Some(strategy_id) = &p.strategy_id {
                    check_not_blank("strategyId", strategy_id)?;
                }
                Ok(())
            }
            CommandPayload::ModifyPosition(p) => {
                check_ticket(p.ticket)?;
                if p.stop_loss.is_none() && p.take_profit.is_none() {
                    return Err(invalid(
                        "parameters",
                        "MODIFY_POSITION needs stopLoss or takeProfit",
                    ));
                }
                Ok(())
            }
            CommandPayload::StartStrategy(p)
            | CommandPayload::StopStrategy(p)
            | CommandPayload::PauseStrategy(p)
            | CommandPayload::ResumeStrategy(p)
            | CommandPayload::CloseByStrategy(p) => check_not_blank("strategyId", &p.strategy_id),
            CommandPayload::UpdateStrategy(p) => {
                check_not_blank("strategyId", &p.strategy_id)?;
                if !p.config.is_object() {
                    return Err(invalid("config", "must be a JSON object"));
                }
                Ok(())
            }
            CommandPayload::CloseBySymbol(p) => check_not_blank("symbol", &p.symbol),
            CommandPayload::StopAll
            | CommandPayload::Pause
            | CommandPayload::Resume
            | CommandPayload::CloseAllPositions
            | CommandPayload::GetStatus
            | CommandPayload::Restart
            | CommandPayload::CloseProfitable
            | CommandPayload::CloseLosing
            | CommandPayload::EmergencyStop(_) => Ok(()),
        }
    }
}

impl TryFrom<RawCommand> for CommandPayload {
    type Error = CoreError;

    fn try_from(raw: RawCommand) -> Result<Self, Self::Error> {
        CommandPayload::from_parts(raw.command, raw.parameters)
    }
}

impl From<CommandPayload> for RawCommand {
    fn from(payload: CommandPayload) -> Self {
        RawCommand {
            command: payload.kind(),
            parameters: payload.parameters(),
        }
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> CoreError {
    CoreError::InvalidInput(field.to_string(), reason.into())
}

fn check_ticket(ticket: i64) -> Result<(), CoreError> {
    if ticket <= 0 {
        return Err(invalid("ticket", "must be a positive integer"));
    }
    Ok(())
}

fn check_not_blank(field: &str, value: &str) -> Result<(), CoreError> {
    if value.trim().is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    Ok(())
}

fn no_parameters(
    kind: CommandKind,
    parameters: Value,
    payload: CommandPayload,
) -> Result<CommandPayload, CoreError> {
    match parameters {
        Value::Null => Ok(payload),
        Value::Object(map) if map.is_empty() => Ok(payload),
        _ => Err(invalid("parameters", format!("{kind} takes no parameters"))),
    }
}

fn parse_parameters<T: DeserializeOwned>(kind: CommandKind, parameters: Value) -> Result<T, CoreError> {
    // A missing parameter document is treated like an empty one so that
    // all-optional shapes (EMERGENCY_STOP) accept it.
    let parameters = match parameters {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    serde_json::from_value(parameters)
        .map_err(|e| invalid("parameters", format!("invalid parameters for {kind}: {e}")))
}

// --- Command record ---

/// A single instruction targeted at one executor, tracked through its lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub id: Uuid,
    pub user_id: Uuid,
    pub executor_id: Uuid,
    #[serde(flatten)]
    pub payload: CommandPayload,
    pub priority: CommandPriority,
    pub status: CommandStatus,
    pub result: Option<Value>,
    /// Store-assigned, strictly increasing. Final FIFO tie-break.
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    /// Set when a heartbeat claims the command for delivery.
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        self.payload.kind()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn is_claimed(&self) -> bool {
        self.acknowledged_at.is_some()
    }

    /// Whether a heartbeat at `now` may claim this command.
    pub fn is_deliverable(&self, now: DateTime<Utc>) -> bool {
        self.status == CommandStatus::Pending && !self.is_claimed() && !self.is_expired(now)
    }
}

/// Everything the caller decides about a new command. The store assigns the
/// id and sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCommand {
    pub user_id: Uuid,
    pub executor_id: Uuid,
    pub payload: CommandPayload,
    pub priority: CommandPriority,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewCommand {
    /// Materializes the record a store persists: fresh id, `pending`, unclaimed.
    pub fn into_command(self, id: Uuid, sequence: i64) -> Command {
        Command {
            id,
            user_id: self.user_id,
            executor_id: self.executor_id,
            payload: self.payload,
            priority: self.priority,
            status: CommandStatus::Pending,
            result: None,
            sequence,
            created_at: self.created_at,
            acknowledged_at: None,
            executed_at: None,
            expires_at: self.expires_at,
        }
    }
}
