use crate::error::CoreError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every instruction an executor understands.
///
/// The wire and storage spelling is SCREAMING_SNAKE_CASE (`CLOSE_ALL_POSITIONS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandKind {
    StopAll,
    Pause,
    Resume,
    CloseAllPositions,
    ClosePosition,
    OpenPosition,
    ModifyPosition,
    GetStatus,
    Restart,
    StartStrategy,
    StopStrategy,
    PauseStrategy,
    ResumeStrategy,
    UpdateStrategy,
    CloseProfitable,
    CloseLosing,
    CloseByStrategy,
    CloseBySymbol,
    EmergencyStop,
}

impl CommandKind {
    pub const ALL: [CommandKind; 19] = [
        CommandKind::StopAll,
        CommandKind::Pause,
        CommandKind::Resume,
        CommandKind::CloseAllPositions,
        CommandKind::ClosePosition,
        CommandKind::OpenPosition,
        CommandKind::ModifyPosition,
        CommandKind::GetStatus,
        CommandKind::Restart,
        CommandKind::StartStrategy,
        CommandKind::StopStrategy,
        CommandKind::PauseStrategy,
        CommandKind::ResumeStrategy,
        CommandKind::UpdateStrategy,
        CommandKind::CloseProfitable,
        CommandKind::CloseLosing,
        CommandKind::CloseByStrategy,
        CommandKind::CloseBySymbol,
        CommandKind::EmergencyStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::StopAll => "STOP_ALL",
            CommandKind::Pause => "PAUSE",
            CommandKind::Resume => "RESUME",
            CommandKind::CloseAllPositions => "CLOSE_ALL_POSITIONS",
            CommandKind::ClosePosition => "CLOSE_POSITION",
            CommandKind::OpenPosition => "OPEN_POSITION",
            CommandKind::ModifyPosition => "MODIFY_POSITION",
            CommandKind::GetStatus => "GET_STATUS",
            CommandKind::Restart => "RESTART",
            CommandKind::StartStrategy => "START_STRATEGY",
            CommandKind::StopStrategy => "STOP_STRATEGY",
            CommandKind::PauseStrategy => "PAUSE_STRATEGY",
            CommandKind::ResumeStrategy => "RESUME_STRATEGY",
            CommandKind::UpdateStrategy => "UPDATE_STRATEGY",
            CommandKind::CloseProfitable => "CLOSE_PROFITABLE",
            CommandKind::CloseLosing => "CLOSE_LOSING",
            CommandKind::CloseByStrategy => "CLOSE_BY_STRATEGY",
            CommandKind::CloseBySymbol => "CLOSE_BY_SYMBOL",
            CommandKind::EmergencyStop => "EMERGENCY_STOP",
        }
    }

    /// Kinds that open, resize or mass-liquidate exposure, or that replace a
    /// running strategy. These are the ones worth a second opinion before queuing.
    pub fn is_high_risk(&self) -> bool {
        matches!(
            self,
            CommandKind::OpenPosition
                | CommandKind::ModifyPosition
                | CommandKind::CloseAllPositions
                | CommandKind::Restart
                | CommandKind::UpdateStrategy
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CommandKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| CoreError::UnknownVariant {
                type_name: "command kind",
                value: s.to_string(),
            })
    }
}

/// Delivery priority. Declaration order is significance order, so `Ord`
/// ranks `Urgent` highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommandPriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl CommandPriority {
    /// The numeric rank persisted in the `priority` column (higher pulls first).
    pub fn rank(&self) -> i16 {
        match self {
            CommandPriority::Low => 0,
            CommandPriority::Normal => 1,
            CommandPriority::High => 2,
            CommandPriority::Urgent => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Result<Self, CoreError> {
        match rank {
            0 => Ok(CommandPriority::Low),
            1 => Ok(CommandPriority::Normal),
            2 => Ok(CommandPriority::High),
            3 => Ok(CommandPriority::Urgent),
            other => Err(CoreError::UnknownVariant {
                type_name: "command priority",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for CommandPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CommandPriority::Low => "LOW",
            CommandPriority::Normal => "NORMAL",
            CommandPriority::High => "HIGH",
            CommandPriority::Urgent => "URGENT",
        };
        f.write_str(label)
    }
}

/// Lifecycle of a command: pending -> acknowledged -> {executed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Pending,
    Acknowledged,
    Executed,
    Failed,
}

impl CommandStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandStatus::Pending => "pending",
            CommandStatus::Acknowledged => "acknowledged",
            CommandStatus::Executed => "executed",
            CommandStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatus::Executed | CommandStatus::Failed)
    }

    /// The statuses a command may currently hold for a move to `self` to be legal.
    ///
    /// Acknowledgement of processing is optional, so a pending command may jump
    /// straight to a terminal status. Nothing leaves a terminal status and no
    /// status may be re-entered.
    pub fn allowed_predecessors(&self) -> &'static [CommandStatus] {
        match self {
            CommandStatus::Pending => &[],
            CommandStatus::Acknowledged => &[CommandStatus::Pending],
            CommandStatus::Executed | CommandStatus::Failed => {
                &[CommandStatus::Pending, CommandStatus::Acknowledged]
            }
        }
    }

    pub fn can_transition_to(&self, next: CommandStatus) -> bool {
        next.allowed_predecessors().contains(self)
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CommandStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CommandStatus::Pending),
            "acknowledged" => Ok(CommandStatus::Acknowledged),
            "executed" => Ok(CommandStatus::Executed),
            "failed" => Ok(CommandStatus::Failed),
            other => Err(CoreError::UnknownVariant {
                type_name: "command status",
                value: other.to_string(),
            }),
        }
    }
}

/// Canonical executor status. `Online`/`Offline` are always derived from
/// heartbeat age; `Error` is a hint an online agent may layer on top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorStatus {
    Online,
    Offline,
    Error,
}

impl ExecutorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorStatus::Online => "online",
            ExecutorStatus::Offline => "offline",
            ExecutorStatus::Error => "error",
        }
    }
}

impl fmt::Display for ExecutorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutorStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(ExecutorStatus::Online),
            "offline" => Ok(ExecutorStatus::Offline),
            "error" => Ok(ExecutorStatus::Error),
            other => Err(CoreError::UnknownVariant {
                type_name: "executor status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Buy,
    Sell,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::Buy => "BUY",
            TradeDirection::Sell => "SELL",
        }
    }

    /// Lots signed by direction: long positive, short negative.
    pub fn signed(&self, lots: Decimal) -> Decimal {
        match self {
            TradeDirection::Buy => lots,
            TradeDirection::Sell => -lots,
        }
    }
}

impl fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeDirection {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(TradeDirection::Buy),
            "SELL" => Ok(TradeDirection::Sell),
            other => Err(CoreError::UnknownVariant {
                type_name: "trade direction",
                value: other.to_string(),
            }),
        }
    }
}

/// Severity of a risk violation. Ordered so `max()` yields the worst one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Points deducted from the composite risk score per violation.
    pub fn penalty(&self) -> u32 {
        match self {
            Severity::Low => 5,
            Severity::Medium => 10,
            Severity::High => 20,
            Severity::Critical => 30,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ViolationKind {
    MarginLevel,
    Drawdown,
    UnrealizedLoss,
    Concentration,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ViolationKind::MarginLevel => "MARGIN_LEVEL",
            ViolationKind::Drawdown => "DRAWDOWN",
            ViolationKind::UnrealizedLoss => "UNREALIZED_LOSS",
            ViolationKind::Concentration => "CONCENTRATION",
        };
        f.write_str(label)
    }
}
