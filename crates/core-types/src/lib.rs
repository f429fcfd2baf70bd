//! Domain vocabulary shared by every crate in the workspace: executors,
//! commands and their typed parameters, mirrored positions and audit records.

pub mod audit;
pub mod command;
pub mod enums;
pub mod error;
pub mod executor;
pub mod position;

// Re-export the core types to provide a clean public API.
pub use audit::AuditRecord;
pub use command::{
    Command, CommandPayload, EmergencyStopParams, ModifyPositionParams, NewCommand,
    OpenPositionParams, PositionTarget, RawCommand, StrategyTarget, SymbolTarget,
    UpdateStrategyParams,
};
pub use enums::{
    CommandKind, CommandPriority, CommandStatus, ExecutorStatus, Severity, TradeDirection,
    ViolationKind,
};
pub use error::CoreError;
pub use executor::{Executor, HeartbeatMetadata, NewExecutor};
pub use position::{Position, TradeClose, TradeReport};
