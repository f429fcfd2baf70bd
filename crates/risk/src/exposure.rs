use chrono::{DateTime, Utc};
use core_types::{Executor, Position, Severity, ViolationKind};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Strategy key for positions that no strategy claims.
pub const UNASSIGNED_STRATEGY: &str = "unassigned";

/// The account figures one executor last reported.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountSnapshot {
    pub executor_id: Uuid,
    pub balance: Option<Decimal>,
    pub equity: Option<Decimal>,
}

impl From<&Executor> for AccountSnapshot {
    fn from(executor: &Executor) -> Self {
        Self {
            executor_id: executor.id,
            balance: executor.metadata.balance,
            equity: executor.metadata.equity,
        }
    }
}

/// Everything the aggregation reads, gathered by the caller in one pass.
#[derive(Debug, Clone)]
pub struct ExposureInput {
    pub accounts: Vec<AccountSnapshot>,
    pub open_positions: Vec<Position>,
    /// Trades opened or closed since `day_start`.
    pub todays_trades: Vec<Position>,
    pub day_start: DateTime<Utc>,
    pub computed_at: DateTime<Utc>,
}

/// Exposure of one symbol or one strategy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureBucket {
    pub long_lots: Decimal,
    pub short_lots: Decimal,
    pub net_lots: Decimal,
    pub notional: Decimal,
    pub unrealized_pnl: Decimal,
    pub position_count: u32,
    pub estimated_risk: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    /// The measured value, in the same unit as `threshold`.
    pub value: Decimal,
    pub threshold: Decimal,
}

/// A point-in-time picture of a user's aggregate risk. Advisory only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskExposure {
    pub balance: Decimal,
    pub equity: Decimal,
    pub used_margin: Decimal,
    pub free_margin: Decimal,
    /// Percent. Zero when no margin is in use.
    pub margin_level: Decimal,
    pub total_lots: Decimal,
    pub open_position_count: u32,
    pub unrealized_pnl: Decimal,
    pub realized_pnl_today: Decimal,
    /// Largest intraday peak-to-trough fall, in percent.
    pub daily_drawdown_pct: Decimal,
    pub by_symbol: BTreeMap<String, ExposureBucket>,
    pub by_strategy: BTreeMap<String, ExposureBucket>,
    pub violations: Vec<Violation>,
    pub risk_score: u32,
    pub risk_level: Severity,
    pub computed_at: DateTime<Utc>,
}

impl RiskExposure {
    pub fn has_violations(&self) -> bool {
        !self.violations.is_empty()
    }

    pub fn worst_violation(&self) -> Option<&Violation> {
        self.violations.iter().max_by_key(|v| v.severity)
    }
}
