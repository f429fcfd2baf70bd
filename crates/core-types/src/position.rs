use crate::enums::TradeDirection;
use crate::error::CoreError;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A trade as mirrored from the agent's terminal. Open while `close_time` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: Uuid,
    pub user_id: Uuid,
    pub executor_id: Uuid,
    /// Terminal ticket, unique per executor.
    pub ticket: i64,
    pub strategy_id: Option<String>,
    pub symbol: String,
    pub direction: TradeDirection,
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

impl Position {
    pub fn is_open(&self) -> bool {
        self.close_time.is_none()
    }

    /// Profit including swap and commission.
    pub fn net_profit(&self) -> Decimal {
        self.profit + self.swap + self.commission
    }
}

/// An agent's report of an open (or updated) trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeReport {
    pub ticket: i64,
    pub symbol: String,
    pub direction: TradeDirection,
    pub lots: Decimal,
    pub open_price: Decimal,
    pub open_time: DateTime<Utc>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub profit: Decimal,
    #[serde(default)]
    pub commission: Decimal,
    #[serde(default)]
    pub swap: Decimal,
}

/// Largest lot size an agent may report.
pub const MAX_LOTS: Decimal = dec!(100000);
/// Largest magnitude accepted for prices and money amounts.
pub const MAX_AMOUNT: Decimal = dec!(1000000000000);
/// Finest precision accepted for reported lots, prices and amounts.
pub const MAX_SCALE: u32 = 8;

fn check_amount(field: &str, value: Decimal) -> Result<(), CoreError> {
    if value.abs() > MAX_AMOUNT {
        return Err(CoreError::InvalidInput(
            field.to_string(),
            format!("magnitude must not exceed {MAX_AMOUNT}"),
        ));
    }
    if value.normalize().scale() > MAX_SCALE {
        return Err(CoreError::InvalidInput(
            field.to_string(),
            format!("at most {MAX_SCALE} decimal places"),
        ));
    }
    Ok(())
}

fn check_price(field: &str, value: Decimal) -> Result<(), CoreError> {
    if value <= Decimal::ZERO {
        return Err(CoreError::InvalidInput(field.to_string(), "must be greater than zero".into()));
    }
    check_amount(field, value)
}

pub(crate) fn check_optional_amount(field: &str, value: Option<Decimal>) -> Result<(), CoreError> {
    value.map_or(Ok(()), |v| check_amount(field, v))
}

impl TradeReport {
    /// Rejects reports the exposure arithmetic cannot represent.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.symbol.trim().is_empty() {
            return Err(CoreError::InvalidInput("symbol".into(), "must not be empty".into()));
        }
        if self.lots <= Decimal::ZERO || self.lots > MAX_LOTS {
            return Err(CoreError::InvalidInput(
                "lots".into(),
                format!("must be greater than zero and at most {MAX_LOTS}"),
            ));
        }
        check_amount("lots", self.lots)?;
        check_price("openPrice", self.open_price)?;
        if let Some(stop_loss) = self.stop_loss {
            check_price("stopLoss", stop_loss)?;
        }
        if let Some(take_profit) = self.take_profit {
            check_price("takeProfit", take_profit)?;
        }
        check_amount("profit", self.profit)?;
        check_amount("commission", self.commission)?;
        check_amount("swap", self.swap)
    }

    pub fn into_position(self, id: Uuid, user_id: Uuid, executor_id: Uuid) -> Position {
        Position {
            id,
            user_id,
            executor_id,
            ticket: self.ticket,
            strategy_id: self.strategy_id,
            symbol: self.symbol,
            direction: self.direction,
            lots: self.lots,
            open_price: self.open_price,
            open_time: self.open_time,
            close_price: None,
            close_time: None,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            profit: self.profit,
            commission: self.commission,
            swap: self.swap,
        }
    }
}

/// An agent's report that a trade has been closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeClose {
    pub close_price: Decimal,
    pub profit: Decimal,
    #[serde(default)]
    pub commission: Option<Decimal>,
    #[serde(default)]
    pub swap: Option<Decimal>,
    /// Defaults to the server time when omitted.
    #[serde(default)]
    pub close_time: Option<DateTime<Utc>>,
}

impl TradeClose {
    pub fn validate(&self) -> Result<(), CoreError> {
        check_price("closePrice", self.close_price)?;
        check_amount("profit", self.profit)?;
        check_optional_amount("commission", self.commission)?;
        check_optional_amount("swap", self.swap)
    }
}
