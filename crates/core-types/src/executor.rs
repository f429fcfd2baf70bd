use crate::enums::ExecutorStatus;
use crate::error::CoreError;
use crate::position::check_optional_amount;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The account snapshot an agent attaches to its heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatMetadata {
    pub version: Option<String>,
    pub balance: Option<Decimal>,
    pub equity: Option<Decimal>,
    pub open_positions: Option<i32>,
    pub active_strategies: Option<i32>,
}

impl HeartbeatMetadata {
    /// Balance and equity feed the exposure report and must stay representable.
    pub fn validate(&self) -> Result<(), CoreError> {
        check_optional_amount("balance", self.balance)?;
        check_optional_amount("equity", self.equity)
    }
}

/// A registered remote agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Executor {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub api_key: String,
    #[serde(skip_serializing, default)]
    pub secret_hash: String,
    /// The last status the agent itself reported. A hint only.
    pub reported_status: Option<ExecutorStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub metadata: HeartbeatMetadata,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Executor {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewExecutor {
    pub user_id: Uuid,
    pub name: String,
    pub api_key: String,
    pub secret_hash: String,
    pub created_at: DateTime<Utc>,
}

impl NewExecutor {
    pub fn into_executor(self, id: Uuid) -> Executor {
        Executor {
            id,
            user_id: self.user_id,
            name: self.name,
            api_key: self.api_key,
            secret_hash: self.secret_hash,
            reported_status: None,
            last_heartbeat: None,
            metadata: HeartbeatMetadata::default(),
            created_at: self.created_at,
            deleted_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn metadata_balance_must_be_representable() {
        let ok = HeartbeatMetadata {
            balance: Some(dec!(10000.25)),
            equity: Some(dec!(9800)),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());
        assert!(HeartbeatMetadata::default().validate().is_ok());

        let dust = HeartbeatMetadata {
            balance: Some(dec!(0.0000000000000000000000000001)),
            ..Default::default()
        };
        assert!(dust.validate().is_err());

        let huge = HeartbeatMetadata {
            equity: Some(Decimal::MAX),
            ..Default::default()
        };
        assert!(matches!(huge.validate(), Err(CoreError::InvalidInput(f, _)) if f == "equity"));
    }
}
