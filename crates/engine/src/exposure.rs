use crate::clock::Clock;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use database::Store;
use risk::{AccountSnapshot, ExposureCalculator, ExposureInput, RiskExposure};
use std::sync::Arc;
use uuid::Uuid;

/// Gathers a user's accounts and trades from the store and runs the calculator.
pub struct ExposureService {
    store: Arc<dyn Store>,
    calculator: ExposureCalculator,
    clock: Arc<dyn Clock>,
}

impl ExposureService {
    pub fn new(store: Arc<dyn Store>, calculator: ExposureCalculator, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            calculator,
            clock,
        }
    }

    pub async fn compute_exposure(&self, user_id: Uuid) -> Result<RiskExposure, EngineError> {
        let now = self.clock.now();
        let day_start = start_of_day(now);

        let (executors, open_positions, todays_trades) = tokio::try_join!(
            self.store.list_executors(user_id),
            self.store.open_positions_for_user(user_id),
            self.store.trades_since(user_id, day_start),
        )?;

        // Positions on soft-deleted executors no longer count.
        let live: std::collections::HashSet<Uuid> = executors.iter().map(|e| e.id).collect();
        let input = ExposureInput {
            accounts: executors.iter().map(AccountSnapshot::from).collect(),
            open_positions: open_positions
                .into_iter()
                .filter(|p| live.contains(&p.executor_id))
                .collect(),
            todays_trades: todays_trades
                .into_iter()
                .filter(|p| live.contains(&p.executor_id))
                .collect(),
            day_start,
            computed_at: now,
        };

        let exposure = self.calculator.compute(&input);
        tracing::debug!(
            %user_id,
            risk_score = exposure.risk_score,
            violations = exposure.violations.len(),
            "Exposure computed."
        );
        Ok(exposure)
    }
}

/// UTC midnight of the day `now` falls in.
pub fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}
