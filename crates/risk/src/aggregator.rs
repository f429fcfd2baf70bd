use crate::error::RiskError;
use crate::exposure::{
    ExposureBucket, ExposureInput, RiskExposure, UNASSIGNED_STRATEGY, Violation,
};
use configuration::RiskSettings;
use core_types::{Position, Severity, TradeDirection, ViolationKind};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};

/// Aggregates open positions and account snapshots into a [`RiskExposure`].
///
/// Pure: no I/O, no clock. Missing optional inputs (balance, equity, stop
/// loss, strategy) fall back to neutral values instead of failing.
#[derive(Debug, Clone)]
pub struct ExposureCalculator {
    params: RiskSettings,
}

impl ExposureCalculator {
    /// Creates a calculator, rejecting parameters that would divide by zero.
    pub fn new(params: RiskSettings) -> Result<Self, RiskError> {
        if params.leverage <= Decimal::ZERO {
            return Err(RiskError::InvalidParameters(
                "leverage must be greater than 0".to_string(),
            ));
        }
        if params.contract_size <= Decimal::ZERO {
            return Err(RiskError::InvalidParameters(
                "contract_size must be greater than 0".to_string(),
            ));
        }
        if params.default_risk_per_lot < Decimal::ZERO {
            return Err(RiskError::InvalidParameters(
                "default_risk_per_lot must not be negative".to_string(),
            ));
        }
        Ok(Self { params })
    }

    pub fn params(&self) -> &RiskSettings {
        &self.params
    }

    /// Loss expected if the position runs to its stop, or a flat per-lot
    /// assumption when it has none.
    pub fn estimated_risk(&self, position: &Position) -> Decimal {
        match position.stop_loss {
            Some(stop_loss) => {
                (position.open_price - stop_loss)
                    .abs()
                    .saturating_mul(position.lots)
                    .saturating_mul(self.params.contract_size)
            }
            None => position.lots.saturating_mul(self.params.default_risk_per_lot),
        }
    }

    pub fn compute(&self, input: &ExposureInput) -> RiskExposure {
        // --- 1. Balance and equity ---
        let mut unrealized_by_executor: HashMap<_, Decimal> = HashMap::new();
        for position in &input.open_positions {
            let entry = unrealized_by_executor.entry(position.executor_id).or_default();
            *entry = entry.saturating_add(position.net_profit());
        }

        let mut balance = Decimal::ZERO;
        let mut equity = Decimal::ZERO;
        for account in &input.accounts {
            let account_balance = account.balance.unwrap_or(Decimal::ZERO);
            balance = balance.saturating_add(account_balance);
            equity = equity.saturating_add(account.equity.unwrap_or_else(|| {
                account_balance.saturating_add(
                    unrealized_by_executor
                        .get(&account.executor_id)
                        .copied()
                        .unwrap_or(Decimal::ZERO),
                )
            }));
        }

        // --- 2. Per-symbol and per-strategy exposure ---
        let mut by_symbol: BTreeMap<String, ExposureBucket> = BTreeMap::new();
        let mut by_strategy: BTreeMap<String, ExposureBucket> = BTreeMap::new();
        let mut total_lots = Decimal::ZERO;
        let mut unrealized_pnl = Decimal::ZERO;

        for position in &input.open_positions {
            let risk = self.estimated_risk(position);
            let strategy = position
                .strategy_id
                .clone()
                .unwrap_or_else(|| UNASSIGNED_STRATEGY.to_string());

            self.accumulate(by_symbol.entry(position.symbol.clone()).or_default(), position, risk);
            self.accumulate(by_strategy.entry(strategy).or_default(), position, risk);

            total_lots = total_lots.saturating_add(position.lots);
            unrealized_pnl = unrealized_pnl.saturating_add(position.net_profit());
        }

        // --- 3. Margin ---
        let used_margin = ratio(
            total_lots.saturating_mul(self.params.contract_size),
            self.params.leverage,
        );
        let free_margin = equity.saturating_sub(used_margin);
        let margin_level = if used_margin > Decimal::ZERO {
            percent_of(equity, used_margin)
        } else {
            Decimal::ZERO
        };

        // --- 4. Intraday drawdown ---
        let realized_pnl_today: Decimal = input
            .todays_trades
            .iter()
            .filter(|t| t.close_time.is_some_and(|at| at >= input.day_start))
            .map(Position::net_profit)
            .sum();
        let daily_drawdown_pct = intraday_drawdown(balance - realized_pnl_today, &input.todays_trades);

        // --- 5. Violations ---
        let mut violations = Vec::new();
        if used_margin > Decimal::ZERO {
            self.check_margin(margin_level, &mut violations);
        }
        self.check_drawdown(daily_drawdown_pct, &mut violations);
        if balance > Decimal::ZERO {
            self.check_unrealized(percent_of(unrealized_pnl, balance), &mut violations);
            self.check_concentration(balance, &by_symbol, &mut violations);
        }

        let (risk_score, risk_level) = score(&violations);

        RiskExposure {
            balance,
            equity,
            used_margin,
            free_margin,
            margin_level: margin_level.round_dp(2),
            total_lots,
            open_position_count: u32::try_from(input.open_positions.len()).unwrap_or(u32::MAX),
            unrealized_pnl,
            realized_pnl_today,
            daily_drawdown_pct: daily_drawdown_pct.round_dp(2),
            by_symbol,
            by_strategy,
            violations,
            risk_score,
            risk_level,
            computed_at: input.computed_at,
        }
    }

    fn accumulate(&self, bucket: &mut ExposureBucket, position: &Position, risk: Decimal) {
        match position.direction {
            TradeDirection::Buy => bucket.long_lots += position.lots,
            TradeDirection::Sell => bucket.short_lots += position.lots,
        }
        bucket.net_lots = bucket.long_lots - bucket.short_lots;
        bucket.notional = (bucket.long_lots + bucket.short_lots) * self.params.contract_size;
        bucket.unrealized_pnl += position.net_profit();
        bucket.position_count += 1;
        bucket.estimated_risk += risk;
    }

    fn check_margin(&self, margin_level: Decimal, violations: &mut Vec<Violation>) {
        let p = &self.params;
        let breach = if margin_level < p.margin_level_critical_pct {
            Some((Severity::Critical, p.margin_level_critical_pct))
        } else if margin_level < p.margin_level_high_pct {
            Some((Severity::High, p.margin_level_high_pct))
        } else {
            None
        };
        if let Some((severity, threshold)) = breach {
            violations.push(Violation {
                kind: ViolationKind::MarginLevel,
                severity,
                message: format!(
                    "Margin level {}% is below {}%",
                    margin_level.round_dp(2),
                    threshold
                ),
                value: margin_level.round_dp(2),
                threshold,
            });
        }
    }

    fn check_drawdown(&self, drawdown_pct: Decimal, violations: &mut Vec<Violation>) {
        let p = &self.params;
        let breach = if drawdown_pct > p.drawdown_critical_pct {
            Some((Severity::Critical, p.drawdown_critical_pct))
        } else if drawdown_pct > p.drawdown_high_pct {
            Some((Severity::High, p.drawdown_high_pct))
        } else if drawdown_pct > p.drawdown_medium_pct {
            Some((Severity::Medium, p.drawdown_medium_pct))
        } else {
            None
        };
        if let Some((severity, threshold)) = breach {
            violations.push(Violation {
                kind: ViolationKind::Drawdown,
                severity,
                message: format!(
                    "Daily drawdown {}% exceeds {}%",
                    drawdown_pct.round_dp(2),
                    threshold
                ),
                value: drawdown_pct.round_dp(2),
                threshold,
            });
        }
    }

    fn check_unrealized(&self, unrealized_pct: Decimal, violations: &mut Vec<Violation>) {
        let p = &self.params;
        let breach = if unrealized_pct < -p.unrealized_loss_critical_pct {
            Some((Severity::Critical, p.unrealized_loss_critical_pct))
        } else if unrealized_pct < -p.unrealized_loss_high_pct {
            Some((Severity::High, p.unrealized_loss_high_pct))
        } else {
            None
        };
        if let Some((severity, threshold)) = breach {
            violations.push(Violation {
                kind: ViolationKind::UnrealizedLoss,
                severity,
                message: format!(
                    "Unrealized loss is {}% of balance (limit {}%)",
                    unrealized_pct.abs().round_dp(2),
                    threshold
                ),
                value: unrealized_pct.round_dp(2),
                threshold: -threshold,
            });
        }
    }

    fn check_concentration(
        &self,
        balance: Decimal,
        by_symbol: &BTreeMap<String, ExposureBucket>,
        violations: &mut Vec<Violation>,
    ) {
        let p = &self.params;
        for (symbol, bucket) in by_symbol {
            let share = percent_of(bucket.estimated_risk, balance);
            let breach = if share > p.concentration_high_pct {
                Some((Severity::High, p.concentration_high_pct))
            } else if share > p.concentration_medium_pct {
                Some((Severity::Medium, p.concentration_medium_pct))
            } else {
                None
            };
            if let Some((severity, threshold)) = breach {
                violations.push(Violation {
                    kind: ViolationKind::Concentration,
                    severity,
                    message: format!(
                        "{symbol} puts {}% of balance at risk (limit {}%)",
                        share.round_dp(2),
                        threshold
                    ),
                    value: share.round_dp(2),
                    threshold,
                });
            }
        }
    }
}

/// Walks the day's trades in open-time order from `start`, returning the
/// deepest peak-to-trough fall as a percentage of the running peak.
fn intraday_drawdown(start: Decimal, trades: &[Position]) -> Decimal {
    let mut ordered: Vec<&Position> = trades.iter().collect();
    ordered.sort_by_key(|t| t.open_time);

    let mut running = start;
    let mut peak = start;
    let mut max_drawdown = Decimal::ZERO;
    for trade in ordered {
        running = running.saturating_add(trade.net_profit());
        peak = peak.max(running);
        if peak > Decimal::ZERO {
            let drawdown = percent_of(peak.saturating_sub(running), peak);
            max_drawdown = max_drawdown.max(drawdown);
        }
    }
    max_drawdown
}

/// `part / whole`, clamped to the representable range. `whole` must be non-zero.
fn ratio(part: Decimal, whole: Decimal) -> Decimal {
    part.checked_div(whole).unwrap_or_else(|| {
        if part.is_sign_negative() != whole.is_sign_negative() {
            Decimal::MIN
        } else {
            Decimal::MAX
        }
    })
}

/// `part` as a percentage of `whole`, saturating instead of overflowing.
fn percent_of(part: Decimal, whole: Decimal) -> Decimal {
    ratio(part, whole).saturating_mul(dec!(100))
}

/// `100 - Σ penalties`, floored at zero, and the worst severity present.
fn score(violations: &[Violation]) -> (u32, Severity) {
    let penalty: u32 = violations.iter().map(|v| v.severity.penalty()).sum();
    let level = violations
        .iter()
        .map(|v| v.severity)
        .max()
        .unwrap_or(Severity::Low);
    (100u32.saturating_sub(penalty), level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposure::AccountSnapshot;
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn calculator() -> ExposureCalculator {
        ExposureCalculator::new(RiskSettings::default()).unwrap()
    }

    fn position(
        executor_id: Uuid,
        symbol: &str,
        direction: TradeDirection,
        lots: Decimal,
        profit: Decimal,
    ) -> Position {
        Position {
            id: Uuid::new_v4(),
            user_id: Uuid::nil(),
            executor_id,
            ticket: 1,
            strategy_id: None,
            symbol: symbol.to_string(),
            direction,
            lots,
            open_price: dec!(1.1000),
            open_time: Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap(),
            close_price: None,
            close_time: None,
            stop_loss: None,
            take_profit: None,
            profit,
            commission: Decimal::ZERO,
            swap: Decimal::ZERO,
        }
    }

    fn input(accounts: Vec<AccountSnapshot>, open: Vec<Position>) -> ExposureInput {
        let day_start = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        ExposureInput {
            accounts,
            todays_trades: open.clone(),
            open_positions: open,
            day_start,
            computed_at: day_start + Duration::hours(12),
        }
    }

    fn account(executor_id: Uuid, balance: Decimal) -> AccountSnapshot {
        AccountSnapshot {
            executor_id,
            balance: Some(balance),
            equity: None,
        }
    }

    #[test]
    fn six_percent_unrealized_loss_is_a_high_violation() {
        let exec = Uuid::new_v4();
        let open = vec![position(exec, "EURUSD", TradeDirection::Buy, dec!(0.1), dec!(-600))];
        let exposure = calculator().compute(&input(vec![account(exec, dec!(10000))], open));

        assert_eq!(exposure.balance, dec!(10000));
        assert_eq!(exposure.equity, dec!(9400));
        assert_eq!(exposure.violations.len(), 1);
        assert_eq!(exposure.violations[0].kind, ViolationKind::UnrealizedLoss);
        assert_eq!(exposure.violations[0].severity, Severity::High);
        assert_eq!(exposure.risk_score, 80);
        assert_eq!(exposure.risk_level, Severity::High);
    }

    #[test]
    fn no_positions_means_no_margin_violation() {
        let exec = Uuid::new_v4();
        let exposure = calculator().compute(&input(vec![account(exec, dec!(5000))], vec![]));

        assert_eq!(exposure.used_margin, Decimal::ZERO);
        assert_eq!(exposure.margin_level, Decimal::ZERO);
        assert!(exposure.violations.is_empty());
        assert_eq!(exposure.risk_score, 100);
        assert_eq!(exposure.risk_level, Severity::Low);
    }

    #[test]
    fn margin_level_of_exactly_one_hundred_is_high_not_critical() {
        // 1 lot = 100,000 notional / 100 leverage = 1,000 used margin.
        let exec = Uuid::new_v4();
        let accounts = vec![AccountSnapshot {
            executor_id: exec,
            balance: Some(dec!(1000)),
            equity: Some(dec!(1000)),
        }];
        let open = vec![position(exec, "GBPUSD", TradeDirection::Sell, dec!(1), Decimal::ZERO)];
        let exposure = calculator().compute(&input(accounts, open));

        assert_eq!(exposure.used_margin, dec!(1000));
        assert_eq!(exposure.margin_level, dec!(100));
        let margin: Vec<_> = exposure
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::MarginLevel)
            .collect();
        assert_eq!(margin.len(), 1);
        assert_eq!(margin[0].severity, Severity::High);
    }

    #[test]
    fn exposure_is_split_by_symbol_and_strategy() {
        let exec = Uuid::new_v4();
        let mut grid = position(exec, "EURUSD", TradeDirection::Buy, dec!(0.3), dec!(10));
        grid.strategy_id = Some("grid".into());
        let hedge = position(exec, "EURUSD", TradeDirection::Sell, dec!(0.1), dec!(-4));
        let gold = position(exec, "XAUUSD", TradeDirection::Buy, dec!(0.2), dec!(2));

        let exposure = calculator().compute(&input(
            vec![account(exec, dec!(100000))],
            vec![grid, hedge, gold],
        ));

        let eurusd = &exposure.by_symbol["EURUSD"];
        assert_eq!(eurusd.long_lots, dec!(0.3));
        assert_eq!(eurusd.short_lots, dec!(0.1));
        assert_eq!(eurusd.net_lots, dec!(0.2));
        assert_eq!(eurusd.notional, dec!(40000));
        assert_eq!(eurusd.unrealized_pnl, dec!(6));
        assert_eq!(eurusd.position_count, 2);

        assert_eq!(exposure.by_strategy["grid"].position_count, 1);
        assert_eq!(exposure.by_strategy[UNASSIGNED_STRATEGY].position_count, 2);
        assert_eq!(exposure.total_lots, dec!(0.6));
    }

    #[test]
    fn stop_loss_drives_estimated_risk_and_concentration() {
        let exec = Uuid::new_v4();
        let mut pos = position(exec, "EURUSD", TradeDirection::Buy, dec!(1), Decimal::ZERO);
        pos.stop_loss = Some(dec!(1.0950));
        // |1.1000 - 1.0950| * 1 * 100,000 = 500, i.e. 5% of 10,000: not above 5%.
        let calc = calculator();
        assert_eq!(calc.estimated_risk(&pos), dec!(500));

        let exposure = calc.compute(&input(vec![account(exec, dec!(10000))], vec![pos.clone()]));
        let concentration: Vec<_> = exposure
            .violations
            .iter()
            .filter(|v| v.kind == ViolationKind::Concentration)
            .collect();
        assert_eq!(concentration.len(), 1);
        assert_eq!(concentration[0].severity, Severity::Medium);

        pos.stop_loss = Some(dec!(1.0940));
        let exposure = calc.compute(&input(vec![account(exec, dec!(10000))], vec![pos]));
        let worst = exposure
            .violations
            .iter()
            .find(|v| v.kind == ViolationKind::Concentration)
            .unwrap();
        assert_eq!(worst.severity, Severity::High);
    }

    #[test]
    fn intraday_drawdown_tracks_peak_to_trough() {
        let exec = Uuid::new_v4();
        let day_start = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        let closed = |hour: u32, pnl: Decimal| {
            let mut p = position(exec, "EURUSD", TradeDirection::Buy, dec!(0.1), pnl);
            p.open_time = day_start + Duration::hours(i64::from(hour));
            p.close_time = Some(p.open_time + Duration::minutes(30));
            p.close_price = Some(dec!(1.1));
            p
        };
        // Start 10,000: +1,000 -> 11,000 peak, -1,760 -> 9,240 (16% down), +240 -> 9,480.
        let trades = vec![closed(1, dec!(1000)), closed(2, dec!(-1760)), closed(3, dec!(240))];
        let balance_now = dec!(10000) + dec!(1000) - dec!(1760) + dec!(240);

        let exposure = calculator().compute(&ExposureInput {
            accounts: vec![account(exec, balance_now)],
            open_positions: vec![],
            todays_trades: trades,
            day_start,
            computed_at: day_start + Duration::hours(4),
        });

        assert_eq!(exposure.realized_pnl_today, dec!(-520));
        assert_eq!(exposure.daily_drawdown_pct, dec!(16));
        assert_eq!(exposure.violations.len(), 1);
        assert_eq!(exposure.violations[0].kind, ViolationKind::Drawdown);
        assert_eq!(exposure.violations[0].severity, Severity::High);
    }

    #[test]
    fn missing_equity_falls_back_to_balance_plus_unrealized() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let accounts = vec![
            account(a, dec!(1000)),
            AccountSnapshot {
                executor_id: b,
                balance: None,
                equity: Some(dec!(250)),
            },
        ];
        let open = vec![position(a, "USDJPY", TradeDirection::Buy, dec!(0.01), dec!(-20))];
        let exposure = calculator().compute(&input(accounts, open));

        assert_eq!(exposure.balance, dec!(1000));
        assert_eq!(exposure.equity, dec!(1230));
    }

    #[test]
    fn score_never_goes_negative() {
        let critical = |kind| Violation {
            kind,
            severity: Severity::Critical,
            message: String::new(),
            value: Decimal::ZERO,
            threshold: Decimal::ZERO,
        };
        let violations = vec![
            critical(ViolationKind::MarginLevel),
            critical(ViolationKind::Drawdown),
            critical(ViolationKind::UnrealizedLoss),
            critical(ViolationKind::Concentration),
        ];
        assert_eq!(score(&violations), (0, Severity::Critical));
    }

    #[test]
    fn invalid_parameters_are_rejected() {
        let params = RiskSettings {
            leverage: Decimal::ZERO,
            ..RiskSettings::default()
        };
        assert!(ExposureCalculator::new(params).is_err());
    }

    fn severity_of(exposure: &RiskExposure, kind: ViolationKind) -> Option<Severity> {
        exposure
            .violations
            .iter()
            .find(|v| v.kind == kind)
            .map(|v| v.severity)
    }

    #[test]
    fn drawdown_thresholds_only_escalate_when_exceeded() {
        let exec = Uuid::new_v4();
        let day_start = Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap();
        for (loss, expected) in [
            (dec!(1000), None),
            (dec!(1001), Some(Severity::Medium)),
            (dec!(1500), Some(Severity::Medium)),
            (dec!(2000), Some(Severity::High)),
            (dec!(2001), Some(Severity::Critical)),
        ] {
            let mut trade = position(exec, "EURUSD", TradeDirection::Buy, dec!(0.1), -loss);
            trade.open_time = day_start + Duration::hours(1);
            trade.close_time = Some(day_start + Duration::hours(2));
            trade.close_price = Some(dec!(1.09));

            let exposure = calculator().compute(&ExposureInput {
                accounts: vec![account(exec, dec!(10000) - loss)],
                open_positions: vec![],
                todays_trades: vec![trade],
                day_start,
                computed_at: day_start + Duration::hours(3),
            });
            assert_eq!(severity_of(&exposure, ViolationKind::Drawdown), expected, "loss {loss}");
        }
    }

    #[test]
    fn unrealized_loss_thresholds_only_escalate_when_exceeded() {
        let exec = Uuid::new_v4();
        for (pnl, expected) in [
            (dec!(-500), None),
            (dec!(-501), Some(Severity::High)),
            (dec!(-1000), Some(Severity::High)),
            (dec!(-1001), Some(Severity::Critical)),
        ] {
            let open = vec![position(exec, "EURUSD", TradeDirection::Buy, dec!(0.01), pnl)];
            let exposure = calculator().compute(&input(vec![account(exec, dec!(10000))], open));
            assert_eq!(
                severity_of(&exposure, ViolationKind::UnrealizedLoss),
                expected,
                "pnl {pnl}"
            );
        }
    }

    #[test]
    fn margin_level_of_exactly_two_hundred_is_clean() {
        let exec = Uuid::new_v4();
        for (equity, expected) in [
            (dec!(2000), None),
            (dec!(1999.99), Some(Severity::High)),
        ] {
            let accounts = vec![AccountSnapshot {
                executor_id: exec,
                balance: Some(equity),
                equity: Some(equity),
            }];
            let open = vec![position(exec, "GBPUSD", TradeDirection::Buy, dec!(1), Decimal::ZERO)];
            let exposure = calculator().compute(&input(accounts, open));
            assert_eq!(
                severity_of(&exposure, ViolationKind::MarginLevel),
                expected,
                "equity {equity}"
            );
        }
    }

    #[test]
    fn dust_lot_size_saturates_instead_of_overflowing() {
        let exec = Uuid::new_v4();
        let dust = dec!(0.0000000000000000000000000001);
        let open = vec![position(exec, "EURUSD", TradeDirection::Buy, dust, Decimal::ZERO)];
        let exposure = calculator().compute(&input(vec![account(exec, dec!(10000))], open));

        assert_eq!(exposure.margin_level, Decimal::MAX);
        assert_eq!(severity_of(&exposure, ViolationKind::MarginLevel), None);
    }

    #[test]
    fn dust_balance_saturates_to_a_critical_loss() {
        let exec = Uuid::new_v4();
        let dust = dec!(0.0000000000000000000000000001);
        let open = vec![position(exec, "EURUSD", TradeDirection::Buy, dec!(0.01), dec!(-100))];
        let exposure = calculator().compute(&input(vec![account(exec, dust)], open));

        let unrealized = exposure
            .violations
            .iter()
            .find(|v| v.kind == ViolationKind::UnrealizedLoss)
            .unwrap();
        assert_eq!(unrealized.severity, Severity::Critical);
        assert_eq!(unrealized.value, Decimal::MIN);
        assert_eq!(exposure.risk_level, Severity::Critical);
    }

    #[test]
    fn percent_of_saturates_towards_the_sign_of_the_result() {
        let dust = dec!(0.0000000000000000000000000001);
        assert_eq!(percent_of(dec!(1000), dust), Decimal::MAX);
        assert_eq!(percent_of(dec!(-1000), dust), Decimal::MIN);
        assert_eq!(percent_of(dec!(50), dec!(200)), dec!(25));
    }
}
