//! Ratio spread: buy one ATM option, sell more OTM options of the same right.
//!
//! Put ratios carry a bullish bias, call ratios a bearish one. The naked
//! short unit makes the loss side open-ended, so the stop is a breach of the
//! short strike by a configured percentage rather than a P&L level.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{ExitReason, LegSide, Position};
use crate::data::OptionRight;
use crate::error::{ValidationError, ValidationResult};
use crate::pricing::{to_decimal, IvHistory, PricedQuote, PricedSnapshot};

use super::selection::{mean_iv, nearest_strike, otm_quotes, select_by_delta};
use super::{
    check_delta_band, check_dte_window, check_fraction, check_history, check_iv_rank, open_count,
    EntryProposal, LegProposal, OptionsStrategy, Signal, StrategyKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RatioVariant {
    #[default]
    PutRatio,
    CallRatio,
}

impl RatioVariant {
    pub fn right(&self) -> OptionRight {
        match self {
            Self::PutRatio => OptionRight::Put,
            Self::CallRatio => OptionRight::Call,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatioSpreadConfig {
    pub iv_rank_threshold: f64,
    pub variant: RatioVariant,
    /// Long units, short units.
    pub ratio: (u32, u32),
    pub short_delta_low: f64,
    pub short_delta_high: f64,
    pub min_dte: i64,
    pub max_dte: i64,
    /// Fraction of the theoretical max profit to capture.
    pub profit_target_pct: f64,
    /// Distance beyond the short strike that counts as a breach.
    pub breach_pct: f64,
    pub exit_dte: i64,
    pub position_size_pct: f64,
    pub max_positions: usize,
    pub iv_lookback: usize,
    pub min_iv_history: usize,
}

impl Default for RatioSpreadConfig {
    fn default() -> Self {
        Self {
            iv_rank_threshold: 60.0,
            variant: RatioVariant::PutRatio,
            ratio: (1, 2),
            short_delta_low: 0.20,
            short_delta_high: 0.25,
            min_dte: 21,
            max_dte: 45,
            profit_target_pct: 0.75,
            breach_pct: 0.02,
            exit_dte: 7,
            position_size_pct: 0.01,
            max_positions: 2,
            iv_lookback: 252,
            min_iv_history: 30,
        }
    }
}

impl RatioSpreadConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        check_iv_rank("ratio_spread.iv_rank_threshold", self.iv_rank_threshold)?;
        if self.ratio.0 == 0 || self.ratio.1 == 0 {
            return Err(ValidationError::invalid("ratio_spread.ratio", "legs need at least one unit"));
        }
        check_delta_band("ratio_spread.short_delta", self.short_delta_low, self.short_delta_high)?;
        check_dte_window("ratio_spread.dte", self.min_dte, self.max_dte)?;
        check_dte_window("ratio_spread.exit_dte", 0, self.exit_dte)?;
        check_fraction("ratio_spread.profit_target_pct", self.profit_target_pct)?;
        check_fraction("ratio_spread.breach_pct", self.breach_pct)?;
        check_fraction("ratio_spread.position_size_pct", self.position_size_pct)?;
        check_history("ratio_spread.iv_lookback", self.iv_lookback, self.min_iv_history)
    }
}

#[derive(Debug, Clone)]
pub struct RatioSpread {
    config: RatioSpreadConfig,
    iv_history: IvHistory,
}

impl RatioSpread {
    pub fn new(config: RatioSpreadConfig) -> Self {
        let iv_history = IvHistory::new(config.iv_lookback, config.min_iv_history);
        Self { config, iv_history }
    }

    pub fn config(&self) -> &RatioSpreadConfig {
        &self.config
    }

    /// Theoretical max profit per set: reached with the underlying pinned at
    /// the short strike at expiry.
    pub fn max_profit(&self, long_strike: Decimal, short_strike: Decimal, net_credit: Decimal) -> Decimal {
        (long_strike - short_strike).abs() * Decimal::from(self.config.ratio.0) + net_credit
    }

    fn propose(&self, snapshot: &PricedSnapshot, iv_rank: f64) -> Option<EntryProposal> {
        let right = self.config.variant.right();
        let (long_units, short_units) = self.config.ratio;
        let spot = snapshot.spot_f64();

        for expiry in snapshot.expiries_in_dte(self.config.min_dte, self.config.max_dte) {
            let side: Vec<&PricedQuote> = snapshot.side(expiry, right).filter(|q| q.dte > 0).collect();
            let Some(long) = nearest_strike(&side, spot) else {
                continue;
            };
            let beyond = otm_quotes(snapshot, expiry, right, long.strike_f64());
            let Some(short) = select_by_delta(&beyond, self.config.short_delta_low, self.config.short_delta_high)
            else {
                continue;
            };

            let net_credit =
                short.mark * Decimal::from(short_units) - long.mark * Decimal::from(long_units);
            let max_profit = self.max_profit(long.strike, short.strike, net_credit);
            if max_profit <= Decimal::ZERO {
                continue;
            }
            let width = (long.strike - short.strike).abs();
            let naked_units = short_units.saturating_sub(long_units).max(1);

            return Some(EntryProposal {
                strategy: StrategyKind::RatioSpread,
                underlying: snapshot.underlying().to_string(),
                legs: vec![
                    LegProposal::from_quote(long, LegSide::Long, long_units),
                    LegProposal::from_quote(short, LegSide::Short, short_units),
                ],
                rationale: format!(
                    "IV rank {:.1} > {:.0}; {}x{} / {}x{} {} expiring {}, net {}",
                    iv_rank,
                    self.config.iv_rank_threshold,
                    long_units,
                    long.strike,
                    short_units,
                    short.strike,
                    right,
                    expiry,
                    net_credit
                ),
                risk_per_set: width * Decimal::from(naked_units),
                max_profit_per_set: Some(max_profit),
                max_loss_per_set: None,
                volatility: snapshot.atm_iv().unwrap_or_else(|| mean_iv(&[long, short])),
                entry_iv_rank: Some(iv_rank),
                position_size_pct: self.config.position_size_pct,
            });
        }
        None
    }
}

impl OptionsStrategy for RatioSpread {
    fn kind(&self) -> StrategyKind {
        StrategyKind::RatioSpread
    }

    fn leg_ratio(&self) -> Vec<u32> {
        vec![self.config.ratio.0, self.config.ratio.1]
    }

    fn max_positions(&self) -> usize {
        self.config.max_positions
    }

    fn iv_history(&self) -> &IvHistory {
        &self.iv_history
    }

    fn iv_history_mut(&mut self) -> &mut IvHistory {
        &mut self.iv_history
    }

    fn evaluate(&self, snapshot: &PricedSnapshot, open: &[&Position]) -> Signal {
        if open_count(open, self.kind()) >= self.config.max_positions {
            return Signal::None;
        }
        match self.iv_rank() {
            Some(rank) if rank > self.config.iv_rank_threshold => self
                .propose(snapshot, rank)
                .map(Signal::Enter)
                .unwrap_or_default(),
            _ => Signal::None,
        }
    }

    fn exit_check(&self, position: &Position, snapshot: &PricedSnapshot) -> Signal {
        let right = self.config.variant.right();
        let spot = snapshot.spot();
        let breach = to_decimal(self.config.breach_pct);

        if let Some(short) = position.short_strike(right) {
            let breached = match right {
                OptionRight::Put => spot <= short * (Decimal::ONE - breach),
                OptionRight::Call => spot >= short * (Decimal::ONE + breach),
            };
            if breached {
                return Signal::exit(
                    position.id,
                    ExitReason::Breach,
                    format!("spot {} beyond short {} by {}%", spot, short, self.config.breach_pct * 100.0),
                );
            }
        }

        if let Some(max_profit) = position.max_profit.filter(|m| *m > Decimal::ZERO) {
            let pnl = position.pnl_per_set();
            if pnl >= max_profit * to_decimal(self.config.profit_target_pct) {
                return Signal::exit(
                    position.id,
                    ExitReason::ProfitTarget,
                    format!("captured {} of max profit {}", pnl, max_profit),
                );
            }
        }

        let dte = position.min_dte(snapshot.date());
        if dte <= self.config.exit_dte {
            return Signal::exit(position.id, ExitReason::TimeExit, format!("{} DTE", dte));
        }
        Signal::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::{MarkSource, OptionLeg};
    use crate::strategy::test_support::{chain_snapshot, priced, timestamp};
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn expiry() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    /// Long 1x 21500 PE at 200, short 2x 21200 PE at 90: net debit 20,
    /// max profit 280.
    fn put_ratio(long_mark: Decimal, short_mark: Decimal) -> Position {
        let mut legs = vec![
            OptionLeg::new(dec!(21500), expiry(), OptionRight::Put, LegSide::Long, 1, dec!(200)),
            OptionLeg::new(dec!(21200), expiry(), OptionRight::Put, LegSide::Short, 2, dec!(90)),
        ];
        legs[0].set_mark(long_mark, MarkSource::Quote);
        legs[1].set_mark(short_mark, MarkSource::Quote);
        let mut position = Position::new(5, StrategyKind::RatioSpread, "NIFTY", legs, timestamp(2024, 1, 2), 1, 50);
        position.max_profit = Some(dec!(280));
        position.fill().unwrap();
        position
    }

    fn tick(day: u32, spot: f64) -> PricedSnapshot {
        priced(chain_snapshot(timestamp(2024, 1, day), spot, 0.15, &[expiry()], 100, 10))
    }

    #[test]
    fn test_max_profit() {
        let strategy = RatioSpread::new(RatioSpreadConfig::default());
        assert_eq!(strategy.max_profit(dec!(21500), dec!(21200), dec!(-20)), dec!(280));
        assert_eq!(strategy.max_profit(dec!(21500), dec!(21800), dec!(15)), dec!(315));
    }

    #[test]
    fn test_enters_one_by_two_put_ratio() {
        let mut strategy = RatioSpread::new(RatioSpreadConfig::default());
        let mut history = vec![0.12; 39];
        history.push(0.20);
        strategy.initialize(&history);

        let snapshot = priced(chain_snapshot(timestamp(2024, 1, 2), 21510.0, 0.20, &[expiry()], 50, 40));
        let Signal::Enter(proposal) = strategy.evaluate(&snapshot, &[]) else {
            panic!("expected an entry");
        };
        assert_eq!(proposal.ratio(), vec![1, 2]);
        assert_eq!(proposal.legs[0].strike, dec!(21500));
        assert_eq!(proposal.legs[0].side, LegSide::Long);
        assert!(proposal.legs[1].strike < dec!(21500));
        assert!(proposal.legs.iter().all(|l| l.right == OptionRight::Put));
        let width = proposal.legs[0].strike - proposal.legs[1].strike;
        assert_eq!(proposal.risk_per_set, width);
        assert_eq!(
            proposal.max_profit_per_set,
            Some(width + proposal.net_premium())
        );
    }

    #[test]
    fn test_breach_exit() {
        let strategy = RatioSpread::new(RatioSpreadConfig::default());
        let position = put_ratio(dec!(200), dec!(90));
        // Breach level 21200 * 0.98 = 20776.
        assert!(strategy.exit_check(&position, &tick(5, 20800.0)).is_none());
        assert!(matches!(
            strategy.exit_check(&position, &tick(5, 20770.0)),
            Signal::Exit { reason: ExitReason::Breach, .. }
        ));
    }

    #[test]
    fn test_call_ratio_breach_is_upside() {
        let strategy = RatioSpread::new(RatioSpreadConfig {
            variant: RatioVariant::CallRatio,
            ..Default::default()
        });
        let legs = vec![
            OptionLeg::new(dec!(21500), expiry(), OptionRight::Call, LegSide::Long, 1, dec!(200)),
            OptionLeg::new(dec!(21800), expiry(), OptionRight::Call, LegSide::Short, 2, dec!(90)),
        ];
        let mut position = Position::new(6, StrategyKind::RatioSpread, "NIFTY", legs, timestamp(2024, 1, 2), 1, 50);
        position.fill().unwrap();
        // 21800 * 1.02 = 22236.
        assert!(matches!(
            strategy.exit_check(&position, &tick(5, 22240.0)),
            Signal::Exit { reason: ExitReason::Breach, .. }
        ));
        assert!(strategy.exit_check(&position, &tick(5, 20000.0)).is_none());
    }

    #[test]
    fn test_profit_target_on_max_profit() {
        let strategy = RatioSpread::new(RatioSpreadConfig::default());
        // 75% of 280 = 210. Cost to close 2*60 - 330 = -210, pnl = -20 + 210 = 190.
        let short_of_target = put_ratio(dec!(330), dec!(60));
        assert!(strategy.exit_check(&short_of_target, &tick(20, 21300.0)).is_none());
        // 2*50 - 330 = -230, pnl 210.
        let at_target = put_ratio(dec!(330), dec!(50));
        assert!(matches!(
            strategy.exit_check(&at_target, &tick(20, 21300.0)),
            Signal::Exit { reason: ExitReason::ProfitTarget, .. }
        ));
    }

    #[test]
    fn test_breach_wins_over_profit_target_on_same_tick() {
        let strategy = RatioSpread::new(RatioSpreadConfig::default());
        assert!(strategy.config().validate().is_ok());
        // pnl 210 reaches 75% of 280 while spot sits below 20776.
        let position = put_ratio(dec!(330), dec!(50));
        assert!(matches!(
            strategy.exit_check(&position, &tick(20, 21300.0)),
            Signal::Exit { reason: ExitReason::ProfitTarget, .. }
        ));
        assert!(matches!(
            strategy.exit_check(&position, &tick(20, 20700.0)),
            Signal::Exit { reason: ExitReason::Breach, .. }
        ));
    }

    #[test]
    fn test_time_exit() {
        let strategy = RatioSpread::new(RatioSpreadConfig::default());
        let position = put_ratio(dec!(200), dec!(90));
        assert!(matches!(
            strategy.exit_check(&position, &tick(25, 21500.0)),
            Signal::Exit { reason: ExitReason::TimeExit, .. }
        ));
    }

    #[test]
    fn test_config_validation() {
        assert!(RatioSpreadConfig::default().validate().is_ok());
        let zero = RatioSpreadConfig {
            ratio: (1, 0),
            ..Default::default()
        };
        assert!(zero.validate().is_err());
    }
}
