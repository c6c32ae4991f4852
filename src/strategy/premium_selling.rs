//! Premium selling: short strangles in high implied volatility.
//!
//! - Entry: IV Rank above the threshold, expiry 7 to 45 DTE
//! - Structure: short OTM call and short OTM put near 15-20 delta
//! - Profit target: 50% of the credit captured
//! - Stop loss: loss reaches 150% of the credit
//! - Time exit: 3 DTE

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{ExitReason, LegSide, Position};
use crate::data::OptionRight;
use crate::error::ValidationResult;
use crate::pricing::{to_decimal, IvHistory, PricedSnapshot};

use super::selection::{mean_iv, otm_quotes, select_by_delta};
use super::{
    check_delta_band, check_dte_window, check_fraction, check_history, check_iv_rank, check_positive,
    open_count, EntryProposal, LegProposal, OptionsStrategy, Signal, StrategyKind,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PremiumSellingConfig {
    /// Enter only when IV Rank is above this.
    pub iv_rank_threshold: f64,
    pub delta_low: f64,
    pub delta_high: f64,
    pub min_dte: i64,
    pub max_dte: i64,
    /// Fraction of the credit to capture.
    pub profit_target_pct: f64,
    /// Loss as a multiple of the credit.
    pub stop_loss_pct: f64,
    pub exit_dte: i64,
    pub position_size_pct: f64,
    pub max_positions: usize,
    pub iv_lookback: usize,
    pub min_iv_history: usize,
}

impl Default for PremiumSellingConfig {
    fn default() -> Self {
        Self {
            iv_rank_threshold: 70.0,
            delta_low: 0.15,
            delta_high: 0.20,
            min_dte: 7,
            max_dte: 45,
            profit_target_pct: 0.50,
            stop_loss_pct: 1.50,
            exit_dte: 3,
            position_size_pct: 0.02,
            max_positions: 5,
            iv_lookback: 252,
            min_iv_history: 30,
        }
    }
}

impl PremiumSellingConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        check_iv_rank("premium_selling.iv_rank_threshold", self.iv_rank_threshold)?;
        check_delta_band("premium_selling.delta", self.delta_low, self.delta_high)?;
        check_dte_window("premium_selling.dte", self.min_dte, self.max_dte)?;
        check_dte_window("premium_selling.exit_dte", 0, self.exit_dte)?;
        check_positive("premium_selling.profit_target_pct", self.profit_target_pct)?;
        check_positive("premium_selling.stop_loss_pct", self.stop_loss_pct)?;
        check_fraction("premium_selling.position_size_pct", self.position_size_pct)?;
        check_history("premium_selling.iv_lookback", self.iv_lookback, self.min_iv_history)
    }
}

#[derive(Debug, Clone)]
pub struct PremiumSelling {
    config: PremiumSellingConfig,
    iv_history: IvHistory,
}

impl PremiumSelling {
    pub fn new(config: PremiumSellingConfig) -> Self {
        let iv_history = IvHistory::new(config.iv_lookback, config.min_iv_history);
        Self { config, iv_history }
    }

    pub fn config(&self) -> &PremiumSellingConfig {
        &self.config
    }

    /// First strangle in the DTE window, nearest expiry first.
    fn propose(&self, snapshot: &PricedSnapshot, iv_rank: f64) -> Option<EntryProposal> {
        let spot = snapshot.spot_f64();
        let (low, high) = (self.config.delta_low, self.config.delta_high);

        for expiry in snapshot.expiries_in_dte(self.config.min_dte, self.config.max_dte) {
            let calls = otm_quotes(snapshot, expiry, OptionRight::Call, spot);
            let puts = otm_quotes(snapshot, expiry, OptionRight::Put, spot);
            let (Some(call), Some(put)) = (select_by_delta(&calls, low, high), select_by_delta(&puts, low, high))
            else {
                continue;
            };

            let credit = call.mark + put.mark;
            if credit <= Decimal::ZERO {
                continue;
            }

            return Some(EntryProposal {
                strategy: StrategyKind::PremiumSelling,
                underlying: snapshot.underlying().to_string(),
                legs: vec![
                    LegProposal::from_quote(call, LegSide::Short, 1),
                    LegProposal::from_quote(put, LegSide::Short, 1),
                ],
                rationale: format!(
                    "IV rank {:.1} > {:.0}; short {} CE / {} PE expiring {} for credit {}",
                    iv_rank, self.config.iv_rank_threshold, call.strike, put.strike, expiry, credit
                ),
                risk_per_set: credit * to_decimal(self.config.stop_loss_pct),
                max_profit_per_set: Some(credit),
                max_loss_per_set: None,
                volatility: snapshot.atm_iv().unwrap_or_else(|| mean_iv(&[call, put])),
                entry_iv_rank: Some(iv_rank),
                position_size_pct: self.config.position_size_pct,
            });
        }
        None
    }
}

impl OptionsStrategy for PremiumSelling {
    fn kind(&self) -> StrategyKind {
        StrategyKind::PremiumSelling
    }

    fn leg_ratio(&self) -> Vec<u32> {
        vec![1, 1]
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
        let Some(iv_rank) = self.iv_rank() else {
            return Signal::None;
        };
        if iv_rank <= self.config.iv_rank_threshold {
            return Signal::None;
        }
        self.propose(snapshot, iv_rank)
            .map(Signal::Enter)
            .unwrap_or_default()
    }

    fn exit_check(&self, position: &Position, snapshot: &PricedSnapshot) -> Signal {
        let credit = position.entry_credit();
        let pnl = position.pnl_per_set();

        if credit > Decimal::ZERO {
            let stop = credit * to_decimal(self.config.stop_loss_pct);
            if -pnl >= stop {
                return Signal::exit(
                    position.id,
                    ExitReason::StopLoss,
                    format!("loss {} >= {} on credit {}", -pnl, stop, credit),
                );
            }
            let target = credit * to_decimal(self.config.profit_target_pct);
            if pnl >= target {
                return Signal::exit(
                    position.id,
                    ExitReason::ProfitTarget,
                    format!("captured {} >= {} on credit {}", pnl, target, credit),
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

    fn high_rank_strategy(config: PremiumSellingConfig) -> PremiumSelling {
        let mut strategy = PremiumSelling::new(config);
        let mut history = vec![0.12; 39];
        history.push(0.20);
        strategy.initialize(&history);
        strategy
    }

    fn strangle(call_mark: Decimal, put_mark: Decimal) -> Position {
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let mut legs = vec![
            OptionLeg::new(dec!(22500), expiry, OptionRight::Call, LegSide::Short, 1, dec!(80)),
            OptionLeg::new(dec!(20500), expiry, OptionRight::Put, LegSide::Short, 1, dec!(70)),
        ];
        legs[0].set_mark(call_mark, MarkSource::Quote);
        legs[1].set_mark(put_mark, MarkSource::Quote);
        let mut position = Position::new(7, StrategyKind::PremiumSelling, "NIFTY", legs, timestamp(2024, 1, 2), 1, 50);
        position.fill().unwrap();
        position
    }

    fn tick(day: u32) -> PricedSnapshot {
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        priced(chain_snapshot(timestamp(2024, 1, day), 21500.0, 0.15, &[expiry], 100, 10))
    }

    #[test]
    fn test_defaults_validate() {
        assert!(PremiumSellingConfig::default().validate().is_ok());
        let bad = PremiumSellingConfig {
            min_dte: 50,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_enters_short_strangle_in_high_iv() {
        let strategy = high_rank_strategy(PremiumSellingConfig::default());
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let snapshot = priced(chain_snapshot(timestamp(2024, 1, 2), 21500.0, 0.20, &[expiry], 50, 40));

        let Signal::Enter(proposal) = strategy.evaluate(&snapshot, &[]) else {
            panic!("expected an entry");
        };
        assert_eq!(proposal.legs.len(), 2);
        assert!(proposal.legs.iter().all(|l| l.side == LegSide::Short));

        let call = &proposal.legs[0];
        let put = &proposal.legs[1];
        assert_eq!(call.right, OptionRight::Call);
        assert!(call.strike > dec!(21500));
        assert!(put.strike < dec!(21500));
        assert!(call.greeks.delta >= 0.15 && call.greeks.delta <= 0.20);
        assert!(put.greeks.delta <= -0.15 && put.greeks.delta >= -0.20);
        assert_eq!(proposal.max_profit_per_set, Some(proposal.net_premium()));
        assert_eq!(proposal.risk_per_set, proposal.net_premium() * dec!(1.5));
        assert_eq!(proposal.validate(&strategy.leg_ratio()), Ok(()));
    }

    #[test]
    fn test_no_entry_without_high_rank_or_capacity() {
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let snapshot = priced(chain_snapshot(timestamp(2024, 1, 2), 21500.0, 0.20, &[expiry], 50, 40));

        let mut low = PremiumSelling::new(PremiumSellingConfig::default());
        low.initialize(&[0.20; 40]);
        assert!(low.evaluate(&snapshot, &[]).is_none());

        let cold = PremiumSelling::new(PremiumSellingConfig::default());
        assert!(cold.evaluate(&snapshot, &[]).is_none());

        let full = high_rank_strategy(PremiumSellingConfig {
            max_positions: 1,
            ..Default::default()
        });
        let open = strangle(dec!(80), dec!(70));
        assert!(full.evaluate(&snapshot, &[&open]).is_none());
    }

    #[test]
    fn test_profit_target_fires_at_half_credit() {
        let strategy = PremiumSelling::new(PremiumSellingConfig::default());
        let snapshot = tick(10);

        assert!(strategy.exit_check(&strangle(dec!(40), dec!(36)), &snapshot).is_none());

        let signal = strategy.exit_check(&strangle(dec!(40), dec!(35)), &snapshot);
        assert!(matches!(
            signal,
            Signal::Exit {
                position_id: 7,
                reason: ExitReason::ProfitTarget,
                ..
            }
        ));
    }

    #[test]
    fn test_stop_loss_at_one_and_half_credit() {
        let strategy = PremiumSelling::new(PremiumSellingConfig::default());
        // Cost to close 375 = credit 150 + loss 225.
        let signal = strategy.exit_check(&strangle(dec!(300), dec!(75)), &tick(10));
        assert!(matches!(signal, Signal::Exit { reason: ExitReason::StopLoss, .. }));
    }

    #[test]
    fn test_time_exit_regardless_of_pnl() {
        let strategy = PremiumSelling::new(PremiumSellingConfig::default());
        let snapshot = priced(chain_snapshot(
            timestamp(2024, 2, 26),
            21500.0,
            0.15,
            &[NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()],
            100,
            10,
        ));
        let signal = strategy.exit_check(&strangle(dec!(78), dec!(70)), &snapshot);
        assert!(matches!(signal, Signal::Exit { reason: ExitReason::TimeExit, .. }));
    }
}
