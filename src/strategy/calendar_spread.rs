//! Calendar spread: long vega in low implied volatility.
//!
//! Sells the near-term ATM call and buys the same strike further out. The
//! position is worth `far - near`; the entry debit is the risk.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{ExitReason, LegSide, Position};
use crate::data::OptionRight;
use crate::error::ValidationResult;
use crate::pricing::{to_decimal, IvHistory, PricedQuote, PricedSnapshot};

use super::selection::{mean_iv, nearest_strike};
use super::{
    check_dte_window, check_fraction, check_history, check_iv_rank, check_positive, open_count,
    EntryProposal, LegProposal, OptionsStrategy, Signal, StrategyKind,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarSpreadConfig {
    /// Enter only when IV Rank is below this.
    pub iv_rank_threshold: f64,
    pub near_min_dte: i64,
    pub near_max_dte: i64,
    pub far_min_dte: i64,
    pub far_max_dte: i64,
    /// Fraction of the debit to gain.
    pub profit_target_pct: f64,
    /// Fraction of the debit to lose.
    pub stop_loss_pct: f64,
    /// Exit when the near leg is this close to expiry.
    pub exit_dte: i64,
    pub position_size_pct: f64,
    pub max_positions: usize,
    pub iv_lookback: usize,
    pub min_iv_history: usize,
}

impl Default for CalendarSpreadConfig {
    fn default() -> Self {
        Self {
            iv_rank_threshold: 30.0,
            near_min_dte: 7,
            near_max_dte: 14,
            far_min_dte: 30,
            far_max_dte: 45,
            profit_target_pct: 0.35,
            stop_loss_pct: 0.50,
            exit_dte: 3,
            position_size_pct: 0.015,
            max_positions: 3,
            iv_lookback: 252,
            min_iv_history: 30,
        }
    }
}

impl CalendarSpreadConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        check_iv_rank("calendar_spread.iv_rank_threshold", self.iv_rank_threshold)?;
        check_dte_window("calendar_spread.near_dte", self.near_min_dte, self.near_max_dte)?;
        check_dte_window("calendar_spread.far_dte", self.far_min_dte, self.far_max_dte)?;
        check_dte_window("calendar_spread.near_far", self.near_max_dte, self.far_min_dte)?;
        check_dte_window("calendar_spread.exit_dte", 0, self.exit_dte)?;
        check_positive("calendar_spread.profit_target_pct", self.profit_target_pct)?;
        check_fraction("calendar_spread.stop_loss_pct", self.stop_loss_pct)?;
        check_fraction("calendar_spread.position_size_pct", self.position_size_pct)?;
        check_history("calendar_spread.iv_lookback", self.iv_lookback, self.min_iv_history)
    }
}

#[derive(Debug, Clone)]
pub struct CalendarSpread {
    config: CalendarSpreadConfig,
    iv_history: IvHistory,
}

impl CalendarSpread {
    pub fn new(config: CalendarSpreadConfig) -> Self {
        let iv_history = IvHistory::new(config.iv_lookback, config.min_iv_history);
        Self { config, iv_history }
    }

    pub fn config(&self) -> &CalendarSpreadConfig {
        &self.config
    }

    fn propose(&self, snapshot: &PricedSnapshot, iv_rank: f64) -> Option<EntryProposal> {
        let near_expiry = *snapshot
            .expiries_in_dte(self.config.near_min_dte, self.config.near_max_dte)
            .first()?;
        let far_expiry = *snapshot
            .expiries_in_dte(self.config.far_min_dte, self.config.far_max_dte)
            .first()?;

        // ATM among strikes listed in both expiries.
        let near_calls: Vec<&PricedQuote> = snapshot
            .side(near_expiry, OptionRight::Call)
            .filter(|q| snapshot.find(far_expiry, q.strike, OptionRight::Call).is_some())
            .collect();
        let near = nearest_strike(&near_calls, snapshot.spot_f64())?;
        let far = snapshot.find(far_expiry, near.strike, OptionRight::Call)?;

        let debit = far.mark - near.mark;
        if debit <= Decimal::ZERO {
            return None;
        }

        Some(EntryProposal {
            strategy: StrategyKind::CalendarSpread,
            underlying: snapshot.underlying().to_string(),
            legs: vec![
                LegProposal::from_quote(near, LegSide::Short, 1),
                LegProposal::from_quote(far, LegSide::Long, 1),
            ],
            rationale: format!(
                "IV rank {:.1} < {:.0}; {} CE {} / {} for debit {}",
                iv_rank, self.config.iv_rank_threshold, near.strike, near_expiry, far_expiry, debit
            ),
            risk_per_set: debit,
            max_profit_per_set: None,
            max_loss_per_set: Some(debit),
            volatility: snapshot.atm_iv().unwrap_or_else(|| mean_iv(&[near, far])),
            entry_iv_rank: Some(iv_rank),
            position_size_pct: self.config.position_size_pct,
        })
    }
}

impl OptionsStrategy for CalendarSpread {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CalendarSpread
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
        match self.iv_rank() {
            Some(rank) if rank < self.config.iv_rank_threshold => self
                .propose(snapshot, rank)
                .map(Signal::Enter)
                .unwrap_or_default(),
            _ => Signal::None,
        }
    }

    fn exit_check(&self, position: &Position, snapshot: &PricedSnapshot) -> Signal {
        let debit = -position.entry_credit();
        let pnl = position.pnl_per_set();

        if debit > Decimal::ZERO {
            if -pnl >= debit * to_decimal(self.config.stop_loss_pct) {
                return Signal::exit(
                    position.id,
                    ExitReason::StopLoss,
                    format!("loss {} on debit {}", -pnl, debit),
                );
            }
            if pnl >= debit * to_decimal(self.config.profit_target_pct) {
                return Signal::exit(
                    position.id,
                    ExitReason::ProfitTarget,
                    format!("gain {} on debit {}", pnl, debit),
                );
            }
        }

        let near_dte = position.min_dte(snapshot.date());
        if near_dte <= self.config.exit_dte {
            return Signal::exit(
                position.id,
                ExitReason::TimeExit,
                format!("near leg at {} DTE", near_dte),
            );
        }
        Signal::None
    }
}
