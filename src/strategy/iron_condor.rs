//! Iron condor: defined-risk premium selling.
//!
//! - Entry: IV Rank above 50, expiry 14 to 45 DTE
//! - Structure: short 15-20 delta put and call, long wings at the configured
//!   width beyond each short strike
//! - Profit target: 50% of the credit
//! - Stop loss: loss of 200% of the credit, or the underlying trading through
//!   a short strike
//! - Time exit: 7 DTE

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{ExitReason, LegSide, Position};
use crate::data::OptionRight;
use crate::error::{ValidationError, ValidationResult};
use crate::pricing::{to_decimal, IvHistory, PricedQuote, PricedSnapshot};

use super::selection::{mean_iv, otm_quotes, select_by_delta};
use super::{
    check_delta_band, check_dte_window, check_fraction, check_history, check_iv_rank, check_positive,
    open_count, EntryProposal, LegProposal, OptionsStrategy, Signal, StrategyKind,
};

/// Max loss and max profit of an iron condor, in points.
pub fn iron_condor_risk(wing_width: Decimal, net_credit: Decimal, quantity: u32) -> (Decimal, Decimal) {
    let quantity = Decimal::from(quantity);
    ((wing_width - net_credit) * quantity, net_credit * quantity)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IronCondorConfig {
    pub iv_rank_threshold: f64,
    pub delta_low: f64,
    pub delta_high: f64,
    /// Wing width in points per underlying.
    pub wing_widths: BTreeMap<String, Decimal>,
    pub default_wing_width: Decimal,
    pub min_dte: i64,
    pub max_dte: i64,
    pub profit_target_pct: f64,
    pub stop_loss_pct: f64,
    pub exit_dte: i64,
    pub position_size_pct: f64,
    pub max_positions: usize,
    pub iv_lookback: usize,
    pub min_iv_history: usize,
}

impl Default for IronCondorConfig {
    fn default() -> Self {
        Self {
            iv_rank_threshold: 50.0,
            delta_low: 0.15,
            delta_high: 0.20,
            wing_widths: BTreeMap::from([
                ("NIFTY".to_string(), Decimal::from(50)),
                ("BANKNIFTY".to_string(), Decimal::from(100)),
                ("SENSEX".to_string(), Decimal::from(100)),
            ]),
            default_wing_width: Decimal::from(100),
            min_dte: 14,
            max_dte: 45,
            profit_target_pct: 0.50,
            stop_loss_pct: 2.00,
            exit_dte: 7,
            position_size_pct: 0.02,
            max_positions: 3,
            iv_lookback: 252,
            min_iv_history: 30,
        }
    }
}

impl IronCondorConfig {
    pub fn wing_width(&self, underlying: &str) -> Decimal {
        self.wing_widths
            .get(underlying)
            .copied()
            .unwrap_or(self.default_wing_width)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        check_iv_rank("iron_condor.iv_rank_threshold", self.iv_rank_threshold)?;
        check_delta_band("iron_condor.delta", self.delta_low, self.delta_high)?;
        check_dte_window("iron_condor.dte", self.min_dte, self.max_dte)?;
        check_dte_window("iron_condor.exit_dte", 0, self.exit_dte)?;
        check_positive("iron_condor.profit_target_pct", self.profit_target_pct)?;
        check_positive("iron_condor.stop_loss_pct", self.stop_loss_pct)?;
        check_fraction("iron_condor.position_size_pct", self.position_size_pct)?;
        for (underlying, width) in &self.wing_widths {
            if *width <= Decimal::ZERO {
                return Err(ValidationError::invalid(
                    format!("iron_condor.wing_widths.{}", underlying),
                    "must be positive",
                ));
            }
        }
        if self.default_wing_width <= Decimal::ZERO {
            return Err(ValidationError::invalid(
                "iron_condor.default_wing_width",
                "must be positive",
            ));
        }
        check_history("iron_condor.iv_lookback", self.iv_lookback, self.min_iv_history)
    }
}

#[derive(Debug, Clone)]
pub struct IronCondor {
    config: IronCondorConfig,
    iv_history: IvHistory,
}

impl IronCondor {
    pub fn new(config: IronCondorConfig) -> Self {
        let iv_history = IvHistory::new(config.iv_lookback, config.min_iv_history);
        Self { config, iv_history }
    }

    pub fn config(&self) -> &IronCondorConfig {
        &self.config
    }

    /// Long wing at `short ± width`, else the nearest listed strike beyond
    /// the short.
    fn wing<'a>(
        snapshot: &'a PricedSnapshot,
        short: &PricedQuote,
        width: Decimal,
    ) -> Option<&'a PricedQuote> {
        let target = match short.right {
            OptionRight::Call => short.strike + width,
            OptionRight::Put => short.strike - width,
        };
        if let Some(exact) = snapshot.find(short.expiry, target, short.right) {
            return Some(exact);
        }
        let beyond = snapshot.side(short.expiry, short.right);
        match short.right {
            OptionRight::Call => beyond.filter(|q| q.strike > short.strike).min_by_key(|q| q.strike),
            OptionRight::Put => beyond.filter(|q| q.strike < short.strike).max_by_key(|q| q.strike),
        }
    }

    fn propose(&self, snapshot: &PricedSnapshot, iv_rank: f64) -> Option<EntryProposal> {
        let spot = snapshot.spot_f64();
        let (low, high) = (self.config.delta_low, self.config.delta_high);
        let width = self.config.wing_width(snapshot.underlying());

        for expiry in snapshot.expiries_in_dte(self.config.min_dte, self.config.max_dte) {
            let calls = otm_quotes(snapshot, expiry, OptionRight::Call, spot);
            let puts = otm_quotes(snapshot, expiry, OptionRight::Put, spot);
            let (Some(short_call), Some(short_put)) =
                (select_by_delta(&calls, low, high), select_by_delta(&puts, low, high))
            else {
                continue;
            };
            let (Some(long_call), Some(long_put)) = (
                Self::wing(snapshot, short_call, width),
                Self::wing(snapshot, short_put, width),
            ) else {
                continue;
            };

            let credit = short_call.mark + short_put.mark - long_call.mark - long_put.mark;
            if credit <= Decimal::ZERO {
                continue;
            }

            // Uneven listings can leave the wings at different widths; risk is
            // taken on the wider one, where the max loss is realized.
            let wing = (long_call.strike - short_call.strike).max(short_put.strike - long_put.strike);
            let (max_loss, max_profit) = iron_condor_risk(wing, credit, 1);
            let risk_per_set = if max_loss > Decimal::ZERO { max_loss } else { wing };

            return Some(EntryProposal {
                strategy: StrategyKind::IronCondor,
                underlying: snapshot.underlying().to_string(),
                legs: vec![
                    LegProposal::from_quote(long_put, LegSide::Long, 1),
                    LegProposal::from_quote(short_put, LegSide::Short, 1),
                    LegProposal::from_quote(short_call, LegSide::Short, 1),
                    LegProposal::from_quote(long_call, LegSide::Long, 1),
                ],
                rationale: format!(
                    "IV rank {:.1} > {:.0}; {}/{}/{}/{} expiring {} for credit {}",
                    iv_rank,
                    self.config.iv_rank_threshold,
                    long_put.strike,
                    short_put.strike,
                    short_call.strike,
                    long_call.strike,
                    expiry,
                    credit
                ),
                risk_per_set,
                max_profit_per_set: Some(max_profit),
                max_loss_per_set: Some(max_loss.max(Decimal::ZERO)),
                volatility: snapshot
                    .atm_iv()
                    .unwrap_or_else(|| mean_iv(&[short_call, short_put])),
                entry_iv_rank: Some(iv_rank),
                position_size_pct: self.config.position_size_pct,
            });
        }
        None
    }
}

impl OptionsStrategy for IronCondor {
    fn kind(&self) -> StrategyKind {
        StrategyKind::IronCondor
    }

    fn leg_ratio(&self) -> Vec<u32> {
        vec![1, 1, 1, 1]
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
        let credit = position.entry_credit();
        let pnl = position.pnl_per_set();
        let spot = snapshot.spot();

        if credit > Decimal::ZERO && -pnl >= credit * to_decimal(self.config.stop_loss_pct) {
            return Signal::exit(
                position.id,
                ExitReason::StopLoss,
                format!("loss {} on credit {}", -pnl, credit),
            );
        }
        if let Some(short_call) = position.short_strike(OptionRight::Call) {
            if spot >= short_call {
                return Signal::exit(
                    position.id,
                    ExitReason::Breach,
                    format!("spot {} >= short call {}", spot, short_call),
                );
            }
        }
        if let Some(short_put) = position.short_strike(OptionRight::Put) {
            if spot <= short_put {
                return Signal::exit(
                    position.id,
                    ExitReason::Breach,
                    format!("spot {} <= short put {}", spot, short_put),
                );
            }
        }
        if credit > Decimal::ZERO && pnl >= credit * to_decimal(self.config.profit_target_pct) {
            return Signal::exit(
                position.id,
                ExitReason::ProfitTarget,
                format!("captured {} on credit {}", pnl, credit),
            );
        }

        let dte = position.min_dte(snapshot.date());
        if dte <= self.config.exit_dte {
            return Signal::exit(position.id, ExitReason::TimeExit, format!("{} DTE", dte));
        }
        Signal::None
    }
}
