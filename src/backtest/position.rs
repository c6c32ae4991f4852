//! Positions and their legs.
//!
//! Handles the position lifecycle:
//! - Entry (PENDING, then OPEN once every leg is filled)
//! - Mark-to-market of each leg
//! - P&L per unit set of the structure
//! - Close (CLOSED, archived into the ledger)
//!
//! Per-set amounts are in underlying points for one lot of the leg ratio.
//! Money amounts include the lot multiplier.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::{Greeks, OptionRight};
use crate::error::EngineFatal;
use crate::strategy::StrategyKind;

pub type PositionId = u64;

/// Long or short exposure of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegSide {
    Long,
    Short,
}

impl LegSide {
    /// +1 for long holdings, -1 for short holdings.
    pub fn holding_sign(&self) -> Decimal {
        match self {
            Self::Long => Decimal::ONE,
            Self::Short => Decimal::NEGATIVE_ONE,
        }
    }

    pub fn is_short(&self) -> bool {
        matches!(self, Self::Short)
    }

    /// Side of the order that closes this leg.
    pub fn closing(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

/// Reason for exiting a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    ProfitTarget,
    StopLoss,
    /// Underlying moved through a short strike.
    Breach,
    TimeExit,
    /// Still open after the last snapshot.
    EndOfData,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProfitTarget => "profit_target",
            Self::StopLoss => "stop_loss",
            Self::Breach => "breach",
            Self::TimeExit => "time_exit",
            Self::EndOfData => "end_of_data",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    /// Entry accepted, legs not yet filled.
    Pending,
    Open,
    Closed,
}

/// How a leg's current mark was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkSource {
    Quote,
    Theoretical,
    /// Previous mark carried forward.
    Carried,
}

/// A single leg of a multi-leg position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionLeg {
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub right: OptionRight,
    pub side: LegSide,
    /// Units of this leg per set of the structure.
    pub ratio: u32,
    /// Contracts held (ratio x lots).
    pub quantity: u32,
    /// Fill price per contract.
    pub entry_price: Decimal,
    pub entry_greeks: Greeks,
    pub entry_iv: f64,
    pub current_mark: Decimal,
    pub mark_source: MarkSource,
    /// IV behind the current mark, reused for theoretical marks.
    pub mark_iv: f64,
}

impl OptionLeg {
    pub fn new(
        strike: Decimal,
        expiry: NaiveDate,
        right: OptionRight,
        side: LegSide,
        ratio: u32,
        entry_price: Decimal,
    ) -> Self {
        Self {
            strike,
            expiry,
            right,
            side,
            ratio,
            quantity: ratio,
            entry_price,
            entry_greeks: Greeks::default(),
            entry_iv: 0.0,
            current_mark: entry_price,
            mark_source: MarkSource::Quote,
            mark_iv: 0.0,
        }
    }

    pub fn with_iv(mut self, iv: f64, greeks: Greeks) -> Self {
        self.entry_iv = iv;
        self.mark_iv = iv;
        self.entry_greeks = greeks;
        self
    }

    pub fn dte(&self, date: NaiveDate) -> i64 {
        (self.expiry - date).num_days()
    }

    pub fn contract_label(&self) -> String {
        format!("{} {} {}", self.expiry, self.strike, self.right.as_str())
    }

    pub fn set_mark(&mut self, mark: Decimal, source: MarkSource) {
        self.current_mark = mark;
        self.mark_source = source;
    }
}

/// A complete options position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub strategy: StrategyKind,
    pub underlying: String,
    pub legs: Vec<OptionLeg>,
    pub opened_at: NaiveDateTime,
    pub closed_at: Option<NaiveDateTime>,
    pub status: PositionStatus,
    /// Number of unit sets held.
    pub lots: u32,
    /// Contract multiplier of the underlying.
    pub lot_size: u32,
    pub entry_spot: Decimal,
    pub entry_iv_rank: Option<f64>,
    /// Best case per set, in points.
    pub max_profit: Option<Decimal>,
    /// Worst case per set, in points.
    pub max_loss: Option<Decimal>,
    /// Money committed against the portfolio risk budget.
    pub risk_amount: Decimal,
    pub entry_costs: Decimal,
    pub exit_costs: Decimal,
    /// Net P&L after costs (if closed).
    pub realized_pnl: Option<Decimal>,
    pub exit_reason: Option<ExitReason>,
    pub rationale: String,
}

impl Position {
    /// Create a pending position; leg quantities are scaled to `lots`.
    pub fn new(
        id: PositionId,
        strategy: StrategyKind,
        underlying: impl Into<String>,
        legs: Vec<OptionLeg>,
        opened_at: NaiveDateTime,
        lots: u32,
        lot_size: u32,
    ) -> Self {
        let legs = legs
            .into_iter()
            .map(|mut leg| {
                leg.quantity = leg.ratio * lots;
                leg
            })
            .collect();
        Self {
            id,
            strategy,
            underlying: underlying.into(),
            legs,
            opened_at,
            closed_at: None,
            status: PositionStatus::Pending,
            lots,
            lot_size,
            entry_spot: Decimal::ZERO,
            entry_iv_rank: None,
            max_profit: None,
            max_loss: None,
            risk_amount: Decimal::ZERO,
            entry_costs: Decimal::ZERO,
            exit_costs: Decimal::ZERO,
            realized_pnl: None,
            exit_reason: None,
            rationale: String::new(),
        }
    }

    fn transition(&mut self, from: PositionStatus, to: PositionStatus) -> Result<(), EngineFatal> {
        if self.status != from {
            return Err(EngineFatal::InvalidTransition {
                id: self.id,
                from: self.status,
                to,
            });
        }
        self.status = to;
        Ok(())
    }

    /// PENDING -> OPEN.
    pub fn fill(&mut self) -> Result<(), EngineFatal> {
        self.transition(PositionStatus::Pending, PositionStatus::Open)
    }

    /// OPEN -> CLOSED.
    pub fn close(
        &mut self,
        at: NaiveDateTime,
        reason: ExitReason,
        realized_pnl: Decimal,
    ) -> Result<(), EngineFatal> {
        self.transition(PositionStatus::Open, PositionStatus::Closed)?;
        self.closed_at = Some(at);
        self.exit_reason = Some(reason);
        self.realized_pnl = Some(realized_pnl);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn leg_ratio(&self) -> Vec<u32> {
        self.legs.iter().map(|l| l.ratio).collect()
    }

    /// Lots times lot size.
    pub fn multiplier(&self) -> Decimal {
        Decimal::from(self.lots) * Decimal::from(self.lot_size)
    }

    /// Net premium received per set at entry; negative for a debit.
    pub fn entry_credit(&self) -> Decimal {
        self.legs
            .iter()
            .map(|l| -l.side.holding_sign() * Decimal::from(l.ratio) * l.entry_price)
            .sum()
    }

    /// Net premium paid per set to close at current marks; negative when
    /// closing would receive money.
    pub fn cost_to_close(&self) -> Decimal {
        self.legs
            .iter()
            .map(|l| -l.side.holding_sign() * Decimal::from(l.ratio) * l.current_mark)
            .sum()
    }

    /// Gross P&L per set at current marks.
    pub fn pnl_per_set(&self) -> Decimal {
        self.entry_credit() - self.cost_to_close()
    }

    /// Gross unrealized P&L in money, before costs.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.pnl_per_set() * self.multiplier()
    }

    /// Signed value of the holdings at current marks.
    pub fn market_value(&self) -> Decimal {
        -self.cost_to_close() * self.multiplier()
    }

    /// Days to the nearest leg expiry.
    pub fn min_dte(&self, date: NaiveDate) -> i64 {
        self.legs.iter().map(|l| l.dte(date)).min().unwrap_or(0)
    }

    /// Strike of the first short leg of the given right.
    pub fn short_strike(&self, right: OptionRight) -> Option<Decimal> {
        self.legs
            .iter()
            .find(|l| l.side.is_short() && l.right == right)
            .map(|l| l.strike)
    }

    /// Whole days the position was held.
    pub fn holding_days(&self) -> i64 {
        self.closed_at
            .map(|c| (c.date() - self.opened_at.date()).num_days())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .unwrap()
            .and_hms_opt(15, 30, 0)
            .unwrap()
    }

    fn expiry(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn strangle() -> Position {
        let legs = vec![
            OptionLeg::new(dec!(22000), expiry(25), OptionRight::Call, LegSide::Short, 1, dec!(80)),
            OptionLeg::new(dec!(21000), expiry(25), OptionRight::Put, LegSide::Short, 1, dec!(70)),
        ];
        Position::new(1, StrategyKind::PremiumSelling, "NIFTY", legs, ts(2), 2, 50)
    }

    #[test]
    fn test_strangle_pnl() {
        let mut position = strangle();
        assert_eq!(position.entry_credit(), dec!(150));
        assert_eq!(position.legs[0].quantity, 2);

        position.legs[0].set_mark(dec!(40), MarkSource::Quote);
        position.legs[1].set_mark(dec!(35), MarkSource::Quote);
        assert_eq!(position.cost_to_close(), dec!(75));
        assert_eq!(position.pnl_per_set(), dec!(75));
        assert_eq!(position.unrealized_pnl(), dec!(7500));
        assert_eq!(position.market_value(), dec!(-7500));
    }

    #[test]
    fn test_debit_spread_pnl() {
        let legs = vec![
            OptionLeg::new(dec!(21500), expiry(11), OptionRight::Call, LegSide::Short, 1, dec!(120)),
            OptionLeg::new(dec!(21500), expiry(31), OptionRight::Call, LegSide::Long, 1, dec!(300)),
        ];
        let mut position = Position::new(2, StrategyKind::CalendarSpread, "NIFTY", legs, ts(2), 1, 50);
        assert_eq!(position.entry_credit(), dec!(-180));

        position.legs[0].set_mark(dec!(60), MarkSource::Quote);
        position.legs[1].set_mark(dec!(290), MarkSource::Quote);
        // Spread widened from 180 to 230.
        assert_eq!(position.pnl_per_set(), dec!(50));
        assert_eq!(position.min_dte(expiry(2)), 9);
        assert_eq!(position.short_strike(OptionRight::Call), Some(dec!(21500)));
    }

    #[test]
    fn test_status_transitions() {
        let mut position = strangle();
        assert!(position.close(ts(3), ExitReason::StopLoss, dec!(0)).is_err());
        position.fill().unwrap();
        assert!(position.is_open());
        assert!(position.fill().is_err());
        position.close(ts(5), ExitReason::ProfitTarget, dec!(100)).unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.holding_days(), 3);
        assert!(matches!(
            position.close(ts(6), ExitReason::TimeExit, dec!(0)),
            Err(EngineFatal::InvalidTransition { id: 1, .. })
        ));
    }
}
