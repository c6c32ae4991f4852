//! Per-tick strategy output.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{ExitReason, LegSide, OptionLeg, PositionId};
use crate::data::{Greeks, OptionRight};
use crate::error::{ValidationError, ValidationResult};
use crate::pricing::PricedQuote;

use super::StrategyKind;

/// One leg of a proposed entry, priced at the snapshot mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegProposal {
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub right: OptionRight,
    pub side: LegSide,
    /// Units of this leg per set.
    pub ratio: u32,
    pub price: Decimal,
    pub iv: f64,
    pub greeks: Greeks,
}

impl LegProposal {
    pub fn from_quote(quote: &PricedQuote, side: LegSide, ratio: u32) -> Self {
        Self {
            strike: quote.strike,
            expiry: quote.expiry,
            right: quote.right,
            side,
            ratio,
            price: quote.mark,
            iv: quote.iv,
            greeks: quote.greeks,
        }
    }

    /// Position leg filled at `fill_price`.
    pub fn to_leg(&self, fill_price: Decimal) -> OptionLeg {
        OptionLeg::new(self.strike, self.expiry, self.right, self.side, self.ratio, fill_price)
            .with_iv(self.iv, self.greeks)
    }
}

/// A fully specified entry candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryProposal {
    pub strategy: StrategyKind,
    pub underlying: String,
    pub legs: Vec<LegProposal>,
    pub rationale: String,
    /// Points at risk per set, used for sizing and the portfolio budget.
    pub risk_per_set: Decimal,
    pub max_profit_per_set: Option<Decimal>,
    pub max_loss_per_set: Option<Decimal>,
    /// Annualized volatility used by volatility-normalized sizing.
    pub volatility: f64,
    pub entry_iv_rank: Option<f64>,
    /// Fraction of capital the strategy allocates per trade.
    pub position_size_pct: f64,
}

impl EntryProposal {
    /// Net premium per set at the proposal marks; negative for a debit.
    pub fn net_premium(&self) -> Decimal {
        self.legs
            .iter()
            .map(|l| -l.side.holding_sign() * Decimal::from(l.ratio) * l.price)
            .sum()
    }

    pub fn ratio(&self) -> Vec<u32> {
        self.legs.iter().map(|l| l.ratio).collect()
    }

    /// Check leg count and that leg units are proportional to `expected`.
    pub fn validate(&self, expected: &[u32]) -> ValidationResult<()> {
        if self.legs.is_empty() || self.legs.len() > 4 {
            return Err(ValidationError::LegCount(self.legs.len()));
        }
        let proposed = self.ratio();
        if !ratio_matches(&proposed, expected) {
            return Err(ValidationError::RatioMismatch {
                expected: expected.to_vec(),
                proposed,
            });
        }
        Ok(())
    }
}

/// True when both ratios have the same shape and proportions.
pub fn ratio_matches(proposed: &[u32], expected: &[u32]) -> bool {
    if proposed.len() != expected.len() || proposed.is_empty() {
        return false;
    }
    if proposed.iter().chain(expected.iter()).any(|&u| u == 0) {
        return false;
    }
    let (p0, e0) = (proposed[0] as u64, expected[0] as u64);
    proposed
        .iter()
        .zip(expected.iter())
        .all(|(&p, &e)| p as u64 * e0 == e as u64 * p0)
}

/// Strategy output for one tick.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Signal {
    #[default]
    None,
    Enter(EntryProposal),
    Exit {
        position_id: PositionId,
        reason: ExitReason,
        detail: String,
    },
}

impl Signal {
    pub fn exit(position_id: PositionId, reason: ExitReason, detail: impl Into<String>) -> Self {
        Self::Exit {
            position_id,
            reason,
            detail: detail.into(),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(side: LegSide, ratio: u32, price: Decimal) -> LegProposal {
        LegProposal {
            strike: dec!(21500),
            expiry: NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
            right: OptionRight::Put,
            side,
            ratio,
            price,
            iv: 0.15,
            greeks: Greeks::default(),
        }
    }

    fn proposal(legs: Vec<LegProposal>) -> EntryProposal {
        EntryProposal {
            strategy: StrategyKind::RatioSpread,
            underlying: "NIFTY".to_string(),
            legs,
            rationale: String::new(),
            risk_per_set: dec!(100),
            max_profit_per_set: None,
            max_loss_per_set: None,
            volatility: 0.15,
            entry_iv_rank: Some(65.0),
            position_size_pct: 0.01,
        }
    }

    #[test]
    fn test_ratio_matches() {
        assert!(ratio_matches(&[1, 2], &[1, 2]));
        assert!(ratio_matches(&[2, 4], &[1, 2]));
        assert!(!ratio_matches(&[1, 3], &[1, 2]));
        assert!(!ratio_matches(&[1, 2, 1], &[1, 2]));
        assert!(!ratio_matches(&[0, 0], &[1, 2]));
    }

    #[test]
    fn test_one_by_three_rejected_against_one_by_two() {
        let p = proposal(vec![
            leg(LegSide::Long, 1, dec!(200)),
            leg(LegSide::Short, 3, dec!(80)),
        ]);
        assert_eq!(
            p.validate(&[1, 2]),
            Err(ValidationError::RatioMismatch {
                expected: vec![1, 2],
                proposed: vec![1, 3],
            })
        );
    }

    #[test]
    fn test_net_premium_and_leg_count() {
        let p = proposal(vec![
            leg(LegSide::Long, 1, dec!(200)),
            leg(LegSide::Short, 2, dec!(80)),
        ]);
        assert_eq!(p.net_premium(), dec!(-40));
        assert!(p.validate(&[1, 2]).is_ok());

        let empty = proposal(Vec::new());
        assert_eq!(empty.validate(&[1, 2]), Err(ValidationError::LegCount(0)));
    }
}
