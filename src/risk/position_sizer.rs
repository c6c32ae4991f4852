//! Position sizing module.
//!
//! Turns a candidate entry into a whole number of lots. The policy decides
//! the raw size; every policy is then bounded by:
//! - Portfolio risk: total open risk at most `max_portfolio_risk` of capital
//! - Lot cap: at most `max_lots` per trade
//!
//! Sizes below one lot come back as zero. The caller drops the signal; it is
//! not an error.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};
use crate::pricing::to_f64;

const TRADING_DAYS: f64 = 252.0;

/// How the raw lot count is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingPolicy {
    /// A fixed fraction of capital divided by risk per set.
    #[default]
    FixedFraction,
    /// Risk budget per trade divided by the worst-case loss per set.
    MaxLoss,
    /// Fractional Kelly on the realized win rate and payoff ratio.
    Kelly,
    /// Equal expected daily move per position.
    VolatilityNormalized,
}

impl SizingPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FixedFraction => "fixed_fraction",
            Self::MaxLoss => "max_loss",
            Self::Kelly => "kelly",
            Self::VolatilityNormalized => "volatility_normalized",
        }
    }
}

/// Position sizing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionSizerConfig {
    pub policy: SizingPolicy,
    /// Risk budget per trade as a fraction of capital (max-loss policy).
    pub risk_per_trade: f64,
    /// Maximum total open risk as a fraction of capital.
    pub max_portfolio_risk: f64,
    /// Multiplier applied to the full Kelly fraction.
    pub kelly_fraction: f64,
    /// Upper bound on the Kelly allocation as a fraction of capital.
    pub max_position_pct: f64,
    /// Target daily risk as a fraction of capital (volatility policy).
    pub target_risk: f64,
    /// Maximum lots per trade.
    pub max_lots: u32,
}

impl Default for PositionSizerConfig {
    fn default() -> Self {
        Self {
            policy: SizingPolicy::FixedFraction,
            risk_per_trade: 0.01,
            max_portfolio_risk: 0.10,
            kelly_fraction: 0.25,
            max_position_pct: 0.02,
            target_risk: 0.01,
            max_lots: 100,
        }
    }
}

impl PositionSizerConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        let fractions = [
            ("sizing.risk_per_trade", self.risk_per_trade),
            ("sizing.max_portfolio_risk", self.max_portfolio_risk),
            ("sizing.kelly_fraction", self.kelly_fraction),
            ("sizing.max_position_pct", self.max_position_pct),
            ("sizing.target_risk", self.target_risk),
        ];
        for (field, value) in fractions {
            if !(value > 0.0 && value <= 1.0) {
                return Err(ValidationError::invalid(field, format!("{} is outside (0, 1]", value)));
            }
        }
        if self.max_lots == 0 {
            return Err(ValidationError::invalid("sizing.max_lots", "must be at least 1"));
        }
        Ok(())
    }
}

/// Realized trade statistics feeding the Kelly policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KellyInputs {
    pub win_rate: f64,
    /// Average win divided by average loss.
    pub win_loss_ratio: f64,
}

impl Default for KellyInputs {
    /// Prior used before any trade has closed.
    fn default() -> Self {
        Self {
            win_rate: 0.5,
            win_loss_ratio: 1.5,
        }
    }
}

impl KellyInputs {
    /// Derive from closed-trade P&Ls; falls back to the prior unless there
    /// is at least one win and one loss.
    pub fn from_pnls(pnls: &[Decimal]) -> Self {
        let wins: Vec<f64> = pnls.iter().filter(|p| p.is_sign_positive() && !p.is_zero()).map(|p| to_f64(*p)).collect();
        let losses: Vec<f64> = pnls.iter().filter(|p| p.is_sign_negative()).map(|p| -to_f64(*p)).collect();
        if wins.is_empty() || losses.is_empty() {
            return Self::default();
        }
        let avg_win = wins.iter().sum::<f64>() / wins.len() as f64;
        let avg_loss = losses.iter().sum::<f64>() / losses.len() as f64;
        Self {
            win_rate: wins.len() as f64 / pnls.len() as f64,
            win_loss_ratio: if avg_loss > 0.0 { avg_win / avg_loss } else { 0.0 },
        }
    }

    /// Capped fractional Kelly allocation.
    pub fn allocation(&self, kelly_fraction: f64, max_position_pct: f64) -> f64 {
        let p = self.win_rate.clamp(0.01, 0.99);
        let b = self.win_loss_ratio.max(0.1);
        let full = (b * p - (1.0 - p)) / b;
        (full * kelly_fraction).clamp(0.0, max_position_pct)
    }
}

/// Everything the sizer needs to know about one candidate entry.
///
/// Per-set amounts are in underlying points for one unit set of the
/// structure (one lot of the configured leg ratio).
#[derive(Debug, Clone, PartialEq)]
pub struct SizingRequest {
    pub capital: Decimal,
    /// Risk already committed by open positions, in money.
    pub open_risk: Decimal,
    pub lot_size: u32,
    pub risk_per_set: Decimal,
    pub max_loss_per_set: Option<Decimal>,
    pub premium_per_set: Decimal,
    /// Annualized volatility of the traded structure.
    pub volatility: f64,
    /// Strategy position fraction for the fixed-fraction policy.
    pub fraction: f64,
    pub kelly: KellyInputs,
}

/// Result of position sizing calculation.
#[derive(Debug, Clone, PartialEq)]
pub struct SizingResult {
    /// Recommended number of lots.
    pub lots: u32,
    /// Size the policy alone would take.
    pub max_by_policy: u32,
    /// Maximum allowed by the remaining portfolio risk budget.
    pub max_by_portfolio_risk: u32,
    pub max_by_lot_cap: u32,
    /// Money at risk for the recommended size.
    pub risk_amount: Decimal,
    pub is_constrained: bool,
    pub constraint_reason: Option<String>,
}

impl SizingResult {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            lots: 0,
            max_by_policy: 0,
            max_by_portfolio_risk: 0,
            max_by_lot_cap: 0,
            risk_amount: Decimal::ZERO,
            is_constrained: true,
            constraint_reason: Some(reason.into()),
        }
    }

    /// Check if the trade is allowed (at least 1 lot).
    pub fn is_allowed(&self) -> bool {
        self.lots >= 1
    }
}

fn floor_lots(value: f64) -> u32 {
    if value.is_finite() && value > 0.0 {
        value.floor().min(u32::MAX as f64) as u32
    } else {
        0
    }
}

/// Position sizer for determining lot counts.
#[derive(Debug, Clone)]
pub struct PositionSizer {
    config: PositionSizerConfig,
}

impl PositionSizer {
    pub fn new(config: PositionSizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PositionSizerConfig {
        &self.config
    }

    /// Calculate the number of lots for a new trade.
    pub fn calculate(&self, request: &SizingRequest) -> SizingResult {
        let capital = to_f64(request.capital);
        let lot = request.lot_size.max(1) as f64;
        let risk_per_set = to_f64(request.risk_per_set);

        if capital <= 0.0 {
            return SizingResult::rejected("No capital available");
        }
        if risk_per_set <= 0.0 {
            return SizingResult::rejected("Invalid risk per set");
        }

        let max_by_policy = match self.config.policy {
            SizingPolicy::FixedFraction => floor_lots(capital * request.fraction / (risk_per_set * lot)),
            SizingPolicy::MaxLoss => {
                let max_loss = request
                    .max_loss_per_set
                    .map(to_f64)
                    .filter(|l| *l > 0.0)
                    .unwrap_or(risk_per_set);
                floor_lots(capital * self.config.risk_per_trade / (max_loss * lot))
            }
            SizingPolicy::Kelly => {
                let allocation = request
                    .kelly
                    .allocation(self.config.kelly_fraction, self.config.max_position_pct);
                floor_lots(capital * allocation / (risk_per_set * lot))
            }
            SizingPolicy::VolatilityNormalized => {
                let premium = to_f64(request.premium_per_set).abs();
                let daily_vol = request.volatility / TRADING_DAYS.sqrt();
                let expected_move = premium * daily_vol * 2.0 * lot;
                if expected_move <= 0.0 {
                    return SizingResult::rejected("Invalid volatility or premium");
                }
                floor_lots(capital * self.config.target_risk / expected_move)
            }
        };

        let budget = capital * self.config.max_portfolio_risk - to_f64(request.open_risk);
        let max_by_portfolio_risk = if budget > 0.0 {
            floor_lots(budget / (risk_per_set * lot))
        } else {
            0
        };
        let max_by_lot_cap = self.config.max_lots;

        let lots = max_by_policy.min(max_by_portfolio_risk).min(max_by_lot_cap);

        let (is_constrained, constraint_reason) = if lots < max_by_policy {
            if lots == max_by_portfolio_risk {
                (
                    true,
                    Some(format!(
                        "Portfolio risk limit ({:.1}% of capital)",
                        self.config.max_portfolio_risk * 100.0
                    )),
                )
            } else {
                (true, Some(format!("Lot cap ({} lots)", max_by_lot_cap)))
            }
        } else if lots == 0 {
            (true, Some(format!("{} size below one lot", self.config.policy.as_str())))
        } else {
            (false, None)
        };

        SizingResult {
            lots,
            max_by_policy,
            max_by_portfolio_risk,
            max_by_lot_cap,
            risk_amount: request.risk_per_set * Decimal::from(lots) * Decimal::from(request.lot_size.max(1)),
            is_constrained,
            constraint_reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    fn request() -> SizingRequest {
        SizingRequest {
            capital: dec!(1_000_000),
            open_risk: dec!(0),
            lot_size: 50,
            risk_per_set: dec!(100),
            max_loss_per_set: Some(dec!(200)),
            premium_per_set: dec!(150),
            volatility: 0.20,
            fraction: 0.02,
            kelly: KellyInputs::default(),
        }
    }

    fn sizer(policy: SizingPolicy) -> PositionSizer {
        PositionSizer::new(PositionSizerConfig {
            policy,
            ..Default::default()
        })
    }

    #[test]
    fn test_default_config() {
        let config = PositionSizerConfig::default();
        assert_eq!(config.policy, SizingPolicy::FixedFraction);
        assert_eq!(config.max_portfolio_risk, 0.10);
        assert_eq!(config.max_lots, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_fraction() {
        // 1M * 2% = 20k budget / (100 points * 50) = 4 lots
        let result = sizer(SizingPolicy::FixedFraction).calculate(&request());
        assert_eq!(result.lots, 4);
        assert_eq!(result.risk_amount, dec!(20000));
        assert!(!result.is_constrained);
    }

    #[test]
    fn test_max_loss_uses_worst_case() {
        // 1M * 1% = 10k / (200 * 50) = 1 lot
        let result = sizer(SizingPolicy::MaxLoss).calculate(&request());
        assert_eq!(result.max_by_policy, 1);
        assert_eq!(result.lots, 1);
    }

    #[test]
    fn test_kelly_allocation_is_capped() {
        let kelly = KellyInputs {
            win_rate: 0.6,
            win_loss_ratio: 2.0,
        };
        // full kelly 0.4, quarter kelly 0.1, capped at 0.02
        assert_relative_eq!(kelly.allocation(0.25, 0.02), 0.02);

        let losing = KellyInputs {
            win_rate: 0.2,
            win_loss_ratio: 0.5,
        };
        assert_eq!(losing.allocation(0.25, 0.02), 0.0);

        let mut req = request();
        req.kelly = losing;
        let result = sizer(SizingPolicy::Kelly).calculate(&req);
        assert_eq!(result.lots, 0);
        assert!(!result.is_allowed());
    }

    #[test]
    fn test_kelly_inputs_from_pnls() {
        let inputs = KellyInputs::from_pnls(&[dec!(300), dec!(100), dec!(-100), dec!(-300)]);
        assert_relative_eq!(inputs.win_rate, 0.5);
        assert_relative_eq!(inputs.win_loss_ratio, 1.0);
        assert_eq!(KellyInputs::from_pnls(&[dec!(10)]), KellyInputs::default());
    }

    #[test]
    fn test_volatility_normalized() {
        // daily vol = 0.2 / sqrt(252) ~ 0.0126; move = 150 * 0.0126 * 2 * 50 ~ 189
        // 1M * 1% / 189 ~ 52 lots
        let result = sizer(SizingPolicy::VolatilityNormalized).calculate(&request());
        assert_eq!(result.max_by_policy, 52);
        // Portfolio budget: 100k / (100 * 50) = 20
        assert_eq!(result.lots, 20);
        assert!(result.is_constrained);
        assert!(result.constraint_reason.unwrap().contains("Portfolio"));
    }

    #[test]
    fn test_portfolio_budget_exhausted() {
        let mut req = request();
        req.open_risk = dec!(95_000);
        // 5k left / 5k per lot = 1
        let result = sizer(SizingPolicy::FixedFraction).calculate(&req);
        assert_eq!(result.max_by_portfolio_risk, 1);
        assert_eq!(result.lots, 1);

        req.open_risk = dec!(100_000);
        assert_eq!(sizer(SizingPolicy::FixedFraction).calculate(&req).lots, 0);
    }

    #[test]
    fn test_below_one_lot_is_zero() {
        let mut req = request();
        req.capital = dec!(100_000);
        let result = sizer(SizingPolicy::FixedFraction).calculate(&req);
        assert_eq!(result.lots, 0);
        assert!(result.constraint_reason.is_some());
    }

    #[test]
    fn test_invalid_inputs() {
        let mut req = request();
        req.risk_per_set = dec!(0);
        assert_eq!(sizer(SizingPolicy::FixedFraction).calculate(&req).lots, 0);

        let bad = PositionSizerConfig {
            max_portfolio_risk: 1.5,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
