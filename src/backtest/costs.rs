//! Transaction cost model for exchange-traded index options.
//!
//! Fills are pushed against the trader by a flat slippage percentage. Charges
//! per order are:
//!
//! | Charge          | Basis                          | Default    |
//! |-----------------|--------------------------------|------------|
//! | Brokerage       | flat, per leg                  | 20         |
//! | STT             | premium notional, sells only   | 0.05%      |
//! | Exchange        | premium notional               | 0.053%     |
//! | GST             | brokerage + exchange           | 18%        |
//! | SEBI            | premium notional               | 0.00005%   |
//! | Stamp duty      | premium notional, buys only    | 0.003%     |

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

use super::position::LegSide;

/// Direction of a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Order that opens a leg held on `side`.
    pub fn opening(side: LegSide) -> Self {
        match side {
            LegSide::Long => Self::Buy,
            LegSide::Short => Self::Sell,
        }
    }

    /// Order that flattens a leg held on `side`.
    pub fn closing(side: LegSide) -> Self {
        Self::opening(side.closing())
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, Self::Sell)
    }
}

/// Charges for one order, itemized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionCost {
    pub brokerage: Decimal,
    pub stt: Decimal,
    pub exchange: Decimal,
    pub gst: Decimal,
    pub sebi: Decimal,
    pub stamp_duty: Decimal,
}

impl TransactionCost {
    pub fn total(&self) -> Decimal {
        self.brokerage + self.stt + self.exchange + self.gst + self.sebi + self.stamp_duty
    }
}

impl std::ops::Add for TransactionCost {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            brokerage: self.brokerage + rhs.brokerage,
            stt: self.stt + rhs.stt,
            exchange: self.exchange + rhs.exchange,
            gst: self.gst + rhs.gst,
            sebi: self.sebi + rhs.sebi,
            stamp_duty: self.stamp_duty + rhs.stamp_duty,
        }
    }
}

impl std::ops::AddAssign for TransactionCost {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Cost parameters. Rates are fractions of premium notional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    pub brokerage_per_order: Decimal,
    pub stt_rate: Decimal,
    pub exchange_charges_rate: Decimal,
    pub gst_rate: Decimal,
    pub sebi_charges_rate: Decimal,
    pub stamp_duty_rate: Decimal,
    pub slippage_pct: Decimal,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            brokerage_per_order: Decimal::from(20),
            stt_rate: Decimal::new(5, 4),
            exchange_charges_rate: Decimal::new(53, 5),
            gst_rate: Decimal::new(18, 2),
            sebi_charges_rate: Decimal::new(5, 7),
            stamp_duty_rate: Decimal::new(3, 5),
            slippage_pct: Decimal::new(5, 3),
        }
    }
}

impl CostModel {
    /// Frictionless model: no charges, fills at the quoted price.
    pub fn zero() -> Self {
        Self {
            brokerage_per_order: Decimal::ZERO,
            stt_rate: Decimal::ZERO,
            exchange_charges_rate: Decimal::ZERO,
            gst_rate: Decimal::ZERO,
            sebi_charges_rate: Decimal::ZERO,
            stamp_duty_rate: Decimal::ZERO,
            slippage_pct: Decimal::ZERO,
        }
    }

    pub fn validate(&self) -> ValidationResult<()> {
        let fields = [
            ("costs.brokerage_per_order", self.brokerage_per_order),
            ("costs.stt_rate", self.stt_rate),
            ("costs.exchange_charges_rate", self.exchange_charges_rate),
            ("costs.gst_rate", self.gst_rate),
            ("costs.sebi_charges_rate", self.sebi_charges_rate),
            ("costs.stamp_duty_rate", self.stamp_duty_rate),
            ("costs.slippage_pct", self.slippage_pct),
        ];
        for (field, value) in fields {
            if value.is_sign_negative() && !value.is_zero() {
                return Err(ValidationError::invalid(field, format!("{} is negative", value)));
            }
        }
        if self.slippage_pct >= Decimal::ONE {
            return Err(ValidationError::invalid("costs.slippage_pct", "must be below 1"));
        }
        Ok(())
    }

    /// Price after slippage; higher on buys, lower on sells.
    pub fn simulate_fill(price: Decimal, side: OrderSide, slippage_pct: Decimal) -> Decimal {
        match side {
            OrderSide::Buy => price * (Decimal::ONE + slippage_pct),
            OrderSide::Sell => price * (Decimal::ONE - slippage_pct),
        }
    }

    /// [`simulate_fill`](Self::simulate_fill) with the configured slippage.
    pub fn fill(&self, price: Decimal, side: OrderSide) -> Decimal {
        Self::simulate_fill(price, side, self.slippage_pct)
    }

    /// Itemized charges for an order of `leg_count` legs on `notional`
    /// premium.
    pub fn breakdown(&self, notional: Decimal, leg_count: usize, is_sell: bool) -> TransactionCost {
        let notional = notional.abs();
        let brokerage = self.brokerage_per_order * Decimal::from(leg_count);
        let exchange = notional * self.exchange_charges_rate;
        TransactionCost {
            brokerage,
            stt: if is_sell { notional * self.stt_rate } else { Decimal::ZERO },
            exchange,
            gst: (brokerage + exchange) * self.gst_rate,
            sebi: notional * self.sebi_charges_rate,
            stamp_duty: if is_sell { Decimal::ZERO } else { notional * self.stamp_duty_rate },
        }
    }

    pub fn total_cost(&self, notional: Decimal, leg_count: usize, is_sell: bool) -> Decimal {
        self.breakdown(notional, leg_count, is_sell).total()
    }
}
