//! Volatility & pricing: Black-Scholes fair value and Greeks, the implied
//! volatility solver, IV Rank/Percentile and the priced snapshot view.

pub mod black_scholes;
pub mod snapshot;
pub mod volatility;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

pub use black_scholes::{greeks, price, years_to_expiry, BlackScholes, IvSolution};
pub use snapshot::{PricedQuote, PricedSnapshot};
pub use volatility::{historical_volatility, iv_percentile, iv_rank, volatility_ratio, IvHistory};

/// Money precision carried by model-derived prices.
const MODEL_PRICE_DP: u32 = 4;

/// Convert a model price into money, rounded to a fixed precision.
pub fn to_decimal(value: f64) -> Decimal {
    if !value.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_f64_retain(value)
        .unwrap_or_default()
        .round_dp(MODEL_PRICE_DP)
}

pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}
