//! Strategy state machines.
//!
//! Every strategy follows the same contract: it keeps its own ATM IV history,
//! proposes entries from a priced snapshot and decides exits for its own
//! positions. Strategies never touch engine-owned positions; they only emit
//! [`Signal`]s.
//!
//! Exit checks run in a fixed order: stop loss (and strike breach), then the
//! profit target, then the time exit. A stop that fires on the same tick as
//! the profit target therefore wins.

pub mod calendar_spread;
pub mod iron_condor;
pub mod premium_selling;
pub mod ratio_spread;
pub mod selection;
pub mod signal;

use serde::{Deserialize, Serialize};

use crate::backtest::Position;
use crate::error::{ValidationError, ValidationResult};
use crate::pricing::{IvHistory, PricedSnapshot};

pub use calendar_spread::{CalendarSpread, CalendarSpreadConfig};
pub use iron_condor::{iron_condor_risk, IronCondor, IronCondorConfig};
pub use premium_selling::{PremiumSelling, PremiumSellingConfig};
pub use ratio_spread::{RatioSpread, RatioSpreadConfig, RatioVariant};
pub use signal::{ratio_matches, EntryProposal, LegProposal, Signal};

/// Closed set of supported strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    PremiumSelling,
    IronCondor,
    CalendarSpread,
    RatioSpread,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 4] = [
        Self::PremiumSelling,
        Self::IronCondor,
        Self::CalendarSpread,
        Self::RatioSpread,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PremiumSelling => "premium_selling",
            Self::IronCondor => "iron_condor",
            Self::CalendarSpread => "calendar_spread",
            Self::RatioSpread => "ratio_spread",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability contract shared by all strategies.
pub trait OptionsStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Configured units per leg, in leg order.
    fn leg_ratio(&self) -> Vec<u32>;

    /// Maximum concurrently open positions of this strategy.
    fn max_positions(&self) -> usize;

    fn iv_history(&self) -> &IvHistory;

    fn iv_history_mut(&mut self) -> &mut IvHistory;

    /// Seed the IV history before the first tick.
    fn initialize(&mut self, history: &[f64]) {
        let iv = self.iv_history_mut();
        iv.clear();
        iv.load(history);
    }

    /// Record the tick's ATM IV. Called on every processed snapshot.
    fn observe(&mut self, snapshot: &PricedSnapshot) {
        if let Some(iv) = snapshot.atm_iv() {
            self.iv_history_mut().push(iv);
        }
    }

    fn iv_rank(&self) -> Option<f64> {
        self.iv_history().rank()
    }

    /// Entry decision for this tick.
    fn evaluate(&self, snapshot: &PricedSnapshot, open: &[&Position]) -> Signal;

    /// Exit decision for one of this strategy's open positions.
    fn exit_check(&self, position: &Position, snapshot: &PricedSnapshot) -> Signal;
}

/// Open positions belonging to `kind`.
pub fn open_count(open: &[&Position], kind: StrategyKind) -> usize {
    open.iter().filter(|p| p.strategy == kind && p.is_open()).count()
}

/// A configured strategy instance.
#[derive(Debug, Clone)]
pub enum Strategy {
    PremiumSelling(PremiumSelling),
    IronCondor(IronCondor),
    CalendarSpread(CalendarSpread),
    RatioSpread(RatioSpread),
}

impl Strategy {
    /// Strategy with its default parameters.
    pub fn with_defaults(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::PremiumSelling => Self::PremiumSelling(PremiumSelling::new(Default::default())),
            StrategyKind::IronCondor => Self::IronCondor(IronCondor::new(Default::default())),
            StrategyKind::CalendarSpread => Self::CalendarSpread(CalendarSpread::new(Default::default())),
            StrategyKind::RatioSpread => Self::RatioSpread(RatioSpread::new(Default::default())),
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn inner(&self) -> &dyn OptionsStrategy {
        match self {
            Self::PremiumSelling(s) => s,
            Self::IronCondor(s) => s,
            Self::CalendarSpread(s) => s,
            Self::RatioSpread(s) => s,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn OptionsStrategy {
        match self {
            Self::PremiumSelling(s) => s,
            Self::IronCondor(s) => s,
            Self::CalendarSpread(s) => s,
            Self::RatioSpread(s) => s,
        }
    }
}

impl OptionsStrategy for Strategy {
    fn kind(&self) -> StrategyKind {
        self.inner().kind()
    }

    fn leg_ratio(&self) -> Vec<u32> {
        self.inner().leg_ratio()
    }

    fn max_positions(&self) -> usize {
        self.inner().max_positions()
    }

    fn iv_history(&self) -> &IvHistory {
        self.inner().iv_history()
    }

    fn iv_history_mut(&mut self) -> &mut IvHistory {
        self.inner_mut().iv_history_mut()
    }

    fn initialize(&mut self, history: &[f64]) {
        self.inner_mut().initialize(history)
    }

    fn observe(&mut self, snapshot: &PricedSnapshot) {
        self.inner_mut().observe(snapshot)
    }

    fn iv_rank(&self) -> Option<f64> {
        self.inner().iv_rank()
    }

    fn evaluate(&self, snapshot: &PricedSnapshot, open: &[&Position]) -> Signal {
        self.inner().evaluate(snapshot, open)
    }

    fn exit_check(&self, position: &Position, snapshot: &PricedSnapshot) -> Signal {
        self.inner().exit_check(position, snapshot)
    }
}

pub(crate) fn check_positive(field: &str, value: f64) -> ValidationResult<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ValidationError::invalid(field, format!("{} must be positive", value)))
    }
}

pub(crate) fn check_fraction(field: &str, value: f64) -> ValidationResult<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ValidationError::invalid(field, format!("{} is outside (0, 1]", value)))
    }
}

pub(crate) fn check_iv_rank(field: &str, value: f64) -> ValidationResult<()> {
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::invalid(field, format!("{} is outside [0, 100]", value)))
    }
}

pub(crate) fn check_dte_window(field: &str, min: i64, max: i64) -> ValidationResult<()> {
    if min < 0 || max < 0 {
        return Err(ValidationError::invalid(field, "days to expiry cannot be negative"));
    }
    if min > max {
        return Err(ValidationError::invalid(field, format!("range {}..{} is inverted", min, max)));
    }
    Ok(())
}

pub(crate) fn check_delta_band(field: &str, low: f64, high: f64) -> ValidationResult<()> {
    if !(low > 0.0 && high < 1.0 && low <= high) {
        return Err(ValidationError::invalid(field, format!("delta band {}..{} is invalid", low, high)));
    }
    Ok(())
}

pub(crate) fn check_history(field: &str, lookback: usize, min_history: usize) -> ValidationResult<()> {
    if lookback == 0 || min_history == 0 || min_history > lookback {
        return Err(ValidationError::invalid(
            field,
            format!("need 0 < min_iv_history ({}) <= iv_lookback ({})", min_history, lookback),
        ));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Synthetic priced snapshots for strategy tests.

    use chrono::{NaiveDate, NaiveDateTime};
    use rust_decimal::Decimal;

    use crate::data::{MarketSnapshot, OptionQuote, OptionRight};
    use crate::error::DataQualityLog;
    use crate::pricing::{to_decimal, BlackScholes, PricedSnapshot};

    pub fn timestamp(y: i32, m: u32, d: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(15, 30, 0)
            .unwrap()
    }

    /// Chain of model-priced quotes at flat `vol` for each expiry.
    pub fn chain_snapshot(
        at: NaiveDateTime,
        spot: f64,
        vol: f64,
        expiries: &[NaiveDate],
        step: i64,
        count: i64,
    ) -> MarketSnapshot {
        let model = BlackScholes::with_rate(0.07);
        let atm = (spot / step as f64).round() as i64 * step;
        let mut snapshot = MarketSnapshot::new(at, "NIFTY", to_decimal(spot));
        for &expiry in expiries {
            let t = (expiry - at.date()).num_days() as f64 / 365.0;
            for i in -count..=count {
                let strike = atm + i * step;
                for right in [OptionRight::Call, OptionRight::Put] {
                    let value = model.price(spot, strike as f64, t, vol, right);
                    let mark = to_decimal(value.max(0.05));
                    snapshot.add_quote(
                        OptionQuote::new(Decimal::from(strike), expiry, right)
                            .with_market(mark, mark, mark)
                            .with_iv(vol),
                    );
                }
            }
        }
        snapshot
    }

    pub fn priced(snapshot: MarketSnapshot) -> PricedSnapshot {
        let mut log = DataQualityLog::new();
        PricedSnapshot::build(snapshot, BlackScholes::with_rate(0.07), &mut log)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip_names() {
        for kind in StrategyKind::ALL {
            assert_eq!(StrategyKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(StrategyKind::from_str("butterfly"), None);
    }

    #[test]
    fn test_strategy_enum_dispatch() {
        let mut strategy = Strategy::with_defaults(StrategyKind::RatioSpread);
        assert_eq!(strategy.name(), "ratio_spread");
        assert_eq!(strategy.leg_ratio(), vec![1, 2]);
        assert_eq!(strategy.max_positions(), 2);

        strategy.initialize(&[0.10; 40]);
        assert_eq!(strategy.iv_history().len(), 40);
        assert_eq!(strategy.iv_rank(), Some(50.0));
    }

    #[test]
    fn test_checks() {
        assert!(check_iv_rank("x", 101.0).is_err());
        assert!(check_dte_window("x", 45, 7).is_err());
        assert!(check_dte_window("x", -1, 7).is_err());
        assert!(check_fraction("x", 0.0).is_err());
        assert!(check_delta_band("x", 0.2, 0.15).is_err());
        assert!(check_history("x", 252, 300).is_err());
        assert!(check_positive("x", 1.5).is_ok());
    }
}
