//! Run configuration loaded from TOML.
//!
//! ```toml
//! [backtest]
//! initial_capital = 1000000
//! mark_policy = "per_leg"
//!
//! [costs]
//! slippage_pct = 0.005
//!
//! [sizing]
//! policy = "max_loss"
//!
//! [strategies.iron_condor]
//! iv_rank_threshold = 50.0
//! ```
//!
//! Every section is optional and missing fields take their defaults. A
//! strategy runs when its `[strategies.<name>]` table is present.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backtest::{BacktestConfig, BacktestEngine, CostModel};
use crate::error::{ValidationError, ValidationResult};
use crate::metrics::{MetricsCalculator, MetricsConfig};
use crate::risk::PositionSizerConfig;
use crate::strategy::{
    CalendarSpread, CalendarSpreadConfig, IronCondor, IronCondorConfig, PremiumSelling, PremiumSellingConfig,
    RatioSpread, RatioSpreadConfig, Strategy,
};
use crate::sweep::WalkForwardConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

/// Per-strategy parameter tables. `None` means the strategy is disabled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategiesConfig {
    pub premium_selling: Option<PremiumSellingConfig>,
    pub iron_condor: Option<IronCondorConfig>,
    pub calendar_spread: Option<CalendarSpreadConfig>,
    pub ratio_spread: Option<RatioSpreadConfig>,
}

impl StrategiesConfig {
    pub fn is_empty(&self) -> bool {
        self.premium_selling.is_none()
            && self.iron_condor.is_none()
            && self.calendar_spread.is_none()
            && self.ratio_spread.is_none()
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if let Some(config) = &self.premium_selling {
            config.validate()?;
        }
        if let Some(config) = &self.iron_condor {
            config.validate()?;
        }
        if let Some(config) = &self.calendar_spread {
            config.validate()?;
        }
        if let Some(config) = &self.ratio_spread {
            config.validate()?;
        }
        Ok(())
    }

    /// Enabled strategies in a fixed order.
    pub fn build(&self) -> Vec<Strategy> {
        let mut strategies = Vec::new();
        if let Some(config) = &self.premium_selling {
            strategies.push(Strategy::PremiumSelling(PremiumSelling::new(config.clone())));
        }
        if let Some(config) = &self.iron_condor {
            strategies.push(Strategy::IronCondor(IronCondor::new(config.clone())));
        }
        if let Some(config) = &self.calendar_spread {
            strategies.push(Strategy::CalendarSpread(CalendarSpread::new(config.clone())));
        }
        if let Some(config) = &self.ratio_spread {
            strategies.push(Strategy::RatioSpread(RatioSpread::new(config.clone())));
        }
        strategies
    }
}

/// Everything needed to run a backtest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub backtest: BacktestConfig,
    pub costs: CostModel,
    pub sizing: PositionSizerConfig,
    pub metrics: MetricsConfig,
    pub walk_forward: WalkForwardConfig,
    pub strategies: StrategiesConfig,
}

impl RunConfig {
    /// Read, parse and validate a config file.
    pub fn from_toml(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        self.backtest.validate()?;
        self.costs.validate()?;
        self.sizing.validate()?;
        self.walk_forward.validate()?;
        if !(self.metrics.var_confidence > 0.0 && self.metrics.var_confidence < 1.0) {
            return Err(ValidationError::invalid(
                "metrics.var_confidence",
                format!("{} is outside (0, 1)", self.metrics.var_confidence),
            ));
        }
        if self.strategies.is_empty() {
            return Err(ValidationError::invalid("strategies", "no strategy enabled"));
        }
        self.strategies.validate()
    }

    /// A fresh engine for one run.
    pub fn engine(&self) -> BacktestEngine {
        self.engine_with(self.strategies.build())
    }

    /// A fresh engine running `strategies` under this config's capital,
    /// costs and sizing.
    pub fn engine_with(&self, strategies: Vec<Strategy>) -> BacktestEngine {
        BacktestEngine::new(self.backtest.clone(), strategies)
            .with_costs(self.costs.clone())
            .with_sizing(self.sizing.clone())
    }

    pub fn calculator(&self) -> MetricsCalculator {
        MetricsCalculator::new(self.metrics.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::SizingPolicy;
    use crate::strategy::RatioVariant;
    use rust_decimal_macros::dec;
    use std::io::Write;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config = RunConfig::from_toml_str(
            r#"
            [backtest]
            initial_capital = 500000

            [strategies.iron_condor]
            iv_rank_threshold = 55.0
            "#,
        )
        .unwrap();

        assert_eq!(config.backtest.initial_capital, dec!(500000));
        assert_eq!(config.backtest.lot_size("nifty"), 50);
        assert_eq!(config.costs, CostModel::default());
        let condor = config.strategies.iron_condor.as_ref().unwrap();
        assert_eq!(condor.iv_rank_threshold, 55.0);
        assert_eq!(condor.min_dte, IronCondorConfig::default().min_dte);
        assert!(config.strategies.premium_selling.is_none());
        assert_eq!(config.strategies.build().len(), 1);
    }

    #[test]
    fn test_full_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [backtest]
            initial_capital = 2000000
            mark_policy = "last_mark"

            [costs]
            brokerage_per_order = 10
            slippage_pct = 0.001

            [sizing]
            policy = "max_loss"
            risk_per_trade = 0.02

            [metrics]
            var_confidence = 0.99

            [strategies.premium_selling]
            [strategies.ratio_spread]
            variant = "call_ratio"
            ratio = [1, 3]
            "#
        )
        .unwrap();

        let config = RunConfig::from_toml(file.path()).unwrap();
        assert_eq!(config.costs.brokerage_per_order, dec!(10));
        assert_eq!(config.sizing.policy, SizingPolicy::MaxLoss);
        assert_eq!(config.metrics.var_confidence, 0.99);
        let ratio = config.strategies.ratio_spread.as_ref().unwrap();
        assert_eq!(ratio.variant, RatioVariant::CallRatio);
        assert_eq!(ratio.ratio, (1, 3));
        assert_eq!(config.engine().config().initial_capital, dec!(2000000));
        assert_eq!(config.strategies.build().len(), 2);
    }

    #[test]
    fn test_invalid_values_rejected_at_load() {
        let cases = [
            "[backtest]\ninitial_capital = 0\n[strategies.iron_condor]\n",
            "[strategies.iron_condor]\niv_rank_threshold = 120.0\n",
            "[strategies.premium_selling]\nmin_dte = -5\n",
            "[strategies.premium_selling]\nmin_dte = 40\nmax_dte = 10\n",
            "[strategies.calendar_spread]\nposition_size_pct = 1.5\n",
            "[strategies.ratio_spread]\nratio = [0, 2]\n",
            "[costs]\nstt_rate = -0.1\n[strategies.iron_condor]\n",
        ];
        for case in cases {
            assert!(
                matches!(RunConfig::from_toml_str(case), Err(ConfigError::Invalid(_))),
                "accepted: {case}"
            );
        }
    }

    #[test]
    fn test_shipped_example_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
        let config = RunConfig::from_toml(path).unwrap();
        assert_eq!(config.strategies.build().len(), 2);
        assert_eq!(config.sizing.policy, SizingPolicy::MaxLoss);
    }

    #[test]
    fn test_no_strategy_is_invalid() {
        assert!(matches!(RunConfig::from_toml_str(""), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_and_io_errors() {
        assert!(matches!(
            RunConfig::from_toml_str("[backtest\n"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            RunConfig::from_toml("/nonexistent/options-backtest.toml"),
            Err(ConfigError::Io { .. })
        ));
    }
}
