//! Discrete-event backtesting for multi-leg index options strategies.
//!
//! Snapshots of an options chain are replayed in time order through a set of
//! strategies. The engine prices each snapshot, marks open positions, applies
//! exits before entries, charges transaction costs and records an auditable
//! ledger and equity curve. Metrics and a report are derived afterwards.

pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod live;
pub mod metrics;
pub mod pricing;
pub mod risk;
pub mod strategy;
pub mod sweep;

// Re-export commonly used types
pub use backtest::{BacktestConfig, BacktestEngine, BacktestResult, CostModel, FailedRun, Position};
pub use config::{ConfigError, RunConfig};
pub use data::{MarketSnapshot, OptionQuote, OptionRight, OptionsChain, ParquetSnapshotSource};
pub use error::{DataQualityIssue, DataQualityLog, EngineFatal, ValidationError};
pub use metrics::{MetricsCalculator, PerformanceMetrics, Report};
pub use pricing::{BlackScholes, PricedSnapshot};
pub use risk::{PositionSizer, PositionSizerConfig};
pub use strategy::{OptionsStrategy, Strategy, StrategyKind};
pub use sweep::{run_sweep, run_walk_forward, ParameterGrid};
