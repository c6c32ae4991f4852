//! Performance metrics module.
//!
//! Provides comprehensive performance calculations:
//! - Total return, CAGR, monthly and yearly returns
//! - Sharpe, Sortino and Calmar ratios
//! - Maximum drawdown and its duration, VaR/CVaR
//! - Win rate, profit factor, streaks
//!
//! and the [`Report`] that bundles them with the ledger for output.

pub mod calculator;
pub mod report;

pub use calculator::{DrawdownAnalysis, MetricsCalculator, MetricsConfig, PerformanceMetrics, PeriodReturn, VarMethod};
pub use report::Report;
