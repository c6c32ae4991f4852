//! Backtesting engine for options strategies.
//!
//! This module provides the event loop and everything it owns:
//! - Position lifecycle (pending, open, closed) and multi-leg marks
//! - Transaction costs (slippage plus brokerage and statutory charges)
//! - The append-only trade ledger and equity curve

pub mod costs;
pub mod engine;
pub mod ledger;
pub mod position;

pub use costs::{CostModel, OrderSide, TransactionCost};
pub use engine::{BacktestConfig, BacktestEngine, BacktestResult, EngineState, FailedRun, MarkPolicy};
pub use ledger::{EquityCurve, EquityCurvePoint, TradeLedger, TradeLedgerEntry};
pub use position::{ExitReason, LegSide, MarkSource, OptionLeg, Position, PositionId, PositionStatus};
