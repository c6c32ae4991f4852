//! Parameter sweeps and walk-forward analysis.
//!
//! Each backtest in a sweep owns its engine; runs share only the read-only
//! snapshot slice and execute in parallel on the rayon pool.

pub mod grid;
pub mod walkforward;

pub use grid::{evaluate, rank, run_sweep, Objective, ParameterGrid, ParameterSet, SweepResult};
pub use walkforward::{
    atm_iv_series, run_walk_forward, walk_forward_windows, WalkForwardConfig, WalkForwardResult, WalkForwardWindow,
    WindowResult,
};
