//! Parameter grid search.
//!
//! Every combination runs its own engine over the same read-only snapshot
//! slice, in parallel with rayon. Results are ranked by an objective with ties
//! broken by combination order, so the ranking does not depend on scheduling.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use rayon::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{RunConfig, StrategiesConfig};
use crate::data::{from_snapshots, MarketSnapshot};
use crate::error::ValidationResult;
use crate::metrics::PerformanceMetrics;

/// Values to sweep. An empty list keeps the configured value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParameterGrid {
    pub profit_target_pct: Vec<f64>,
    pub stop_loss_pct: Vec<f64>,
    pub iv_rank_threshold: Vec<f64>,
    /// `(min_dte, max_dte)` entry windows.
    pub dte_windows: Vec<(i64, i64)>,
}

impl Default for ParameterGrid {
    fn default() -> Self {
        Self {
            profit_target_pct: vec![0.25, 0.50, 0.75],
            stop_loss_pct: vec![1.0, 1.5, 2.0],
            iv_rank_threshold: vec![50.0, 60.0, 70.0],
            dte_windows: vec![(7, 30), (14, 45)],
        }
    }
}

fn axis<T: Copy>(values: &[T]) -> Vec<Option<T>> {
    if values.is_empty() {
        vec![None]
    } else {
        values.iter().copied().map(Some).collect()
    }
}

impl ParameterGrid {
    /// All combinations in a fixed nesting order. Inverted DTE windows are
    /// skipped.
    pub fn combinations(&self) -> Vec<ParameterSet> {
        let mut combos = Vec::new();
        for dte_window in axis(&self.dte_windows) {
            if matches!(dte_window, Some((min, max)) if min > max) {
                continue;
            }
            for iv_rank_threshold in axis(&self.iv_rank_threshold) {
                for profit_target_pct in axis(&self.profit_target_pct) {
                    for stop_loss_pct in axis(&self.stop_loss_pct) {
                        combos.push(ParameterSet {
                            profit_target_pct,
                            stop_loss_pct,
                            iv_rank_threshold,
                            dte_window,
                        });
                    }
                }
            }
        }
        combos
    }
}

/// One point of the grid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub profit_target_pct: Option<f64>,
    pub stop_loss_pct: Option<f64>,
    pub iv_rank_threshold: Option<f64>,
    pub dte_window: Option<(i64, i64)>,
}

impl ParameterSet {
    /// Overlay these values on every enabled strategy. Strategies without a
    /// matching parameter keep theirs: calendar spreads have two DTE windows
    /// and ignore `dte_window`, ratio spreads exit on a strike breach and
    /// ignore `stop_loss_pct`.
    pub fn apply(&self, base: &StrategiesConfig) -> StrategiesConfig {
        let mut out = base.clone();
        if let Some(c) = out.premium_selling.as_mut() {
            set(&mut c.profit_target_pct, self.profit_target_pct);
            set(&mut c.stop_loss_pct, self.stop_loss_pct);
            set(&mut c.iv_rank_threshold, self.iv_rank_threshold);
            if let Some((min, max)) = self.dte_window {
                c.min_dte = min;
                c.max_dte = max;
            }
        }
        if let Some(c) = out.iron_condor.as_mut() {
            set(&mut c.profit_target_pct, self.profit_target_pct);
            set(&mut c.stop_loss_pct, self.stop_loss_pct);
            set(&mut c.iv_rank_threshold, self.iv_rank_threshold);
            if let Some((min, max)) = self.dte_window {
                c.min_dte = min;
                c.max_dte = max;
            }
        }
        if let Some(c) = out.calendar_spread.as_mut() {
            set(&mut c.profit_target_pct, self.profit_target_pct);
            set(&mut c.iv_rank_threshold, self.iv_rank_threshold);
            // Calendar stops are a fraction of the debit.
            if let Some(stop) = self.stop_loss_pct.filter(|s| *s <= 1.0) {
                c.stop_loss_pct = stop;
            }
        }
        if let Some(c) = out.ratio_spread.as_mut() {
            set(&mut c.profit_target_pct, self.profit_target_pct);
            set(&mut c.iv_rank_threshold, self.iv_rank_threshold);
            if let Some((min, max)) = self.dte_window {
                c.min_dte = min;
                c.max_dte = max;
            }
        }
        out
    }

    /// Full run config for this point.
    pub fn config(&self, base: &RunConfig) -> ValidationResult<RunConfig> {
        let config = RunConfig {
            strategies: self.apply(&base.strategies),
            ..base.clone()
        };
        config.validate()?;
        Ok(config)
    }

    /// Short stable label, e.g. `pt0.50_sl1.50_iv70_dte7-45`.
    pub fn key(&self) -> String {
        let mut parts = Vec::new();
        if let Some(v) = self.profit_target_pct {
            parts.push(format!("pt{:.2}", v));
        }
        if let Some(v) = self.stop_loss_pct {
            parts.push(format!("sl{:.2}", v));
        }
        if let Some(v) = self.iv_rank_threshold {
            parts.push(format!("iv{:.0}", v));
        }
        if let Some((min, max)) = self.dte_window {
            parts.push(format!("dte{}-{}", min, max));
        }
        if parts.is_empty() {
            "base".to_string()
        } else {
            parts.join("_")
        }
    }
}

fn set(target: &mut f64, value: Option<f64>) {
    if let Some(value) = value {
        *target = value;
    }
}

/// Ranking criterion; higher is better for all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Sharpe,
    Sortino,
    Calmar,
    TotalReturn,
    ProfitFactor,
}

impl Objective {
    pub fn score(&self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            Self::Sharpe => metrics.sharpe_ratio,
            Self::Sortino => metrics.sortino_ratio,
            Self::Calmar => metrics.calmar_ratio,
            Self::TotalReturn => metrics.total_return,
            Self::ProfitFactor => metrics.profit_factor,
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "sharpe" => Some(Self::Sharpe),
            "sortino" => Some(Self::Sortino),
            "calmar" => Some(Self::Calmar),
            "total_return" => Some(Self::TotalReturn),
            "profit_factor" => Some(Self::ProfitFactor),
            _ => None,
        }
    }
}

/// Outcome of one grid point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResult {
    /// Position in [`ParameterGrid::combinations`].
    pub index: usize,
    pub params: ParameterSet,
    /// `None` when the point was invalid or the run failed.
    pub metrics: Option<PerformanceMetrics>,
    pub final_equity: Decimal,
    pub score: f64,
    pub error: Option<String>,
}

impl SweepResult {
    pub fn succeeded(&self) -> bool {
        self.metrics.is_some()
    }

    pub fn total_trades(&self) -> usize {
        self.metrics.as_ref().map(|m| m.total_trades).unwrap_or(0)
    }

    fn failed(index: usize, params: ParameterSet, error: String, capital: Decimal) -> Self {
        Self {
            index,
            params,
            metrics: None,
            final_equity: capital,
            score: f64::NEG_INFINITY,
            error: Some(error),
        }
    }
}

/// Run one parameter set to completion.
pub fn evaluate(
    index: usize,
    params: &ParameterSet,
    base: &RunConfig,
    snapshots: &[MarketSnapshot],
    iv_history: &[f64],
    objective: Objective,
) -> SweepResult {
    let capital = base.backtest.initial_capital;
    let config = match params.config(base) {
        Ok(config) => config,
        Err(e) => return SweepResult::failed(index, params.clone(), e.to_string(), capital),
    };

    let mut engine = config.engine();
    if !iv_history.is_empty() {
        engine.initialize_strategies(iv_history);
    }
    match engine.run(from_snapshots(snapshots.iter().cloned())) {
        Ok(result) => {
            let metrics = config.calculator().calculate(&result);
            let score = objective.score(&metrics);
            SweepResult {
                index,
                params: params.clone(),
                final_equity: result.final_equity,
                score: if score.is_nan() { f64::NEG_INFINITY } else { score },
                metrics: Some(metrics),
                error: None,
            }
        }
        Err(failed) => SweepResult::failed(index, params.clone(), failed.error.to_string(), capital),
    }
}

/// Best first; equal scores keep grid order.
pub fn rank(results: &mut [SweepResult]) {
    results.sort_by(|a, b| match b.score.total_cmp(&a.score) {
        Ordering::Equal => a.index.cmp(&b.index),
        other => other,
    });
}

/// Evaluate every combination of `grid` in parallel and rank the results.
pub fn run_sweep(
    base: &RunConfig,
    grid: &ParameterGrid,
    snapshots: &[MarketSnapshot],
    iv_history: &[f64],
    objective: Objective,
) -> Vec<SweepResult> {
    let combos = grid.combinations();
    let total = combos.len();
    info!(combinations = total, snapshots = snapshots.len(), ?objective, "sweep started");

    let progress = AtomicUsize::new(0);
    let mut results: Vec<SweepResult> = combos
        .par_iter()
        .enumerate()
        .map(|(index, params)| {
            let result = evaluate(index, params, base, snapshots, iv_history, objective);
            if let Some(error) = &result.error {
                warn!(params = %params.key(), %error, "sweep point failed");
            }
            let done = progress.fetch_add(1, AtomicOrdering::Relaxed) + 1;
            if done % (total / 10).max(1) == 0 || done == total {
                info!("  {:.0}% ({}/{} combinations)", done as f64 / total as f64 * 100.0, done, total);
            }
            result
        })
        .collect();

    rank(&mut results);
    if let Some(best) = results.first() {
        info!(best = %best.params.key(), score = best.score, "sweep complete");
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{chain_snapshot, timestamp};
    use crate::strategy::{CalendarSpreadConfig, IronCondorConfig, PremiumSellingConfig};
    use chrono::{Duration, NaiveDate};

    fn base() -> RunConfig {
        RunConfig {
            strategies: StrategiesConfig {
                premium_selling: Some(PremiumSellingConfig::default()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn snapshots(days: i64) -> Vec<MarketSnapshot> {
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        let start = timestamp(2024, 1, 2);
        (0..days)
            .map(|i| chain_snapshot(start + Duration::days(i), 21500.0 + 10.0 * i as f64, 0.20, &[expiry], 50, 30))
            .collect()
    }

    #[test]
    fn test_combinations_skip_inverted_windows() {
        let grid = ParameterGrid {
            profit_target_pct: vec![0.5, 0.75],
            stop_loss_pct: vec![],
            iv_rank_threshold: vec![60.0],
            dte_windows: vec![(7, 30), (45, 14)],
        };
        let combos = grid.combinations();
        assert_eq!(combos.len(), 2);
        assert!(combos.iter().all(|c| c.stop_loss_pct.is_none()));
        assert_eq!(combos[0].key(), "pt0.50_iv60_dte7-30");
    }

    #[test]
    fn test_default_grid_size() {
        assert_eq!(ParameterGrid::default().combinations().len(), 2 * 3 * 3 * 3);
    }

    #[test]
    fn test_apply_overlays_enabled_strategies_only() {
        let strategies = StrategiesConfig {
            iron_condor: Some(IronCondorConfig::default()),
            calendar_spread: Some(CalendarSpreadConfig::default()),
            ..Default::default()
        };
        let params = ParameterSet {
            profit_target_pct: Some(0.6),
            stop_loss_pct: Some(1.5),
            iv_rank_threshold: None,
            dte_window: Some((10, 40)),
        };
        let applied = params.apply(&strategies);

        let condor = applied.iron_condor.unwrap();
        assert_eq!(condor.profit_target_pct, 0.6);
        assert_eq!(condor.stop_loss_pct, 1.5);
        assert_eq!((condor.min_dte, condor.max_dte), (10, 40));
        assert_eq!(condor.iv_rank_threshold, IronCondorConfig::default().iv_rank_threshold);

        let calendar = applied.calendar_spread.unwrap();
        assert_eq!(calendar.profit_target_pct, 0.6);
        assert_eq!(calendar.stop_loss_pct, CalendarSpreadConfig::default().stop_loss_pct);
        assert_eq!(calendar.near_min_dte, CalendarSpreadConfig::default().near_min_dte);
        assert!(applied.premium_selling.is_none());
    }

    #[test]
    fn test_invalid_point_is_reported_not_fatal() {
        let params = ParameterSet {
            iv_rank_threshold: Some(150.0),
            ..Default::default()
        };
        let result = evaluate(0, &params, &base(), &snapshots(3), &[], Objective::Sharpe);
        assert!(!result.succeeded());
        assert!(result.error.is_some());
        assert_eq!(result.score, f64::NEG_INFINITY);
    }

    #[test]
    fn test_rank_breaks_ties_by_grid_order() {
        let make = |index, score| SweepResult {
            index,
            params: ParameterSet::default(),
            metrics: None,
            final_equity: Decimal::ZERO,
            score,
            error: None,
        };
        let mut results = vec![make(0, 0.5), make(1, 1.2), make(2, 1.2), make(3, f64::NEG_INFINITY)];
        rank(&mut results);
        let order: Vec<usize> = results.iter().map(|r| r.index).collect();
        assert_eq!(order, vec![1, 2, 0, 3]);
    }

    #[test]
    fn test_sweep_is_deterministic() {
        let grid = ParameterGrid {
            profit_target_pct: vec![0.25, 0.5],
            stop_loss_pct: vec![],
            iv_rank_threshold: vec![],
            dte_windows: vec![],
        };
        let data = snapshots(10);
        let seed = [0.10; 40];
        let a = run_sweep(&base(), &grid, &data, &seed, Objective::TotalReturn);
        let b = run_sweep(&base(), &grid, &data, &seed, Objective::TotalReturn);
        assert_eq!(a.len(), 2);
        assert!(a.iter().all(SweepResult::succeeded));
        assert_eq!(a, b);
        assert!(a[0].score >= a[1].score);
    }
}
