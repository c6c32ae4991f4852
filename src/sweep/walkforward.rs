//! Walk-forward analysis.
//!
//! Ticks are split into rolling train/test windows. The grid is searched on
//! each train window and the winner is run out-of-sample on the test window
//! that follows it.

use std::collections::BTreeMap;
use std::ops::Range;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::RunConfig;
use crate::data::MarketSnapshot;
use crate::error::{DataQualityLog, ValidationError, ValidationResult};
use crate::pricing::{BlackScholes, PricedSnapshot};

use super::grid::{evaluate, run_sweep, Objective, ParameterGrid, ParameterSet, SweepResult};

/// Window lengths in ticks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkForwardConfig {
    pub train_ticks: usize,
    pub test_ticks: usize,
    pub step_ticks: usize,
}

impl Default for WalkForwardConfig {
    fn default() -> Self {
        Self {
            train_ticks: 252,
            test_ticks: 63,
            step_ticks: 21,
        }
    }
}

impl WalkForwardConfig {
    pub fn validate(&self) -> ValidationResult<()> {
        for (field, value) in [
            ("walk_forward.train_ticks", self.train_ticks),
            ("walk_forward.test_ticks", self.test_ticks),
            ("walk_forward.step_ticks", self.step_ticks),
        ] {
            if value == 0 {
                return Err(ValidationError::invalid(field, "must be at least 1"));
            }
        }
        Ok(())
    }
}

/// Index ranges of one train/test split.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkForwardWindow {
    /// 1-indexed.
    pub number: usize,
    pub train: Range<usize>,
    pub test: Range<usize>,
}

/// Rolling windows over `n_ticks`. A window is emitted only when both its
/// train and test ranges fit.
pub fn walk_forward_windows(n_ticks: usize, train: usize, test: usize, step: usize) -> Vec<WalkForwardWindow> {
    let mut windows = Vec::new();
    if train == 0 || test == 0 || step == 0 {
        return windows;
    }
    let mut start = 0;
    while start + train + test <= n_ticks {
        let test_start = start + train;
        windows.push(WalkForwardWindow {
            number: windows.len() + 1,
            train: start..test_start,
            test: test_start..test_start + test,
        });
        start += step;
    }
    windows
}

/// ATM implied vols of `snapshots`, in order, for seeding IV history.
pub fn atm_iv_series(snapshots: &[MarketSnapshot], risk_free_rate: f64) -> Vec<f64> {
    let model = BlackScholes::with_rate(risk_free_rate);
    let mut log = DataQualityLog::new();
    snapshots
        .iter()
        .filter_map(|s| PricedSnapshot::build(s.clone(), model, &mut log).atm_iv())
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowResult {
    pub window: WalkForwardWindow,
    pub train_start: NaiveDateTime,
    pub test_start: NaiveDateTime,
    pub test_end: NaiveDateTime,
    pub best_params: ParameterSet,
    /// Best in-sample run.
    pub train: SweepResult,
    /// Out-of-sample run with the in-sample winner.
    pub test: SweepResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub objective: Objective,
    pub windows: Vec<WindowResult>,
    /// Parameter set chosen most often; earliest wins ties.
    pub consensus_params: Option<ParameterSet>,
}

impl WalkForwardResult {
    fn mean_score(&self, pick: impl Fn(&WindowResult) -> &SweepResult) -> f64 {
        let scores: Vec<f64> = self
            .windows
            .iter()
            .map(|w| pick(w).score)
            .filter(|s| s.is_finite())
            .collect();
        if scores.is_empty() {
            return 0.0;
        }
        scores.iter().sum::<f64>() / scores.len() as f64
    }

    pub fn avg_train_score(&self) -> f64 {
        self.mean_score(|w| &w.train)
    }

    pub fn avg_test_score(&self) -> f64 {
        self.mean_score(|w| &w.test)
    }

    /// Drop from in-sample to out-of-sample score, as a percentage.
    pub fn degradation_pct(&self) -> f64 {
        let train = self.avg_train_score();
        if train > 0.0 {
            (train - self.avg_test_score()) / train * 100.0
        } else {
            0.0
        }
    }

    pub fn total_test_trades(&self) -> usize {
        self.windows.iter().map(|w| w.test.total_trades()).sum()
    }

    pub fn summary(&self) -> String {
        let mut out = format!(
            "Walk-Forward Results: {} windows ({:?})\n\
             Avg Train Score: {:.2}\n\
             Avg Test Score:  {:.2}\n\
             Degradation:     {:.1}%\n\
             Test Trades:     {}\n",
            self.windows.len(),
            self.objective,
            self.avg_train_score(),
            self.avg_test_score(),
            self.degradation_pct(),
            self.total_test_trades(),
        );
        for w in &self.windows {
            out.push_str(&format!(
                "  #{:<3} test {} to {}  {:<28} train {:>7.2}  test {:>7.2}\n",
                w.window.number,
                w.test_start.date(),
                w.test_end.date(),
                w.best_params.key(),
                w.train.score,
                w.test.score,
            ));
        }
        if let Some(params) = &self.consensus_params {
            out.push_str(&format!("Consensus: {}\n", params.key()));
        }
        out
    }
}

fn consensus(windows: &[WindowResult]) -> Option<ParameterSet> {
    let mut counts: BTreeMap<String, (usize, usize, &ParameterSet)> = BTreeMap::new();
    for (order, w) in windows.iter().enumerate() {
        counts
            .entry(w.best_params.key())
            .or_insert((0, order, &w.best_params))
            .0 += 1;
    }
    counts
        .into_values()
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .map(|(_, _, params)| params.clone())
}

/// Optimize on each train window and evaluate the winner on its test window.
///
/// Test runs are seeded with the ATM IVs observed during their train window.
/// Windows where no point succeeds in-sample are skipped.
pub fn run_walk_forward(
    base: &RunConfig,
    grid: &ParameterGrid,
    snapshots: &[MarketSnapshot],
    objective: Objective,
) -> WalkForwardResult {
    let wf = &base.walk_forward;
    let windows = walk_forward_windows(snapshots.len(), wf.train_ticks, wf.test_ticks, wf.step_ticks);
    if windows.is_empty() {
        warn!(
            ticks = snapshots.len(),
            required = wf.train_ticks + wf.test_ticks,
            "insufficient data for walk-forward"
        );
    }
    info!(windows = windows.len(), "walk-forward started");

    let mut results = Vec::new();
    for window in windows {
        let train = &snapshots[window.train.clone()];
        let test = &snapshots[window.test.clone()];
        let (Some(train_first), Some(test_first), Some(test_last)) = (train.first(), test.first(), test.last())
        else {
            continue;
        };
        info!(
            window = window.number,
            train_start = %train_first.timestamp,
            test_start = %test_first.timestamp,
            test_end = %test_last.timestamp,
            "walk-forward window"
        );

        let ranked = run_sweep(base, grid, train, &[], objective);
        let Some(best) = ranked.into_iter().find(SweepResult::succeeded) else {
            warn!(window = window.number, "no successful parameter set in train window");
            continue;
        };

        let seed = atm_iv_series(train, base.backtest.risk_free_rate);
        let test_result = evaluate(best.index, &best.params, base, test, &seed, objective);

        results.push(WindowResult {
            train_start: train_first.timestamp,
            test_start: test_first.timestamp,
            test_end: test_last.timestamp,
            best_params: best.params.clone(),
            train: best,
            test: test_result,
            window,
        });
    }

    let result = WalkForwardResult {
        objective,
        consensus_params: consensus(&results),
        windows: results,
    };
    info!(
        windows = result.windows.len(),
        avg_test_score = result.avg_test_score(),
        "walk-forward complete"
    );
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategiesConfig;
    use crate::strategy::test_support::{chain_snapshot, timestamp};
    use crate::strategy::PremiumSellingConfig;
    use chrono::{Duration, NaiveDate};
    use rust_decimal::Decimal;

    #[test]
    fn test_default_window_lengths() {
        let config = WalkForwardConfig::default();
        assert_eq!((config.train_ticks, config.test_ticks, config.step_ticks), (252, 63, 21));
        assert!(config.validate().is_ok());
        assert!(WalkForwardConfig {
            step_ticks: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_windows_roll_by_step() {
        let windows = walk_forward_windows(400, 252, 63, 21);
        // Starts 0, 21, 42, 63, 84: the next (105) would need 420 ticks.
        assert_eq!(windows.len(), 5);
        assert_eq!(windows[0].train, 0..252);
        assert_eq!(windows[0].test, 252..315);
        assert_eq!(windows[4].train, 84..336);
        assert_eq!(windows[4].test, 336..399);
        assert_eq!(windows[4].number, 5);
    }

    #[test]
    fn test_windows_need_train_plus_test() {
        assert!(walk_forward_windows(314, 252, 63, 21).is_empty());
        assert_eq!(walk_forward_windows(315, 252, 63, 21).len(), 1);
        assert!(walk_forward_windows(100, 10, 5, 0).is_empty());
    }

    fn set(pt: f64) -> ParameterSet {
        ParameterSet {
            profit_target_pct: Some(pt),
            ..Default::default()
        }
    }

    fn window_result(number: usize, params: ParameterSet) -> WindowResult {
        let sweep = SweepResult {
            index: 0,
            params: params.clone(),
            metrics: None,
            final_equity: Decimal::ZERO,
            score: 1.0,
            error: None,
        };
        WindowResult {
            window: WalkForwardWindow {
                number,
                train: 0..1,
                test: 1..2,
            },
            train_start: timestamp(2024, 1, 1),
            test_start: timestamp(2024, 1, 2),
            test_end: timestamp(2024, 1, 2),
            best_params: params,
            train: sweep.clone(),
            test: sweep,
        }
    }

    #[test]
    fn test_consensus_prefers_most_common_then_earliest() {
        let windows = vec![
            window_result(1, set(0.25)),
            window_result(2, set(0.50)),
            window_result(3, set(0.50)),
        ];
        assert_eq!(consensus(&windows), Some(set(0.50)));

        let tied = vec![window_result(1, set(0.75)), window_result(2, set(0.25))];
        assert_eq!(consensus(&tied), Some(set(0.75)));
        assert_eq!(consensus(&[]), None);
    }

    #[test]
    fn test_run_walk_forward_small_windows() {
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 15).unwrap();
        let start = timestamp(2024, 1, 2);
        let snapshots: Vec<MarketSnapshot> = (0..12)
            .map(|i| chain_snapshot(start + Duration::days(i), 21500.0 + 5.0 * i as f64, 0.20, &[expiry], 50, 30))
            .collect();

        let base = RunConfig {
            strategies: StrategiesConfig {
                premium_selling: Some(PremiumSellingConfig {
                    min_iv_history: 2,
                    ..Default::default()
                }),
                ..Default::default()
            },
            walk_forward: WalkForwardConfig {
                train_ticks: 6,
                test_ticks: 3,
                step_ticks: 3,
            },
            ..Default::default()
        };
        let grid = ParameterGrid {
            profit_target_pct: vec![0.25, 0.5],
            stop_loss_pct: vec![],
            iv_rank_threshold: vec![],
            dte_windows: vec![],
        };

        let result = run_walk_forward(&base, &grid, &snapshots, Objective::Sharpe);
        assert_eq!(result.windows.len(), 2);
        assert_eq!(result.windows[0].test_start, snapshots[6].timestamp);
        assert_eq!(result.windows[1].test_end, snapshots[11].timestamp);
        assert!(result.windows.iter().all(|w| w.test.succeeded()));
        assert!(result.consensus_params.is_some());
        assert!(result.summary().contains("2 windows"));
    }

    #[test]
    fn test_atm_iv_series_reads_each_snapshot() {
        let expiry = NaiveDate::from_ymd_opt(2024, 2, 15).unwrap();
        let snapshots: Vec<MarketSnapshot> = (0..3)
            .map(|i| chain_snapshot(timestamp(2024, 1, 2) + Duration::days(i), 21500.0, 0.20, &[expiry], 50, 10))
            .collect();
        let series = atm_iv_series(&snapshots, 0.07);
        assert_eq!(series.len(), 3);
        assert!(series.iter().all(|v| (v - 0.20).abs() < 0.01));
    }
}
