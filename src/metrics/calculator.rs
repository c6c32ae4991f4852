//! Performance metrics calculator.
//!
//! Derives return, risk and trade statistics from a completed run's equity
//! curve and ledger. Degenerate inputs (no trades, flat or too-short series)
//! produce neutral values, never errors.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use statrs::statistics::Statistics;

use crate::backtest::{BacktestResult, TradeLedger};
use crate::pricing::to_f64;

const TRADING_DAYS: f64 = 252.0;

/// Minimum number of returns before VaR/CVaR are reported.
const MIN_VAR_OBSERVATIONS: usize = 10;

/// How VaR is estimated from the return series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarMethod {
    /// Empirical percentile of observed returns.
    #[default]
    Historical,
    /// Normal approximation from the sample mean and deviation.
    Parametric,
}

/// Knobs for the calculation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub var_confidence: f64,
    pub var_method: VarMethod,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            var_confidence: 0.95,
            var_method: VarMethod::Historical,
        }
    }
}

/// Return over one calendar month or year.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodReturn {
    pub year: i32,
    /// `None` for a yearly figure.
    pub month: Option<u32>,
    pub return_pct: f64,
}

impl PeriodReturn {
    pub fn label(&self) -> String {
        match self.month {
            Some(month) => format!("{}-{:02}", self.year, month),
            None => self.year.to_string(),
        }
    }
}

/// Maximum drawdown as a fraction of the running peak, and the longest run of
/// consecutive points spent below a peak. The peak starts at initial capital;
/// `peak_at` is `None` when the deepest drawdown is measured from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawdownAnalysis {
    pub max_drawdown: f64,
    pub max_drawdown_duration: usize,
    pub peak_at: Option<NaiveDateTime>,
    pub trough_at: Option<NaiveDateTime>,
}

/// Longest runs of winning and losing trades.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streaks {
    pub longest_win: usize,
    pub longest_loss: usize,
}

/// Comprehensive performance metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    // Return metrics
    pub total_return: f64,
    pub cagr: f64,
    pub annualized_volatility: f64,

    // Risk metrics
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_duration: usize,
    pub calmar_ratio: f64,
    pub var: f64,
    pub cvar: f64,
    pub var_confidence: f64,

    // Trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    /// Infinite when there are wins and no losses.
    pub profit_factor: f64,
    pub total_pnl: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub avg_holding_days: f64,
    pub longest_win_streak: usize,
    pub longest_loss_streak: usize,
    pub exit_reasons: BTreeMap<String, usize>,

    // Costs
    pub total_costs: Decimal,

    pub monthly_returns: Vec<PeriodReturn>,
    pub yearly_returns: Vec<PeriodReturn>,
}

/// Metrics calculator.
#[derive(Debug, Clone, Default)]
pub struct MetricsCalculator {
    config: MetricsConfig,
}

impl MetricsCalculator {
    pub fn new(config: MetricsConfig) -> Self {
        Self { config }
    }

    /// Calculate all metrics from a backtest result.
    pub fn calculate(&self, result: &BacktestResult) -> PerformanceMetrics {
        let initial = to_f64(result.initial_capital);
        let values = result.equity_curve.values();
        let returns = period_returns(initial, &values);

        let total_return = result.total_return();
        let days = match (result.start, result.end) {
            (Some(start), Some(end)) => (end.date() - start.date()).num_days(),
            _ => 0,
        };
        let cagr = cagr(initial, to_f64(result.final_equity), days);

        let drawdown = analyze_drawdown(initial, &result.equity_curve.timestamps(), &values);
        let calmar_ratio = if drawdown.max_drawdown > 0.0 {
            cagr / drawdown.max_drawdown
        } else {
            0.0
        };

        let (var, cvar) = match self.config.var_method {
            VarMethod::Historical => historical_var(&returns, self.config.var_confidence),
            VarMethod::Parametric => parametric_var(&returns, self.config.var_confidence),
        };

        let timeline: Vec<(NaiveDateTime, f64)> = result
            .equity_curve
            .timestamps()
            .into_iter()
            .zip(values.iter().copied())
            .collect();

        let mut metrics = PerformanceMetrics {
            total_return,
            cagr,
            annualized_volatility: annualized_volatility(&returns),
            sharpe_ratio: sharpe_ratio(&returns, result.risk_free_rate),
            sortino_ratio: sortino_ratio(&returns, result.risk_free_rate),
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_duration: drawdown.max_drawdown_duration,
            calmar_ratio,
            var,
            cvar,
            var_confidence: self.config.var_confidence,
            total_costs: result.costs.total(),
            monthly_returns: calendar_returns(initial, &timeline, true),
            yearly_returns: calendar_returns(initial, &timeline, false),
            ..Default::default()
        };
        fill_trade_statistics(&mut metrics, &result.ledger);
        metrics
    }
}

fn fill_trade_statistics(metrics: &mut PerformanceMetrics, ledger: &TradeLedger) {
    let pnls = ledger.net_pnls();
    let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
    let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p < Decimal::ZERO).collect();

    metrics.total_trades = pnls.len();
    metrics.winning_trades = wins.len();
    metrics.losing_trades = losses.len();
    metrics.win_rate = if pnls.is_empty() {
        0.0
    } else {
        wins.len() as f64 / pnls.len() as f64
    };
    metrics.profit_factor = profit_factor(&pnls);
    metrics.total_pnl = pnls.iter().copied().sum();
    metrics.avg_win = average(&wins);
    metrics.avg_loss = average(&losses);
    metrics.largest_win = wins.iter().copied().max().unwrap_or(Decimal::ZERO);
    metrics.largest_loss = losses.iter().copied().min().unwrap_or(Decimal::ZERO);
    metrics.avg_holding_days = if ledger.is_empty() {
        0.0
    } else {
        ledger.iter().map(|e| e.holding_days as f64).sum::<f64>() / ledger.len() as f64
    };

    let streaks = streaks(&pnls);
    metrics.longest_win_streak = streaks.longest_win;
    metrics.longest_loss_streak = streaks.longest_loss;

    for entry in ledger.iter() {
        let reason = entry.exit_reason().map(|r| r.as_str()).unwrap_or("unknown");
        *metrics.exit_reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

fn average(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().copied().sum::<Decimal>() / Decimal::from(values.len())
}

/// Simple returns between consecutive values, starting from `initial`.
pub fn period_returns(initial: f64, values: &[f64]) -> Vec<f64> {
    let mut previous = initial;
    let mut returns = Vec::with_capacity(values.len());
    for &value in values {
        if previous > 0.0 {
            returns.push(value / previous - 1.0);
        }
        previous = value;
    }
    returns
}

/// Compound annual growth over `days` calendar days.
pub fn cagr(start: f64, end: f64, days: i64) -> f64 {
    if start <= 0.0 || days <= 0 {
        return 0.0;
    }
    if end <= 0.0 {
        return -1.0;
    }
    (end / start).powf(365.0 / days as f64) - 1.0
}

pub fn annualized_volatility(returns: &[f64]) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let std = returns.std_dev();
    if std.is_finite() {
        std * TRADING_DAYS.sqrt()
    } else {
        0.0
    }
}

/// Annualized Sharpe ratio on excess daily returns.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    if returns.len() < 2 {
        return 0.0;
    }
    let daily_rf = risk_free_rate / TRADING_DAYS;
    let std = returns.std_dev();
    if !std.is_finite() || std <= f64::EPSILON {
        return 0.0;
    }
    let excess = returns.iter().map(|r| r - daily_rf).mean();
    excess / std * TRADING_DAYS.sqrt()
}

/// Annualized Sortino ratio; the denominator is the deviation of the
/// negative excess returns only.
pub fn sortino_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    let daily_rf = risk_free_rate / TRADING_DAYS;
    let excess: Vec<f64> = returns.iter().map(|r| r - daily_rf).collect();
    let downside: Vec<f64> = excess.iter().copied().filter(|r| *r < 0.0).collect();
    if downside.len() < 2 {
        return 0.0;
    }
    let downside_std = downside.std_dev();
    if !downside_std.is_finite() || downside_std <= f64::EPSILON {
        return 0.0;
    }
    excess.mean() / downside_std * TRADING_DAYS.sqrt()
}

/// Drawdown against the running peak of `values`.
pub fn analyze_drawdown(initial: f64, timestamps: &[NaiveDateTime], values: &[f64]) -> DrawdownAnalysis {
    let mut analysis = DrawdownAnalysis::default();

    // The run starts at its initial capital; `None` marks that starting peak.
    let mut peak = initial;
    let mut peak_index: Option<usize> = None;
    let mut current_duration = 0;
    for (i, &value) in values.iter().enumerate() {
        if value >= peak {
            peak = value;
            peak_index = Some(i);
            current_duration = 0;
            continue;
        }

        current_duration += 1;
        analysis.max_drawdown_duration = analysis.max_drawdown_duration.max(current_duration);
        if peak > 0.0 {
            let drawdown = (peak - value) / peak;
            if drawdown > analysis.max_drawdown {
                analysis.max_drawdown = drawdown;
                analysis.peak_at = peak_index.and_then(|p| timestamps.get(p).copied());
                analysis.trough_at = timestamps.get(i).copied();
            }
        }
    }
    analysis
}

/// Linear-interpolated percentile of sorted data, `q` in [0, 1].
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let rank = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let weight = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * weight
}

/// Historical VaR and CVaR as positive loss fractions.
pub fn historical_var(returns: &[f64], confidence: f64) -> (f64, f64) {
    if returns.len() < MIN_VAR_OBSERVATIONS {
        return (0.0, 0.0);
    }
    let mut sorted = returns.to_vec();
    sorted.sort_by(f64::total_cmp);
    let cutoff = percentile(&sorted, 1.0 - confidence);
    let var = cutoff.abs();

    let tail: Vec<f64> = sorted.iter().copied().filter(|r| *r <= -var).collect();
    let cvar = if tail.is_empty() { var } else { tail.mean().abs() };
    (var, cvar)
}

/// Normal-approximation VaR; CVaR is the expected shortfall of the same
/// normal.
pub fn parametric_var(returns: &[f64], confidence: f64) -> (f64, f64) {
    if returns.len() < MIN_VAR_OBSERVATIONS {
        return (0.0, 0.0);
    }
    let mean = returns.mean();
    let sigma = returns.std_dev();
    let Ok(normal) = Normal::new(0.0, 1.0) else {
        return (0.0, 0.0);
    };
    if !sigma.is_finite() || sigma <= 0.0 {
        return (mean.min(0.0).abs(), mean.min(0.0).abs());
    }
    let alpha = 1.0 - confidence;
    let z = normal.inverse_cdf(alpha);
    let var = (mean + z * sigma).abs();
    let density = (-0.5 * z * z).exp() / (2.0 * std::f64::consts::PI).sqrt();
    let cvar = (mean - sigma * density / alpha).abs();
    (var, cvar)
}

/// Gross wins over gross losses.
pub fn profit_factor(pnls: &[Decimal]) -> f64 {
    let gross_win: Decimal = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).sum();
    let gross_loss: Decimal = pnls.iter().copied().filter(|p| *p < Decimal::ZERO).sum::<Decimal>().abs();
    if gross_win.is_zero() {
        0.0
    } else if gross_loss.is_zero() {
        f64::INFINITY
    } else {
        to_f64(gross_win) / to_f64(gross_loss)
    }
}

/// Longest win and loss runs in ledger order. Breakeven trades end both.
pub fn streaks(pnls: &[Decimal]) -> Streaks {
    let mut result = Streaks::default();
    let (mut wins, mut losses) = (0, 0);
    for pnl in pnls {
        if *pnl > Decimal::ZERO {
            wins += 1;
            losses = 0;
        } else if *pnl < Decimal::ZERO {
            losses += 1;
            wins = 0;
        } else {
            wins = 0;
            losses = 0;
        }
        result.longest_win = result.longest_win.max(wins);
        result.longest_loss = result.longest_loss.max(losses);
    }
    result
}

/// Month-over-month (or year-over-year) change of closing equity. The first
/// period is measured from `initial`.
pub fn calendar_returns(initial: f64, timeline: &[(NaiveDateTime, f64)], monthly: bool) -> Vec<PeriodReturn> {
    let mut closes: BTreeMap<(i32, Option<u32>), f64> = BTreeMap::new();
    for (at, value) in timeline {
        let key = (at.year(), monthly.then(|| at.month()));
        closes.insert(key, *value);
    }

    let mut previous = initial;
    closes
        .into_iter()
        .map(|((year, month), close)| {
            let return_pct = if previous > 0.0 {
                (close / previous - 1.0) * 100.0
            } else {
                0.0
            };
            previous = close;
            PeriodReturn {
                year,
                month,
                return_pct,
            }
        })
        .collect()
}
