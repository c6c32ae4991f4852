//! Stable output schema for a run and its text rendering.

use std::fmt::{self, Write as _};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{BacktestResult, EngineState, EquityCurve, FailedRun, TradeLedger, TransactionCost};

use super::calculator::{MetricsCalculator, PerformanceMetrics};

const RULE: &str = "============================================================";

/// Everything a run produced, ready to serialize.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub status: EngineState,
    /// Terminating error for failed runs.
    pub error: Option<String>,
    pub strategies: Vec<String>,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub snapshots_processed: usize,
    pub snapshots_skipped: usize,
    pub metrics: PerformanceMetrics,
    pub costs: TransactionCost,
    /// Per-kind counts, e.g. `theoretical_mark: 4`.
    pub warnings: Vec<String>,
    pub ledger: TradeLedger,
    pub equity_curve: EquityCurve,
}

impl Report {
    pub fn from_result(result: &BacktestResult, calculator: &MetricsCalculator) -> Self {
        Self {
            status: result.state,
            error: None,
            strategies: result.strategies.iter().map(|s| s.as_str().to_string()).collect(),
            start: result.start,
            end: result.end,
            initial_capital: result.initial_capital,
            final_equity: result.final_equity,
            snapshots_processed: result.snapshots_processed,
            snapshots_skipped: result.snapshots_skipped,
            metrics: calculator.calculate(result),
            costs: result.costs,
            warnings: result.data_quality.summary_lines(),
            ledger: result.ledger.clone(),
            equity_curve: result.equity_curve.clone(),
        }
    }

    /// Report for an aborted run. Only trade statistics are derived; the
    /// return series is incomplete.
    pub fn from_failure(failed: &FailedRun, initial_capital: Decimal) -> Self {
        let final_equity = failed
            .equity_curve
            .last()
            .map(|p| p.equity)
            .unwrap_or(initial_capital);
        let partial = BacktestResult {
            state: EngineState::Failed,
            strategies: Vec::new(),
            initial_capital,
            final_equity,
            risk_free_rate: 0.0,
            start: failed.equity_curve.first().map(|p| p.timestamp),
            end: failed.equity_curve.last().map(|p| p.timestamp),
            ledger: failed.ledger.clone(),
            equity_curve: EquityCurve::new(),
            costs: TransactionCost::default(),
            data_quality: failed.data_quality.clone(),
            snapshots_processed: failed.snapshots_processed,
            snapshots_skipped: 0,
        };
        let mut report = Self::from_result(&partial, &MetricsCalculator::default());
        report.error = Some(failed.error.to_string());
        report.equity_curve = failed.equity_curve.clone();
        report.metrics.total_costs = failed.ledger.total_costs();
        report
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    fn write_text(&self, out: &mut String) -> fmt::Result {
        let m = &self.metrics;

        writeln!(out, "{RULE}")?;
        writeln!(out, "SUMMARY")?;
        writeln!(out, "{RULE}")?;
        writeln!(out, "Status:              {}", self.status.as_str())?;
        if let Some(error) = &self.error {
            writeln!(out, "Error:               {}", error)?;
        }
        writeln!(out, "Strategies:          {}", self.strategies.join(", "))?;
        match (self.start, self.end) {
            (Some(start), Some(end)) => writeln!(out, "Period:              {} to {}", start.date(), end.date())?,
            _ => writeln!(out, "Period:              n/a")?,
        }
        writeln!(
            out,
            "Snapshots:           {} processed, {} skipped",
            self.snapshots_processed, self.snapshots_skipped
        )?;
        writeln!(out, "Initial Capital:     {:.2}", self.initial_capital)?;
        writeln!(out, "Final Equity:        {:.2}", self.final_equity)?;
        writeln!(out, "Total Return:        {:.2}%", m.total_return * 100.0)?;
        writeln!(out, "CAGR:                {:.2}%", m.cagr * 100.0)?;
        writeln!(out, "Volatility (ann.):   {:.2}%", m.annualized_volatility * 100.0)?;

        writeln!(out)?;
        writeln!(out, "RISK METRICS")?;
        writeln!(out, "{RULE}")?;
        writeln!(out, "Sharpe Ratio:        {:.2}", m.sharpe_ratio)?;
        writeln!(out, "Sortino Ratio:       {:.2}", m.sortino_ratio)?;
        writeln!(out, "Calmar Ratio:        {:.2}", m.calmar_ratio)?;
        writeln!(out, "Max Drawdown:        {:.2}%", m.max_drawdown * 100.0)?;
        writeln!(out, "Max DD Duration:     {} points", m.max_drawdown_duration)?;
        let confidence = m.var_confidence * 100.0;
        writeln!(out, "VaR ({:.0}%):          {:.2}%", confidence, m.var * 100.0)?;
        writeln!(out, "CVaR ({:.0}%):         {:.2}%", confidence, m.cvar * 100.0)?;

        writeln!(out)?;
        writeln!(out, "TRADE STATISTICS")?;
        writeln!(out, "{RULE}")?;
        writeln!(
            out,
            "Total Trades:        {} ({} won, {} lost)",
            m.total_trades, m.winning_trades, m.losing_trades
        )?;
        writeln!(out, "Win Rate:            {:.1}%", m.win_rate * 100.0)?;
        if m.profit_factor.is_infinite() {
            writeln!(out, "Profit Factor:       inf")?;
        } else {
            writeln!(out, "Profit Factor:       {:.2}", m.profit_factor)?;
        }
        writeln!(out, "Net P&L:             {:.2}", m.total_pnl)?;
        writeln!(out, "Avg Win / Loss:      {:.2} / {:.2}", m.avg_win, m.avg_loss)?;
        writeln!(out, "Largest Win / Loss:  {:.2} / {:.2}", m.largest_win, m.largest_loss)?;
        writeln!(out, "Avg Holding Days:    {:.1}", m.avg_holding_days)?;
        writeln!(
            out,
            "Longest Streaks:     {} wins, {} losses",
            m.longest_win_streak, m.longest_loss_streak
        )?;
        for (reason, count) in &m.exit_reasons {
            writeln!(out, "  exit {:<14} {}", reason, count)?;
        }

        writeln!(out)?;
        writeln!(out, "MONTHLY RETURNS")?;
        writeln!(out, "{RULE}")?;
        if m.monthly_returns.is_empty() {
            writeln!(out, "(none)")?;
        }
        for period in &m.monthly_returns {
            writeln!(out, "{}             {:>8.2}%", period.label(), period.return_pct)?;
        }
        for period in &m.yearly_returns {
            writeln!(out, "{} (year)         {:>8.2}%", period.label(), period.return_pct)?;
        }

        writeln!(out)?;
        writeln!(out, "TRANSACTION COSTS")?;
        writeln!(out, "{RULE}")?;
        writeln!(out, "Brokerage:           {:.2}", self.costs.brokerage)?;
        writeln!(out, "STT:                 {:.2}", self.costs.stt)?;
        writeln!(out, "Exchange:            {:.2}", self.costs.exchange)?;
        writeln!(out, "GST:                 {:.2}", self.costs.gst)?;
        writeln!(out, "SEBI:                {:.2}", self.costs.sebi)?;
        writeln!(out, "Stamp Duty:          {:.2}", self.costs.stamp_duty)?;
        writeln!(out, "Total:               {:.2}", m.total_costs)?;

        writeln!(out)?;
        writeln!(out, "DATA QUALITY")?;
        writeln!(out, "{RULE}")?;
        if self.warnings.is_empty() {
            writeln!(out, "No issues recorded")?;
        }
        for warning in &self.warnings {
            writeln!(out, "{}", warning)?;
        }
        Ok(())
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut text = String::new();
        self.write_text(&mut text)?;
        f.write_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DataQualityIssue, DataQualityLog, EngineFatal};
    use crate::strategy::StrategyKind;
    use rust_decimal_macros::dec;

    fn result() -> BacktestResult {
        let mut data_quality = DataQualityLog::new();
        data_quality.record(DataQualityIssue::DataUnavailable {
            timestamp: None,
            detail: "gap".to_string(),
        });
        BacktestResult {
            state: EngineState::Complete,
            strategies: vec![StrategyKind::IronCondor],
            initial_capital: dec!(100000),
            final_equity: dec!(100000),
            risk_free_rate: 0.07,
            start: None,
            end: None,
            ledger: TradeLedger::new(),
            equity_curve: EquityCurve::new(),
            costs: TransactionCost::default(),
            data_quality,
            snapshots_processed: 0,
            snapshots_skipped: 1,
        }
    }

    #[test]
    fn test_text_has_every_section() {
        let report = Report::from_result(&result(), &MetricsCalculator::default());
        let text = report.to_string();
        for section in [
            "SUMMARY",
            "RISK METRICS",
            "TRADE STATISTICS",
            "MONTHLY RETURNS",
            "TRANSACTION COSTS",
            "DATA QUALITY",
        ] {
            assert!(text.contains(section), "missing {section}");
        }
        assert!(text.contains("iron_condor"));
        assert!(text.contains("data_unavailable: 1"));
    }

    #[test]
    fn test_json_schema_fields() {
        let report = Report::from_result(&result(), &MetricsCalculator::default());
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["status"], "complete");
        assert_eq!(json["strategies"][0], "iron_condor");
        assert!(json["metrics"]["sharpe_ratio"].is_number());
        assert!(json["ledger"].is_array());
        assert!(json["equity_curve"].is_array());
    }

    #[test]
    fn test_failure_report_keeps_error() {
        let failed = FailedRun {
            ledger: TradeLedger::new(),
            equity_curve: EquityCurve::new(),
            data_quality: DataQualityLog::new(),
            snapshots_processed: 3,
            error: EngineFatal::MalformedSnapshot("spot is NaN".to_string()),
        };
        let report = Report::from_failure(&failed, dec!(100000));
        assert_eq!(report.status, EngineState::Failed);
        assert_eq!(report.final_equity, dec!(100000));
        assert!(report.error.as_deref().unwrap_or_default().contains("spot is NaN"));
        assert!(report.to_string().contains("Status:              failed"));
    }
}
