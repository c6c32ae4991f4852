//! Core backtesting engine.
//!
//! Runs the simulation loop over a time-ordered snapshot source:
//! 1. Skip ticks the provider could not produce
//! 2. Sanitize the snapshot and enforce strictly increasing timestamps
//! 3. Price the chain and feed each strategy's IV history
//! 4. Mark open positions to market
//! 5. Check exit conditions on open positions
//! 6. Evaluate entries while under the concurrency cap
//! 7. Record the equity point
//!
//! The engine is IDLE until [`BacktestEngine::run`], then RUNNING, and ends
//! COMPLETE or FAILED. A failed run hands back the ledger built so far.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::data::{sanitize_snapshot, MarketSnapshot, SnapshotResult, SourceError};
use crate::error::{DataQualityIssue, DataQualityLog, EngineFatal, ValidationError, ValidationResult};
use crate::pricing::{BlackScholes, PricedSnapshot};
use crate::risk::{KellyInputs, PositionSizer, PositionSizerConfig, SizingRequest};
use crate::strategy::{EntryProposal, OptionsStrategy, Signal, Strategy, StrategyKind};

use super::costs::{CostModel, OrderSide, TransactionCost};
use super::ledger::{EquityCurve, EquityCurvePoint, TradeLedger, TradeLedgerEntry};
use super::position::{ExitReason, MarkSource, OptionLeg, Position, PositionId};

/// Lifecycle of one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    Complete,
    Failed,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// How legs without a fresh quote are valued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkPolicy {
    /// Only the stale legs get a model price.
    #[default]
    PerLeg,
    /// One stale leg puts every leg of the position on model prices.
    WholePosition,
    /// Stale legs keep their previous mark.
    LastMark,
}

impl MarkPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerLeg => "per_leg",
            Self::WholePosition => "whole_position",
            Self::LastMark => "last_mark",
        }
    }
}

/// Configuration for backtest execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestConfig {
    /// Starting capital.
    pub initial_capital: Decimal,

    /// Annual risk-free rate for pricing and Sharpe/Sortino.
    pub risk_free_rate: f64,

    /// Contract multiplier per underlying.
    pub lot_sizes: BTreeMap<String, u32>,

    /// Multiplier for underlyings not listed in `lot_sizes`.
    pub default_lot_size: u32,

    /// Maximum open positions across all strategies.
    pub max_concurrent_positions: usize,

    pub mark_policy: MarkPolicy,

    /// Close whatever is still open after the last snapshot.
    pub close_at_end: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        let lot_sizes = [("NIFTY", 50), ("BANKNIFTY", 15), ("SENSEX", 10)]
            .into_iter()
            .map(|(name, lots)| (name.to_string(), lots))
            .collect();
        Self {
            initial_capital: Decimal::from(1_000_000),
            risk_free_rate: 0.07,
            lot_sizes,
            default_lot_size: 50,
            max_concurrent_positions: 10,
            mark_policy: MarkPolicy::PerLeg,
            close_at_end: true,
        }
    }
}

impl BacktestConfig {
    pub fn lot_size(&self, underlying: &str) -> u32 {
        self.lot_sizes
            .get(&underlying.to_ascii_uppercase())
            .copied()
            .unwrap_or(self.default_lot_size)
    }

    pub fn validate(&self) -> ValidationResult<()> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(ValidationError::invalid(
                "backtest.initial_capital",
                format!("{} must be positive", self.initial_capital),
            ));
        }
        if !self.risk_free_rate.is_finite() || !(0.0..1.0).contains(&self.risk_free_rate) {
            return Err(ValidationError::invalid(
                "backtest.risk_free_rate",
                format!("{} is outside [0, 1)", self.risk_free_rate),
            ));
        }
        if self.default_lot_size == 0 {
            return Err(ValidationError::invalid("backtest.default_lot_size", "must be at least 1"));
        }
        if let Some((name, _)) = self.lot_sizes.iter().find(|(_, lots)| **lots == 0) {
            return Err(ValidationError::invalid(
                format!("backtest.lot_sizes.{}", name),
                "must be at least 1",
            ));
        }
        if self.max_concurrent_positions == 0 {
            return Err(ValidationError::invalid(
                "backtest.max_concurrent_positions",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub state: EngineState,
    pub strategies: Vec<StrategyKind>,
    pub initial_capital: Decimal,
    pub final_equity: Decimal,
    pub risk_free_rate: f64,
    pub start: Option<NaiveDateTime>,
    pub end: Option<NaiveDateTime>,
    pub ledger: TradeLedger,
    pub equity_curve: EquityCurve,
    /// Charges paid over the run, itemized.
    pub costs: TransactionCost,
    pub data_quality: DataQualityLog,
    pub snapshots_processed: usize,
    pub snapshots_skipped: usize,
}

impl BacktestResult {
    pub fn total_return(&self) -> f64 {
        let initial = crate::pricing::to_f64(self.initial_capital);
        if initial <= 0.0 {
            return 0.0;
        }
        crate::pricing::to_f64(self.final_equity) / initial - 1.0
    }
}

/// A run that stopped on an unrecoverable error.
#[derive(Debug, Clone, Error)]
#[error("backtest failed after {snapshots_processed} snapshots: {error}")]
pub struct FailedRun {
    /// Trades closed before the failure.
    pub ledger: TradeLedger,
    pub equity_curve: EquityCurve,
    pub data_quality: DataQualityLog,
    pub snapshots_processed: usize,
    #[source]
    pub error: EngineFatal,
}

/// The main backtesting engine.
pub struct BacktestEngine {
    config: BacktestConfig,
    costs: CostModel,
    sizer: PositionSizer,
    model: BlackScholes,
    strategies: Vec<Strategy>,
    state: EngineState,
    cash: Decimal,
    realized_pnl: Decimal,
    positions: Vec<Position>,
    ledger: TradeLedger,
    equity_curve: EquityCurve,
    log: DataQualityLog,
    cost_totals: TransactionCost,
    next_id: PositionId,
    first_timestamp: Option<NaiveDateTime>,
    last_timestamp: Option<NaiveDateTime>,
    processed: usize,
    skipped: usize,
}

impl BacktestEngine {
    /// Engine with default costs and sizing.
    pub fn new(config: BacktestConfig, strategies: Vec<Strategy>) -> Self {
        let cash = config.initial_capital;
        let model = BlackScholes::with_rate(config.risk_free_rate);
        Self {
            config,
            costs: CostModel::default(),
            sizer: PositionSizer::new(PositionSizerConfig::default()),
            model,
            strategies,
            state: EngineState::Idle,
            cash,
            realized_pnl: Decimal::ZERO,
            positions: Vec::new(),
            ledger: TradeLedger::new(),
            equity_curve: EquityCurve::new(),
            log: DataQualityLog::new(),
            cost_totals: TransactionCost::default(),
            next_id: 1,
            first_timestamp: None,
            last_timestamp: None,
            processed: 0,
            skipped: 0,
        }
    }

    pub fn with_costs(mut self, costs: CostModel) -> Self {
        self.costs = costs;
        self
    }

    pub fn with_sizing(mut self, sizing: PositionSizerConfig) -> Self {
        self.sizer = PositionSizer::new(sizing);
        self
    }

    /// Seed every strategy's IV history before the first tick.
    pub fn initialize_strategies(&mut self, iv_history: &[f64]) {
        for strategy in &mut self.strategies {
            strategy.initialize(iv_history);
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn open_positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn cash(&self) -> Decimal {
        self.cash
    }

    /// Cash plus the market value of open positions.
    pub fn equity(&self) -> Decimal {
        self.cash + self.positions.iter().map(Position::market_value).sum::<Decimal>()
    }

    /// Replay `source` to the end. An engine runs once.
    pub fn run<I>(&mut self, source: I) -> Result<BacktestResult, FailedRun>
    where
        I: IntoIterator<Item = SnapshotResult>,
    {
        if self.state != EngineState::Idle {
            return Err(FailedRun {
                ledger: TradeLedger::new(),
                equity_curve: EquityCurve::new(),
                data_quality: DataQualityLog::new(),
                snapshots_processed: 0,
                error: EngineFatal::NotIdle(self.state.as_str().to_string()),
            });
        }

        self.state = EngineState::Running;
        info!(
            strategies = ?self.strategies.iter().map(Strategy::name).collect::<Vec<_>>(),
            capital = %self.config.initial_capital,
            "backtest started"
        );

        match self.drive(source) {
            Ok(()) => {
                self.state = EngineState::Complete;
                let result = self.take_result();
                info!(
                    snapshots = result.snapshots_processed,
                    skipped = result.snapshots_skipped,
                    trades = result.ledger.len(),
                    final_equity = %result.final_equity,
                    "backtest complete"
                );
                Ok(result)
            }
            Err(error) => {
                self.state = EngineState::Failed;
                tracing::error!(%error, snapshots = self.processed, "backtest failed");
                Err(FailedRun {
                    ledger: std::mem::take(&mut self.ledger),
                    equity_curve: std::mem::take(&mut self.equity_curve),
                    data_quality: std::mem::take(&mut self.log),
                    snapshots_processed: self.processed,
                    error,
                })
            }
        }
    }

    fn drive<I>(&mut self, source: I) -> Result<(), EngineFatal>
    where
        I: IntoIterator<Item = SnapshotResult>,
    {
        let mut items = source.into_iter().peekable();
        while let Some(item) = items.next() {
            match item {
                Ok(snapshot) => {
                    let is_last = items.peek().is_none();
                    self.process_snapshot(snapshot, is_last)?;
                }
                Err(SourceError::DataUnavailable { timestamp, reason }) => {
                    self.skipped += 1;
                    self.log.record(DataQualityIssue::DataUnavailable {
                        timestamp,
                        detail: reason,
                    });
                }
                Err(SourceError::Malformed(detail)) => {
                    return Err(EngineFatal::MalformedSnapshot(detail));
                }
            }
        }

        // Trailing gaps leave positions open past the last processed tick.
        if self.config.close_at_end && !self.positions.is_empty() {
            if let Some(at) = self.last_timestamp {
                self.close_all(at)?;
                let point = self.equity_point(at);
                self.equity_curve.restate_last(point)?;
            }
        }
        Ok(())
    }

    /// Process a single tick.
    fn process_snapshot(&mut self, snapshot: MarketSnapshot, is_last: bool) -> Result<(), EngineFatal> {
        let timestamp = snapshot.timestamp;
        if let Some(previous) = self.last_timestamp {
            if timestamp <= previous {
                return Err(EngineFatal::NonMonotonicTimestamp {
                    previous,
                    current: timestamp,
                });
            }
        }

        let (snapshot, report) = sanitize_snapshot(snapshot)?;
        for (contract, defect) in &report.dropped {
            self.log.record(DataQualityIssue::DataUnavailable {
                timestamp: Some(timestamp),
                detail: format!("{} dropped: {}", contract, defect.describe()),
            });
        }

        self.last_timestamp = Some(timestamp);
        self.first_timestamp.get_or_insert(timestamp);

        let priced = PricedSnapshot::build(snapshot, self.model, &mut self.log);

        for strategy in &mut self.strategies {
            strategy.observe(&priced);
        }

        self.mark_positions(&priced);
        self.check_exits(&priced)?;
        self.check_entries(&priced)?;

        if is_last && self.config.close_at_end {
            self.close_all(timestamp)?;
        }

        self.record_equity(timestamp)?;
        self.processed += 1;
        Ok(())
    }

    /// Update marks for open positions on this snapshot's underlying.
    fn mark_positions(&mut self, snapshot: &PricedSnapshot) {
        let policy = self.config.mark_policy;
        let timestamp = snapshot.timestamp();
        let log = &mut self.log;

        for position in self
            .positions
            .iter_mut()
            .filter(|p| p.underlying == snapshot.underlying())
        {
            let fresh: Vec<Option<(Decimal, Option<f64>)>> =
                position.legs.iter().map(|leg| fresh_mark(snapshot, leg)).collect();
            let any_stale = fresh.iter().any(Option::is_none);

            for (leg, quote) in position.legs.iter_mut().zip(fresh) {
                match (policy, quote) {
                    (MarkPolicy::WholePosition, _) if any_stale => {
                        mark_theoretical(leg, snapshot, timestamp, log);
                    }
                    (_, Some((mark, iv))) => {
                        leg.set_mark(mark, MarkSource::Quote);
                        if let Some(iv) = iv {
                            leg.mark_iv = iv;
                        }
                    }
                    (MarkPolicy::LastMark, None) => {
                        leg.set_mark(leg.current_mark, MarkSource::Carried);
                        log.record(DataQualityIssue::TheoreticalMark {
                            timestamp,
                            contract: leg.contract_label(),
                            method: "carried".to_string(),
                        });
                    }
                    (_, None) => mark_theoretical(leg, snapshot, timestamp, log),
                }
            }
        }
    }

    /// Ask each position's strategy for an exit and apply the ones that fire.
    fn check_exits(&mut self, snapshot: &PricedSnapshot) -> Result<(), EngineFatal> {
        let mut exits = Vec::new();
        for position in self
            .positions
            .iter()
            .filter(|p| p.underlying == snapshot.underlying())
        {
            let Some(strategy) = self.strategies.iter().find(|s| s.kind() == position.strategy) else {
                continue;
            };
            if let Signal::Exit { reason, detail, .. } = strategy.exit_check(position, snapshot) {
                exits.push((position.id, reason, detail));
            }
        }

        for (id, reason, detail) in exits {
            debug!(position = id, %reason, %detail, "exit signal");
            self.close_position(id, reason, snapshot.timestamp())?;
        }
        Ok(())
    }

    /// Evaluate strategies in configured order until the cap is reached.
    fn check_entries(&mut self, snapshot: &PricedSnapshot) -> Result<(), EngineFatal> {
        for index in 0..self.strategies.len() {
            if self.positions.len() >= self.config.max_concurrent_positions {
                break;
            }

            let strategy = &self.strategies[index];
            let open: Vec<&Position> = self.positions.iter().collect();
            let Signal::Enter(proposal) = strategy.evaluate(snapshot, &open) else {
                continue;
            };
            let kind = strategy.kind();

            if let Err(err) = proposal.validate(&strategy.leg_ratio()) {
                self.log.record(DataQualityIssue::SignalRejected {
                    timestamp: snapshot.timestamp(),
                    strategy: kind.to_string(),
                    detail: err.to_string(),
                });
                continue;
            }

            self.open_position(kind, proposal, snapshot)?;
        }
        Ok(())
    }

    fn open_position(
        &mut self,
        kind: StrategyKind,
        proposal: EntryProposal,
        snapshot: &PricedSnapshot,
    ) -> Result<(), EngineFatal> {
        let lot_size = self.config.lot_size(&proposal.underlying);
        let request = SizingRequest {
            capital: self.equity(),
            open_risk: self.positions.iter().map(|p| p.risk_amount).sum(),
            lot_size,
            risk_per_set: proposal.risk_per_set,
            max_loss_per_set: proposal.max_loss_per_set,
            premium_per_set: proposal.net_premium(),
            volatility: proposal.volatility,
            fraction: proposal.position_size_pct,
            kelly: KellyInputs::from_pnls(&self.ledger.net_pnls_for(kind)),
        };
        let sizing = self.sizer.calculate(&request);
        if !sizing.is_allowed() {
            debug!(
                strategy = %kind,
                reason = sizing.constraint_reason.as_deref().unwrap_or("no size"),
                "entry skipped"
            );
            return Ok(());
        }

        let legs: Vec<OptionLeg> = proposal
            .legs
            .iter()
            .map(|l| {
                let mut leg = l.to_leg(self.costs.fill(l.price, OrderSide::opening(l.side)));
                leg.set_mark(l.price, MarkSource::Quote);
                leg
            })
            .collect();

        let id = self.next_id;
        self.next_id += 1;
        let mut position = Position::new(
            id,
            kind,
            proposal.underlying,
            legs,
            snapshot.timestamp(),
            sizing.lots,
            lot_size,
        );
        position.entry_spot = snapshot.spot();
        position.entry_iv_rank = proposal.entry_iv_rank;
        position.max_profit = proposal.max_profit_per_set;
        position.max_loss = proposal.max_loss_per_set;
        position.risk_amount = sizing.risk_amount;
        position.rationale = proposal.rationale;

        let lot = Decimal::from(lot_size);
        let mut charges = TransactionCost::default();
        for leg in &position.legs {
            let side = OrderSide::opening(leg.side);
            let notional = leg.entry_price * Decimal::from(leg.quantity) * lot;
            charges += self.costs.breakdown(notional, 1, side.is_sell());
            self.cash -= leg.side.holding_sign() * notional;
        }
        position.entry_costs = charges.total();
        self.cash -= charges.total();
        self.cost_totals += charges;

        position.fill()?;
        debug!(
            position = id,
            strategy = %kind,
            lots = position.lots,
            credit = %position.entry_credit(),
            rationale = %position.rationale,
            "position opened"
        );
        self.positions.push(position);
        Ok(())
    }

    /// Fill the closing orders at current marks and archive the position.
    fn close_position(&mut self, id: PositionId, reason: ExitReason, at: NaiveDateTime) -> Result<(), EngineFatal> {
        let index = self
            .positions
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| EngineFatal::CorruptedLedger(format!("exit for unknown position {}", id)))?;
        let mut position = self.positions.remove(index);

        let lot = Decimal::from(position.lot_size);
        let mut charges = TransactionCost::default();
        let mut gross_pnl = Decimal::ZERO;
        for leg in &position.legs {
            let side = OrderSide::closing(leg.side);
            let fill = self.costs.fill(leg.current_mark, side);
            let quantity = Decimal::from(leg.quantity) * lot;
            charges += self.costs.breakdown(fill * quantity, 1, side.is_sell());
            self.cash += leg.side.holding_sign() * fill * quantity;
            gross_pnl += leg.side.holding_sign() * (fill - leg.entry_price) * quantity;
        }

        let net_pnl = gross_pnl - position.entry_costs - charges.total();
        self.cash -= charges.total();
        self.cost_totals += charges;
        self.realized_pnl += net_pnl;

        position.exit_costs = charges.total();
        position.close(at, reason, net_pnl)?;
        debug!(position = id, %reason, pnl = %net_pnl, "position closed");

        self.ledger.append(TradeLedgerEntry::from_position(position, gross_pnl)?)
    }

    fn close_all(&mut self, at: NaiveDateTime) -> Result<(), EngineFatal> {
        let ids: Vec<PositionId> = self.positions.iter().map(|p| p.id).collect();
        for id in ids {
            self.close_position(id, ExitReason::EndOfData, at)?;
        }
        Ok(())
    }

    fn equity_point(&self, timestamp: NaiveDateTime) -> EquityCurvePoint {
        let positions_value: Decimal = self.positions.iter().map(Position::market_value).sum();
        let unrealized_pnl: Decimal = self.positions.iter().map(Position::unrealized_pnl).sum();
        EquityCurvePoint {
            timestamp,
            equity: self.cash + positions_value,
            cash: self.cash,
            positions_value,
            realized_pnl: self.realized_pnl,
            unrealized_pnl,
            open_positions: self.positions.len(),
        }
    }

    fn record_equity(&mut self, timestamp: NaiveDateTime) -> Result<(), EngineFatal> {
        let point = self.equity_point(timestamp);
        self.equity_curve.push(point)
    }

    fn take_result(&mut self) -> BacktestResult {
        BacktestResult {
            state: self.state,
            strategies: self.strategies.iter().map(Strategy::kind).collect(),
            initial_capital: self.config.initial_capital,
            final_equity: self.equity(),
            risk_free_rate: self.config.risk_free_rate,
            start: self.first_timestamp,
            end: self.last_timestamp,
            ledger: std::mem::take(&mut self.ledger),
            equity_curve: std::mem::take(&mut self.equity_curve),
            costs: self.cost_totals,
            data_quality: std::mem::take(&mut self.log),
            snapshots_processed: self.processed,
            snapshots_skipped: self.skipped,
        }
    }
}

/// Quote mark and IV for a leg, if the snapshot has a usable one.
pub(crate) fn fresh_mark(snapshot: &PricedSnapshot, leg: &OptionLeg) -> Option<(Decimal, Option<f64>)> {
    if let Some(quote) = snapshot.find(leg.expiry, leg.strike, leg.right) {
        return Some((quote.mark, Some(quote.iv)));
    }
    snapshot
        .market_mark(leg.expiry, leg.strike, leg.right)
        .map(|mark| (mark, None))
}

fn mark_theoretical(
    leg: &mut OptionLeg,
    snapshot: &PricedSnapshot,
    timestamp: NaiveDateTime,
    log: &mut DataQualityLog,
) {
    let vol = if leg.mark_iv > 0.0 { leg.mark_iv } else { leg.entry_iv };
    let value = snapshot.theoretical_value(leg.expiry, leg.strike, leg.right, vol);
    leg.set_mark(value, MarkSource::Theoretical);
    log.record(DataQualityIssue::TheoreticalMark {
        timestamp,
        contract: leg.contract_label(),
        method: "black_scholes".to_string(),
    });
}
