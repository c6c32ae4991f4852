//! Append-only trade ledger and equity curve.

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::EngineFatal;
use crate::pricing::to_f64;
use crate::strategy::StrategyKind;

use super::position::{ExitReason, Position, PositionStatus};

/// A closed position with its costs and net result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLedgerEntry {
    pub position: Position,
    /// P&L at the exit fills, before costs.
    pub gross_pnl: Decimal,
    /// Entry plus exit charges.
    pub costs: Decimal,
    pub net_pnl: Decimal,
    pub holding_days: i64,
    /// Net P&L over the capital put at risk.
    pub return_on_risk: f64,
}

impl TradeLedgerEntry {
    /// Archive a closed position. Fails on anything not closed.
    pub fn from_position(position: Position, gross_pnl: Decimal) -> Result<Self, EngineFatal> {
        if position.status != PositionStatus::Closed {
            return Err(EngineFatal::CorruptedLedger(format!(
                "position {} archived while {:?}",
                position.id, position.status
            )));
        }
        let net_pnl = position.realized_pnl.ok_or_else(|| {
            EngineFatal::CorruptedLedger(format!("position {} closed without realized P&L", position.id))
        })?;
        let costs = position.entry_costs + position.exit_costs;
        let return_on_risk = if position.risk_amount.is_zero() {
            0.0
        } else {
            to_f64(net_pnl) / to_f64(position.risk_amount)
        };
        Ok(Self {
            holding_days: position.holding_days(),
            position,
            gross_pnl,
            costs,
            net_pnl,
            return_on_risk,
        })
    }

    pub fn is_winner(&self) -> bool {
        self.net_pnl > Decimal::ZERO
    }

    pub fn strategy(&self) -> StrategyKind {
        self.position.strategy
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.position.exit_reason
    }

    pub fn closed_at(&self) -> Option<NaiveDateTime> {
        self.position.closed_at
    }
}

/// Closed trades in the order they were closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeLedger {
    entries: Vec<TradeLedgerEntry>,
}

impl TradeLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a closed trade; close times must not go backwards.
    pub fn append(&mut self, entry: TradeLedgerEntry) -> Result<(), EngineFatal> {
        if let (Some(last), Some(closed)) = (self.entries.last().and_then(|e| e.closed_at()), entry.closed_at()) {
            if closed < last {
                return Err(EngineFatal::CorruptedLedger(format!(
                    "position {} closed at {} before previous close {}",
                    entry.position.id, closed, last
                )));
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[TradeLedgerEntry] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &TradeLedgerEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Net P&L of every trade, in ledger order.
    pub fn net_pnls(&self) -> Vec<Decimal> {
        self.entries.iter().map(|e| e.net_pnl).collect()
    }

    /// Net P&L of closed trades for one strategy.
    pub fn net_pnls_for(&self, strategy: StrategyKind) -> Vec<Decimal> {
        self.entries
            .iter()
            .filter(|e| e.strategy() == strategy)
            .map(|e| e.net_pnl)
            .collect()
    }

    pub fn total_net_pnl(&self) -> Decimal {
        self.entries.iter().map(|e| e.net_pnl).sum()
    }

    pub fn total_costs(&self) -> Decimal {
        self.entries.iter().map(|e| e.costs).sum()
    }
}

/// Net asset value after one processed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityCurvePoint {
    pub timestamp: NaiveDateTime,
    pub equity: Decimal,
    pub cash: Decimal,
    /// Signed market value of open positions.
    pub positions_value: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub open_positions: usize,
}

/// Strictly time-ordered equity points.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EquityCurve {
    points: Vec<EquityCurvePoint>,
}

impl EquityCurve {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: EquityCurvePoint) -> Result<(), EngineFatal> {
        if let Some(last) = self.points.last() {
            if point.timestamp <= last.timestamp {
                return Err(EngineFatal::CorruptedLedger(format!(
                    "equity point at {} does not follow {}",
                    point.timestamp, last.timestamp
                )));
            }
        }
        self.points.push(point);
        Ok(())
    }

    /// Replace the latest point with a restated one for the same timestamp.
    pub fn restate_last(&mut self, point: EquityCurvePoint) -> Result<(), EngineFatal> {
        match self.points.last_mut() {
            Some(last) if last.timestamp == point.timestamp => {
                *last = point;
                Ok(())
            }
            Some(last) => Err(EngineFatal::CorruptedLedger(format!(
                "restated equity point at {} does not match {}",
                point.timestamp, last.timestamp
            ))),
            None => Err(EngineFatal::CorruptedLedger("no equity point to restate".to_string())),
        }
    }

    pub fn points(&self) -> &[EquityCurvePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn first(&self) -> Option<&EquityCurvePoint> {
        self.points.first()
    }

    pub fn last(&self) -> Option<&EquityCurvePoint> {
        self.points.last()
    }

    /// Equity values as `f64`, in time order.
    pub fn values(&self) -> Vec<f64> {
        self.points.iter().map(|p| to_f64(p.equity)).collect()
    }

    pub fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.points.iter().map(|p| p.timestamp).collect()
    }
}
