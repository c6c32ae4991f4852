//! Error taxonomy.
//!
//! Two classes of failure flow through the crate:
//!
//! - fatal errors ([`ValidationError`] at load time, [`EngineFatal`] during a
//!   run) stop the work and are returned to the caller;
//! - recoverable problems ([`DataQualityIssue`]) are counted in a
//!   [`DataQualityLog`] and surfaced in the report. They never change P&L.

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backtest::PositionStatus;

/// Bad configuration, malformed input or a structurally invalid signal.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("invalid value for `{field}`: {reason}")]
    InvalidParameter { field: String, reason: String },

    #[error("history has {available} observations but lookback requires {required}")]
    InsufficientHistory { required: usize, available: usize },

    #[error("leg ratio {proposed:?} does not match configured ratio {expected:?}")]
    RatioMismatch { expected: Vec<u32>, proposed: Vec<u32> },

    #[error("a position needs 1 to 4 legs, got {0}")]
    LegCount(usize),
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidParameter {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

/// Unrecoverable run error. The run is marked failed and keeps its ledger.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineFatal {
    #[error("snapshot at {current} does not come after {previous}")]
    NonMonotonicTimestamp {
        previous: NaiveDateTime,
        current: NaiveDateTime,
    },

    #[error("malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("ledger corrupted: {0}")]
    CorruptedLedger(String),

    #[error("position {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: u64,
        from: PositionStatus,
        to: PositionStatus,
    },

    #[error("engine already used (state {0})")]
    NotIdle(String),
}

/// Kind tag used to count recoverable issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    DataUnavailable,
    ConvergenceWarning,
    DomainError,
    TheoreticalMark,
    SignalRejected,
}

impl IssueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataUnavailable => "data_unavailable",
            Self::ConvergenceWarning => "convergence_warning",
            Self::DomainError => "domain_error",
            Self::TheoreticalMark => "theoretical_mark",
            Self::SignalRejected => "signal_rejected",
        }
    }
}

/// A recoverable problem observed during a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DataQualityIssue {
    /// Missing snapshot or quote; the item is skipped.
    #[error("data unavailable{}: {detail}", at_suffix(.timestamp))]
    DataUnavailable {
        timestamp: Option<NaiveDateTime>,
        detail: String,
    },

    /// IV solver did not converge; the quote is dropped.
    #[error("IV did not converge for {contract} at {timestamp} (last estimate {estimate:.4})")]
    ConvergenceWarning {
        timestamp: NaiveDateTime,
        contract: String,
        estimate: f64,
    },

    /// Undefined math input; a degenerate value was substituted.
    #[error("domain error for {contract} at {timestamp}: {detail}")]
    DomainError {
        timestamp: NaiveDateTime,
        contract: String,
        detail: String,
    },

    /// A leg had no fresh quote and was marked by a fallback policy.
    #[error("{contract} at {timestamp} marked by fallback ({method})")]
    TheoreticalMark {
        timestamp: NaiveDateTime,
        contract: String,
        method: String,
    },

    /// An entry signal failed validation or could not be filled.
    #[error("signal from {strategy} at {timestamp} rejected: {detail}")]
    SignalRejected {
        timestamp: NaiveDateTime,
        strategy: String,
        detail: String,
    },
}

fn at_suffix(ts: &Option<NaiveDateTime>) -> String {
    ts.map(|t| format!(" at {}", t)).unwrap_or_default()
}

impl DataQualityIssue {
    pub fn kind(&self) -> IssueKind {
        match self {
            Self::DataUnavailable { .. } => IssueKind::DataUnavailable,
            Self::ConvergenceWarning { .. } => IssueKind::ConvergenceWarning,
            Self::DomainError { .. } => IssueKind::DomainError,
            Self::TheoreticalMark { .. } => IssueKind::TheoreticalMark,
            Self::SignalRejected { .. } => IssueKind::SignalRejected,
        }
    }
}

/// Number of individual issues kept verbatim; counts are always complete.
const MAX_RECORDED_ISSUES: usize = 200;

/// Per-run collector of recoverable issues.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataQualityLog {
    counts: BTreeMap<IssueKind, usize>,
    issues: Vec<DataQualityIssue>,
}

impl DataQualityLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, issue: DataQualityIssue) {
        match issue.kind() {
            IssueKind::TheoreticalMark | IssueKind::DomainError => debug!("{}", issue),
            _ => warn!("{}", issue),
        }
        *self.counts.entry(issue.kind()).or_insert(0) += 1;
        if self.issues.len() < MAX_RECORDED_ISSUES {
            self.issues.push(issue);
        }
    }

    pub fn count(&self, kind: IssueKind) -> usize {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn counts(&self) -> &BTreeMap<IssueKind, usize> {
        &self.counts
    }

    pub fn issues(&self) -> &[DataQualityIssue] {
        &self.issues
    }

    /// One line per issue kind, e.g. `convergence_warning: 3`.
    pub fn summary_lines(&self) -> Vec<String> {
        self.counts
            .iter()
            .map(|(kind, n)| format!("{}: {}", kind.as_str(), n))
            .collect()
    }
}
