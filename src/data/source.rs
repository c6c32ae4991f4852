//! Snapshot sequences consumed by the engine.
//!
//! A source is any finite, forward-only iterator of
//! `Result<MarketSnapshot, SourceError>`. Providers report gaps with
//! [`SourceError::DataUnavailable`]; the engine skips those and continues.

use chrono::NaiveDateTime;
use thiserror::Error;

use super::types::MarketSnapshot;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    /// A tick the provider could not produce. Recoverable.
    #[error("no snapshot available{}: {reason}", .timestamp.map(|t| format!(" at {}", t)).unwrap_or_default())]
    DataUnavailable {
        timestamp: Option<NaiveDateTime>,
        reason: String,
    },

    /// Input that cannot be interpreted at all. Fatal for the run.
    #[error("malformed input: {0}")]
    Malformed(String),
}

pub type SnapshotResult = Result<MarketSnapshot, SourceError>;

/// Wrap already-materialized snapshots as a source.
pub fn from_snapshots<I>(snapshots: I) -> impl Iterator<Item = SnapshotResult>
where
    I: IntoIterator<Item = MarketSnapshot>,
{
    snapshots.into_iter().map(Ok)
}
