//! Parquet snapshot provider.
//!
//! Reads a long-format parquet file with one row per option quote and groups
//! the rows into time-ordered [`MarketSnapshot`]s. Expected schema:
//! - `timestamp` (string, `%Y-%m-%d %H:%M:%S` or `%Y-%m-%d`)
//! - `underlying` (string), `spot` (numeric)
//! - `expiry` (string, `%Y-%m-%d`), `strike` (numeric), `right` (`CE`/`PE`/`C`/`P`)
//! - `bid`, `ask`, `last` (numeric)
//! - `iv` (numeric, optional, annualized decimal)
//!
//! Ticks without a usable spot or without any quote come out as
//! [`SourceError::DataUnavailable`] so the engine can skip them. A tick that
//! mixes rows of several underlyings is [`SourceError::Malformed`]; use
//! [`ParquetSnapshotSource::with_underlying`] on multi-underlying files.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use polars::prelude::*;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, info};

use crate::pricing::to_decimal;

use super::source::{SnapshotResult, SourceError};
use super::types::{MarketSnapshot, OptionQuote, OptionRight};

/// Columns that must be present in the parquet file.
pub const EXPECTED_COLUMNS: &[&str] = &[
    "timestamp",
    "underlying",
    "spot",
    "expiry",
    "strike",
    "right",
    "bid",
    "ask",
    "last",
];

/// Optional implied volatility column.
pub const IV_COLUMN: &str = "iv";

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Loads snapshots for one parquet file, optionally filtered.
#[derive(Debug, Clone)]
pub struct ParquetSnapshotSource {
    path: PathBuf,
    underlying: Option<String>,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

impl ParquetSnapshotSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            underlying: None,
            start: None,
            end: None,
        }
    }

    /// Keep only rows for one underlying.
    pub fn with_underlying(mut self, underlying: impl Into<String>) -> Self {
        self.underlying = Some(underlying.into());
        self
    }

    /// Keep only snapshots dated inside the inclusive range.
    pub fn with_date_range(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start = start;
        self.end = end;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the parquet file as a DataFrame.
    pub fn load_dataframe(&self) -> Result<DataFrame, LoaderError> {
        if !self.path.exists() {
            return Err(LoaderError::FileNotFound(self.path.display().to_string()));
        }

        let mut lf = LazyFrame::scan_parquet(&self.path, ScanArgsParquet::default())?;
        if let Some(underlying) = &self.underlying {
            lf = lf.filter(col("underlying").eq(lit(underlying.clone())));
        }
        Ok(lf.collect()?)
    }

    /// Load and group every snapshot, in ascending time order.
    pub fn load(&self) -> Result<Vec<SnapshotResult>, LoaderError> {
        let df = self.load_dataframe()?;
        let snapshots = dataframe_to_snapshots(&df, self.start, self.end)?;
        info!(
            "Loaded {} ticks from {} ({} rows)",
            snapshots.len(),
            self.path.display(),
            df.height()
        );
        Ok(snapshots)
    }

    /// Forward-only iterator over the loaded snapshots.
    pub fn snapshots(&self) -> Result<impl Iterator<Item = SnapshotResult>, LoaderError> {
        Ok(self.load()?.into_iter())
    }
}

/// Parse a timestamp column value; bare dates map to midnight.
fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S"))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

#[derive(Default)]
struct TickRows {
    underlying: String,
    other_underlyings: BTreeSet<String>,
    spot: Option<Decimal>,
    quotes: Vec<OptionQuote>,
    rejected_rows: usize,
}

/// Group quote rows into snapshots.
fn dataframe_to_snapshots(
    df: &DataFrame,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> Result<Vec<SnapshotResult>, LoaderError> {
    let names: Vec<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    let missing: Vec<&str> = EXPECTED_COLUMNS
        .iter()
        .copied()
        .filter(|c| !names.iter().any(|n| n == c))
        .collect();
    if !missing.is_empty() {
        return Err(LoaderError::InvalidData(format!("missing columns: {:?}", missing)));
    }

    let numeric = |name: &str| -> Result<Column, LoaderError> {
        Ok(df.column(name)?.cast(&DataType::Float64)?)
    };

    let timestamp_col = df.column("timestamp")?.cast(&DataType::String)?;
    let underlying_col = df.column("underlying")?.cast(&DataType::String)?;
    let expiry_col = df.column("expiry")?.cast(&DataType::String)?;
    let right_col = df.column("right")?.cast(&DataType::String)?;
    let spot_col = numeric("spot")?;
    let strike_col = numeric("strike")?;
    let bid_col = numeric("bid")?;
    let ask_col = numeric("ask")?;
    let last_col = numeric("last")?;
    let iv_col = if names.iter().any(|n| n == IV_COLUMN) {
        Some(numeric(IV_COLUMN)?)
    } else {
        None
    };

    let timestamps = timestamp_col.str()?;
    let underlyings = underlying_col.str()?;
    let expiries = expiry_col.str()?;
    let rights = right_col.str()?;
    let spots = spot_col.f64()?;
    let strikes = strike_col.f64()?;
    let bids = bid_col.f64()?;
    let asks = ask_col.f64()?;
    let lasts = last_col.f64()?;
    let ivs = match &iv_col {
        Some(c) => Some(c.f64()?),
        None => None,
    };

    let mut ticks: BTreeMap<NaiveDateTime, TickRows> = BTreeMap::new();
    let mut unreadable = 0usize;

    for idx in 0..df.height() {
        let Some(timestamp) = timestamps.get(idx).and_then(parse_timestamp) else {
            unreadable += 1;
            continue;
        };
        let date = timestamp.date();
        if start.map(|s| date < s).unwrap_or(false) || end.map(|e| date > e).unwrap_or(false) {
            continue;
        }

        let tick = ticks.entry(timestamp).or_default();
        let underlying = underlyings.get(idx).unwrap_or_default();
        if tick.underlying.is_empty() {
            tick.underlying = underlying.to_string();
        } else if tick.underlying != underlying {
            tick.other_underlyings.insert(underlying.to_string());
            continue;
        }
        if tick.spot.is_none() {
            tick.spot = spots.get(idx).filter(|s| s.is_finite() && *s > 0.0).map(to_decimal);
        }

        let expiry = expiries
            .get(idx)
            .and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok());
        let right = rights.get(idx).and_then(OptionRight::from_str);
        let strike = strikes.get(idx).filter(|s| s.is_finite());

        let (Some(expiry), Some(right), Some(strike)) = (expiry, right, strike) else {
            tick.rejected_rows += 1;
            continue;
        };

        let price = |v: Option<f64>| v.filter(|p| p.is_finite()).map(to_decimal).unwrap_or_default();
        let mut quote = OptionQuote::new(to_decimal(strike), expiry, right).with_market(
            price(bids.get(idx)),
            price(asks.get(idx)),
            price(lasts.get(idx)),
        );
        quote.iv = ivs.and_then(|c| c.get(idx)).filter(|v| v.is_finite() && *v > 0.0);
        tick.quotes.push(quote);
    }

    let mut out = Vec::with_capacity(ticks.len() + 1);
    if unreadable > 0 {
        out.push(Err(SourceError::DataUnavailable {
            timestamp: None,
            reason: format!("{} rows with unreadable timestamp", unreadable),
        }));
    }

    for (timestamp, tick) in ticks {
        if !tick.other_underlyings.is_empty() {
            let mut names = vec![tick.underlying];
            names.extend(tick.other_underlyings);
            out.push(Err(SourceError::Malformed(format!(
                "{}: rows for several underlyings ({}), filter by underlying",
                timestamp,
                names.join(", ")
            ))));
            continue;
        }
        if tick.rejected_rows > 0 {
            debug!("{}: {} unreadable quote rows", timestamp, tick.rejected_rows);
        }
        let Some(spot) = tick.spot else {
            out.push(Err(SourceError::DataUnavailable {
                timestamp: Some(timestamp),
                reason: "no spot price".to_string(),
            }));
            continue;
        };
        if tick.quotes.is_empty() {
            out.push(Err(SourceError::DataUnavailable {
                timestamp: Some(timestamp),
                reason: "no option quotes".to_string(),
            }));
            continue;
        }

        let mut snapshot = MarketSnapshot::new(timestamp, tick.underlying, spot);
        for quote in tick.quotes {
            snapshot.add_quote(quote);
        }
        out.push(Ok(snapshot));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(9, 15, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-01-02 09:15:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-02T09:15:00"), Some(expected));
        assert_eq!(
            parse_timestamp("2024-01-02"),
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap().and_hms_opt(0, 0, 0)
        );
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_missing_file() {
        let source = ParquetSnapshotSource::new("/nonexistent/quotes.parquet");
        assert!(matches!(source.load(), Err(LoaderError::FileNotFound(_))));
    }

    #[test]
    fn test_dataframe_grouping() {
        let df = df!(
            "timestamp" => ["2024-01-03", "2024-01-02", "2024-01-02", "bad", "2024-01-04"],
            "underlying" => ["NIFTY", "NIFTY", "NIFTY", "NIFTY", "NIFTY"],
            "spot" => [21600.0, 21500.0, 21500.0, 21500.0, 0.0],
            "expiry" => ["2024-01-25", "2024-01-25", "2024-01-25", "2024-01-25", "2024-01-25"],
            "strike" => [21600.0, 21500.0, 21500.0, 21500.0, 21500.0],
            "right" => ["CE", "CE", "PE", "CE", "CE"],
            "bid" => [180.0, 200.0, 150.0, 1.0, 1.0],
            "ask" => [182.0, 204.0, 152.0, 2.0, 2.0],
            "last" => [181.0, 202.0, 151.0, 1.5, 1.5]
        )
        .unwrap();

        let out = dataframe_to_snapshots(&df, None, None).unwrap();
        assert_eq!(out.len(), 4);
        assert!(matches!(out[0], Err(SourceError::DataUnavailable { timestamp: None, .. })));

        let first = out[1].as_ref().unwrap();
        assert_eq!(first.date(), NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(first.quote_count(), 2);
        assert_eq!(out[2].as_ref().unwrap().quote_count(), 1);
        assert!(matches!(out[3], Err(SourceError::DataUnavailable { timestamp: Some(_), .. })));

        let filtered = dataframe_to_snapshots(
            &df,
            NaiveDate::from_ymd_opt(2024, 1, 3),
            NaiveDate::from_ymd_opt(2024, 1, 3),
        )
        .unwrap();
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_mixed_underlyings_are_malformed() {
        let df = df!(
            "timestamp" => ["2024-01-02", "2024-01-02", "2024-01-03"],
            "underlying" => ["NIFTY", "BANKNIFTY", "NIFTY"],
            "spot" => [22000.0, 47000.0, 22100.0],
            "expiry" => ["2024-01-25", "2024-01-25", "2024-01-25"],
            "strike" => [22000.0, 47000.0, 22100.0],
            "right" => ["CE", "CE", "CE"],
            "bid" => [180.0, 300.0, 170.0],
            "ask" => [182.0, 304.0, 172.0],
            "last" => [181.0, 302.0, 171.0]
        )
        .unwrap();

        let out = dataframe_to_snapshots(&df, None, None).unwrap();
        assert_eq!(out.len(), 2);
        match &out[0] {
            Err(SourceError::Malformed(msg)) => {
                assert!(msg.contains("NIFTY"));
                assert!(msg.contains("BANKNIFTY"));
            }
            other => panic!("expected malformed tick, got {:?}", other),
        }
        let next = out[1].as_ref().unwrap();
        assert_eq!(next.underlying, "NIFTY");
        assert_eq!(next.quote_count(), 1);
    }

    #[test]
    fn test_missing_columns_rejected() {
        let df = df!("timestamp" => ["2024-01-02"]).unwrap();
        assert!(matches!(
            dataframe_to_snapshots(&df, None, None),
            Err(LoaderError::InvalidData(_))
        ));
    }
}
