//! Snapshot integrity checks.
//!
//! Run on every snapshot before it enters the engine:
//! - spot must be positive (otherwise the whole snapshot is malformed)
//! - prices must be non-negative and bid must not exceed ask
//! - strikes must be positive
//! - expiries must not lie before the snapshot date
//! - reported IVs must be finite and non-negative
//!
//! A bad spot is fatal for the run; bad quotes are dropped and reported.

use serde::Serialize;

use crate::error::EngineFatal;

use super::types::{MarketSnapshot, OptionQuote, OptionsChain};

/// Why a quote was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteDefect {
    NegativePrice,
    CrossedMarket,
    NonPositiveStrike,
    ExpiredBeforeSnapshot,
    InvalidIv,
}

impl QuoteDefect {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::NegativePrice => "negative price",
            Self::CrossedMarket => "bid above ask",
            Self::NonPositiveStrike => "non-positive strike",
            Self::ExpiredBeforeSnapshot => "expiry before snapshot date",
            Self::InvalidIv => "invalid implied volatility",
        }
    }
}

/// First defect found on a quote, if any.
pub fn quote_defect(quote: &OptionQuote, snapshot: &MarketSnapshot) -> Option<QuoteDefect> {
    if quote.bid.is_sign_negative() || quote.ask.is_sign_negative() || quote.last.is_sign_negative() {
        return Some(QuoteDefect::NegativePrice);
    }
    if !quote.ask.is_zero() && quote.bid > quote.ask {
        return Some(QuoteDefect::CrossedMarket);
    }
    if quote.strike <= rust_decimal::Decimal::ZERO {
        return Some(QuoteDefect::NonPositiveStrike);
    }
    if quote.expiry < snapshot.date() {
        return Some(QuoteDefect::ExpiredBeforeSnapshot);
    }
    if quote.iv.map(|iv| !iv.is_finite() || iv < 0.0).unwrap_or(false) {
        return Some(QuoteDefect::InvalidIv);
    }
    None
}

/// Outcome of checking one snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub quotes_checked: usize,
    /// Contract label and defect for every dropped quote.
    pub dropped: Vec<(String, QuoteDefect)>,
}

impl IntegrityReport {
    pub fn all_passed(&self) -> bool {
        self.dropped.is_empty()
    }

    pub fn summary(&self) -> String {
        format!(
            "{}/{} quotes passed",
            self.quotes_checked - self.dropped.len(),
            self.quotes_checked
        )
    }
}

/// Validate a snapshot and return a copy without defective quotes.
///
/// Fails only when the snapshot as a whole cannot be used.
pub fn sanitize_snapshot(snapshot: MarketSnapshot) -> Result<(MarketSnapshot, IntegrityReport), EngineFatal> {
    if snapshot.underlying.trim().is_empty() {
        return Err(EngineFatal::MalformedSnapshot(format!(
            "snapshot at {} has no underlying",
            snapshot.timestamp
        )));
    }
    if snapshot.spot <= rust_decimal::Decimal::ZERO {
        return Err(EngineFatal::MalformedSnapshot(format!(
            "{} spot {} at {} is not positive",
            snapshot.underlying, snapshot.spot, snapshot.timestamp
        )));
    }

    let mut report = IntegrityReport {
        quotes_checked: snapshot.quote_count(),
        dropped: Vec::new(),
    };
    if snapshot.quotes().all(|q| quote_defect(q, &snapshot).is_none()) {
        return Ok((snapshot, report));
    }

    let mut chains = Vec::with_capacity(snapshot.chains.len());
    for chain in &snapshot.chains {
        let mut clean = OptionsChain::new(chain.expiry);
        for quote in chain.calls.iter().chain(chain.puts.iter()) {
            match quote_defect(quote, &snapshot) {
                Some(defect) => report.dropped.push((quote.contract_label(), defect)),
                None => clean.add_quote(quote.clone()),
            }
        }
        if !clean.is_empty() {
            chains.push(clean);
        }
    }

    let cleaned = MarketSnapshot {
        chains,
        ..snapshot
    };
    Ok((cleaned, report))
}
