//! Core market data types.
//!
//! A [`MarketSnapshot`] is one tick of the replay: the underlying spot plus
//! every listed option quote, grouped into chains by expiry. Snapshots are
//! built once by the data provider and only read afterwards.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "C" | "CE" | "CALL" => Some(Self::Call),
            "P" | "PE" | "PUT" => Some(Self::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
        }
    }
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Greeks for an option contract.
///
/// Theta is per calendar day, vega and rho per one volatility/rate point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

impl Greeks {
    /// Scale every sensitivity by a signed quantity.
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            delta: self.delta * factor,
            gamma: self.gamma * factor,
            theta: self.theta * factor,
            vega: self.vega * factor,
            rho: self.rho * factor,
        }
    }
}

/// A single option quote inside a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionQuote {
    /// Strike price
    pub strike: Decimal,

    /// Expiry date
    pub expiry: NaiveDate,

    /// Call or put
    pub right: OptionRight,

    /// Best bid (zero when absent)
    pub bid: Decimal,

    /// Best ask (zero when absent)
    pub ask: Decimal,

    /// Last traded price (zero when absent)
    pub last: Decimal,

    /// Implied volatility reported by the provider, if any
    pub iv: Option<f64>,
}

impl OptionQuote {
    pub fn new(strike: Decimal, expiry: NaiveDate, right: OptionRight) -> Self {
        Self {
            strike,
            expiry,
            right,
            bid: Decimal::ZERO,
            ask: Decimal::ZERO,
            last: Decimal::ZERO,
            iv: None,
        }
    }

    pub fn with_market(mut self, bid: Decimal, ask: Decimal, last: Decimal) -> Self {
        self.bid = bid;
        self.ask = ask;
        self.last = last;
        self
    }

    pub fn with_iv(mut self, iv: f64) -> Self {
        self.iv = Some(iv);
        self
    }

    /// Bid/ask midpoint, when both sides are present and not crossed.
    pub fn mid(&self) -> Option<Decimal> {
        if self.bid > Decimal::ZERO && self.ask >= self.bid {
            Some((self.bid + self.ask) / Decimal::TWO)
        } else {
            None
        }
    }

    /// Price used for marking and fills: the mid, else the last trade.
    pub fn mark(&self) -> Option<Decimal> {
        self.mid().or_else(|| {
            if self.last > Decimal::ZERO {
                Some(self.last)
            } else {
                None
            }
        })
    }

    /// Calculate bid-ask spread as percentage of mid.
    pub fn spread_pct(&self) -> f64 {
        match self.mid() {
            Some(mid) if !mid.is_zero() => ((self.ask - self.bid) / mid).try_into().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Calendar days from `date` to expiry.
    pub fn dte(&self, date: NaiveDate) -> i64 {
        (self.expiry - date).num_days()
    }

    /// Short human-readable contract label, e.g. `2024-01-25 21500 CE`.
    pub fn contract_label(&self) -> String {
        format!("{} {} {}", self.expiry, self.strike.normalize(), self.right)
    }
}

/// All options for a single expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionsChain {
    /// Expiry date for this chain
    pub expiry: NaiveDate,

    /// Calls sorted by strike
    pub calls: Vec<OptionQuote>,

    /// Puts sorted by strike
    pub puts: Vec<OptionQuote>,
}

impl OptionsChain {
    pub fn new(expiry: NaiveDate) -> Self {
        Self {
            expiry,
            calls: Vec::new(),
            puts: Vec::new(),
        }
    }

    /// Add a quote to the appropriate side, keeping strikes ordered.
    pub fn add_quote(&mut self, quote: OptionQuote) {
        let side = match quote.right {
            OptionRight::Call => &mut self.calls,
            OptionRight::Put => &mut self.puts,
        };
        let idx = side.partition_point(|q| q.strike < quote.strike);
        if side.get(idx).map(|q| q.strike == quote.strike).unwrap_or(false) {
            side[idx] = quote;
        } else {
            side.insert(idx, quote);
        }
    }

    /// Get all strikes available in this chain.
    pub fn strikes(&self) -> Vec<Decimal> {
        let mut strikes: Vec<_> = self
            .calls
            .iter()
            .chain(self.puts.iter())
            .map(|q| q.strike)
            .collect();
        strikes.sort();
        strikes.dedup();
        strikes
    }

    pub fn quote(&self, strike: Decimal, right: OptionRight) -> Option<&OptionQuote> {
        let side = match right {
            OptionRight::Call => &self.calls,
            OptionRight::Put => &self.puts,
        };
        side.binary_search_by(|q| q.strike.cmp(&strike))
            .ok()
            .map(|idx| &side[idx])
    }

    pub fn len(&self) -> usize {
        self.calls.len() + self.puts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty() && self.puts.is_empty()
    }
}

/// Complete options snapshot for one underlying at one timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketSnapshot {
    /// Snapshot time
    pub timestamp: NaiveDateTime,

    /// Underlying symbol (e.g. "NIFTY")
    pub underlying: String,

    /// Underlying spot price
    pub spot: Decimal,

    /// Option chains ordered by expiry
    pub chains: Vec<OptionsChain>,
}

impl MarketSnapshot {
    pub fn new(timestamp: NaiveDateTime, underlying: impl Into<String>, spot: Decimal) -> Self {
        Self {
            timestamp,
            underlying: underlying.into(),
            spot,
            chains: Vec::new(),
        }
    }

    /// Builder-style quote insertion used by providers and tests.
    pub fn with_quote(mut self, quote: OptionQuote) -> Self {
        self.add_quote(quote);
        self
    }

    pub fn add_quote(&mut self, quote: OptionQuote) {
        let idx = self.chains.partition_point(|c| c.expiry < quote.expiry);
        match self.chains.get_mut(idx) {
            Some(chain) if chain.expiry == quote.expiry => chain.add_quote(quote),
            _ => {
                let mut chain = OptionsChain::new(quote.expiry);
                chain.add_quote(quote);
                self.chains.insert(idx, chain);
            }
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    /// Calendar days from this snapshot to `expiry`.
    pub fn dte(&self, expiry: NaiveDate) -> i64 {
        (expiry - self.date()).num_days()
    }

    pub fn chain(&self, expiry: NaiveDate) -> Option<&OptionsChain> {
        self.chains
            .binary_search_by(|c| c.expiry.cmp(&expiry))
            .ok()
            .map(|idx| &self.chains[idx])
    }

    /// Get chains within an inclusive DTE range, nearest expiry first.
    pub fn chains_by_dte(&self, min_dte: i64, max_dte: i64) -> Vec<&OptionsChain> {
        self.chains
            .iter()
            .filter(|c| {
                let dte = self.dte(c.expiry);
                dte >= min_dte && dte <= max_dte
            })
            .collect()
    }

    pub fn quote(&self, expiry: NaiveDate, strike: Decimal, right: OptionRight) -> Option<&OptionQuote> {
        self.chain(expiry).and_then(|c| c.quote(strike, right))
    }

    pub fn quotes(&self) -> impl Iterator<Item = &OptionQuote> {
        self.chains
            .iter()
            .flat_map(|c| c.calls.iter().chain(c.puts.iter()))
    }

    pub fn quote_count(&self) -> usize {
        self.chains.iter().map(OptionsChain::len).sum()
    }

    pub fn spot_f64(&self) -> f64 {
        self.spot.try_into().unwrap_or(0.0)
    }
}
