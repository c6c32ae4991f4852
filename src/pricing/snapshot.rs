//! Snapshot enriched with implied volatility and Greeks.
//!
//! The engine prices every quote of a tick once; strategies select strikes
//! from the result. Quotes whose IV cannot be recovered are left out and
//! counted as convergence warnings; quotes with no price at all are left out
//! and counted as unavailable data.

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;

use crate::data::{Greeks, MarketSnapshot, OptionQuote, OptionRight};
use crate::error::{DataQualityIssue, DataQualityLog};

use super::black_scholes::{years_to_expiry, BlackScholes};
use super::{to_decimal, to_f64};

/// A tradeable quote with its volatility and sensitivities.
#[derive(Debug, Clone, PartialEq)]
pub struct PricedQuote {
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub right: OptionRight,
    /// Calendar days to expiry at the snapshot
    pub dte: i64,
    /// Market mark (mid or last)
    pub mark: Decimal,
    /// Observed or solved implied volatility
    pub iv: f64,
    pub greeks: Greeks,
}

impl PricedQuote {
    pub fn strike_f64(&self) -> f64 {
        to_f64(self.strike)
    }

    pub fn abs_delta(&self) -> f64 {
        self.greeks.delta.abs()
    }
}

#[derive(Debug, Clone)]
pub struct PricedSnapshot {
    snapshot: MarketSnapshot,
    quotes: Vec<PricedQuote>,
    atm_iv: Option<f64>,
    model: BlackScholes,
}

impl PricedSnapshot {
    /// Price every quote of `snapshot`.
    pub fn build(snapshot: MarketSnapshot, model: BlackScholes, log: &mut DataQualityLog) -> Self {
        let spot = snapshot.spot_f64();
        let timestamp = snapshot.timestamp;
        let date = snapshot.date();

        let mut quotes = Vec::with_capacity(snapshot.quote_count());
        for quote in snapshot.quotes() {
            if let Some(priced) = price_quote(quote, spot, date, timestamp, &model, log) {
                quotes.push(priced);
            }
        }

        let atm_iv = atm_iv(&quotes, spot);

        Self {
            snapshot,
            quotes,
            atm_iv,
            model,
        }
    }

    pub fn snapshot(&self) -> &MarketSnapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> MarketSnapshot {
        self.snapshot
    }

    pub fn timestamp(&self) -> NaiveDateTime {
        self.snapshot.timestamp
    }

    pub fn date(&self) -> NaiveDate {
        self.snapshot.date()
    }

    pub fn underlying(&self) -> &str {
        &self.snapshot.underlying
    }

    pub fn spot(&self) -> Decimal {
        self.snapshot.spot
    }

    pub fn spot_f64(&self) -> f64 {
        self.snapshot.spot_f64()
    }

    pub fn dte(&self, expiry: NaiveDate) -> i64 {
        self.snapshot.dte(expiry)
    }

    pub fn model(&self) -> &BlackScholes {
        &self.model
    }

    /// Mean IV at the strike nearest to spot, across expiries and rights.
    pub fn atm_iv(&self) -> Option<f64> {
        self.atm_iv
    }

    pub fn quotes(&self) -> &[PricedQuote] {
        &self.quotes
    }

    /// Distinct expiries with DTE inside the inclusive range, nearest first.
    pub fn expiries_in_dte(&self, min_dte: i64, max_dte: i64) -> Vec<NaiveDate> {
        let mut expiries: Vec<NaiveDate> = self
            .quotes
            .iter()
            .filter(|q| q.dte >= min_dte && q.dte <= max_dte)
            .map(|q| q.expiry)
            .collect();
        expiries.sort();
        expiries.dedup();
        expiries
    }

    /// Priced quotes for one expiry and right, ordered by strike.
    pub fn side(&self, expiry: NaiveDate, right: OptionRight) -> impl Iterator<Item = &PricedQuote> {
        self.quotes
            .iter()
            .filter(move |q| q.expiry == expiry && q.right == right)
    }

    pub fn find(&self, expiry: NaiveDate, strike: Decimal, right: OptionRight) -> Option<&PricedQuote> {
        self.quotes
            .iter()
            .find(|q| q.expiry == expiry && q.strike == strike && q.right == right)
    }

    /// Fresh market mark for a contract, straight from the raw snapshot.
    pub fn market_mark(&self, expiry: NaiveDate, strike: Decimal, right: OptionRight) -> Option<Decimal> {
        self.snapshot
            .quote(expiry, strike, right)
            .and_then(OptionQuote::mark)
    }

    /// Model value of a contract at `vol`, used when no fresh quote exists.
    pub fn theoretical_value(&self, expiry: NaiveDate, strike: Decimal, right: OptionRight, vol: f64) -> Decimal {
        let time = years_to_expiry(self.dte(expiry));
        let value = self
            .model
            .price(self.spot_f64(), to_f64(strike), time, vol, right);
        to_decimal(value)
    }
}

fn price_quote(
    quote: &OptionQuote,
    spot: f64,
    date: NaiveDate,
    timestamp: NaiveDateTime,
    model: &BlackScholes,
    log: &mut DataQualityLog,
) -> Option<PricedQuote> {
    let Some(mark) = quote.mark() else {
        log.record(DataQualityIssue::DataUnavailable {
            timestamp: Some(timestamp),
            detail: format!("{} dropped: no bid/ask or last price", quote.contract_label()),
        });
        return None;
    };
    let dte = quote.dte(date);
    let strike = to_f64(quote.strike);
    let time = years_to_expiry(dte);

    if dte <= 0 {
        log.record(DataQualityIssue::DomainError {
            timestamp,
            contract: quote.contract_label(),
            detail: format!("time to expiry is {} days, intrinsic Greeks used", dte),
        });
        let iv = quote.iv.filter(|v| v.is_finite() && *v > 0.0).unwrap_or(0.0);
        return Some(PricedQuote {
            strike: quote.strike,
            expiry: quote.expiry,
            right: quote.right,
            dte,
            mark,
            iv,
            greeks: model.greeks(spot, strike, 0.0, iv, quote.right),
        });
    }

    let iv = match quote.iv.filter(|v| v.is_finite() && *v > 0.0) {
        Some(iv) => iv,
        None => {
            let solution = model.implied_volatility(to_f64(mark), spot, strike, time, quote.right);
            match solution.value() {
                Some(iv) => iv,
                None => {
                    log.record(DataQualityIssue::ConvergenceWarning {
                        timestamp,
                        contract: quote.contract_label(),
                        estimate: solution.estimate,
                    });
                    return None;
                }
            }
        }
    };

    Some(PricedQuote {
        strike: quote.strike,
        expiry: quote.expiry,
        right: quote.right,
        dte,
        mark,
        iv,
        greeks: model.greeks(spot, strike, time, iv, quote.right),
    })
}

fn atm_iv(quotes: &[PricedQuote], spot: f64) -> Option<f64> {
    let live = || quotes.iter().filter(|q| q.dte > 0 && q.iv > 0.0);
    let nearest = live()
        .map(|q| (q.strike_f64() - spot).abs())
        .fold(f64::INFINITY, f64::min);
    if !nearest.is_finite() {
        return None;
    }

    let ivs: Vec<f64> = live()
        .filter(|q| (q.strike_f64() - spot).abs() <= nearest)
        .map(|q| q.iv)
        .collect();
    if ivs.is_empty() {
        return None;
    }
    Some(ivs.iter().sum::<f64>() / ivs.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IssueKind;
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    fn snapshot() -> MarketSnapshot {
        let ts = NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(15, 30, 0)
            .unwrap();
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        let expired = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        MarketSnapshot::new(ts, "NIFTY", dec!(21500))
            .with_quote(
                OptionQuote::new(dec!(21500), expiry, OptionRight::Call)
                    .with_market(dec!(200), dec!(204), dec!(0))
                    .with_iv(0.14),
            )
            .with_quote(
                OptionQuote::new(dec!(21500), expiry, OptionRight::Put)
                    .with_market(dec!(150), dec!(152), dec!(0))
                    .with_iv(0.16),
            )
            // No IV: solved from the mark.
            .with_quote(
                OptionQuote::new(dec!(22000), expiry, OptionRight::Call)
                    .with_market(dec!(40), dec!(42), dec!(0)),
            )
            // Worth more than spot: cannot converge.
            .with_quote(
                OptionQuote::new(dec!(23000), expiry, OptionRight::Call)
                    .with_market(dec!(30000), dec!(30002), dec!(0)),
            )
            // Nothing traded or quoted.
            .with_quote(
                OptionQuote::new(dec!(22000), expiry, OptionRight::Put)
                    .with_market(dec!(0), dec!(0), dec!(0)),
            )
            // Expiring today.
            .with_quote(
                OptionQuote::new(dec!(21400), expired, OptionRight::Call)
                    .with_market(dec!(100), dec!(101), dec!(0)),
            )
    }

    #[test]
    fn test_build_prices_quotes_and_logs_issues() {
        let mut log = DataQualityLog::new();
        let priced = PricedSnapshot::build(snapshot(), BlackScholes::with_rate(0.07), &mut log);

        assert_eq!(priced.quotes().len(), 4);
        assert_eq!(log.count(IssueKind::ConvergenceWarning), 1);
        assert_eq!(log.count(IssueKind::DomainError), 1);
        assert_eq!(log.count(IssueKind::DataUnavailable), 1);

        let expiry = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();
        let solved = priced.find(expiry, dec!(22000), OptionRight::Call).unwrap();
        assert!(solved.iv > 0.05 && solved.iv < 0.5);
        assert!(solved.greeks.delta > 0.0 && solved.greeks.delta < 0.5);

        let expired = priced
            .quotes()
            .iter()
            .find(|q| q.dte == 0)
            .unwrap();
        assert_eq!(expired.greeks.delta, 1.0);
    }

    #[test]
    fn test_atm_iv_averages_nearest_strike() {
        let mut log = DataQualityLog::new();
        let priced = PricedSnapshot::build(snapshot(), BlackScholes::with_rate(0.07), &mut log);
        assert_relative_eq!(priced.atm_iv().unwrap(), 0.15, epsilon = 1e-12);
    }

    #[test]
    fn test_expiries_and_theoretical_value() {
        let mut log = DataQualityLog::new();
        let priced = PricedSnapshot::build(snapshot(), BlackScholes::with_rate(0.07), &mut log);
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();

        assert_eq!(priced.expiries_in_dte(7, 45), vec![expiry]);
        assert_eq!(priced.side(expiry, OptionRight::Call).count(), 2);
        assert_eq!(priced.market_mark(expiry, dec!(21500), OptionRight::Put), Some(dec!(151)));

        let value = priced.theoretical_value(expiry, dec!(21500), OptionRight::Call, 0.14);
        assert!(value > dec!(250) && value < dec!(450));
    }
}
