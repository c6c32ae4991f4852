//! Strike selection helpers shared by the strategies.

use crate::data::OptionRight;
use crate::pricing::{PricedQuote, PricedSnapshot};
use chrono::NaiveDate;

/// Quotes of one side that are out of the money relative to `pivot`.
pub fn otm_quotes<'a>(
    snapshot: &'a PricedSnapshot,
    expiry: NaiveDate,
    right: OptionRight,
    pivot: f64,
) -> Vec<&'a PricedQuote> {
    snapshot
        .side(expiry, right)
        .filter(|q| q.dte > 0)
        .filter(|q| match right {
            OptionRight::Call => q.strike_f64() > pivot,
            OptionRight::Put => q.strike_f64() < pivot,
        })
        .collect()
}

/// Quote whose |delta| is nearest the middle of `[low, high]`.
///
/// Quotes inside the band are preferred; when none is, the nearest by
/// delta distance is taken.
pub fn select_by_delta<'a>(candidates: &[&'a PricedQuote], low: f64, high: f64) -> Option<&'a PricedQuote> {
    let target = (low + high) / 2.0;
    let distance = |q: &&PricedQuote| (q.abs_delta() - target).abs();

    let in_band: Vec<&PricedQuote> = candidates
        .iter()
        .copied()
        .filter(|q| q.abs_delta() >= low && q.abs_delta() <= high)
        .collect();
    let pool = if in_band.is_empty() { candidates.to_vec() } else { in_band };

    pool.into_iter()
        .min_by(|a, b| distance(a).total_cmp(&distance(b)))
}

/// Quote with the strike nearest `target`; lower strike wins ties.
pub fn nearest_strike<'a>(candidates: &[&'a PricedQuote], target: f64) -> Option<&'a PricedQuote> {
    candidates.iter().copied().min_by(|a, b| {
        (a.strike_f64() - target)
            .abs()
            .total_cmp(&(b.strike_f64() - target).abs())
            .then(a.strike.cmp(&b.strike))
    })
}

/// Mean IV over the chosen quotes.
pub fn mean_iv(quotes: &[&PricedQuote]) -> f64 {
    if quotes.is_empty() {
        return 0.0;
    }
    quotes.iter().map(|q| q.iv).sum::<f64>() / quotes.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Greeks;
    use rust_decimal::Decimal;

    fn quote(strike: i64, delta: f64) -> PricedQuote {
        PricedQuote {
            strike: Decimal::from(strike),
            expiry: NaiveDate::from_ymd_opt(2024, 1, 25).unwrap(),
            right: OptionRight::Call,
            dte: 20,
            mark: Decimal::from(10),
            iv: 0.15,
            greeks: Greeks {
                delta,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_select_by_delta_prefers_band() {
        let quotes = [quote(21800, 0.30), quote(22000, 0.19), quote(22100, 0.15), quote(22400, 0.05)];
        let refs: Vec<&PricedQuote> = quotes.iter().collect();
        let chosen = select_by_delta(&refs, 0.15, 0.20).unwrap();
        assert_eq!(chosen.strike, Decimal::from(22000));
    }

    #[test]
    fn test_select_by_delta_falls_back() {
        let quotes = [quote(21800, 0.30), quote(22400, 0.08)];
        let refs: Vec<&PricedQuote> = quotes.iter().collect();
        let chosen = select_by_delta(&refs, 0.15, 0.20).unwrap();
        assert_eq!(chosen.strike, Decimal::from(22400));
        assert!(select_by_delta(&[], 0.15, 0.20).is_none());
    }

    #[test]
    fn test_nearest_strike() {
        let quotes = [quote(21400, 0.6), quote(21500, 0.5), quote(21600, 0.4)];
        let refs: Vec<&PricedQuote> = quotes.iter().collect();
        assert_eq!(nearest_strike(&refs, 21550.0).unwrap().strike, Decimal::from(21500));
        assert_eq!(nearest_strike(&refs, 21590.0).unwrap().strike, Decimal::from(21600));
    }
}
