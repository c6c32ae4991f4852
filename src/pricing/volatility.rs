//! Volatility regime measures.
//!
//! - IV Rank: where the current IV sits inside its trailing min/max range.
//! - IV Percentile: share of prior observations strictly below the current.
//! - Historical volatility from close-to-close log returns.
//!
//! All series are ordered oldest first; the last element is "current".

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// Trading days per year used for annualization.
pub const TRADING_DAYS: f64 = 252.0;

/// Default trailing window for IV rank.
pub const DEFAULT_IV_LOOKBACK: usize = 252;

/// Observations required before an IV rank is trusted.
pub const DEFAULT_MIN_IV_HISTORY: usize = 30;

/// IV Rank of the last value over the trailing `lookback` observations.
///
/// Returns 50 when the window has no range. Fails when `history` is shorter
/// than `lookback`.
pub fn iv_rank(history: &[f64], lookback: usize) -> ValidationResult<f64> {
    if lookback == 0 {
        return Err(ValidationError::invalid("lookback", "must be at least 1"));
    }
    if history.len() < lookback {
        return Err(ValidationError::InsufficientHistory {
            required: lookback,
            available: history.len(),
        });
    }

    let window = &history[history.len() - lookback..];
    let current = window[window.len() - 1];
    let (min, max) = window
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let range = max - min;
    if range <= f64::EPSILON {
        return Ok(50.0);
    }
    Ok(((current - min) / range * 100.0).clamp(0.0, 100.0))
}

/// IV Percentile (0-100) of the last value against every prior value.
///
/// Defined as 50 when there is no prior observation.
pub fn iv_percentile(history: &[f64]) -> f64 {
    if history.len() < 2 {
        return 50.0;
    }
    let (prior, current) = history.split_at(history.len() - 1);
    let current = current[0];
    let below = prior.iter().filter(|&&iv| iv < current).count();
    below as f64 / prior.len() as f64 * 100.0
}

/// Annualized close-to-close volatility over the last `window` returns.
pub fn historical_volatility(closes: &[f64], window: usize) -> Option<f64> {
    if window < 2 || closes.len() < 3 {
        return None;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > 0.0 && w[1] > 0.0)
        .map(|w| (w[1] / w[0]).ln())
        .collect();
    if returns.len() < 2 {
        return None;
    }
    let tail = &returns[returns.len().saturating_sub(window)..];
    let n = tail.len() as f64;
    let mean = tail.iter().sum::<f64>() / n;
    let variance = tail.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt() * TRADING_DAYS.sqrt())
}

/// Implied over realized volatility.
pub fn volatility_ratio(implied: f64, historical: f64) -> Option<f64> {
    (historical > 0.0).then(|| implied / historical)
}

/// Rolling window of ATM IV observations with rank/percentile lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IvHistory {
    values: Vec<f64>,
    capacity: usize,
    min_observations: usize,
}

impl Default for IvHistory {
    fn default() -> Self {
        Self::new(DEFAULT_IV_LOOKBACK, DEFAULT_MIN_IV_HISTORY)
    }
}

impl IvHistory {
    pub fn new(capacity: usize, min_observations: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            values: Vec::with_capacity(capacity),
            capacity,
            min_observations: min_observations.clamp(1, capacity),
        }
    }

    /// Record one observation; non-finite or non-positive values are ignored.
    pub fn push(&mut self, iv: f64) {
        if !iv.is_finite() || iv <= 0.0 {
            return;
        }
        self.values.push(iv);
        if self.values.len() > self.capacity {
            self.values.remove(0);
        }
    }

    /// Pre-load historical observations, keeping only the newest `capacity`.
    pub fn load(&mut self, ivs: &[f64]) {
        for &iv in ivs {
            self.push(iv);
        }
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn latest(&self) -> Option<f64> {
        self.values.last().copied()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// IV Rank of the latest observation, once enough history exists.
    ///
    /// Uses the full window when it is not yet at capacity.
    pub fn rank(&self) -> Option<f64> {
        if self.values.len() < self.min_observations {
            return None;
        }
        let lookback = self.capacity.min(self.values.len());
        iv_rank(&self.values, lookback).ok()
    }

    /// IV Percentile of the latest observation, once enough history exists.
    pub fn percentile(&self) -> Option<f64> {
        if self.values.len() < self.min_observations {
            return None;
        }
        Some(iv_percentile(&self.values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_iv_rank_extremes() {
        let history = [0.12, 0.18, 0.15, 0.22];
        assert_relative_eq!(iv_rank(&history, 4).unwrap(), 100.0);

        let history = [0.12, 0.18, 0.15, 0.10];
        assert_relative_eq!(iv_rank(&history, 4).unwrap(), 0.0);

        let history = [0.10, 0.20, 0.15];
        assert_relative_eq!(iv_rank(&history, 3).unwrap(), 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_iv_rank_flat_range_is_fifty() {
        let history = [0.16; 10];
        assert_eq!(iv_rank(&history, 10).unwrap(), 50.0);
    }

    #[test]
    fn test_iv_rank_uses_trailing_window_only() {
        // The 0.50 spike falls outside a 3-point lookback.
        let history = [0.50, 0.10, 0.20, 0.15];
        assert_relative_eq!(iv_rank(&history, 3).unwrap(), 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_iv_rank_short_history_fails() {
        let err = iv_rank(&[0.1, 0.2], 5).unwrap_err();
        assert_eq!(
            err,
            ValidationError::InsufficientHistory {
                required: 5,
                available: 2
            }
        );
        assert!(iv_rank(&[0.1], 0).is_err());
    }

    #[test]
    fn test_iv_percentile() {
        let history: Vec<f64> = (0..100).map(|i| 0.10 + 0.01 * i as f64).chain([0.60]).collect();
        // 50 of the 100 prior values are strictly below 0.60.
        assert_relative_eq!(iv_percentile(&history), 50.0, epsilon = 1e-9);
        assert_eq!(iv_percentile(&[0.2]), 50.0);
        assert_eq!(iv_percentile(&[0.2, 0.2]), 0.0);
    }

    #[test]
    fn test_history_rank_after_warmup() {
        let mut history = IvHistory::new(5, 3);
        history.push(0.10);
        history.push(0.20);
        assert_eq!(history.rank(), None);

        history.push(0.15);
        assert_relative_eq!(history.rank().unwrap(), 50.0, epsilon = 1e-9);

        // Capacity drops the oldest value.
        history.load(&[0.30, 0.25, 0.12]);
        assert_eq!(history.len(), 5);
        assert_eq!(history.values()[0], 0.20);
        assert_eq!(history.rank(), Some(0.0));
    }

    #[test]
    fn test_history_ignores_invalid() {
        let mut history = IvHistory::default();
        history.push(f64::NAN);
        history.push(-0.1);
        history.push(0.0);
        assert!(history.is_empty());
    }

    #[test]
    fn test_historical_volatility() {
        let flat = vec![100.0; 30];
        assert_eq!(historical_volatility(&flat, 20), Some(0.0));

        // Alternating +1%/-1% moves.
        let mut closes = vec![100.0];
        for i in 0..40 {
            let last = *closes.last().unwrap();
            closes.push(if i % 2 == 0 { last * 1.01 } else { last / 1.01 });
        }
        let hv = historical_volatility(&closes, 20).unwrap();
        assert!(hv > 0.15 && hv < 0.17, "hv = {hv}");

        assert_eq!(historical_volatility(&[100.0, 101.0], 20), None);
        assert_relative_eq!(volatility_ratio(0.2, 0.1).unwrap(), 2.0);
        assert_eq!(volatility_ratio(0.2, 0.0), None);
    }
}
