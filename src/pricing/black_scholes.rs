//! Black-Scholes pricing, analytic Greeks and implied volatility.
//!
//! Inputs are annualized decimals (rate, volatility) and year fractions
//! (time). When time to expiry or volatility is not positive every function
//! degenerates to the intrinsic answer instead of failing.

use std::f64::consts::{PI, SQRT_2};

use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;

use crate::data::{Greeks, OptionRight};

/// Lower bound of the implied volatility search domain.
pub const IV_MIN: f64 = 0.01;
/// Upper bound of the implied volatility search domain.
pub const IV_MAX: f64 = 5.0;
/// Iteration budget of the root finder.
pub const IV_MAX_ITERATIONS: usize = 100;
/// Price tolerance at which the solver stops.
pub const IV_PRICE_TOLERANCE: f64 = 1e-6;
/// Volatility tolerance at which the bracket is considered collapsed.
pub const IV_VOL_TOLERANCE: f64 = 1e-6;

/// Days per year used to turn DTE into a year fraction.
pub const DAYS_PER_YEAR: f64 = 365.0;

/// Convert calendar days to expiry into a year fraction.
pub fn years_to_expiry(dte: i64) -> f64 {
    dte.max(0) as f64 / DAYS_PER_YEAR
}

/// Result of an implied volatility solve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IvSolution {
    /// Last volatility estimate (a domain bound when the price is out of reach).
    pub estimate: f64,
    /// Whether the price tolerance or bracket tolerance was reached.
    pub converged: bool,
    /// Iterations spent.
    pub iterations: usize,
}

impl IvSolution {
    fn failed(estimate: f64, iterations: usize) -> Self {
        Self {
            estimate,
            converged: false,
            iterations,
        }
    }

    /// The estimate, only when the solver converged.
    pub fn value(&self) -> Option<f64> {
        self.converged.then_some(self.estimate)
    }
}

/// Black-Scholes calculator for European options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlackScholes {
    /// Risk-free interest rate
    pub rate: f64,
    /// Continuous dividend yield
    pub dividend: f64,
}

impl Default for BlackScholes {
    fn default() -> Self {
        Self {
            rate: 0.07,
            dividend: 0.0,
        }
    }
}

impl BlackScholes {
    pub fn new(rate: f64, dividend: f64) -> Self {
        Self { rate, dividend }
    }

    pub fn with_rate(rate: f64) -> Self {
        Self {
            rate,
            dividend: 0.0,
        }
    }

    fn d1(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        let numerator =
            (spot / strike).ln() + (self.rate - self.dividend + 0.5 * vol * vol) * time;
        numerator / (vol * time.sqrt())
    }

    fn d2(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        self.d1(spot, strike, time, vol) - vol * time.sqrt()
    }

    /// Standard normal CDF.
    pub(crate) fn norm_cdf(x: f64) -> f64 {
        0.5 * erfc(-x / SQRT_2)
    }

    /// Standard normal PDF.
    pub(crate) fn norm_pdf(x: f64) -> f64 {
        (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
    }

    fn degenerate(spot: f64, strike: f64, time: f64, vol: f64) -> bool {
        time <= 0.0 || vol <= 0.0 || spot <= 0.0 || strike <= 0.0
    }

    pub fn intrinsic(spot: f64, strike: f64, right: OptionRight) -> f64 {
        match right {
            OptionRight::Call => (spot - strike).max(0.0),
            OptionRight::Put => (strike - spot).max(0.0),
        }
    }

    pub fn call_price(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        if Self::degenerate(spot, strike, time, vol) {
            return Self::intrinsic(spot, strike, OptionRight::Call);
        }

        let d1 = self.d1(spot, strike, time, vol);
        let d2 = self.d2(spot, strike, time, vol);

        let value = spot * (-self.dividend * time).exp() * Self::norm_cdf(d1)
            - strike * (-self.rate * time).exp() * Self::norm_cdf(d2);
        value.max(0.0)
    }

    pub fn put_price(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        if Self::degenerate(spot, strike, time, vol) {
            return Self::intrinsic(spot, strike, OptionRight::Put);
        }

        let d1 = self.d1(spot, strike, time, vol);
        let d2 = self.d2(spot, strike, time, vol);

        let value = strike * (-self.rate * time).exp() * Self::norm_cdf(-d2)
            - spot * (-self.dividend * time).exp() * Self::norm_cdf(-d1);
        value.max(0.0)
    }

    /// Fair value of an option; never negative.
    pub fn price(&self, spot: f64, strike: f64, time: f64, vol: f64, right: OptionRight) -> f64 {
        match right {
            OptionRight::Call => self.call_price(spot, strike, time, vol),
            OptionRight::Put => self.put_price(spot, strike, time, vol),
        }
    }

    pub fn delta(&self, spot: f64, strike: f64, time: f64, vol: f64, right: OptionRight) -> f64 {
        if Self::degenerate(spot, strike, time, vol) {
            return match right {
                OptionRight::Call if spot > strike => 1.0,
                OptionRight::Put if spot < strike => -1.0,
                _ => 0.0,
            };
        }

        let d1 = self.d1(spot, strike, time, vol);
        let discount = (-self.dividend * time).exp();

        match right {
            OptionRight::Call => discount * Self::norm_cdf(d1),
            OptionRight::Put => discount * (Self::norm_cdf(d1) - 1.0),
        }
    }

    /// Gamma (same for calls and puts).
    pub fn gamma(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        if Self::degenerate(spot, strike, time, vol) {
            return 0.0;
        }

        let d1 = self.d1(spot, strike, time, vol);
        let discount = (-self.dividend * time).exp();

        discount * Self::norm_pdf(d1) / (spot * vol * time.sqrt())
    }

    /// Vega per 1 volatility point (same for calls and puts).
    pub fn vega(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        self.raw_vega(spot, strike, time, vol) / 100.0
    }

    fn raw_vega(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        if Self::degenerate(spot, strike, time, vol) {
            return 0.0;
        }

        let d1 = self.d1(spot, strike, time, vol);
        spot * (-self.dividend * time).exp() * Self::norm_pdf(d1) * time.sqrt()
    }

    /// Theta per calendar day.
    pub fn theta(&self, spot: f64, strike: f64, time: f64, vol: f64, right: OptionRight) -> f64 {
        if Self::degenerate(spot, strike, time, vol) {
            return 0.0;
        }

        let d1 = self.d1(spot, strike, time, vol);
        let d2 = self.d2(spot, strike, time, vol);
        let discount_d = (-self.dividend * time).exp();
        let discount_r = (-self.rate * time).exp();

        let term1 = -spot * discount_d * Self::norm_pdf(d1) * vol / (2.0 * time.sqrt());

        let annual = match right {
            OptionRight::Call => {
                term1 + self.dividend * spot * discount_d * Self::norm_cdf(d1)
                    - self.rate * strike * discount_r * Self::norm_cdf(d2)
            }
            OptionRight::Put => {
                term1 - self.dividend * spot * discount_d * Self::norm_cdf(-d1)
                    + self.rate * strike * discount_r * Self::norm_cdf(-d2)
            }
        };
        annual / DAYS_PER_YEAR
    }

    /// Rho per 1 rate point.
    pub fn rho(&self, spot: f64, strike: f64, time: f64, vol: f64, right: OptionRight) -> f64 {
        if Self::degenerate(spot, strike, time, vol) {
            return 0.0;
        }

        let d2 = self.d2(spot, strike, time, vol);
        let discount = (-self.rate * time).exp();

        match right {
            OptionRight::Call => strike * time * discount * Self::norm_cdf(d2) / 100.0,
            OptionRight::Put => -strike * time * discount * Self::norm_cdf(-d2) / 100.0,
        }
    }

    pub fn greeks(&self, spot: f64, strike: f64, time: f64, vol: f64, right: OptionRight) -> Greeks {
        Greeks {
            delta: self.delta(spot, strike, time, vol, right),
            gamma: self.gamma(spot, strike, time, vol),
            theta: self.theta(spot, strike, time, vol, right),
            vega: self.vega(spot, strike, time, vol),
            rho: self.rho(spot, strike, time, vol, right),
        }
    }

    /// Solve for the volatility that reproduces `observed_price`.
    ///
    /// Brent's method over [`IV_MIN`, `IV_MAX`] with a fixed iteration budget.
    /// Never fails: an unreachable price or an exhausted budget comes back
    /// with `converged == false` and the last estimate.
    pub fn implied_volatility(
        &self,
        observed_price: f64,
        spot: f64,
        strike: f64,
        time: f64,
        right: OptionRight,
    ) -> IvSolution {
        if time <= 0.0 || observed_price <= 0.0 || spot <= 0.0 || strike <= 0.0 {
            return IvSolution::failed(IV_MIN, 0);
        }
        if !observed_price.is_finite() {
            return IvSolution::failed(IV_MAX, 0);
        }

        let objective = |vol: f64| self.price(spot, strike, time, vol, right) - observed_price;

        let mut a = IV_MIN;
        let mut b = IV_MAX;
        let mut fa = objective(a);
        let mut fb = objective(b);

        if fa.abs() <= IV_PRICE_TOLERANCE {
            return IvSolution {
                estimate: a,
                converged: true,
                iterations: 0,
            };
        }
        if fb.abs() <= IV_PRICE_TOLERANCE {
            return IvSolution {
                estimate: b,
                converged: true,
                iterations: 0,
            };
        }
        // Price is below the floor or above the ceiling of the domain.
        if fa > 0.0 {
            return IvSolution::failed(IV_MIN, 0);
        }
        if fb < 0.0 {
            return IvSolution::failed(IV_MAX, 0);
        }

        let mut c = b;
        let mut fc = fb;
        let mut d = b - a;
        let mut e = d;

        for iteration in 1..=IV_MAX_ITERATIONS {
            if (fb > 0.0 && fc > 0.0) || (fb < 0.0 && fc < 0.0) {
                c = a;
                fc = fa;
                d = b - a;
                e = d;
            }
            if fc.abs() < fb.abs() {
                a = b;
                b = c;
                c = a;
                fa = fb;
                fb = fc;
                fc = fa;
            }

            let tol = 2.0 * f64::EPSILON * b.abs() + 0.5 * IV_VOL_TOLERANCE;
            let half = 0.5 * (c - b);

            if fb.abs() <= IV_PRICE_TOLERANCE || half.abs() <= tol {
                return IvSolution {
                    estimate: b,
                    converged: true,
                    iterations: iteration,
                };
            }

            if e.abs() >= tol && fa.abs() > fb.abs() {
                // Inverse quadratic interpolation, or secant when only two points.
                let s = fb / fa;
                let (mut p, mut q) = if a == c {
                    (2.0 * half * s, 1.0 - s)
                } else {
                    let qa = fa / fc;
                    let r = fb / fc;
                    (
                        s * (2.0 * half * qa * (qa - r) - (b - a) * (r - 1.0)),
                        (qa - 1.0) * (r - 1.0) * (s - 1.0),
                    )
                };
                if p > 0.0 {
                    q = -q;
                }
                p = p.abs();
                let bound = (3.0 * half * q - (tol * q).abs()).min((e * q).abs());
                if 2.0 * p < bound {
                    e = d;
                    d = p / q;
                } else {
                    d = half;
                    e = d;
                }
            } else {
                d = half;
                e = d;
            }

            a = b;
            fa = fb;
            b += if d.abs() > tol { d } else { tol.copysign(half) };
            fb = objective(b);
        }

        IvSolution::failed(b, IV_MAX_ITERATIONS)
    }
}

/// Closed-form fair value with an explicit rate.
pub fn price(spot: f64, strike: f64, time_to_expiry: f64, rate: f64, volatility: f64, right: OptionRight) -> f64 {
    BlackScholes::with_rate(rate).price(spot, strike, time_to_expiry, volatility, right)
}

/// Analytic Greeks with an explicit rate.
pub fn greeks(spot: f64, strike: f64, time_to_expiry: f64, rate: f64, volatility: f64, right: OptionRight) -> Greeks {
    BlackScholes::with_rate(rate).greeks(spot, strike, time_to_expiry, volatility, right)
}
