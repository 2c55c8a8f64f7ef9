//! Black-Scholes pricer and Greeks, with Newton-Raphson IV extraction.
//!
//! Pure, stateless, CPU-bound. Dispatched off the ingest task through a
//! bounded request/response channel (see `worker.rs`) so the ingest loop
//! never awaits this directly.

pub mod worker;

use statrs::distribution::{Continuous, ContinuousCDF, Normal};

const MIN_IV: f64 = 0.005;
const MAX_IV: f64 = 5.0;
const MAX_NEWTON_ITERS: u32 = 64;
const NEWTON_TOL: f64 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionType {
    Call,
    Put,
}

/// Inputs to a single Greeks/IV derivation.
#[derive(Debug, Clone, Copy)]
pub struct AnalyticsRequest {
    pub spot: f64,
    pub strike: f64,
    pub option_type: OptionType,
    pub t_years: f64,
    pub rate: f64,
    pub dividend_yield: f64,
    pub observed_price: Option<f64>,
    pub observed_iv: Option<f64>,
}

/// Output of a derivation. `iv` is `None` only when it was supplied on
/// input (nothing to derive) and not requested to be echoed back.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnalyticsResult {
    pub iv: Option<f64>,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub model_price: f64,
    pub invalid_inputs: bool,
}

fn normal() -> Normal {
    Normal::new(0.0, 1.0).expect("standard normal params are always valid")
}

/// `(d1, d2)` for the standard Black-Scholes formulation.
fn d1_d2(spot: f64, strike: f64, t_years: f64, rate: f64, q: f64, vol: f64) -> (f64, f64) {
    let d1 = ((spot / strike).ln() + (rate - q + 0.5 * vol * vol) * t_years)
        / (vol * t_years.sqrt());
    let d2 = d1 - vol * t_years.sqrt();
    (d1, d2)
}

/// Model price under Black-Scholes with continuous dividend yield `q`.
fn price(
    spot: f64,
    strike: f64,
    option_type: OptionType,
    t_years: f64,
    rate: f64,
    q: f64,
    vol: f64,
) -> f64 {
    let n = normal();
    let (d1, d2) = d1_d2(spot, strike, t_years, rate, q, vol);
    let disc_q = (-q * t_years).exp();
    let disc_r = (-rate * t_years).exp();
    match option_type {
        OptionType::Call => spot * disc_q * n.cdf(d1) - strike * disc_r * n.cdf(d2),
        OptionType::Put => strike * disc_r * n.cdf(-d2) - spot * disc_q * n.cdf(-d1),
    }
}

fn intrinsic(spot: f64, strike: f64, option_type: OptionType) -> f64 {
    match option_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

/// Greeks at a given volatility, in the per-1-point / per-day / per-1%-vol
/// units the UI expects (not the raw analytic units).
fn greeks(
    spot: f64,
    strike: f64,
    option_type: OptionType,
    t_years: f64,
    rate: f64,
    q: f64,
    vol: f64,
) -> (f64, f64, f64, f64) {
    let n = normal();
    let (d1, d2) = d1_d2(spot, strike, t_years, rate, q, vol);
    let disc_q = (-q * t_years).exp();
    let disc_r = (-rate * t_years).exp();
    let sqrt_t = t_years.sqrt();

    let delta = match option_type {
        OptionType::Call => disc_q * n.cdf(d1),
        OptionType::Put => disc_q * (n.cdf(d1) - 1.0),
    };
    let gamma = disc_q * n.pdf(d1) / (spot * vol * sqrt_t);
    let vega_raw = spot * disc_q * n.pdf(d1) * sqrt_t;
    let theta_raw = match option_type {
        OptionType::Call => {
            -(spot * disc_q * n.pdf(d1) * vol) / (2.0 * sqrt_t) - rate * strike * disc_r * n.cdf(d2)
                + q * spot * disc_q * n.cdf(d1)
        }
        OptionType::Put => {
            -(spot * disc_q * n.pdf(d1) * vol) / (2.0 * sqrt_t)
                + rate * strike * disc_r * n.cdf(-d2)
                - q * spot * disc_q * n.cdf(-d1)
        }
    };

    // UI convention: theta per calendar day, vega per 1 vol-point (1%).
    (delta, gamma, theta_raw / 365.0, vega_raw / 100.0)
}

/// Newton-Raphson IV extraction with bisection fallback, bounded to
/// `[MIN_IV, MAX_IV]` and `MAX_NEWTON_ITERS` iterations.
fn implied_vol(
    spot: f64,
    strike: f64,
    option_type: OptionType,
    t_years: f64,
    rate: f64,
    q: f64,
    observed_price: f64,
) -> f64 {
    let mut vol = 0.3_f64;
    for _ in 0..MAX_NEWTON_ITERS {
        let model = price(spot, strike, option_type, t_years, rate, q, vol);
        let diff = model - observed_price;
        if diff.abs() <= NEWTON_TOL * observed_price.max(1e-8) {
            return vol.clamp(MIN_IV, MAX_IV);
        }
        let (d1, _) = d1_d2(spot, strike, t_years, rate, q, vol);
        let vega_raw = spot * (-q * t_years).exp() * normal().pdf(d1) * t_years.sqrt();
        if vega_raw.abs() < 1e-8 {
            // Derivative collapsed (deep ITM/OTM): fall back to bisection.
            return bisect_iv(spot, strike, option_type, t_years, rate, q, observed_price);
        }
        vol -= diff / vega_raw;
        vol = vol.clamp(MIN_IV, MAX_IV);
    }
    vol.clamp(MIN_IV, MAX_IV)
}

fn bisect_iv(
    spot: f64,
    strike: f64,
    option_type: OptionType,
    t_years: f64,
    rate: f64,
    q: f64,
    observed_price: f64,
) -> f64 {
    let mut lo = MIN_IV;
    let mut hi = MAX_IV;
    for _ in 0..MAX_NEWTON_ITERS {
        let mid = 0.5 * (lo + hi);
        let model = price(spot, strike, option_type, t_years, rate, q, mid);
        if (model - observed_price).abs() <= NEWTON_TOL * observed_price.max(1e-8) {
            return mid;
        }
        if model > observed_price {
            hi = mid;
        } else {
            lo = mid;
        }
    }
    0.5 * (lo + hi)
}

/// Compute Greeks (and IV if requested/needed) for one request.
///
/// Numerical guards per the spec: `T <= 0` returns intrinsic value with
/// zero Greeks; non-positive spot or strike returns all zeros flagged
/// `invalid_inputs`.
pub fn derive(req: AnalyticsRequest) -> AnalyticsResult {
    if req.spot <= 0.0 || req.strike <= 0.0 {
        return AnalyticsResult {
            invalid_inputs: true,
            ..Default::default()
        };
    }
    if req.t_years <= 0.0 {
        return AnalyticsResult {
            iv: req.observed_iv,
            model_price: intrinsic(req.spot, req.strike, req.option_type),
            ..Default::default()
        };
    }

    let vol = match req.observed_iv {
        Some(iv) if iv > 0.0 => iv.clamp(MIN_IV, MAX_IV),
        _ => match req.observed_price {
            Some(p) if p > 0.0 => implied_vol(
                req.spot,
                req.strike,
                req.option_type,
                req.t_years,
                req.rate,
                req.dividend_yield,
                p,
            ),
            _ => 0.3,
        },
    };

    let model_price = price(
        req.spot,
        req.strike,
        req.option_type,
        req.t_years,
        req.rate,
        req.dividend_yield,
        vol,
    );
    let (delta, gamma, theta, vega) = greeks(
        req.spot,
        req.strike,
        req.option_type,
        req.t_years,
        req.rate,
        req.dividend_yield,
        vol,
    );

    AnalyticsResult {
        iv: Some(vol),
        delta,
        gamma,
        theta,
        vega,
        model_price,
        invalid_inputs: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn atm_call() -> AnalyticsRequest {
        AnalyticsRequest {
            spot: 100.0,
            strike: 100.0,
            option_type: OptionType::Call,
            t_years: 0.5,
            rate: 0.05,
            dividend_yield: 0.0,
            observed_price: None,
            observed_iv: Some(0.2),
        }
    }

    #[test]
    fn atm_call_delta_is_roughly_half() {
        let r = derive(atm_call());
        assert!((r.delta - 0.5).abs() < 0.15);
    }

    #[test]
    fn put_call_parity_roughly_holds() {
        let call = derive(atm_call());
        let mut put_req = atm_call();
        put_req.option_type = OptionType::Put;
        let put = derive(put_req);
        let lhs = call.model_price - put.model_price;
        let rhs = 100.0 - 100.0 * (-0.05_f64 * 0.5).exp();
        assert!((lhs - rhs).abs() < 1e-6);
    }

    #[test]
    fn non_positive_spot_flags_invalid_inputs() {
        let mut req = atm_call();
        req.spot = 0.0;
        let r = derive(req);
        assert!(r.invalid_inputs);
        assert_eq!(r.delta, 0.0);
    }

    #[test]
    fn zero_time_to_expiry_returns_intrinsic() {
        let mut req = atm_call();
        req.t_years = 0.0;
        req.spot = 110.0;
        let r = derive(req);
        assert_eq!(r.model_price, 10.0);
        assert_eq!(r.delta, 0.0);
    }

    #[test]
    fn implied_vol_recovers_the_generating_vol() {
        let true_vol = 0.35;
        let observed = price(100.0, 95.0, OptionType::Call, 0.75, 0.03, 0.0, true_vol);
        let req = AnalyticsRequest {
            spot: 100.0,
            strike: 95.0,
            option_type: OptionType::Call,
            t_years: 0.75,
            rate: 0.03,
            dividend_yield: 0.0,
            observed_price: Some(observed),
            observed_iv: None,
        };
        let r = derive(req);
        assert!((r.iv.unwrap() - true_vol).abs() < 1e-3);
    }

    #[test]
    fn deep_otm_iv_extraction_does_not_diverge() {
        // Vega collapses here; must fall back to bisection instead of NaN/∞.
        let observed = price(100.0, 400.0, OptionType::Call, 0.1, 0.05, 0.0, 0.5);
        let req = AnalyticsRequest {
            spot: 100.0,
            strike: 400.0,
            option_type: OptionType::Call,
            t_years: 0.1,
            rate: 0.05,
            dividend_yield: 0.0,
            observed_price: Some(observed.max(1e-6)),
            observed_iv: None,
        };
        let r = derive(req);
        assert!(r.iv.unwrap().is_finite());
        assert!(r.iv.unwrap() >= MIN_IV && r.iv.unwrap() <= MAX_IV);
    }
}
