//! Synthetic market agents: the fair-price process and uninformed retail flow.
//!
//! Sampling runs in `f64`; everything handed to pools is converted to
//! `Decimal` first.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, LogNormal, Poisson, StandardNormal};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::error::MarketError;
use crate::types::{Side, WAD_DECIMALS};

/// Smallest price the decimal view of the process reports.
pub const PRICE_FLOOR: Decimal = dec!(0.000000000000000001);

fn to_decimal(value: f64) -> Decimal {
    if value.is_nan() || value <= 0.0 {
        return Decimal::ZERO;
    }
    Decimal::from_f64(value)
        .map(|d| d.round_dp(WAD_DECIMALS))
        .unwrap_or(if value < 1.0 { Decimal::ZERO } else { Decimal::MAX })
}

fn invalid(field: &'static str, reason: impl Into<String>) -> MarketError {
    MarketError::InvalidParameter {
        field,
        reason: reason.into(),
    }
}

// ─── GBM Price Process ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct PriceProcessConfig {
    pub initial_price: f64,
    /// Drift per unit time.
    pub mu: f64,
    /// Volatility per unit time.
    pub sigma: f64,
    /// Time step in the same unit as `mu` and `sigma`.
    pub dt: f64,
}

impl Default for PriceProcessConfig {
    fn default() -> Self {
        Self {
            initial_price: 100.0,
            mu: 0.0,
            sigma: 0.2,
            dt: 1.0 / 252.0,
        }
    }
}

impl PriceProcessConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        if !(self.initial_price.is_finite() && self.initial_price > 0.0) {
            return Err(invalid("initial_price", "must be positive and finite"));
        }
        if !self.mu.is_finite() {
            return Err(invalid("mu", "must be finite"));
        }
        if !(self.sigma.is_finite() && self.sigma >= 0.0) {
            return Err(invalid("sigma", "must be non-negative and finite"));
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(invalid("dt", "must be positive and finite"));
        }
        Ok(())
    }
}

/// Geometric Brownian motion for the external fair price of X in Y.
///
/// S(t+dt) = S(t) · exp((μ − σ²/2)·dt + σ·√dt·Z),  Z ~ N(0,1)
#[derive(Clone, Debug)]
pub struct PriceProcess {
    config: PriceProcessConfig,
    current: f64,
    rng: ChaCha8Rng,
}

impl PriceProcess {
    pub fn new(config: PriceProcessConfig, seed: u64) -> Result<Self, MarketError> {
        config.validate()?;
        Ok(Self {
            current: config.initial_price,
            config,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &PriceProcessConfig {
        &self.config
    }

    /// Current price, always strictly positive.
    pub fn current_price(&self) -> Decimal {
        to_decimal(self.current).max(PRICE_FLOOR)
    }

    /// Advance one time step and return the new price.
    pub fn step(&mut self) -> Decimal {
        let PriceProcessConfig { mu, sigma, dt, .. } = self.config;
        let z: f64 = self.rng.sample(StandardNormal);
        let exponent = (mu - 0.5 * sigma * sigma) * dt + sigma * dt.sqrt() * z;
        self.current = (self.current * exponent.exp()).min(f64::MAX);
        self.current_price()
    }

    /// `n` prices: the current one, then `n - 1` successive steps.
    pub fn generate_path(&mut self, n: usize) -> Vec<Decimal> {
        let mut path = Vec::with_capacity(n);
        if n == 0 {
            return path;
        }
        path.push(self.current_price());
        path.extend((1..n).map(|_| self.step()));
        path
    }

    /// Reseed and return to the configured initial price.
    pub fn reset(&mut self, seed: u64) {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self.current = self.config.initial_price;
    }
}

// ─── Retail Order Generation ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct RetailConfig {
    /// Mean orders per step (Poisson).
    pub arrival_rate: f64,
    /// Mean order size in Y.
    pub mean_size: f64,
    /// Log-space dispersion of order sizes.
    pub size_sigma: f64,
    /// Probability that an order buys X.
    pub buy_prob: f64,
}

impl Default for RetailConfig {
    fn default() -> Self {
        Self {
            arrival_rate: 5.0,
            mean_size: 2.0,
            size_sigma: 0.7,
            buy_prob: 0.5,
        }
    }
}

impl RetailConfig {
    pub fn validate(&self) -> Result<(), MarketError> {
        if !(self.arrival_rate.is_finite() && self.arrival_rate >= 0.0) {
            return Err(invalid("arrival_rate", "must be non-negative and finite"));
        }
        if !(self.mean_size.is_finite() && self.mean_size > 0.0) {
            return Err(invalid("mean_size", "must be positive and finite"));
        }
        if !(self.size_sigma.is_finite() && self.size_sigma >= 0.0) {
            return Err(invalid("size_sigma", "must be non-negative and finite"));
        }
        if !(0.0..=1.0).contains(&self.buy_prob) {
            return Err(invalid("buy_prob", "must lie in [0, 1]"));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RetailOrder {
    pub side: Side,
    /// Notional in Y.
    pub size: Decimal,
}

/// Uninformed order flow with a private random stream.
#[derive(Clone, Debug)]
pub struct RetailTrader {
    config: RetailConfig,
    /// `None` when the arrival rate is zero.
    arrivals: Option<Poisson<f64>>,
    sizes: LogNormal<f64>,
    rng: ChaCha8Rng,
}

impl RetailTrader {
    pub fn new(config: RetailConfig, seed: u64) -> Result<Self, MarketError> {
        config.validate()?;
        let arrivals = if config.arrival_rate > 0.0 {
            Some(
                Poisson::new(config.arrival_rate)
                    .map_err(|e| invalid("arrival_rate", e.to_string()))?,
            )
        } else {
            None
        };
        // E[size] = exp(μ + σ²/2)  →  μ = ln(mean) − σ²/2
        let sigma = config.size_sigma;
        let mu = config.mean_size.ln() - 0.5 * sigma * sigma;
        let sizes = LogNormal::new(mu, sigma).map_err(|e| invalid("size_sigma", e.to_string()))?;
        Ok(Self {
            config,
            arrivals,
            sizes,
            rng: ChaCha8Rng::seed_from_u64(seed),
        })
    }

    pub fn config(&self) -> &RetailConfig {
        &self.config
    }

    /// Orders for one step. The count is drawn up front; each order is drawn
    /// as the iterator is advanced.
    pub fn generate_orders(&mut self) -> impl Iterator<Item = RetailOrder> + '_ {
        let count = match &self.arrivals {
            Some(poisson) => poisson.sample(&mut self.rng) as usize,
            None => 0,
        };
        (0..count).map(move |_| self.next_order())
    }

    fn next_order(&mut self) -> RetailOrder {
        let side = if self.rng.gen_bool(self.config.buy_prob) {
            Side::Buy
        } else {
            Side::Sell
        };
        let size = to_decimal(self.sizes.sample(&mut self.rng));
        RetailOrder { side, size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_price_and_reset() {
        let mut p = PriceProcess::new(PriceProcessConfig::default(), 42).unwrap();
        assert_eq!(p.current_price(), dec!(100));
        for _ in 0..10 {
            p.step();
        }
        p.reset(42);
        assert_eq!(p.current_price(), dec!(100));
    }

    #[test]
    fn reset_reproduces_fresh_path() {
        let mut used = PriceProcess::new(PriceProcessConfig::default(), 7).unwrap();
        used.generate_path(50);
        used.reset(9);
        let mut fresh = PriceProcess::new(PriceProcessConfig::default(), 9).unwrap();
        assert_eq!(used.generate_path(100), fresh.generate_path(100));
    }

    #[test]
    fn path_starts_at_current_price() {
        let mut p = PriceProcess::new(PriceProcessConfig::default(), 1).unwrap();
        assert!(p.generate_path(0).is_empty());
        assert_eq!(p.generate_path(1), vec![dec!(100)]);
        // generate_path(1) consumed no step
        assert_eq!(p.current_price(), dec!(100));
        let path = p.generate_path(5);
        assert_eq!(path.len(), 5);
        assert_eq!(path[0], dec!(100));
        assert_eq!(*path.last().unwrap(), p.current_price());
    }

    #[test]
    fn prices_stay_positive_under_extreme_volatility() {
        let config = PriceProcessConfig {
            initial_price: 1.0,
            mu: -5.0,
            sigma: 25.0,
            dt: 1.0,
        };
        let mut p = PriceProcess::new(config, 3).unwrap();
        for price in p.generate_path(2_000) {
            assert!(price > Decimal::ZERO);
        }
    }

    #[test]
    fn invalid_price_config_is_rejected() {
        let config = PriceProcessConfig {
            sigma: -0.1,
            ..Default::default()
        };
        assert!(matches!(
            PriceProcess::new(config, 0),
            Err(MarketError::InvalidParameter { field: "sigma", .. })
        ));
    }

    #[test]
    fn same_seed_same_orders() {
        let mut a = RetailTrader::new(RetailConfig::default(), 11).unwrap();
        let mut b = RetailTrader::new(RetailConfig::default(), 11).unwrap();
        for _ in 0..20 {
            let xs: Vec<_> = a.generate_orders().collect();
            let ys: Vec<_> = b.generate_orders().collect();
            assert_eq!(xs, ys);
        }
    }

    #[test]
    fn zero_rate_yields_nothing() {
        let config = RetailConfig {
            arrival_rate: 0.0,
            ..Default::default()
        };
        let mut t = RetailTrader::new(config, 5).unwrap();
        for _ in 0..1_000 {
            assert_eq!(t.generate_orders().count(), 0);
        }
    }

    #[test]
    fn buy_probability_one_only_buys() {
        let config = RetailConfig {
            arrival_rate: 20.0,
            buy_prob: 1.0,
            ..Default::default()
        };
        let mut t = RetailTrader::new(config, 5).unwrap();
        for _ in 0..50 {
            assert!(t.generate_orders().all(|o| o.side == Side::Buy));
        }
    }

    #[test]
    fn mean_order_size_matches_config() {
        let mut t = RetailTrader::new(RetailConfig::default(), 99).unwrap();
        let sizes: Vec<Decimal> = (0..4_000).flat_map(|_| t.generate_orders().collect::<Vec<_>>()).map(|o| o.size).collect();
        assert!(sizes.len() > 15_000);
        let mean = sizes.iter().sum::<Decimal>() / Decimal::from(sizes.len());
        assert!((mean - dec!(2)).abs() < dec!(0.1), "mean size {mean}");
        assert!(sizes.iter().all(|s| *s >= Decimal::ZERO));
    }

    #[test]
    fn invalid_retail_config_is_rejected() {
        for config in [
            RetailConfig { buy_prob: 1.5, ..Default::default() },
            RetailConfig { mean_size: 0.0, ..Default::default() },
            RetailConfig { arrival_rate: f64::NAN, ..Default::default() },
        ] {
            assert!(RetailTrader::new(config, 0).is_err());
        }
    }
}
