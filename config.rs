//! Simulation and logging configuration.

use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{ConfigError, MarketError};
use crate::market::{PriceProcessConfig, RetailConfig};

/// Parameters of one simulation run. Every field has a default, so a TOML
/// file only needs the values it changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub n_steps: u64,
    pub initial_price: f64,
    pub initial_x: Decimal,
    pub initial_y: Decimal,
    pub gbm_mu: f64,
    pub gbm_sigma: f64,
    pub gbm_dt: f64,
    pub retail_arrival_rate: f64,
    pub retail_mean_size: f64,
    pub retail_size_sigma: f64,
    pub retail_buy_prob: f64,
    /// Arbitrage below this profit (in Y) is left on the table.
    pub arb_min_profit: Decimal,
    /// Price stream seed; the retail stream uses `seed + 1`.
    pub seed: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        let price = PriceProcessConfig::default();
        let retail = RetailConfig::default();
        Self {
            n_steps: 10_000,
            initial_price: price.initial_price,
            initial_x: dec!(100),
            initial_y: dec!(10000),
            gbm_mu: price.mu,
            gbm_sigma: price.sigma,
            gbm_dt: price.dt,
            retail_arrival_rate: retail.arrival_rate,
            retail_mean_size: retail.mean_size,
            retail_size_sigma: retail.size_sigma,
            retail_buy_prob: retail.buy_prob,
            arb_min_profit: Decimal::ZERO,
            seed: 0,
        }
    }
}

impl SimulationConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::ReadFile)?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_x <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                field: "initial_x",
                reason: "must be positive".into(),
            });
        }
        if self.initial_y <= Decimal::ZERO {
            return Err(ConfigError::InvalidValue {
                field: "initial_y",
                reason: "must be positive".into(),
            });
        }
        if self.arb_min_profit.is_sign_negative() {
            return Err(ConfigError::InvalidValue {
                field: "arb_min_profit",
                reason: "must be non-negative".into(),
            });
        }
        let market = |MarketError::InvalidParameter { field, reason }| {
            ConfigError::InvalidValue { field, reason }
        };
        self.price_config().validate().map_err(market)?;
        self.retail_config().validate().map_err(market)?;
        Ok(())
    }

    pub fn price_config(&self) -> PriceProcessConfig {
        PriceProcessConfig {
            initial_price: self.initial_price,
            mu: self.gbm_mu,
            sigma: self.gbm_sigma,
            dt: self.gbm_dt,
        }
    }

    pub fn retail_config(&self) -> RetailConfig {
        RetailConfig {
            arrival_rate: self.retail_arrival_rate,
            mean_size: self.retail_mean_size,
            size_sigma: self.retail_size_sigma,
            buy_prob: self.retail_buy_prob,
        }
    }

    pub fn retail_seed(&self) -> u64 {
        self.seed.wrapping_add(1)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` or `json`.
    pub format: String,
}

impl LoggingConfig {
    /// Install the global tracing subscriber. `RUST_LOG` wins over `level`.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        match self.format.as_str() {
            "json" => {
                fmt().json().with_env_filter(filter).init();
            }
            _ => {
                fmt().with_env_filter(filter).init();
            }
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "pretty".into(),
        }
    }
}
