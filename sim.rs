//! Single-run simulation engine.
//!
//! Each step:
//!   1. the fair price advances one GBM step
//!   2. retail orders arrive and are split across all pools by the router
//!   3. the arbitrageur closes any remaining gap on each pool
//!
//! Every trade goes through `Amm::execute_trade`, so each one refreshes the
//! owning strategy's quote.

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, warn};

use crate::amm::Amm;
use crate::arbitrage::Arbitrageur;
use crate::config::SimulationConfig;
use crate::error::{AmmError, SimulationError};
use crate::market::{PriceProcess, RetailOrder, RetailTrader};
use crate::router::{compute_optimal_split_buy, compute_optimal_split_sell};
use crate::strategy::Strategy;
use crate::types::{Side, WAD_DECIMALS};

// ─── Simulation Result ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PoolSummary {
    pub name: String,
    pub reserve_x: Decimal,
    pub reserve_y: Decimal,
    /// `None` if the reserve ratio leaves Decimal range.
    pub spot_price: Option<Decimal>,
    pub retail_trades: u64,
    pub arb_trades: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SimulationSummary {
    pub steps: u64,
    pub final_fair_price: Decimal,
    pub pools: Vec<PoolSummary>,
}

#[derive(Clone, Copy, Debug, Default)]
struct PoolStats {
    retail_trades: u64,
    arb_trades: u64,
}

// ─── Core Simulation ──────────────────────────────────────────────────────────

pub struct Simulation {
    config: SimulationConfig,
    price: PriceProcess,
    retail: RetailTrader,
    arbitrageur: Arbitrageur,
    amms: Vec<Amm>,
    stats: Vec<PoolStats>,
    steps: u64,
}

impl Simulation {
    /// One pool per strategy, each seeded with the configured reserves and
    /// initialised.
    pub fn new(
        config: SimulationConfig,
        strategies: Vec<Box<dyn Strategy>>,
    ) -> Result<Self, SimulationError> {
        if strategies.is_empty() {
            return Err(SimulationError::NoStrategies);
        }
        config.validate()?;

        let price = PriceProcess::new(config.price_config(), config.seed)?;
        let retail = RetailTrader::new(config.retail_config(), config.retail_seed())?;

        let mut amms = Vec::with_capacity(strategies.len());
        for strategy in strategies {
            let name = strategy.name().to_string();
            let mut amm = Amm::new(name, strategy, config.initial_x, config.initial_y)?;
            amm.initialize()?;
            amms.push(amm);
        }
        let stats = vec![PoolStats::default(); amms.len()];

        Ok(Self {
            arbitrageur: Arbitrageur::with_min_profit(config.arb_min_profit),
            config,
            price,
            retail,
            amms,
            stats,
            steps: 0,
        })
    }

    pub fn amms(&self) -> &[Amm] {
        &self.amms
    }

    pub fn fair_price(&self) -> Decimal {
        self.price.current_price()
    }

    /// Advance one step; `t` is the timestamp handed to strategies.
    pub fn step(&mut self, t: u64) -> Result<(), SimulationError> {
        // ── 1. Price step ─────────────────────────────────────────────────────
        let fair_price = self.price.step();

        // ── 2. Retail order routing ───────────────────────────────────────────
        let Self {
            retail, amms, stats, ..
        } = self;
        for order in retail.generate_orders() {
            route_retail_order(order, amms, stats, fair_price, t)?;
        }

        // ── 3. Arbitrage each pool ────────────────────────────────────────────
        for (amm, stat) in self.amms.iter_mut().zip(self.stats.iter_mut()) {
            match self.arbitrageur.execute_arb(amm, fair_price, t) {
                Ok(Some(_)) => stat.arb_trades += 1,
                Ok(None) => {}
                Err(err) => skip_or_abort(amm.name(), t, err)?,
            }
        }

        self.steps += 1;
        Ok(())
    }

    /// Run the configured number of steps.
    pub fn run(&mut self) -> Result<SimulationSummary, SimulationError> {
        info!(
            pools = self.amms.len(),
            steps = self.config.n_steps,
            seed = self.config.seed,
            "simulation started"
        );
        for t in 0..self.config.n_steps {
            self.step(t)?;
        }
        let summary = self.summary();
        info!(
            steps = summary.steps,
            final_fair_price = %summary.final_fair_price,
            "simulation finished"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> SimulationSummary {
        SimulationSummary {
            steps: self.steps,
            final_fair_price: self.price.current_price(),
            pools: self
                .amms
                .iter()
                .zip(&self.stats)
                .map(|(amm, stat)| PoolSummary {
                    name: amm.name().to_string(),
                    reserve_x: amm.reserve_x(),
                    reserve_y: amm.reserve_y(),
                    spot_price: amm.spot_price(),
                    retail_trades: stat.retail_trades,
                    arb_trades: stat.arb_trades,
                })
                .collect(),
        }
    }

    /// Hand the strategies back in pool order, e.g. to `reset()` and reuse.
    pub fn into_strategies(self) -> Vec<Box<dyn Strategy>> {
        self.amms.into_iter().map(Amm::into_strategy).collect()
    }
}

// ─── Retail Order Routing ─────────────────────────────────────────────────────

fn route_retail_order(
    order: RetailOrder,
    amms: &mut [Amm],
    stats: &mut [PoolStats],
    fair_price: Decimal,
    t: u64,
) -> Result<(), SimulationError> {
    if order.size <= Decimal::ZERO {
        return Ok(());
    }
    // Sizes are Y notional; sells are converted to X at the fair price.
    let allocation = match order.side {
        Side::Buy => compute_optimal_split_buy(amms, order.size),
        Side::Sell => {
            let size_x = (order.size / fair_price).round_dp(WAD_DECIMALS);
            compute_optimal_split_sell(amms, size_x)
        }
    };

    for ((amm, stat), amount) in amms.iter_mut().zip(stats.iter_mut()).zip(allocation) {
        if amount <= Decimal::ZERO {
            continue;
        }
        match amm.execute_trade(order.side, amount, t) {
            Ok(_) => stat.retail_trades += 1,
            Err(err) => skip_or_abort(amm.name(), t, err)?,
        }
    }
    Ok(())
}

/// A strategy failure ends the run; any other rejection only drops the trade.
fn skip_or_abort(pool: &str, step: u64, err: AmmError) -> Result<(), SimulationError> {
    match err {
        AmmError::Strategy(source) => Err(SimulationError::StrategyFailed {
            pool: pool.to_string(),
            step,
            source,
        }),
        other => {
            warn!(pool, step, error = %other, "trade rejected");
            Ok(())
        }
    }
}
