use rust_decimal::Decimal;

use crate::error::StrategyError;
use crate::types::{FeeQuote, TradeInfo};

/// Calling convention every fee strategy satisfies, native or sandboxed.
///
/// Pools, the arbitrageur and the router only ever talk to this trait.
/// Identity of a strategy is the object itself; two instances may report the
/// same [`Strategy::name`].
pub trait Strategy: Send {
    /// Display name. Stable for the lifetime of the instance.
    fn name(&self) -> &str;

    /// Called exactly once before any trade, with the pool's starting reserves.
    fn after_initialize(
        &mut self,
        initial_x: Decimal,
        initial_y: Decimal,
    ) -> Result<FeeQuote, StrategyError>;

    /// Called once per trade, before the pool commits it; returns the quote
    /// for the next trade. `trade` carries the pre-trade reserves. If the
    /// returned quote is rejected the pool rolls the trade back but this
    /// instance has already advanced, so callers treat it as failed until
    /// [`Strategy::reset`].
    fn after_swap(&mut self, trade: &TradeInfo) -> Result<FeeQuote, StrategyError>;

    /// Restore the pre-`after_initialize` state.
    fn reset(&mut self) -> Result<(), StrategyError>;
}

impl<S: Strategy + ?Sized> Strategy for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn after_initialize(
        &mut self,
        initial_x: Decimal,
        initial_y: Decimal,
    ) -> Result<FeeQuote, StrategyError> {
        (**self).after_initialize(initial_x, initial_y)
    }

    fn after_swap(&mut self, trade: &TradeInfo) -> Result<FeeQuote, StrategyError> {
        (**self).after_swap(trade)
    }

    fn reset(&mut self) -> Result<(), StrategyError> {
        (**self).reset()
    }
}

// ─── Native strategies ────────────────────────────────────────────────────────

/// Native strategy that always quotes the same bid/ask pair.
#[derive(Clone, Debug)]
pub struct FixedFeeStrategy {
    name: String,
    fees: FeeQuote,
}

impl FixedFeeStrategy {
    pub fn new(bid_fee: Decimal, ask_fee: Decimal) -> Result<Self, StrategyError> {
        let fees = FeeQuote::new(bid_fee, ask_fee)?;
        let name = format!(
            "Fixed_{}_{}bps",
            (bid_fee * Decimal::from(10_000)).normalize(),
            (ask_fee * Decimal::from(10_000)).normalize()
        );
        Ok(Self { name, fees })
    }

    pub fn symmetric(fee: Decimal) -> Result<Self, StrategyError> {
        Self::new(fee, fee)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Strategy for FixedFeeStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_initialize(&mut self, _: Decimal, _: Decimal) -> Result<FeeQuote, StrategyError> {
        Ok(self.fees)
    }

    fn after_swap(&mut self, _: &TradeInfo) -> Result<FeeQuote, StrategyError> {
        Ok(self.fees)
    }

    fn reset(&mut self) -> Result<(), StrategyError> {
        Ok(())
    }
}
