//! Constant-product pool whose fees are quoted by a bound [`Strategy`].

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use tracing::{debug, trace};

use crate::error::AmmError;
use crate::strategy::Strategy;
use crate::types::{FeeQuote, Side, TradeInfo, WAD_DECIMALS};

/// Relative slack on the invariant check. Reserve ratios carry at most 28
/// significant digits, so a fee-free trade can land a few ulps short.
const K_TOLERANCE: Decimal = dec!(0.000000000000000000000001);

/// Result of pricing a trade without executing it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Quote {
    pub side: Side,
    pub amount_in: Decimal,
    pub amount_out: Decimal,
    pub fee: Decimal,
    pub new_reserve_x: Decimal,
    pub new_reserve_y: Decimal,
}

pub struct Amm {
    name: String,
    reserve_x: Decimal,
    reserve_y: Decimal,
    strategy: Box<dyn Strategy>,
    fees: FeeQuote,
    initialized: bool,
}

impl Amm {
    pub fn new(
        name: impl Into<String>,
        strategy: Box<dyn Strategy>,
        reserve_x: Decimal,
        reserve_y: Decimal,
    ) -> Result<Self, AmmError> {
        if reserve_x <= Decimal::ZERO || reserve_y <= Decimal::ZERO {
            return Err(AmmError::InvalidReserves { reserve_x, reserve_y });
        }
        Ok(Self {
            name: name.into(),
            reserve_x,
            reserve_y,
            strategy,
            fees: FeeQuote {
                bid_fee: Decimal::ZERO,
                ask_fee: Decimal::ZERO,
            },
            initialized: false,
        })
    }

    /// Fetch the first quote from the strategy. Must be called exactly once
    /// before any trade.
    pub fn initialize(&mut self) -> Result<FeeQuote, AmmError> {
        if self.initialized {
            return Err(AmmError::AlreadyInitialized(self.name.clone()));
        }
        let fees = self.strategy.after_initialize(self.reserve_x, self.reserve_y)?;
        fees.validate()?;
        self.fees = fees;
        self.initialized = true;
        debug!(pool = %self.name, bid = %fees.bid_fee, ask = %fees.ask_fee, "pool initialized");
        Ok(fees)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reserve_x(&self) -> Decimal {
        self.reserve_x
    }

    pub fn reserve_y(&self) -> Decimal {
        self.reserve_y
    }

    /// `reserve_x * reserve_y`, or `None` once the product leaves Decimal range.
    pub fn k(&self) -> Option<Decimal> {
        self.reserve_x.checked_mul(self.reserve_y)
    }

    /// Price of X in units of Y; `None` if the ratio leaves Decimal range.
    pub fn spot_price(&self) -> Option<Decimal> {
        self.reserve_y.checked_div(self.reserve_x)
    }

    /// Quote currently in force.
    pub fn fees(&self) -> FeeQuote {
        self.fees
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn into_strategy(self) -> Box<dyn Strategy> {
        self.strategy
    }

    /// Price a trade of `amount_in` (Y for `Buy`, X for `Sell`) against the
    /// current reserves and fees. Nothing is mutated.
    pub fn quote(&self, side: Side, amount_in: Decimal) -> Result<Quote, AmmError> {
        if !self.initialized {
            return Err(AmmError::NotInitialized(self.name.clone()));
        }
        if amount_in <= Decimal::ZERO {
            return Err(AmmError::InvalidAmount(amount_in));
        }

        let fee = self.fees.fee_for(side);
        let (reserve_in, reserve_out) = match side {
            Side::Buy => (self.reserve_y, self.reserve_x),
            Side::Sell => (self.reserve_x, self.reserve_y),
        };

        let effective = amount_in
            .checked_mul(Decimal::ONE - fee)
            .ok_or(AmmError::Overflow)?;
        let denominator = reserve_in.checked_add(effective).ok_or(AmmError::Overflow)?;
        let amount_out = reserve_out
            .checked_mul(effective)
            .and_then(|n| n.checked_div(denominator))
            .or_else(|| {
                effective
                    .checked_div(denominator)
                    .and_then(|share| share.checked_mul(reserve_out))
            })
            .ok_or(AmmError::Overflow)?
            .round_dp_with_strategy(WAD_DECIMALS, RoundingStrategy::ToZero);

        if amount_out >= reserve_out {
            return Err(AmmError::InsufficientLiquidity {
                side,
                output: amount_out,
                reserve: reserve_out,
            });
        }

        // Full input (fee included) stays in the pool.
        let new_in = reserve_in.checked_add(amount_in).ok_or(AmmError::Overflow)?;
        let new_out = reserve_out - amount_out;
        let (new_reserve_x, new_reserve_y) = match side {
            Side::Buy => (new_out, new_in),
            Side::Sell => (new_in, new_out),
        };

        // k' >= k  <=>  new_in / reserve_in >= reserve_out / new_out
        let input_growth = new_in.checked_div(reserve_in).ok_or(AmmError::Overflow)?;
        let output_shrink = reserve_out.checked_div(new_out).ok_or(AmmError::Overflow)?;
        if input_growth < output_shrink - output_shrink * K_TOLERANCE {
            return Err(AmmError::InvariantViolation {
                input_growth,
                output_shrink,
            });
        }

        Ok(Quote {
            side,
            amount_in,
            amount_out,
            fee,
            new_reserve_x,
            new_reserve_y,
        })
    }

    /// Execute a trade and refresh the fee quote.
    ///
    /// `Buy`: counterparty pays `amount_in` Y and receives X, charged `ask_fee`.
    /// `Sell`: counterparty pays `amount_in` X and receives Y, charged `bid_fee`.
    ///
    /// The strategy sees the trade before reserves are committed; if it fails
    /// or quotes an out-of-range fee the pool is left untouched, though the
    /// strategy may already have advanced its own state.
    pub fn execute_trade(
        &mut self,
        side: Side,
        amount_in: Decimal,
        timestamp: u64,
    ) -> Result<TradeInfo, AmmError> {
        let quote = self.quote(side, amount_in)?;
        let (amount_x, amount_y) = match side {
            Side::Buy => (quote.amount_out, quote.amount_in),
            Side::Sell => (quote.amount_in, quote.amount_out),
        };
        let trade = TradeInfo {
            side,
            amount_x,
            amount_y,
            timestamp,
            reserve_x: self.reserve_x,
            reserve_y: self.reserve_y,
        };

        let next = self.strategy.after_swap(&trade)?;
        next.validate()?;

        self.reserve_x = quote.new_reserve_x;
        self.reserve_y = quote.new_reserve_y;
        self.fees = next;
        trace!(
            pool = %self.name,
            ?side,
            %amount_x,
            %amount_y,
            fee = %quote.fee,
            "trade executed"
        );
        Ok(trade)
    }
}

impl std::fmt::Debug for Amm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Amm")
            .field("name", &self.name)
            .field("reserve_x", &self.reserve_x)
            .field("reserve_y", &self.reserve_y)
            .field("strategy", &self.strategy.name())
            .field("fees", &self.fees)
            .field("initialized", &self.initialized)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::strategy::{FixedFeeStrategy, Strategy};
    use proptest::prelude::*;

    fn pool(bid: Decimal, ask: Decimal) -> Amm {
        let strategy = FixedFeeStrategy::new(bid, ask).unwrap();
        let mut amm = Amm::new("pool", Box::new(strategy), dec!(1000), dec!(1000)).unwrap();
        amm.initialize().unwrap();
        amm
    }

    /// Quotes 30 bps, then fails on the n-th swap.
    struct FailsAfter {
        remaining: u32,
    }

    impl Strategy for FailsAfter {
        fn name(&self) -> &str {
            "FailsAfter"
        }
        fn after_initialize(&mut self, _: Decimal, _: Decimal) -> Result<FeeQuote, StrategyError> {
            FeeQuote::symmetric(dec!(0.003))
        }
        fn after_swap(&mut self, _: &TradeInfo) -> Result<FeeQuote, StrategyError> {
            if self.remaining == 0 {
                return Err(StrategyError::Terminated);
            }
            self.remaining -= 1;
            FeeQuote::symmetric(dec!(0.003))
        }
        fn reset(&mut self) -> Result<(), StrategyError> {
            Ok(())
        }
    }

    #[test]
    fn rejects_non_positive_reserves() {
        let s = FixedFeeStrategy::symmetric(dec!(0.003)).unwrap();
        let err = Amm::new("bad", Box::new(s), dec!(0), dec!(10)).unwrap_err();
        assert!(matches!(err, AmmError::InvalidReserves { .. }));
    }

    #[test]
    fn trading_requires_initialize() {
        let s = FixedFeeStrategy::symmetric(dec!(0.003)).unwrap();
        let mut amm = Amm::new("p", Box::new(s), dec!(100), dec!(100)).unwrap();
        assert!(matches!(
            amm.execute_trade(Side::Buy, dec!(1), 0),
            Err(AmmError::NotInitialized(_))
        ));
        amm.initialize().unwrap();
        assert!(matches!(amm.initialize(), Err(AmmError::AlreadyInitialized(_))));
    }

    #[test]
    fn buy_uses_ask_fee_and_reports_pre_trade_reserves() {
        let mut amm = pool(dec!(0.01), dec!(0.05));
        let trade = amm.execute_trade(Side::Buy, dec!(100), 7).unwrap();
        // 1000 * 95 / 1095
        let expected = (dec!(95000) / dec!(1095)).round_dp_with_strategy(18, RoundingStrategy::ToZero);
        assert_eq!(trade.amount_x, expected);
        assert_eq!(trade.amount_y, dec!(100));
        assert_eq!((trade.reserve_x, trade.reserve_y), (dec!(1000), dec!(1000)));
        assert_eq!(trade.timestamp, 7);
        assert_eq!(amm.reserve_y(), dec!(1100));
        assert_eq!(amm.reserve_x(), dec!(1000) - expected);
    }

    #[test]
    fn sell_uses_bid_fee() {
        let mut amm = pool(dec!(0.01), dec!(0.05));
        let trade = amm.execute_trade(Side::Sell, dec!(100), 0).unwrap();
        let expected = (dec!(99000) / dec!(1099)).round_dp_with_strategy(18, RoundingStrategy::ToZero);
        assert_eq!(trade.amount_y, expected);
        assert_eq!(amm.reserve_x(), dec!(1100));
    }

    #[test]
    fn zero_amount_is_rejected_without_mutation() {
        let mut amm = pool(dec!(0.003), dec!(0.003));
        assert!(matches!(
            amm.execute_trade(Side::Sell, dec!(0), 0),
            Err(AmmError::InvalidAmount(_))
        ));
        assert_eq!((amm.reserve_x(), amm.reserve_y()), (dec!(1000), dec!(1000)));
    }

    #[test]
    fn strategy_failure_leaves_pool_untouched() {
        let mut amm = Amm::new("p", Box::new(FailsAfter { remaining: 1 }), dec!(1000), dec!(1000)).unwrap();
        amm.initialize().unwrap();
        amm.execute_trade(Side::Buy, dec!(10), 0).unwrap();
        let (x, y) = (amm.reserve_x(), amm.reserve_y());
        let err = amm.execute_trade(Side::Buy, dec!(10), 1).unwrap_err();
        assert!(matches!(err, AmmError::Strategy(StrategyError::Terminated)));
        assert_eq!((amm.reserve_x(), amm.reserve_y()), (x, y));
    }

    /// Quotes 30 bps, then an out-of-range fee on every swap.
    struct Overcharges {
        swaps: u32,
    }

    impl Strategy for Overcharges {
        fn name(&self) -> &str {
            "Overcharges"
        }
        fn after_initialize(&mut self, _: Decimal, _: Decimal) -> Result<FeeQuote, StrategyError> {
            FeeQuote::symmetric(dec!(0.003))
        }
        fn after_swap(&mut self, _: &TradeInfo) -> Result<FeeQuote, StrategyError> {
            self.swaps += 1;
            Ok(FeeQuote {
                bid_fee: dec!(0.2),
                ask_fee: dec!(0.2),
            })
        }
        fn reset(&mut self) -> Result<(), StrategyError> {
            self.swaps = 0;
            Ok(())
        }
    }

    #[test]
    fn out_of_range_quote_is_rejected_before_commit() {
        let mut amm = Amm::new("p", Box::new(Overcharges { swaps: 0 }), dec!(1000), dec!(1000)).unwrap();
        amm.initialize().unwrap();
        let err = amm.execute_trade(Side::Sell, dec!(10), 0).unwrap_err();
        assert!(matches!(
            err,
            AmmError::Strategy(StrategyError::FeeOutOfRange { .. })
        ));
        assert_eq!((amm.reserve_x(), amm.reserve_y()), (dec!(1000), dec!(1000)));
        assert_eq!(amm.fees(), FeeQuote::symmetric(dec!(0.003)).unwrap());
    }

    #[test]
    fn deep_pools_trade_without_forming_k() {
        let s = FixedFeeStrategy::symmetric(dec!(0.003)).unwrap();
        let mut amm = Amm::new("deep", Box::new(s), dec!(100000000000000), dec!(10000000000000000)).unwrap();
        amm.initialize().unwrap();
        assert_eq!(amm.k(), None);
        assert_eq!(amm.spot_price(), Some(dec!(100)));

        let buy = amm.execute_trade(Side::Buy, dec!(1000), 0).unwrap();
        assert!(buy.amount_x > dec!(9.9) && buy.amount_x < dec!(10));
        let sell = amm.execute_trade(Side::Sell, dec!(1000000000000), 1).unwrap();
        assert!(sell.amount_y > Decimal::ZERO);
        assert!(amm.spot_price().unwrap() < dec!(100));
    }

    #[test]
    fn zero_fee_keeps_k() {
        let mut amm = pool(dec!(0), dec!(0));
        let before = amm.k().unwrap();
        amm.execute_trade(Side::Buy, dec!(250), 0).unwrap();
        let after = amm.k().unwrap();
        assert!(after >= before - before * K_TOLERANCE);
        assert!((after - before).abs() / before < dec!(0.000000000001));
    }

    #[test]
    fn spot_price_moves_with_trades() {
        let mut amm = pool(dec!(0.003), dec!(0.003));
        assert_eq!(amm.spot_price(), Some(dec!(1)));
        amm.execute_trade(Side::Buy, dec!(50), 0).unwrap();
        assert!(amm.spot_price().unwrap() > dec!(1));
        amm.execute_trade(Side::Sell, dec!(120), 1).unwrap();
        assert!(amm.spot_price().unwrap() < dec!(1));
    }

    proptest! {
        #[test]
        fn k_grows_with_positive_fee(
            fee_bps in 1u32..=1000,
            amount in 1u64..5_000_000,
            buy in any::<bool>(),
        ) {
            let fee = Decimal::new(fee_bps as i64, 4);
            let mut amm = pool(fee, fee);
            let before = amm.k().unwrap();
            let side = if buy { Side::Buy } else { Side::Sell };
            amm.execute_trade(side, Decimal::new(amount as i64, 3), 0).unwrap();
            prop_assert!(amm.k().unwrap() > before);
            prop_assert!(amm.reserve_x() > Decimal::ZERO);
            prop_assert!(amm.reserve_y() > Decimal::ZERO);
        }
    }
}
