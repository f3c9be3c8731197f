//! Closed-form arbitrage against a single pool.
//!
//! With fee-on-input and `γ = 1 − fee`, the trade that moves the pool's
//! fee-adjusted marginal price onto the fair price `p` is:
//!
//!   AMM sells X (p > spot, ask leg):  x_out = x − √(k / (γ·p)),  y_in = (√(γ·k·p) − y) / γ
//!   AMM buys X  (p < spot, bid leg):  x_in  = (√(k·γ / p) − x) / γ, y_out = y − √(k·p / γ)

use rust_decimal::{Decimal, MathematicalOps};
use serde::Serialize;
use tracing::debug;

use crate::amm::Amm;
use crate::error::AmmError;
use crate::types::{Side, TradeInfo};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbSide {
    /// Fair price above spot: the arbitrageur buys X from the pool.
    AmmSellsX,
    /// Fair price below spot: the arbitrageur sells X to the pool.
    AmmBuysX,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ArbOpportunity {
    pub side: ArbSide,
    /// X leaving (`AmmSellsX`) or entering (`AmmBuysX`) the pool.
    pub amount_x: Decimal,
    /// Y entering (`AmmSellsX`, gross of fee) or leaving (`AmmBuysX`) the pool.
    pub amount_y: Decimal,
    /// Expected profit in Y, valued at the fair price.
    pub profit: Decimal,
}

/// Risk-free trader that closes the gap between pool spot and fair price.
#[derive(Clone, Copy, Debug, Default)]
pub struct Arbitrageur {
    /// Opportunities must beat this profit (in Y) to be taken.
    pub min_profit: Decimal,
}

impl Arbitrageur {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_profit(min_profit: Decimal) -> Self {
        Self { min_profit }
    }

    pub fn find_arb_opportunity(&self, amm: &Amm, fair_price: Decimal) -> Option<ArbOpportunity> {
        if !amm.is_initialized() || fair_price <= Decimal::ZERO {
            return None;
        }
        let x = amm.reserve_x();
        let y = amm.reserve_y();
        // √k without forming k, so deep pools stay in range.
        let root_k = x.sqrt()?.checked_mul(y.sqrt()?)?;
        let spot = amm.spot_price()?;
        let fees = amm.fees();

        let opp = if fair_price > spot {
            let gamma = Decimal::ONE - fees.ask_fee;
            let root_gp = gamma.checked_mul(fair_price)?.sqrt()?;
            let amount_x = x - root_k.checked_div(root_gp)?;
            let amount_y = (root_k.checked_mul(root_gp)? - y) / gamma;
            ArbOpportunity {
                side: ArbSide::AmmSellsX,
                amount_x,
                amount_y,
                profit: amount_x.checked_mul(fair_price)? - amount_y,
            }
        } else if fair_price < spot {
            let gamma = Decimal::ONE - fees.bid_fee;
            let amount_x = (root_k.checked_mul(gamma.checked_div(fair_price)?.sqrt()?)? - x) / gamma;
            let amount_y = y - root_k.checked_mul(fair_price.checked_div(gamma)?.sqrt()?)?;
            ArbOpportunity {
                side: ArbSide::AmmBuysX,
                amount_x,
                amount_y,
                profit: amount_y - amount_x.checked_mul(fair_price)?,
            }
        } else {
            return None;
        };

        if opp.amount_x <= Decimal::ZERO
            || opp.amount_y <= Decimal::ZERO
            || opp.profit <= self.min_profit
        {
            return None;
        }
        Some(opp)
    }

    /// Take the opportunity, if any, through the pool's normal trade path.
    pub fn execute_arb(
        &self,
        amm: &mut Amm,
        fair_price: Decimal,
        timestamp: u64,
    ) -> Result<Option<TradeInfo>, AmmError> {
        let Some(opp) = self.find_arb_opportunity(amm, fair_price) else {
            return Ok(None);
        };
        debug!(
            pool = %amm.name(),
            side = ?opp.side,
            amount_x = %opp.amount_x,
            profit = %opp.profit,
            "arbitrage"
        );
        let trade = match opp.side {
            ArbSide::AmmSellsX => amm.execute_trade(Side::Buy, opp.amount_y, timestamp)?,
            ArbSide::AmmBuysX => amm.execute_trade(Side::Sell, opp.amount_x, timestamp)?,
        };
        Ok(Some(trade))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::FixedFeeStrategy;
    use rust_decimal_macros::dec;

    fn pool(bid: Decimal, ask: Decimal) -> Amm {
        let strategy = FixedFeeStrategy::new(bid, ask).unwrap();
        let mut amm = Amm::new("pool", Box::new(strategy), dec!(1000), dec!(1000)).unwrap();
        amm.initialize().unwrap();
        amm
    }

    #[test]
    fn inside_fee_band_no_opportunity() {
        let amm = pool(dec!(0.05), dec!(0.05));
        let arb = Arbitrageur::new();
        assert!(arb.find_arb_opportunity(&amm, dec!(1.02)).is_none());
        assert!(arb.find_arb_opportunity(&amm, dec!(0.98)).is_none());
        assert!(arb.find_arb_opportunity(&amm, dec!(1)).is_none());
    }

    #[test]
    fn asymmetric_fees_pick_the_right_leg() {
        // Cheap ask, expensive bid: a high fair price is exploitable, a low one is not.
        let amm = pool(dec!(0.08), dec!(0.001));
        let arb = Arbitrageur::new();
        let up = arb.find_arb_opportunity(&amm, dec!(1.05)).unwrap();
        assert_eq!(up.side, ArbSide::AmmSellsX);
        assert!(arb.find_arb_opportunity(&amm, dec!(0.95)).is_none());
    }

    #[test]
    fn execution_moves_spot_to_fee_adjusted_fair_price() {
        let mut amm = pool(dec!(0.003), dec!(0.003));
        let arb = Arbitrageur::new();
        let trade = arb.execute_arb(&mut amm, dec!(1.5), 0).unwrap().unwrap();
        assert_eq!(trade.side, Side::Buy);
        // The fee stays in the pool, so the post-trade marginal lands just above p.
        let marginal = amm.spot_price().unwrap() / (Decimal::ONE - dec!(0.003));
        assert!(marginal > dec!(1.5) && marginal < dec!(1.502), "marginal {marginal}");
        assert!(arb.find_arb_opportunity(&amm, dec!(1.5)).is_none());
    }

    #[test]
    fn deep_pool_is_still_arbitraged() {
        let strategy = FixedFeeStrategy::symmetric(dec!(0.003)).unwrap();
        let mut amm = Amm::new("deep", Box::new(strategy), dec!(100000000000000), dec!(10000000000000000)).unwrap();
        amm.initialize().unwrap();
        let arb = Arbitrageur::new();
        let opp = arb.find_arb_opportunity(&amm, dec!(110)).unwrap();
        assert_eq!(opp.side, ArbSide::AmmSellsX);
        arb.execute_arb(&mut amm, dec!(110), 0).unwrap().unwrap();
        assert!(arb.find_arb_opportunity(&amm, dec!(110)).is_none());
    }

    #[test]
    fn min_profit_filters_small_gaps() {
        let amm = pool(dec!(0.003), dec!(0.003));
        assert!(Arbitrageur::new().find_arb_opportunity(&amm, dec!(1.01)).is_some());
        assert!(Arbitrageur::with_min_profit(dec!(100))
            .find_arb_opportunity(&amm, dec!(1.01))
            .is_none());
    }

    #[test]
    fn no_opportunity_is_a_no_op() {
        let mut amm = pool(dec!(0.003), dec!(0.003));
        assert!(Arbitrageur::new().execute_arb(&mut amm, dec!(1), 0).unwrap().is_none());
        assert_eq!(amm.reserve_x(), dec!(1000));
    }
}
