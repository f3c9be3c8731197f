//! N-way order splitting across constant-product pools.
//!
//! Uses the equimarginal principle: at the optimum, every pool that receives
//! flow has the same marginal output per unit input. For pool i with input
//! reserve r, invariant k and γ = 1 − fee, marginal output at allocation Δ is
//! γ·k / (r + γ·Δ)². Writing s = 1/√λ for the shadow price gives
//!
//!   Δᵢ(s) = (√(γᵢ·kᵢ)·s − rᵢ) / γᵢ,   active once s > tᵢ = rᵢ / √(γᵢ·kᵢ)
//!
//! so the allocation is solved exactly by adding pools in order of tᵢ.

use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};
use tracing::trace;

use crate::amm::Amm;
use crate::error::AmmError;
use crate::types::{Side, TradeInfo, WAD_DECIMALS};

struct Venue {
    index: usize,
    reserve_in: Decimal,
    gamma: Decimal,
    /// √(γ·k)
    root_gk: Decimal,
    /// Shadow price at which the venue starts receiving flow.
    threshold: Decimal,
}

fn venue(index: usize, amm: &Amm, side: Side) -> Option<Venue> {
    if !amm.is_initialized() {
        return None;
    }
    let gamma = Decimal::ONE - amm.fees().fee_for(side);
    if gamma <= Decimal::ZERO {
        return None;
    }
    let reserve_in = match side {
        Side::Buy => amm.reserve_y(),
        Side::Sell => amm.reserve_x(),
    };
    let root_gk = gamma
        .checked_mul(amm.reserve_x())?
        .sqrt()?
        .checked_mul(amm.reserve_y().sqrt()?)?;
    if root_gk <= Decimal::ZERO {
        return None;
    }
    Some(Venue {
        index,
        reserve_in,
        gamma,
        root_gk,
        threshold: reserve_in / root_gk,
    })
}

fn truncate(d: Decimal) -> Decimal {
    d.round_dp_with_strategy(WAD_DECIMALS, RoundingStrategy::ToZero)
}

fn compute_split(amms: &[Amm], side: Side, total: Decimal) -> Vec<Decimal> {
    let mut allocation = vec![Decimal::ZERO; amms.len()];
    if total <= Decimal::ZERO {
        return allocation;
    }

    let mut venues: Vec<Venue> = amms
        .iter()
        .enumerate()
        .filter_map(|(i, amm)| venue(i, amm, side))
        .collect();
    if venues.is_empty() {
        return allocation;
    }
    venues.sort_by(|a, b| a.threshold.cmp(&b.threshold));

    // Grow the active set until the shadow price no longer reaches the next venue.
    let mut sum_r = Decimal::ZERO;
    let mut sum_root = Decimal::ZERO;
    let mut shadow = Decimal::ZERO;
    let mut active = 0;
    for (m, v) in venues.iter().enumerate() {
        sum_r += v.reserve_in / v.gamma;
        sum_root += v.root_gk / v.gamma;
        shadow = (total + sum_r) / sum_root;
        active = m + 1;
        if venues.get(m + 1).map_or(true, |next| shadow <= next.threshold) {
            break;
        }
    }

    for v in &venues[..active] {
        let d = (v.root_gk * shadow - v.reserve_in) / v.gamma;
        allocation[v.index] = truncate(d.max(Decimal::ZERO));
    }

    // Spread the rounding remainder so the allocations sum to `total` exactly.
    let remainder = total - allocation.iter().copied().sum::<Decimal>();
    if !remainder.is_zero() {
        let share = truncate(remainder / Decimal::from(active));
        for v in &venues[..active] {
            allocation[v.index] += share;
        }
        let leftover = remainder - share * Decimal::from(active);
        if let Some(largest) = (0..allocation.len()).max_by_key(|&i| allocation[i]) {
            allocation[largest] += leftover;
        }
    }

    trace!(?side, %total, active, "computed split");
    allocation
}

/// Split `total_y` of Y across `amms` (buying X). The result is aligned with
/// `amms`; an all-zero vector means no pool could take the order.
pub fn compute_optimal_split_buy(amms: &[Amm], total_y: Decimal) -> Vec<Decimal> {
    compute_split(amms, Side::Buy, total_y)
}

/// Split `total_x` of X across `amms` (selling X).
pub fn compute_optimal_split_sell(amms: &[Amm], total_x: Decimal) -> Vec<Decimal> {
    compute_split(amms, Side::Sell, total_x)
}

fn execute_split(
    amms: &mut [Amm],
    side: Side,
    total: Decimal,
    timestamp: u64,
) -> Result<Vec<TradeInfo>, AmmError> {
    let allocation = compute_split(amms, side, total);
    let mut trades = Vec::new();
    for (amm, amount) in amms.iter_mut().zip(allocation) {
        if amount > Decimal::ZERO {
            trades.push(amm.execute_trade(side, amount, timestamp)?);
        }
    }
    Ok(trades)
}

/// Route a Y-denominated buy through each pool's `execute_trade`. Stops at
/// the first rejected leg; legs already filled stay filled.
pub fn execute_split_buy(
    amms: &mut [Amm],
    total_y: Decimal,
    timestamp: u64,
) -> Result<Vec<TradeInfo>, AmmError> {
    execute_split(amms, Side::Buy, total_y, timestamp)
}

pub fn execute_split_sell(
    amms: &mut [Amm],
    total_x: Decimal,
    timestamp: u64,
) -> Result<Vec<TradeInfo>, AmmError> {
    execute_split(amms, Side::Sell, total_x, timestamp)
}
