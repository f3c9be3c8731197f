use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{SandboxError, StrategyError};

/// Sandbox fixed-point scale: WAD = 1e18 represents 1.0.
pub const WAD: u128 = 1_000_000_000_000_000_000;

/// Decimal places carried by a WAD word.
pub const WAD_DECIMALS: u32 = 18;

/// Upper bound for either fee leg (10%).
pub const MAX_FEE: Decimal = dec!(0.1);

// ─── Trade direction ──────────────────────────────────────────────────────────

/// Direction of a trade from the counterparty's point of view.
///
/// `Buy`: counterparty supplies Y and receives X (the pool outputs X, `ask_fee` applies).
/// `Sell`: counterparty supplies X and receives Y (the pool buys X, `bid_fee` applies).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

// ─── Fees ─────────────────────────────────────────────────────────────────────

/// Bid/ask fee fractions a strategy currently charges.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    pub bid_fee: Decimal,
    pub ask_fee: Decimal,
}

impl FeeQuote {
    pub fn new(bid_fee: Decimal, ask_fee: Decimal) -> Result<Self, StrategyError> {
        let quote = Self { bid_fee, ask_fee };
        quote.validate()?;
        Ok(quote)
    }

    pub fn symmetric(fee: Decimal) -> Result<Self, StrategyError> {
        Self::new(fee, fee)
    }

    /// Check both legs lie in `[0, MAX_FEE]`.
    pub fn validate(&self) -> Result<(), StrategyError> {
        for fee in [self.bid_fee, self.ask_fee] {
            if fee.is_sign_negative() || fee > MAX_FEE {
                return Err(StrategyError::FeeOutOfRange { fee, max: MAX_FEE });
            }
        }
        Ok(())
    }

    /// Fee charged on the input leg of a trade in `side`.
    #[inline]
    pub fn fee_for(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask_fee,
            Side::Sell => self.bid_fee,
        }
    }
}

// ─── Trade record ─────────────────────────────────────────────────────────────

/// One executed trade as reported to the pool's strategy.
///
/// `reserve_x` / `reserve_y` are the pool's reserves *before* the trade.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TradeInfo {
    pub side: Side,
    pub amount_x: Decimal,
    pub amount_y: Decimal,
    pub timestamp: u64,
    pub reserve_x: Decimal,
    pub reserve_y: Decimal,
}

// ─── WAD marshalling ──────────────────────────────────────────────────────────

/// Convert a non-negative decimal into a WAD word, truncating below 1e-18.
///
/// Whole and fractional parts are scaled separately so the full u128 range
/// (about 3.4e20 whole units) is reachable.
pub fn to_wad(field: &'static str, value: Decimal) -> Result<u128, StrategyError> {
    let err = || StrategyError::Marshal { field, value };
    if value.is_sign_negative() {
        return Err(err());
    }
    let whole = value.trunc().to_u128().ok_or_else(err)?;
    let frac = (value.fract() * Decimal::from(WAD as u64))
        .trunc()
        .to_u128()
        .ok_or_else(err)?;
    whole
        .checked_mul(WAD)
        .and_then(|scaled| scaled.checked_add(frac))
        .ok_or_else(err)
}

/// Convert a WAD word back into a decimal. Words beyond 28 significant
/// digits lose their lowest fractional digits.
pub fn from_wad(word: u128) -> Result<Decimal, SandboxError> {
    let malformed = || SandboxError::MalformedReturn(format!("word {word} does not fit a decimal"));
    let whole = Decimal::from_u128(word / WAD).ok_or_else(malformed)?;
    let frac = Decimal::from_i128_with_scale((word % WAD) as i128, WAD_DECIMALS);
    whole
        .checked_add(frac)
        .map(|d| d.normalize())
        .ok_or_else(malformed)
}
