//! Built-in vanilla strategy used as the benchmark opponent.

use std::sync::Arc;

use crate::adapter::SandboxStrategy;
use crate::artifact::{ArtifactCache, CompiledArtifact};
use crate::asm::AsmCompiler;
use crate::error::ArtifactError;

/// Assembly for the 30 bps constant-fee strategy.
pub const VANILLA_SOURCE: &str = include_str!("strategies/vanilla.asm");

/// Vanilla artifact, compiled once per process.
pub fn vanilla_artifact() -> Result<Arc<CompiledArtifact>, ArtifactError> {
    ArtifactCache::global().get_or_compile(VANILLA_SOURCE, &AsmCompiler)
}

/// Fresh vanilla instance with its own storage.
pub fn load_vanilla_strategy() -> Result<SandboxStrategy, ArtifactError> {
    Ok(SandboxStrategy::new(vanilla_artifact()?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::Strategy;
    use crate::types::{Side, TradeInfo};
    use rust_decimal_macros::dec;

    #[test]
    fn artifact_is_compiled_once() {
        let a = vanilla_artifact().unwrap();
        let b = vanilla_artifact().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!a.bytecode().is_empty());
        for name in ["afterInitialize", "afterSwap", "getName"] {
            assert!(a.abi().function(name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn quotes_thirty_bps() {
        let mut s = load_vanilla_strategy().unwrap();
        assert_eq!(s.name(), "Vanilla_30bps");

        let q = s.after_initialize(dec!(100), dec!(10000)).unwrap();
        assert_eq!((q.bid_fee, q.ask_fee), (dec!(0.003), dec!(0.003)));

        let trade = TradeInfo {
            side: Side::Buy,
            amount_x: dec!(10),
            amount_y: dec!(900),
            timestamp: 1,
            reserve_x: dec!(110),
            reserve_y: dec!(9100),
        };
        let q = s.after_swap(&trade).unwrap();
        assert_eq!((q.bid_fee, q.ask_fee), (dec!(0.003), dec!(0.003)));
    }

    #[test]
    fn deep_pools_marshal_into_the_sandbox() {
        let mut s = load_vanilla_strategy().unwrap();
        let q = s.after_initialize(dec!(100000000000), dec!(250000000000000)).unwrap();
        assert_eq!((q.bid_fee, q.ask_fee), (dec!(0.003), dec!(0.003)));

        let trade = TradeInfo {
            side: Side::Sell,
            amount_x: dec!(5000000000),
            amount_y: dec!(11904761904761.904761),
            timestamp: 2,
            reserve_x: dec!(100000000000),
            reserve_y: dec!(250000000000000),
        };
        let q = s.after_swap(&trade).unwrap();
        assert_eq!(q.ask_fee, dec!(0.003));
    }

    #[test]
    fn fresh_instances_share_the_artifact() {
        let a = load_vanilla_strategy().unwrap();
        let b = load_vanilla_strategy().unwrap();
        assert_ne!(a, b);
        assert!(Arc::ptr_eq(a.artifact(), b.artifact()));
    }

    #[test]
    fn reset_then_reinitialize() {
        let mut s = load_vanilla_strategy().unwrap();
        s.after_initialize(dec!(100), dec!(10000)).unwrap();
        s.reset().unwrap();
        let q = s.after_initialize(dec!(100), dec!(10000)).unwrap();
        assert_eq!(q.bid_fee, dec!(0.003));
    }
}
