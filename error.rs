use rust_decimal::Decimal;
use thiserror::Error;

use crate::types::Side;

/// Failures loading validator rule tables or simulation configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("invalid pattern for rule '{rule}': {source}")]
    Pattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to read config file: {0}")]
    ReadFile(#[source] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),
}

/// A sandboxed call that did not produce a usable result.
///
/// Every variant is deterministic for a given artifact, storage image and
/// argument list, so none of them is worth retrying.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("execution reverted at pc {pc}")]
    Revert { pc: usize },

    #[error("instruction budget of {limit} exhausted")]
    OutOfBudget { limit: u32 },

    #[error("stack underflow at pc {pc}")]
    StackUnderflow { pc: usize },

    #[error("stack overflow at pc {pc}")]
    StackOverflow { pc: usize },

    #[error("arithmetic fault at pc {pc}")]
    Arithmetic { pc: usize },

    #[error("invalid opcode 0x{opcode:02x} at pc {pc}")]
    InvalidOpcode { opcode: u8, pc: usize },

    #[error("jump to invalid target {target}")]
    InvalidJump { target: usize },

    #[error("storage slot {slot} out of range")]
    SlotOutOfRange { slot: u8 },

    #[error("argument {index} out of range")]
    ArgOutOfRange { index: u8 },

    #[error("storage write inside read-only call")]
    StaticWrite,

    #[error("malformed return: {0}")]
    MalformedReturn(String),

    #[error("no entry point for selector 0x{selector}")]
    UnknownSelector { selector: String },

    #[error("invalid bytecode: {0}")]
    BadBytecode(String),
}

/// Errors surfaced through the strategy calling convention.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StrategyError {
    #[error("sandbox call '{entry}' failed: {source}")]
    Execution {
        entry: &'static str,
        #[source]
        source: SandboxError,
    },

    #[error("strategy instance is terminated after an earlier failure; reset() required")]
    Terminated,

    #[error("cannot marshal {field} = {value} into the sandbox word format")]
    Marshal { field: &'static str, value: Decimal },

    #[error("fee {fee} outside [0, {max}]")]
    FeeOutOfRange { fee: Decimal, max: Decimal },

    #[error("artifact ABI is missing required function '{0}'")]
    MissingFunction(&'static str),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("line {line}: {reason}")]
    Assemble { line: usize, reason: String },

    #[error("undefined label '{0}'")]
    UndefinedLabel(String),

    #[error("malformed ABI descriptor: {0}")]
    Abi(#[source] serde_json::Error),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

/// AMM precondition violations. Pool state is untouched whenever one of
/// these is returned.
#[derive(Error, Debug)]
pub enum AmmError {
    #[error("pool '{0}' is not initialized")]
    NotInitialized(String),

    #[error("pool '{0}' is already initialized")]
    AlreadyInitialized(String),

    #[error("reserves must be positive (x = {reserve_x}, y = {reserve_y})")]
    InvalidReserves { reserve_x: Decimal, reserve_y: Decimal },

    #[error("trade amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error("{side:?} trade would pay out {output} against reserve {reserve}")]
    InsufficientLiquidity {
        side: Side,
        output: Decimal,
        reserve: Decimal,
    },

    #[error("invariant decreased: input reserve grew {input_growth}x, output reserve shrank {output_shrink}x")]
    InvariantViolation {
        input_growth: Decimal,
        output_shrink: Decimal,
    },

    #[error("arithmetic overflow while pricing trade")]
    Overflow,

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

#[derive(Error, Debug)]
pub enum MarketError {
    #[error("invalid market parameter {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("simulation needs at least one strategy")]
    NoStrategies,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Market(#[from] MarketError),

    #[error(transparent)]
    Amm(#[from] AmmError),

    #[error("pool '{pool}' stopped at step {step}: {source}")]
    StrategyFailed {
        pool: String,
        step: u64,
        #[source]
        source: StrategyError,
    },
}
