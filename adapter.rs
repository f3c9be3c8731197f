//! Sandboxed strategies: a shared [`CompiledArtifact`] plus private storage,
//! exposed through the [`Strategy`] calling convention.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::artifact::{Abi, CompiledArtifact};
use crate::error::{ArtifactError, SandboxError, StrategyError};
use crate::sandbox::{execute, CallMode, Output, Selector, Storage, SLOT_COUNT};
use crate::strategy::Strategy;
use crate::types::{from_wad, to_wad, FeeQuote, Side, TradeInfo};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Selectors of the three required entry points, resolved from the ABI.
#[derive(Clone, Copy, Debug)]
struct EntryPoints {
    after_initialize: Selector,
    after_swap: Selector,
    get_name: Selector,
}

impl EntryPoints {
    fn resolve(abi: &Abi) -> Result<Self, StrategyError> {
        let find = |name: &'static str| {
            abi.function(name)
                .map(|f| f.selector())
                .ok_or(StrategyError::MissingFunction(name))
        };
        Ok(Self {
            after_initialize: find("afterInitialize")?,
            after_swap: find("afterSwap")?,
            get_name: find("getName")?,
        })
    }
}

/// One isolated strategy instance.
///
/// Instances built from the same artifact share its bytecode but never its
/// storage. Equality is identity: two instances are equal only if they are
/// the same instance, whatever their names.
pub struct SandboxStrategy {
    id: u64,
    artifact: Arc<CompiledArtifact>,
    entries: EntryPoints,
    storage: Storage,
    /// Storage right after the constructor ran; `reset` restores it.
    genesis: Storage,
    name: String,
    failed: bool,
}

impl SandboxStrategy {
    pub fn new(artifact: Arc<CompiledArtifact>) -> Result<Self, StrategyError> {
        Self::deploy(artifact, None)
    }

    /// Like [`SandboxStrategy::new`] but reports `display_name` instead of
    /// the name the strategy returns.
    pub fn with_display_name(
        artifact: Arc<CompiledArtifact>,
        display_name: impl Into<String>,
    ) -> Result<Self, StrategyError> {
        Self::deploy(artifact, Some(display_name.into()))
    }

    /// Build directly from raw bytecode and an ABI descriptor.
    pub fn from_parts(
        bytecode: Vec<u8>,
        abi: Abi,
        display_name: Option<String>,
    ) -> Result<Self, ArtifactError> {
        let artifact = Arc::new(CompiledArtifact::new(bytecode, abi)?);
        Ok(Self::deploy(artifact, display_name)?)
    }

    fn deploy(
        artifact: Arc<CompiledArtifact>,
        display_name: Option<String>,
    ) -> Result<Self, StrategyError> {
        let entries = EntryPoints::resolve(artifact.abi())?;

        let mut genesis: Storage = [0; SLOT_COUNT];
        if let Some(ctor) = artifact.abi().constructor() {
            execute(
                artifact.program(),
                &mut genesis,
                &ctor.selector(),
                &[],
                CallMode::Mutating,
            )
            .map_err(|source| StrategyError::Execution {
                entry: "constructor",
                source,
            })?;
        }

        let name = match display_name {
            Some(name) => name,
            None => read_name(&artifact, &entries.get_name, &genesis)?,
        };

        let id = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        debug!(id, name = %name, "deployed sandbox strategy");

        Ok(Self {
            id,
            artifact,
            entries,
            storage: genesis,
            genesis,
            name,
            failed: false,
        })
    }

    /// Process-unique instance id.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn artifact(&self) -> &Arc<CompiledArtifact> {
        &self.artifact
    }

    /// Whether an earlier call failed; the instance refuses work until reset.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn call_for_quote(
        &mut self,
        entry: &'static str,
        sel: Selector,
        args: &[u128],
    ) -> Result<FeeQuote, StrategyError> {
        if self.failed {
            return Err(StrategyError::Terminated);
        }
        let result = execute(
            self.artifact.program(),
            &mut self.storage,
            &sel,
            args,
            CallMode::Mutating,
        )
        .and_then(decode_quote)
        .map_err(|source| StrategyError::Execution { entry, source })
        .and_then(|quote| quote.validate().map(|_| quote));

        if let Err(err) = &result {
            warn!(strategy = %self.name, id = self.id, error = %err, "strategy call failed");
            self.failed = true;
        }
        result
    }
}

fn read_name(
    artifact: &CompiledArtifact,
    sel: &Selector,
    storage: &Storage,
) -> Result<String, StrategyError> {
    let fail = |source| StrategyError::Execution {
        entry: "getName",
        source,
    };
    let mut scratch = *storage;
    match execute(artifact.program(), &mut scratch, sel, &[], CallMode::ReadOnly).map_err(fail)? {
        Output::Bytes(raw) => String::from_utf8(raw)
            .map_err(|_| fail(SandboxError::MalformedReturn("name is not valid UTF-8".into()))),
        other => Err(fail(SandboxError::MalformedReturn(format!(
            "expected a string, got {other:?}"
        )))),
    }
}

fn decode_quote(out: Output) -> Result<FeeQuote, SandboxError> {
    match out {
        Output::Words(words) if words.len() == 2 => Ok(FeeQuote {
            bid_fee: from_wad(words[0])?,
            ask_fee: from_wad(words[1])?,
        }),
        other => Err(SandboxError::MalformedReturn(format!(
            "expected (bidFee, askFee), got {other:?}"
        ))),
    }
}

impl Strategy for SandboxStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn after_initialize(
        &mut self,
        initial_x: Decimal,
        initial_y: Decimal,
    ) -> Result<FeeQuote, StrategyError> {
        let args = [to_wad("initial_x", initial_x)?, to_wad("initial_y", initial_y)?];
        self.call_for_quote("afterInitialize", self.entries.after_initialize, &args)
    }

    fn after_swap(&mut self, trade: &TradeInfo) -> Result<FeeQuote, StrategyError> {
        let args = [
            u128::from(trade.side == Side::Buy),
            to_wad("amount_x", trade.amount_x)?,
            to_wad("amount_y", trade.amount_y)?,
            u128::from(trade.timestamp),
            to_wad("reserve_x", trade.reserve_x)?,
            to_wad("reserve_y", trade.reserve_y)?,
        ];
        self.call_for_quote("afterSwap", self.entries.after_swap, &args)
    }

    fn reset(&mut self) -> Result<(), StrategyError> {
        self.storage = self.genesis;
        self.failed = false;
        Ok(())
    }
}

impl PartialEq for SandboxStrategy {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SandboxStrategy {}

impl std::fmt::Debug for SandboxStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxStrategy")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("failed", &self.failed)
            .finish()
    }
}
