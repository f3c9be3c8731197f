//! Compiled strategy artifacts and the process-wide artifact cache.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::{Lazy, OnceCell};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use tracing::{debug, info};

use crate::error::ArtifactError;
use crate::sandbox::{selector, Program, Selector};

// ─── ABI descriptor ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbiParam {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbiFunction {
    /// `"function"` or `"constructor"`.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub inputs: Vec<AbiParam>,
    #[serde(default)]
    pub outputs: Vec<AbiParam>,
    #[serde(default = "default_mutability")]
    pub state_mutability: String,
}

fn default_mutability() -> String {
    "nonpayable".into()
}

impl AbiFunction {
    /// Canonical signature, e.g. `afterInitialize(uint256,uint256)`.
    pub fn signature(&self) -> String {
        let name = if self.kind == "constructor" { "constructor" } else { self.name.as_str() };
        let types: Vec<&str> = self.inputs.iter().map(|p| p.ty.as_str()).collect();
        format!("{name}({})", types.join(","))
    }

    pub fn selector(&self) -> Selector {
        selector(&self.signature())
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self.state_mutability.as_str(), "view" | "pure")
    }
}

/// Solidity-style interface descriptor of an artifact.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Abi(pub Vec<AbiFunction>);

impl Abi {
    pub fn from_json(raw: &str) -> Result<Self, ArtifactError> {
        serde_json::from_str(raw).map_err(ArtifactError::Abi)
    }

    pub fn to_json(&self) -> Result<String, ArtifactError> {
        serde_json::to_string_pretty(self).map_err(ArtifactError::Abi)
    }

    pub fn function(&self, name: &str) -> Option<&AbiFunction> {
        self.0.iter().find(|f| f.kind == "function" && f.name == name)
    }

    pub fn constructor(&self) -> Option<&AbiFunction> {
        self.0.iter().find(|f| f.kind == "constructor")
    }
}

// ─── Artifact ─────────────────────────────────────────────────────────────────

/// Immutable `(bytecode, ABI)` pair with its decoded program.
#[derive(Debug)]
pub struct CompiledArtifact {
    bytecode: Vec<u8>,
    abi: Abi,
    program: Program,
}

impl CompiledArtifact {
    pub fn new(bytecode: Vec<u8>, abi: Abi) -> Result<Self, ArtifactError> {
        let program = Program::decode(&bytecode)?;
        Ok(Self {
            bytecode,
            abi,
            program,
        })
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    pub fn program(&self) -> &Program {
        &self.program
    }
}

/// Turns strategy source into an artifact.
pub trait ArtifactCompiler: Sync {
    fn compile(&self, source: &str) -> Result<CompiledArtifact, ArtifactError>;
}

// ─── Cache ────────────────────────────────────────────────────────────────────

pub type ContentHash = [u8; 32];

pub fn content_hash(source: &str) -> ContentHash {
    Keccak256::digest(source.as_bytes()).into()
}

type Slot = Arc<OnceCell<Arc<CompiledArtifact>>>;

/// Content-addressed artifact cache. Each distinct source is compiled at most
/// once, even when several threads ask for it at the same time; entries are
/// never evicted.
#[derive(Default)]
pub struct ArtifactCache {
    entries: DashMap<ContentHash, Slot>,
    compiles: AtomicUsize,
}

static GLOBAL: Lazy<ArtifactCache> = Lazy::new(ArtifactCache::new);

impl ArtifactCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cache.
    pub fn global() -> &'static ArtifactCache {
        &GLOBAL
    }

    pub fn get_or_compile(
        &self,
        source: &str,
        compiler: &dyn ArtifactCompiler,
    ) -> Result<Arc<CompiledArtifact>, ArtifactError> {
        let key = content_hash(source);
        // Clone the slot out so the shard lock is released before compiling.
        let slot: Slot = Arc::clone(&self.entries.entry(key).or_default());

        if let Some(hit) = slot.get() {
            debug!(hash = %hex::encode(&key[..8]), "artifact cache hit");
            return Ok(Arc::clone(hit));
        }

        slot.get_or_try_init(|| {
            self.compiles.fetch_add(1, Ordering::Relaxed);
            info!(hash = %hex::encode(&key[..8]), "compiling strategy artifact");
            compiler.compile(source).map(Arc::new)
        })
        .cloned()
    }

    /// Number of compilations performed so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::AsmCompiler;
    use crate::baseline::VANILLA_SOURCE;
    use std::thread;
    use std::time::Duration;

    struct CountingCompiler {
        calls: AtomicUsize,
    }

    impl ArtifactCompiler for CountingCompiler {
        fn compile(&self, source: &str) -> Result<CompiledArtifact, ArtifactError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            AsmCompiler.compile(source)
        }
    }

    #[test]
    fn abi_round_trips_through_json() {
        let artifact = AsmCompiler.compile(VANILLA_SOURCE).unwrap();
        let json = artifact.abi().to_json().unwrap();
        assert!(json.contains("\"stateMutability\": \"view\""));
        assert_eq!(&Abi::from_json(&json).unwrap(), artifact.abi());
    }

    #[test]
    fn signature_uses_input_types_only() {
        let artifact = AsmCompiler.compile(VANILLA_SOURCE).unwrap();
        let f = artifact.abi().function("afterInitialize").unwrap();
        assert_eq!(f.signature(), "afterInitialize(uint256,uint256)");
    }

    #[test]
    fn cache_returns_shared_artifact() {
        let cache = ArtifactCache::new();
        let a = cache.get_or_compile(VANILLA_SOURCE, &AsmCompiler).unwrap();
        let b = cache.get_or_compile(VANILLA_SOURCE, &AsmCompiler).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.compile_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn concurrent_first_use_compiles_once() {
        let cache = ArtifactCache::new();
        let compiler = CountingCompiler {
            calls: AtomicUsize::new(0),
        };
        let results: Vec<Arc<CompiledArtifact>> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| cache.get_or_compile(VANILLA_SOURCE, &compiler).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(compiler.calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn failed_compilation_is_not_cached() {
        let cache = ArtifactCache::new();
        assert!(cache.get_or_compile("bogus instruction", &AsmCompiler).is_err());
        assert!(cache.is_empty());
        assert!(cache.get_or_compile("bogus instruction", &AsmCompiler).is_err());
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn distinct_sources_get_distinct_entries() {
        let cache = ArtifactCache::new();
        let other = VANILLA_SOURCE.replace("Vanilla_30bps", "Vanilla_copy");
        let a = cache.get_or_compile(VANILLA_SOURCE, &AsmCompiler).unwrap();
        let b = cache.get_or_compile(&other, &AsmCompiler).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);
    }
}
