//! Ordered symbol resolution.
//!
//! The linker consults a [`SymbolResolver`] for every reference an object
//! makes but does not define. The resolver is a fixed list of tiers tried in
//! order; the first tier that knows the name wins:
//!
//! 1. host-registered global mappings,
//! 2. exports of previously linked modules (newest first),
//! 3. symbols the dynamic linker can see in the running process.
//!
//! Definitions inside the object being linked are handled by the linker
//! before the resolver is asked at all.

use std::sync::{Arc, RwLock};

use crate::mangle::{CanonicalName, Mangler};
use crate::symbols::{EmittedSymbols, GlobalSymbolTable};
use crate::types::{ResolvedSymbol, SymbolFlags};

/// One resolution strategy.
pub trait SymbolLookup: Send + Sync {
    /// Short name used in logs and by [`SymbolResolver::tier_names`].
    fn tier_name(&self) -> &'static str;

    /// Look up a canonical name, returning `None` when this tier does not
    /// know it.
    fn lookup(&self, name: &CanonicalName) -> Option<ResolvedSymbol>;
}

/// Tier 1: addresses registered through `add_global_mapping`.
#[derive(Debug, Clone)]
pub struct HostGlobals {
    table: Arc<RwLock<GlobalSymbolTable>>,
}

impl HostGlobals {
    pub fn new(table: Arc<RwLock<GlobalSymbolTable>>) -> Self {
        Self { table }
    }
}

impl SymbolLookup for HostGlobals {
    fn tier_name(&self) -> &'static str {
        "host-globals"
    }

    fn lookup(&self, name: &CanonicalName) -> Option<ResolvedSymbol> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let table = self.table.read().unwrap();
        table
            .get(name.as_str())
            .map(|address| ResolvedSymbol::new(address, SymbolFlags::HOST))
    }
}

/// Tier 2: exported definitions of previously linked objects.
#[derive(Debug, Clone)]
pub struct EmittedExports {
    symbols: Arc<RwLock<EmittedSymbols>>,
}

impl EmittedExports {
    pub fn new(symbols: Arc<RwLock<EmittedSymbols>>) -> Self {
        Self { symbols }
    }
}

impl SymbolLookup for EmittedExports {
    fn tier_name(&self) -> &'static str {
        "emitted-modules"
    }

    fn lookup(&self, name: &CanonicalName) -> Option<ResolvedSymbol> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let symbols = self.symbols.read().unwrap();
        symbols.lookup_exported(name.as_str())
    }
}

/// Tier 3: symbols the dynamic linker resolves in the current process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessSymbols {
    mangler: Mangler,
}

impl ProcessSymbols {
    pub fn new(mangler: Mangler) -> Self {
        Self { mangler }
    }
}

impl SymbolLookup for ProcessSymbols {
    fn tier_name(&self) -> &'static str {
        "process"
    }

    fn lookup(&self, name: &CanonicalName) -> Option<ResolvedSymbol> {
        let address = process_symbol_address(self.mangler.process_name(name))?;
        Some(ResolvedSymbol::new(address, SymbolFlags::HOST))
    }
}

#[cfg(unix)]
fn process_symbol_address(name: &str) -> Option<u64> {
    let name = std::ffi::CString::new(name).ok()?;
    // SAFETY: `name` is a valid NUL-terminated string and RTLD_DEFAULT searches
    // the global scope of the process without loading anything.
    #[expect(unsafe_code)]
    let ptr = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if ptr.is_null() {
        return None;
    }
    u64::try_from(ptr.expose_provenance()).ok()
}

#[cfg(not(unix))]
fn process_symbol_address(_name: &str) -> Option<u64> {
    None
}

/// An ordered chain of [`SymbolLookup`] tiers.
#[derive(Default)]
pub struct SymbolResolver {
    tiers: Vec<Box<dyn SymbolLookup>>,
}

impl SymbolResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a tier; it is consulted after all tiers added before it.
    pub fn with_tier(mut self, tier: impl SymbolLookup + 'static) -> Self {
        self.tiers.push(Box::new(tier));
        self
    }

    /// Resolve a canonical name through the tiers in order.
    pub fn resolve(&self, name: &CanonicalName) -> Option<ResolvedSymbol> {
        self.resolve_with_tier(name).map(|(_, symbol)| symbol)
    }

    /// Like [`resolve`](Self::resolve), also reporting which tier answered.
    pub fn resolve_with_tier(&self, name: &CanonicalName) -> Option<(&'static str, ResolvedSymbol)> {
        self.tiers.iter().find_map(|tier| {
            let symbol = tier.lookup(name)?;
            tracing::trace!(
                symbol = %name,
                tier = tier.tier_name(),
                address = format_args!("{:#x}", symbol.address),
                "Resolved symbol"
            );
            Some((tier.tier_name(), symbol))
        })
    }

    /// Names of the tiers in consultation order.
    pub fn tier_names(&self) -> Vec<&'static str> {
        self.tiers.iter().map(|t| t.tier_name()).collect()
    }
}

impl std::fmt::Debug for SymbolResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymbolResolver")
            .field("tiers", &self.tier_names())
            .finish()
    }
}
