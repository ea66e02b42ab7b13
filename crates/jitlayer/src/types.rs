//! Core data types shared across the JIT layer.
//!
//! Configuration, identifiers, symbol metadata and the atomic metrics
//! counters. Nothing in here owns executable memory.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// A runtime address inside the host process.
pub type Address = u64;

/// Configuration for the JIT engine.
#[derive(Debug, Clone)]
pub struct JitConfig {
    /// Abort the process when lowering a module fails. When false the
    /// failure is returned to the caller as [`JitError::Compilation`].
    ///
    /// [`JitError::Compilation`]: crate::JitError::Compilation
    pub abort_on_compile_failure: bool,
    /// Abort the process when code memory cannot be obtained.
    pub abort_on_allocation_failure: bool,
    /// Register every loaded object with the process-wide debugger list.
    pub register_with_debugger: bool,
    /// Consult the dynamic linker (`dlsym`) as the last resolution tier.
    pub resolve_process_symbols: bool,
    /// Log a warning when a module export shadows an earlier module's export.
    pub warn_on_redefinition: bool,
    /// Route every external call through a stub, even when the target is
    /// within direct branch range.
    pub always_emit_stubs: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            abort_on_compile_failure: true,
            abort_on_allocation_failure: true,
            register_with_debugger: true,
            resolve_process_symbols: true,
            warn_on_redefinition: true,
            always_emit_stubs: false,
        }
    }
}

/// Opaque token identifying everything produced by one `add_module` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleHandle(pub(crate) u64);

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifier of a code object retained by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeObjectId(pub(crate) u64);

impl fmt::Display for CodeObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

/// Properties of a symbol defined by a linked object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolFlags {
    /// Visible to other modules (default or protected visibility).
    pub exported: bool,
    /// Points at code rather than data.
    pub callable: bool,
    /// Weak binding.
    pub weak: bool,
}

impl SymbolFlags {
    /// Flags for an address registered by the host or found in the process.
    pub const HOST: Self = Self {
        exported: true,
        callable: false,
        weak: false,
    };
}

/// A symbol that a resolution tier found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub address: Address,
    pub flags: SymbolFlags,
}

impl ResolvedSymbol {
    pub fn new(address: Address, flags: SymbolFlags) -> Self {
        Self { address, flags }
    }
}

/// Atomic counters for JIT lifecycle events.
#[derive(Debug)]
pub struct JitMetrics {
    /// Modules successfully added.
    pub modules_added: AtomicU64,
    /// Modules removed.
    pub modules_removed: AtomicU64,
    /// `add_module` calls that failed during linking.
    pub link_failures: AtomicU64,
    /// Objects registered with the debugger list.
    pub debug_registrations: AtomicU64,
    /// Objects kept as a verbatim copy because no debug image could be built.
    pub debug_fallbacks: AtomicU64,
    /// Call stubs emitted for out-of-range branches.
    pub stubs_emitted: AtomicU64,
    /// Exports that shadowed an earlier module's definition.
    pub redefinitions: AtomicU64,
}

impl JitMetrics {
    /// Create a new metrics instance with all counters at zero.
    pub fn new() -> Self {
        Self {
            modules_added: AtomicU64::new(0),
            modules_removed: AtomicU64::new(0),
            link_failures: AtomicU64::new(0),
            debug_registrations: AtomicU64::new(0),
            debug_fallbacks: AtomicU64::new(0),
            stubs_emitted: AtomicU64::new(0),
            redefinitions: AtomicU64::new(0),
        }
    }

    /// Reset all counters to zero.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn reset(&self) {
        self.modules_added.store(0, Ordering::Relaxed);
        self.modules_removed.store(0, Ordering::Relaxed);
        self.link_failures.store(0, Ordering::Relaxed);
        self.debug_registrations.store(0, Ordering::Relaxed);
        self.debug_fallbacks.store(0, Ordering::Relaxed);
        self.stubs_emitted.store(0, Ordering::Relaxed);
        self.redefinitions.store(0, Ordering::Relaxed);
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            modules_added: self.modules_added.load(Ordering::Relaxed),
            modules_removed: self.modules_removed.load(Ordering::Relaxed),
            link_failures: self.link_failures.load(Ordering::Relaxed),
            debug_registrations: self.debug_registrations.load(Ordering::Relaxed),
            debug_fallbacks: self.debug_fallbacks.load(Ordering::Relaxed),
            stubs_emitted: self.stubs_emitted.load(Ordering::Relaxed),
            redefinitions: self.redefinitions.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for JitMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`JitMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub modules_added: u64,
    pub modules_removed: u64,
    pub link_failures: u64,
    pub debug_registrations: u64,
    pub debug_fallbacks: u64,
    pub stubs_emitted: u64,
    pub redefinitions: u64,
}
