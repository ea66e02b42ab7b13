//! Error types for the JIT layer.

use crate::types::ModuleHandle;

/// Errors that can occur while compiling, linking or unloading a module.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// The lowering collaborator failed to produce an object image.
    #[error("compilation failed: {0}")]
    Compilation(String),

    /// The lowering backend could not be initialized for the host target.
    #[error("backend error: {0}")]
    Backend(String),

    /// A reference made by the module was not found at any resolution tier.
    #[error("unresolved symbol `{name}` while linking `{module}`")]
    UnresolvedSymbol {
        /// Canonical (mangled) name of the missing symbol.
        name: String,
        /// Display name of the module being linked.
        module: String,
    },

    /// Memory for a code object or debug record could not be obtained.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// An image could not be announced to the debugger. The module itself
    /// is unaffected.
    #[error("debugger registration failed: {0}")]
    DebugRegistration(String),

    /// `remove_module` was given a handle that is not currently tracked.
    #[error("unknown module handle {0}")]
    UnknownHandle(ModuleHandle),

    /// The object image is malformed.
    #[error("invalid object `{module}`: {reason}")]
    InvalidObject {
        /// Display name of the object.
        module: String,
        /// What the parser rejected.
        reason: String,
    },

    /// The object is well-formed but uses a format or architecture the
    /// linker does not load.
    #[error("unsupported object `{module}`: {reason}")]
    UnsupportedObject {
        /// Display name of the object.
        module: String,
        /// Format or architecture that was rejected.
        reason: String,
    },

    /// A relocation type the linker does not implement.
    #[error("unsupported relocation type {r_type} in section `{section}`")]
    UnsupportedRelocation {
        /// Raw ELF relocation type.
        r_type: u32,
        /// Name of the section holding the relocation.
        section: String,
    },

    /// A relocated value does not fit its field and cannot be routed
    /// through a stub.
    #[error("relocation overflow for `{symbol}` in section `{section}` (value {value:#x})")]
    RelocationOverflow {
        /// Target symbol (or section) name.
        symbol: String,
        /// Name of the section holding the relocation.
        section: String,
        /// Computed value that did not fit.
        value: i128,
    },
}

impl JitError {
    /// Whether this failure leaves the JIT in a state where continuing is
    /// unsafe by policy (lowering and allocation failures).
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Compilation(_) | Self::Allocation(_))
    }
}
