//! jitlayer: an in-process JIT linking layer.
//!
//! Accepts compiled modules one at a time, links each into executable
//! memory, and makes every function and global it defines addressable by
//! name, from later modules and from the host. Loaded objects are announced
//! to native debuggers through the GDB JIT interface.
//!
//! # Architecture
//!
//! ```text
//! JitEngine (engine)
//!   ├── pipeline : Lowering collaborator: IR module -> object bytes
//!   ├── linker   : ELF64 loader: layout, relocations, stubs, debug image
//!   │     └── resolver: host globals -> module exports -> process (dlsym)
//!   ├── store    : resident code objects, address -> object lookup
//!   ├── debug    : __jit_debug_descriptor list + __jit_debug_register_code
//!   └── symbols  : host mappings and per-module export stacks
//! ```
//!
//! # Feature Flags
//!
//! - `cranelift` (default): Cranelift IR lowering in [`backend::cranelift`].
//! - `test-utils`: counter reset helpers for test isolation.

pub mod backend;
pub mod buffer;
pub mod debug;
pub mod engine;
pub mod error;
pub mod linker;
pub mod listener;
pub mod mangle;
pub mod memory;
pub mod pipeline;
mod reloc;
pub mod resolver;
pub mod store;
pub mod symbols;
pub mod types;

pub use buffer::ObjectBuffer;
pub use debug::{DebugRecordId, DebugRegistrar};
pub use engine::JitEngine;
pub use error::JitError;
pub use linker::{LinkOptions, LinkedObject, ObjectLinker};
pub use listener::JitEventListener;
pub use mangle::{CanonicalName, Mangler, TargetInfo};
pub use memory::{HeapMemoryManager, MemoryManager};
#[cfg(unix)]
pub use memory::MmapMemoryManager;
pub use pipeline::{CompilePipeline, Lowering, ObjectFileLowering};
pub use store::CodeObject;
pub use types::{
    Address, CodeObjectId, JitConfig, JitMetrics, MetricsSnapshot, ModuleHandle, ResolvedSymbol,
    SymbolFlags,
};

#[cfg(test)]
mod tests;
