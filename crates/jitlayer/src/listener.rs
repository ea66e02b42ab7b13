//! Hooks for profilers and other tools that track JIT code.

use crate::store::CodeObject;

/// Observer of code-object lifecycle events.
///
/// Callbacks run synchronously on the thread that adds or removes the
/// module, after the object is resident and before it is released.
/// Implementations must not call back into the engine.
pub trait JitEventListener: Send + Sync {
    /// A module was linked and its code is now executable.
    fn object_emitted(&self, _object: &CodeObject) {}

    /// A module is being removed; its memory is still mapped.
    fn object_freed(&self, _object: &CodeObject) {}
}
