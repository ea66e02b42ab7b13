//! Module compile pipeline.
//!
//! Turns an intermediate module into a relocatable object image in memory.
//! The actual instruction selection is delegated to a [`Lowering`]; the
//! pipeline owns it together with a reusable output buffer, and serializes
//! access to both because lowering contexts are stateful.

use std::sync::Mutex;

use bytes::Bytes;
use object::{Object, ObjectKind};

use crate::buffer::ObjectBuffer;
use crate::error::JitError;
use crate::mangle::TargetInfo;

/// Produces relocatable object code for the host target.
pub trait Lowering: Send {
    /// The intermediate representation accepted by this lowering.
    type Module;

    /// Lower `module` and append the object image to `out`.
    ///
    /// Returns the module's display name.
    fn lower(&mut self, module: Self::Module, out: &mut Vec<u8>) -> Result<String, JitError>;

    /// Target the produced objects are built for.
    fn target(&self) -> TargetInfo;
}

struct PipelineState<L> {
    lowering: L,
    buffer: Vec<u8>,
}

/// Owns a [`Lowering`] and runs modules through it one at a time.
pub struct CompilePipeline<L: Lowering> {
    state: Mutex<PipelineState<L>>,
    target: TargetInfo,
}

impl<L: Lowering> CompilePipeline<L> {
    pub fn new(lowering: L) -> Self {
        let target = lowering.target();
        Self {
            state: Mutex::new(PipelineState {
                lowering,
                buffer: Vec::new(),
            }),
            target,
        }
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    /// Lower `module` into an object buffer. The module is consumed.
    pub fn compile(&self, module: L::Module) -> Result<ObjectBuffer, JitError> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut state = self.state.lock().unwrap();
        let PipelineState { lowering, buffer } = &mut *state;
        buffer.clear();
        let name = lowering.lower(module, buffer)?;
        if buffer.is_empty() {
            return Err(JitError::Compilation(format!(
                "lowering `{name}` produced an empty object"
            )));
        }
        tracing::debug!(module = %name, size = buffer.len(), "Lowered module");
        Ok(ObjectBuffer::new(name, Bytes::copy_from_slice(buffer)))
    }
}

impl<L: Lowering> std::fmt::Debug for CompilePipeline<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilePipeline")
            .field("target", &self.target)
            .finish()
    }
}

/// Lowering for modules that are already relocatable objects, e.g. the
/// output of an ahead-of-time compiler.
///
/// The header is checked here so malformed input is rejected before any
/// linking starts.
#[derive(Debug, Clone, Copy)]
pub struct ObjectFileLowering {
    target: TargetInfo,
}

impl ObjectFileLowering {
    pub fn new() -> Self {
        Self {
            target: TargetInfo::host(),
        }
    }
}

impl Default for ObjectFileLowering {
    fn default() -> Self {
        Self::new()
    }
}

impl Lowering for ObjectFileLowering {
    type Module = ObjectBuffer;

    fn lower(&mut self, module: ObjectBuffer, out: &mut Vec<u8>) -> Result<String, JitError> {
        let file = object::File::parse(module.as_slice()).map_err(|e| JitError::InvalidObject {
            module: module.name().to_string(),
            reason: e.to_string(),
        })?;
        if file.kind() != ObjectKind::Relocatable {
            return Err(JitError::UnsupportedObject {
                module: module.name().to_string(),
                reason: format!("expected a relocatable object, found {:?}", file.kind()),
            });
        }
        out.extend_from_slice(module.as_slice());
        Ok(module.name().to_string())
    }

    fn target(&self) -> TargetInfo {
        self.target
    }
}
