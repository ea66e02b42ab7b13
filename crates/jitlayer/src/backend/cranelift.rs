//! Cranelift lowering.
//!
//! A [`ClifModule`] is a named set of function and data declarations with
//! Cranelift IR bodies. [`CraneliftLowering`] compiles it with
//! `cranelift-object` into a relocatable ELF object for the host ISA.
//!
//! Function bodies refer to other functions and data of the same module
//! through [`ClifModule::func_ref`] and [`ClifModule::global_value`], which
//! import the declaration into the body the same way `cranelift-module`
//! does. Imports are resolved by the JIT linker, so a module may call host
//! functions and the exports of earlier modules by name.

use std::sync::Arc;

use cranelift_codegen::Context;
use cranelift_codegen::ir::{
    self, ExtFuncData, ExternalName, Function, GlobalValueData, Signature, UserExternalName,
    UserFuncName, immediates::Imm64,
};
use cranelift_codegen::isa::TargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_module::{DataDescription, Linkage, Module};
use cranelift_object::{ObjectBuilder, ObjectModule};

use crate::error::JitError;
use crate::mangle::TargetInfo;
use crate::pipeline::Lowering;

/// Index of a function declared in a [`ClifModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FuncIndex(u32);

/// Index of a data object declared in a [`ClifModule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataIndex(u32);

/// Symbol visibility of a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Visible to other modules and to symbol lookups.
    Exported,
    /// Only reachable through lookups that include hidden symbols.
    Hidden,
}

impl From<Visibility> for Linkage {
    fn from(visibility: Visibility) -> Self {
        match visibility {
            Visibility::Exported => Linkage::Export,
            Visibility::Hidden => Linkage::Hidden,
        }
    }
}

#[derive(Debug)]
struct FunctionDecl {
    name: String,
    signature: Signature,
    linkage: Linkage,
    body: Option<Function>,
}

#[derive(Debug)]
struct DataDecl {
    name: String,
    linkage: Linkage,
    writable: bool,
    contents: Option<Box<[u8]>>,
}

/// A module of Cranelift IR ready to be handed to the JIT.
#[derive(Debug)]
pub struct ClifModule {
    name: String,
    functions: Vec<FunctionDecl>,
    data: Vec<DataDecl>,
}

impl ClifModule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            functions: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare a function defined elsewhere (host or another module).
    pub fn import_function(&mut self, name: impl Into<String>, signature: Signature) -> FuncIndex {
        self.push_function(name.into(), signature, Linkage::Import)
    }

    /// Declare a function this module will define.
    pub fn declare_function(
        &mut self,
        name: impl Into<String>,
        signature: Signature,
        visibility: Visibility,
    ) -> FuncIndex {
        self.push_function(name.into(), signature, visibility.into())
    }

    /// Attach the body of a declared function.
    pub fn define_function(&mut self, index: FuncIndex, body: Function) -> Result<(), JitError> {
        let module = self.name.clone();
        let decl = usize::try_from(index.0)
            .ok()
            .and_then(|i| self.functions.get_mut(i))
            .ok_or_else(|| JitError::Compilation(format!("unknown function {index:?} in `{module}`")))?;
        if decl.linkage == Linkage::Import {
            return Err(JitError::Compilation(format!(
                "cannot define imported function `{}` in `{module}`",
                decl.name
            )));
        }
        if body.signature != decl.signature {
            return Err(JitError::Compilation(format!(
                "body of `{}` does not match its declared signature",
                decl.name
            )));
        }
        decl.body = Some(body);
        Ok(())
    }

    /// Declare a data object defined elsewhere.
    pub fn import_data(&mut self, name: impl Into<String>) -> DataIndex {
        self.push_data(name.into(), Linkage::Import, false, None)
    }

    /// Declare and define a data object.
    pub fn define_data(
        &mut self,
        name: impl Into<String>,
        contents: impl Into<Box<[u8]>>,
        writable: bool,
        visibility: Visibility,
    ) -> DataIndex {
        self.push_data(name.into(), visibility.into(), writable, Some(contents.into()))
    }

    pub fn signature(&self, index: FuncIndex) -> Option<&Signature> {
        let decl = self.functions.get(usize::try_from(index.0).ok()?)?;
        Some(&decl.signature)
    }

    /// Make function `index` callable from `func`.
    pub fn func_ref(&self, index: FuncIndex, func: &mut Function) -> Option<ir::FuncRef> {
        let decl = self.functions.get(usize::try_from(index.0).ok()?)?;
        let signature = func.import_signature(decl.signature.clone());
        let name = func.declare_imported_user_function(UserExternalName::new(0, index.0));
        Some(func.import_function(ExtFuncData {
            name: ExternalName::user(name),
            signature,
            colocated: decl.linkage.is_final(),
        }))
    }

    /// Make the address of data object `index` available in `func`.
    ///
    /// The address is materialized as an absolute constant, so the data may
    /// live anywhere in the address space.
    pub fn global_value(&self, index: DataIndex, func: &mut Function) -> Option<ir::GlobalValue> {
        self.data.get(usize::try_from(index.0).ok()?)?;
        let name = func.declare_imported_user_function(UserExternalName::new(1, index.0));
        Some(func.create_global_value(GlobalValueData::Symbol {
            name: ExternalName::user(name),
            offset: Imm64::new(0),
            colocated: false,
            tls: false,
        }))
    }

    fn push_function(&mut self, name: String, signature: Signature, linkage: Linkage) -> FuncIndex {
        let index = u32::try_from(self.functions.len()).unwrap_or(u32::MAX);
        self.functions.push(FunctionDecl {
            name,
            signature,
            linkage,
            body: None,
        });
        FuncIndex(index)
    }

    fn push_data(
        &mut self,
        name: String,
        linkage: Linkage,
        writable: bool,
        contents: Option<Box<[u8]>>,
    ) -> DataIndex {
        let index = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        self.data.push(DataDecl {
            name,
            linkage,
            writable,
            contents,
        });
        DataIndex(index)
    }
}

/// Compiles [`ClifModule`]s for the host ISA.
///
/// Holds the ISA and a codegen context reused across modules.
pub struct CraneliftLowering {
    isa: Arc<dyn TargetIsa>,
    ctx: Context,
}

impl CraneliftLowering {
    /// Lowering for the host with `opt_level = speed`.
    pub fn host() -> Result<Self, JitError> {
        Self::host_with_opt_level("speed")
    }

    /// Lowering for the host with the given Cranelift `opt_level`
    /// (`none`, `speed` or `speed_and_size`).
    pub fn host_with_opt_level(opt_level: &str) -> Result<Self, JitError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", opt_level)
            .map_err(|e| JitError::Backend(format!("opt_level: {e}")))?;
        // Cross-module references are patched by the JIT linker, which
        // handles absolute relocations directly.
        flag_builder
            .set("is_pic", "false")
            .map_err(|e| JitError::Backend(format!("is_pic: {e}")))?;
        let isa = cranelift_native::builder()
            .map_err(|msg| JitError::Backend(format!("host machine not supported: {msg}")))?
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| JitError::Backend(format!("failed to create ISA: {e}")))?;
        Ok(Self {
            isa,
            ctx: Context::new(),
        })
    }

    pub fn isa(&self) -> &dyn TargetIsa {
        &*self.isa
    }

    /// An empty signature in the host's default calling convention.
    pub fn make_signature(&self) -> Signature {
        Signature::new(self.isa.default_call_conv())
    }
}

impl std::fmt::Debug for CraneliftLowering {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CraneliftLowering")
            .field("isa", &self.isa.name())
            .finish()
    }
}

impl Lowering for CraneliftLowering {
    type Module = ClifModule;

    fn lower(&mut self, module: ClifModule, out: &mut Vec<u8>) -> Result<String, JitError> {
        let ClifModule {
            name,
            functions,
            data,
        } = module;
        let compilation = |e: cranelift_module::ModuleError| {
            JitError::Compilation(format!("module `{name}`: {e}"))
        };

        let builder = ObjectBuilder::new(
            Arc::clone(&self.isa),
            name.clone(),
            cranelift_module::default_libcall_names(),
        )
        .map_err(|e| JitError::Backend(e.to_string()))?;
        let mut object = ObjectModule::new(builder);

        // Declaration order fixes the ids the bodies refer to.
        let mut func_ids = Vec::with_capacity(functions.len());
        for (index, decl) in functions.iter().enumerate() {
            let id = object
                .declare_function(&decl.name, decl.linkage, &decl.signature)
                .map_err(compilation)?;
            if usize::try_from(id.as_u32()).ok() != Some(index) {
                return Err(JitError::Compilation(format!(
                    "function `{}` is declared twice in `{name}`",
                    decl.name
                )));
            }
            func_ids.push(id);
        }
        let mut data_ids = Vec::with_capacity(data.len());
        for (index, decl) in data.iter().enumerate() {
            let id = object
                .declare_data(&decl.name, decl.linkage, decl.writable, false)
                .map_err(compilation)?;
            if usize::try_from(id.as_u32()).ok() != Some(index) {
                return Err(JitError::Compilation(format!(
                    "data `{}` is declared twice in `{name}`",
                    decl.name
                )));
            }
            data_ids.push(id);
        }

        for (decl, id) in functions.into_iter().zip(func_ids) {
            let Some(body) = decl.body else {
                if decl.linkage == Linkage::Import {
                    continue;
                }
                return Err(JitError::Compilation(format!(
                    "function `{}` in `{name}` has no body",
                    decl.name
                )));
            };
            self.ctx.clear();
            self.ctx.func = body;
            self.ctx.func.name = UserFuncName::user(0, id.as_u32());
            let defined = object.define_function(id, &mut self.ctx);
            object.clear_context(&mut self.ctx);
            defined.map_err(compilation)?;
        }

        for (decl, id) in data.into_iter().zip(data_ids) {
            let Some(contents) = decl.contents else {
                continue;
            };
            let mut description = DataDescription::new();
            description.define(contents);
            object.define_data(id, &description).map_err(compilation)?;
        }

        let bytes = object
            .finish()
            .emit()
            .map_err(|e| JitError::Compilation(format!("module `{name}`: {e}")))?;
        out.extend_from_slice(&bytes);
        Ok(name)
    }

    fn target(&self) -> TargetInfo {
        // `cranelift_native` always builds for the host.
        TargetInfo::host()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_codegen::ir::{AbiParam, InstBuilder, types};
    use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
    use object::{Object, ObjectSymbol, SymbolKind};

    fn returns_i64(lowering: &CraneliftLowering) -> Signature {
        let mut sig = lowering.make_signature();
        sig.returns.push(AbiParam::new(types::I64));
        sig
    }

    fn constant(sig: Signature, value: i64) -> Function {
        let mut func = Function::with_name_signature(UserFuncName::default(), sig);
        let mut fctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut func, &mut fctx);
        let block = builder.create_block();
        builder.switch_to_block(block);
        builder.seal_block(block);
        let v = builder.ins().iconst(types::I64, value);
        builder.ins().return_(&[v]);
        builder.finalize();
        func
    }

    #[test]
    fn test_lowering_emits_relocatable_object() {
        let mut lowering = CraneliftLowering::host().expect("host ISA");
        let sig = returns_i64(&lowering);
        let mut module = ClifModule::new("answer");
        let f = module.declare_function("answer", sig.clone(), Visibility::Exported);
        module.define_function(f, constant(sig, 42)).unwrap();

        let mut out = Vec::new();
        let name = lowering.lower(module, &mut out).expect("lowering");
        assert_eq!(name, "answer");

        let file = object::File::parse(&*out).expect("valid object");
        assert_eq!(file.kind(), object::ObjectKind::Relocatable);
        // The module name also lands in the symbol table as the file symbol.
        let symbol = file
            .symbols()
            .find(|s| s.name().ok() == Some("answer") && s.kind() == SymbolKind::Text)
            .expect("exported symbol");
        assert!(symbol.is_global());
    }

    #[test]
    fn test_imports_become_undefined_symbols() {
        let mut lowering = CraneliftLowering::host().expect("host ISA");
        let sig = returns_i64(&lowering);
        let mut module = ClifModule::new("caller");
        let callee = module.import_function("host_callee", sig.clone());
        let caller = module.declare_function("caller", sig.clone(), Visibility::Exported);

        let mut func = Function::with_name_signature(UserFuncName::default(), sig);
        let callee_ref = module.func_ref(callee, &mut func).unwrap();
        let mut fctx = FunctionBuilderContext::new();
        let mut builder = FunctionBuilder::new(&mut func, &mut fctx);
        let block = builder.create_block();
        builder.switch_to_block(block);
        builder.seal_block(block);
        let call = builder.ins().call(callee_ref, &[]);
        let result = builder.inst_results(call)[0];
        builder.ins().return_(&[result]);
        builder.finalize();
        module.define_function(caller, func).unwrap();

        let mut out = Vec::new();
        lowering.lower(module, &mut out).expect("lowering");
        let file = object::File::parse(&*out).unwrap();
        assert!(
            file.symbols()
                .any(|s| s.name().ok() == Some("host_callee") && s.is_undefined())
        );
    }

    #[test]
    fn test_missing_body_is_a_compilation_error() {
        let mut lowering = CraneliftLowering::host().expect("host ISA");
        let sig = returns_i64(&lowering);
        let mut module = ClifModule::new("incomplete");
        module.declare_function("never_defined", sig, Visibility::Exported);

        let err = lowering.lower(module, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, JitError::Compilation(_)), "{err}");
    }

    #[test]
    fn test_define_rejects_signature_mismatch() {
        let lowering = CraneliftLowering::host().expect("host ISA");
        let mut module = ClifModule::new("mismatch");
        let f = module.declare_function("f", lowering.make_signature(), Visibility::Hidden);
        let err = module
            .define_function(f, constant(returns_i64(&lowering), 1))
            .unwrap_err();
        assert!(matches!(err, JitError::Compilation(_)));
    }

    #[test]
    fn test_data_objects_are_emitted() {
        let mut lowering = CraneliftLowering::host().expect("host ISA");
        let mut module = ClifModule::new("tables");
        module.define_data("table", vec![1u8, 2, 3, 4], false, Visibility::Exported);
        module.define_data("counter", vec![0u8; 8], true, Visibility::Hidden);

        let mut out = Vec::new();
        lowering.lower(module, &mut out).expect("lowering");
        let file = object::File::parse(&*out).unwrap();
        let names: Vec<_> = file.symbols().filter_map(|s| s.name().ok()).collect();
        assert!(names.contains(&"table"));
        assert!(names.contains(&"counter"));
    }
}
