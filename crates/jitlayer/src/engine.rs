//! The JIT engine.
//!
//! [`JitEngine`] ties the pieces together: a module goes through the
//! compile pipeline, is linked against the resolver chain, retained by the
//! store, registered with the debugger and finally has its symbols
//! published. Publication is the last step, so a module that fails anywhere
//! along the way leaves no trace in the symbol tables.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rustc_hash::FxHashMap;

use crate::buffer::ObjectBuffer;
use crate::debug::{DebugRecordId, DebugRegistrar};
use crate::error::JitError;
use crate::linker::{LinkOptions, ObjectLinker};
use crate::listener::JitEventListener;
use crate::mangle::{CanonicalName, Mangler, TargetInfo};
use crate::memory::MemoryManager;
use crate::pipeline::{CompilePipeline, Lowering};
use crate::resolver::{EmittedExports, HostGlobals, ProcessSymbols, SymbolResolver};
use crate::store::{CodeObject, CodeObjectStore};
use crate::symbols::{EmittedSymbols, GlobalSymbolTable};
use crate::types::{Address, JitConfig, JitMetrics, MetricsSnapshot, ModuleHandle, ResolvedSymbol};

/// Which debugger list objects are registered with.
enum Registrar {
    Global,
    Private(Arc<DebugRegistrar>),
}

impl Registrar {
    fn get(&self) -> &DebugRegistrar {
        match self {
            Self::Global => DebugRegistrar::global(),
            Self::Private(registrar) => registrar.as_ref(),
        }
    }
}

/// Everything `remove_module` needs to undo an `add_module`.
struct LoadedModule {
    object: Arc<CodeObject>,
    debug_record: Option<DebugRecordId>,
}

/// Compiles modules, keeps their code resident and answers symbol queries.
pub struct JitEngine<L: Lowering> {
    config: JitConfig,
    pipeline: CompilePipeline<L>,
    linker: ObjectLinker,
    resolver: SymbolResolver,
    mangler: Mangler,
    globals: Arc<RwLock<GlobalSymbolTable>>,
    emitted: Arc<RwLock<EmittedSymbols>>,
    store: CodeObjectStore,
    registrar: Registrar,
    modules: Mutex<FxHashMap<ModuleHandle, LoadedModule>>,
    listeners: RwLock<Vec<Arc<dyn JitEventListener>>>,
    next_handle: AtomicU64,
    metrics: JitMetrics,
}

impl<L: Lowering> JitEngine<L> {
    /// Engine with default configuration and executable memory.
    pub fn new(lowering: L) -> Self {
        Self::with_config(lowering, JitConfig::default())
    }

    pub fn with_config(lowering: L, config: JitConfig) -> Self {
        Self::with_memory_manager(lowering, config, default_memory_manager())
    }

    /// Engine whose code objects live in memory from `memory`.
    pub fn with_memory_manager(
        lowering: L,
        config: JitConfig,
        memory: Arc<dyn MemoryManager>,
    ) -> Self {
        let pipeline = CompilePipeline::new(lowering);
        let target = *pipeline.target();
        let mangler = Mangler::new(&target);
        let globals = Arc::new(RwLock::new(GlobalSymbolTable::new()));
        let emitted = Arc::new(RwLock::new(EmittedSymbols::new()));

        let mut resolver = SymbolResolver::new()
            .with_tier(HostGlobals::new(Arc::clone(&globals)))
            .with_tier(EmittedExports::new(Arc::clone(&emitted)));
        if config.resolve_process_symbols {
            resolver = resolver.with_tier(ProcessSymbols::new(mangler));
        }

        let linker = ObjectLinker::new(
            memory,
            target,
            LinkOptions {
                always_emit_stubs: config.always_emit_stubs,
            },
        );

        tracing::info!(
            arch = ?target.architecture,
            format = ?target.format,
            tiers = ?resolver.tier_names(),
            "JIT engine initialized"
        );

        Self {
            config,
            pipeline,
            linker,
            resolver,
            mangler,
            globals,
            emitted,
            store: CodeObjectStore::new(),
            registrar: Registrar::Global,
            modules: Mutex::new(FxHashMap::default()),
            listeners: RwLock::new(Vec::new()),
            next_handle: AtomicU64::new(1),
            metrics: JitMetrics::new(),
        }
    }

    /// Register objects with `registrar` instead of the process-wide list.
    pub fn with_debug_registrar(mut self, registrar: Arc<DebugRegistrar>) -> Self {
        self.registrar = Registrar::Private(registrar);
        self
    }

    /// Compile and load `module`.
    ///
    /// Lowering and allocation failures abort the process unless the
    /// configuration says otherwise; every other error is returned and leaves
    /// the engine unchanged.
    pub fn add_module(&self, module: L::Module) -> Result<ModuleHandle, JitError> {
        let buffer = self.pipeline.compile(module).map_err(|e| self.fail(e))?;
        self.load(buffer)
    }

    /// Load an already-compiled relocatable object, bypassing lowering.
    pub fn add_object_file(&self, buffer: ObjectBuffer) -> Result<ModuleHandle, JitError> {
        self.load(buffer)
    }

    fn load(&self, buffer: ObjectBuffer) -> Result<ModuleHandle, JitError> {
        let linked = self.linker.link(&buffer, &self.resolver).map_err(|e| {
            JitMetrics::bump(&self.metrics.link_failures);
            tracing::warn!(module = buffer.name(), error = %e, "Failed to link module");
            self.fail(e)
        })?;
        let stubs = u64::try_from(linked.stubs()).unwrap_or(u64::MAX);
        let object = self.store.retain(linked);

        let debug_record = self.register_debug_image(&object);

        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let listeners = self.listeners.read().unwrap();
            for listener in listeners.iter() {
                listener.object_emitted(&object);
            }
        }

        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let mut emitted = self.emitted.write().unwrap();
            for name in emitted.publish(object.id(), object.symbols()) {
                JitMetrics::bump(&self.metrics.redefinitions);
                if self.config.warn_on_redefinition {
                    tracing::warn!(
                        symbol = %name,
                        module = object.name(),
                        "Module redefines a symbol exported by an earlier module"
                    );
                }
            }
        }

        let handle = ModuleHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        tracing::info!(
            module = object.name(),
            handle = %handle,
            base = format_args!("{:#x}", object.base_address()),
            size = object.size(),
            symbols = object.symbols().len(),
            "Added module"
        );
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut modules = self.modules.lock().unwrap();
        modules.insert(
            handle,
            LoadedModule {
                object,
                debug_record,
            },
        );
        JitMetrics::bump(&self.metrics.modules_added);
        self.metrics.stubs_emitted.fetch_add(stubs, Ordering::Relaxed);
        Ok(handle)
    }

    fn register_debug_image(&self, object: &CodeObject) -> Option<DebugRecordId> {
        if !object.image().is_debug() {
            JitMetrics::bump(&self.metrics.debug_fallbacks);
            return None;
        }
        if !self.config.register_with_debugger {
            return None;
        }
        // SAFETY: the image is owned by the code object, which the module
        // table keeps alive until `remove_module` (or drop) unregisters it.
        #[expect(unsafe_code)]
        let registered = unsafe { self.registrar.get().register(object.image().bytes()) };
        match registered {
            Ok(record) => {
                JitMetrics::bump(&self.metrics.debug_registrations);
                Some(record)
            }
            // Only debuggability is lost; the module links and runs without it.
            Err(error) => {
                tracing::warn!(module = object.name(), %error, "Debugger registration skipped");
                None
            }
        }
    }

    /// Unload a module: retract its symbols, unregister it from the
    /// debugger, notify listeners and drop the store's ownership.
    ///
    /// # Safety
    ///
    /// No code from the module may still be running or be called afterwards,
    /// and no other module may still reference its symbols.
    #[expect(unsafe_code)]
    pub unsafe fn remove_module(&self, handle: ModuleHandle) -> Result<(), JitError> {
        let module = {
            #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
            let mut modules = self.modules.lock().unwrap();
            modules
                .remove(&handle)
                .ok_or(JitError::UnknownHandle(handle))?
        };
        let object = module.object;

        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let mut emitted = self.emitted.write().unwrap();
            emitted.retract(object.id());
        }
        if let Some(record) = module.debug_record {
            self.registrar.get().unregister(record);
        }
        {
            #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
            let listeners = self.listeners.read().unwrap();
            for listener in listeners.iter() {
                listener.object_freed(&object);
            }
        }
        // SAFETY: forwarded from this function's contract.
        unsafe {
            self.store.release(object.id());
        }

        JitMetrics::bump(&self.metrics.modules_removed);
        tracing::info!(module = object.name(), handle = %handle, "Removed module");
        Ok(())
    }

    /// Bind `name` to a host address for all future resolutions.
    pub fn add_global_mapping(&self, name: &str, address: Address) {
        let canonical = self.mangler.mangle(name);
        tracing::debug!(
            symbol = %canonical,
            address = format_args!("{address:#x}"),
            "Added global mapping"
        );
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut globals = self.globals.write().unwrap();
        globals.insert(canonical, address);
    }

    /// Resolve a canonical name through host mappings, module exports and
    /// the process, in that order.
    pub fn find_symbol(&self, name: &CanonicalName) -> Option<ResolvedSymbol> {
        self.resolver.resolve(name)
    }

    /// [`find_symbol`](Self::find_symbol) on the mangled form of `name`.
    pub fn find_unmangled_symbol(&self, name: &str) -> Option<ResolvedSymbol> {
        self.find_symbol(&self.mangler.mangle(name))
    }

    /// Address of a function, including module-internal (hidden) ones.
    ///
    /// Same lookup as [`get_global_value_address`](Self::get_global_value_address):
    /// symbol kind is not checked at either level.
    pub fn get_function_address(&self, name: &str) -> Option<Address> {
        self.lookup_including_hidden(name)
    }

    /// Address of a global variable or function, including hidden ones.
    pub fn get_global_value_address(&self, name: &str) -> Option<Address> {
        self.lookup_including_hidden(name)
    }

    fn lookup_including_hidden(&self, name: &str) -> Option<Address> {
        let canonical = self.mangler.mangle(name);
        if let Some(symbol) = self.find_symbol(&canonical) {
            return Some(symbol.address);
        }
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let emitted = self.emitted.read().unwrap();
        emitted
            .lookup_any(canonical.as_str())
            .map(|symbol| symbol.address)
    }

    /// Always `None`: modules are consumed by lowering, so no IR is kept
    /// around to look functions up in.
    pub fn find_function_named(&self, _name: &str) -> Option<&L::Module> {
        None
    }

    /// Code object containing `address`, with the offset into it.
    pub fn lookup_address(&self, address: Address) -> Option<(Arc<CodeObject>, u64)> {
        self.store.lookup_address(address)
    }

    /// Code object loaded for `handle`.
    pub fn module_object(&self, handle: ModuleHandle) -> Option<Arc<CodeObject>> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let modules = self.modules.lock().unwrap();
        modules.get(&handle).map(|m| Arc::clone(&m.object))
    }

    pub fn register_event_listener(&self, listener: Arc<dyn JitEventListener>) {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut listeners = self.listeners.write().unwrap();
        listeners.push(listener);
    }

    pub fn mangle(&self, name: &str) -> CanonicalName {
        self.mangler.mangle(name)
    }

    pub fn target(&self) -> &TargetInfo {
        self.pipeline.target()
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// The resolution tiers, for inspection.
    pub fn resolver(&self) -> &SymbolResolver {
        &self.resolver
    }

    /// Number of modules currently loaded.
    pub fn module_count(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let modules = self.modules.lock().unwrap();
        modules.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Apply the abort policy to a failure.
    fn fail(&self, error: JitError) -> JitError {
        let abort = match &error {
            JitError::Compilation(_) => self.config.abort_on_compile_failure,
            JitError::Allocation(_) => self.config.abort_on_allocation_failure,
            _ => false,
        };
        if abort {
            tracing::error!(%error, "Unrecoverable JIT failure, aborting");
            std::process::abort();
        }
        error
    }
}

impl<L: Lowering> Drop for JitEngine<L> {
    fn drop(&mut self) {
        // The images die with the store, so they must leave the debugger
        // list first.
        let modules = match self.modules.get_mut() {
            Ok(modules) => std::mem::take(modules),
            Err(poisoned) => std::mem::take(poisoned.into_inner()),
        };
        for module in modules.into_values() {
            if let Some(record) = module.debug_record {
                self.registrar.get().unregister(record);
            }
        }
    }
}

impl<L: Lowering> std::fmt::Debug for JitEngine<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitEngine")
            .field("config", &self.config)
            .field("target", self.pipeline.target())
            .field("resolver", &self.resolver)
            .field("modules", &self.module_count())
            .finish()
    }
}

/// `mmap`-backed executable memory where available.
fn default_memory_manager() -> Arc<dyn MemoryManager> {
    #[cfg(unix)]
    {
        Arc::new(crate::memory::MmapMemoryManager::new())
    }
    #[cfg(not(unix))]
    {
        Arc::new(crate::memory::HeapMemoryManager::new())
    }
}
