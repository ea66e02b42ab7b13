use std::io::IsTerminal;
use std::sync::Arc;

use jitlayer::{
    HeapMemoryManager, JitConfig, JitEngine, MemoryManager, ModuleHandle, ObjectBuffer,
    ObjectFileLowering,
};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, Registry, filter::Directive, fmt, layer::SubscriberExt};

use crate::cli::{LogColor, Options};

pub fn init_tracing(opts: &Options) {
    let log_filter = EnvFilter::builder()
        .with_default_directive(Directive::from(opts.log_level))
        .from_env_lossy();

    let use_color = match opts.log_color {
        LogColor::Always => true,
        LogColor::Never => false,
        LogColor::Auto => std::io::stderr().is_terminal(),
    };
    let include_target = matches!(opts.log_level, Level::DEBUG | Level::TRACE);

    // Program output goes to stdout, logs to stderr.
    let fmt_layer = fmt::layer()
        .with_target(include_target)
        .with_ansi(use_color)
        .with_writer(std::io::stderr);

    let subscriber = Registry::default().with(log_filter).with(fmt_layer);
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("a global tracing subscriber was already installed");
    }
}

pub fn jit_config(opts: &Options) -> JitConfig {
    JitConfig {
        // A CLI reports failures instead of aborting.
        abort_on_compile_failure: false,
        abort_on_allocation_failure: false,
        register_with_debugger: !opts.no_debugger,
        resolve_process_symbols: !opts.no_process_symbols,
        warn_on_redefinition: true,
        always_emit_stubs: opts.always_emit_stubs,
    }
}

/// Engine whose code can be executed.
pub fn init_engine(opts: &Options) -> JitEngine<ObjectFileLowering> {
    JitEngine::with_config(ObjectFileLowering::new(), jit_config(opts))
}

/// Engine over plain heap memory, for inspecting objects of any supported
/// architecture without running them.
pub fn init_inspection_engine(opts: &Options) -> JitEngine<ObjectFileLowering> {
    let memory: Arc<dyn MemoryManager> = Arc::new(HeapMemoryManager::new());
    JitEngine::with_memory_manager(ObjectFileLowering::new(), jit_config(opts), memory)
}

/// Apply `--define` mappings, then load every object in order.
pub fn load_objects(
    engine: &JitEngine<ObjectFileLowering>,
    defines: &[(String, u64)],
    paths: &[std::path::PathBuf],
) -> eyre::Result<Vec<ModuleHandle>> {
    for (name, address) in defines {
        engine.add_global_mapping(name, *address);
    }
    let mut handles = Vec::with_capacity(paths.len());
    for path in paths {
        let buffer = ObjectBuffer::from_file(path)
            .map_err(|e| eyre::eyre!("failed to read {}: {e}", path.display()))?;
        let handle = engine
            .add_object_file(buffer)
            .map_err(|e| eyre::eyre!("failed to load {}: {e}", path.display()))?;
        info!(path = %path.display(), %handle, "Loaded object");
        handles.push(handle);
    }
    Ok(handles)
}
