use std::path::PathBuf;

use clap::{ArgAction, Parser as ClapParser, Subcommand as ClapSubcommand, ValueEnum};
use jitlayer::{JitEngine, ObjectFileLowering};
use tracing::{Level, info};

use crate::initializers::{init_engine, init_inspection_engine, load_objects};

#[allow(clippy::upper_case_acronyms)]
#[derive(ClapParser)]
#[command(
    name = "jitlayer",
    version,
    about = "Load relocatable objects into the running process and call into them"
)]
pub struct CLI {
    #[command(flatten)]
    pub opts: Options,
    #[command(subcommand)]
    pub command: Subcommand,
}

#[derive(ClapParser, Debug, Clone)]
pub struct Options {
    #[arg(
        long = "log.level",
        default_value_t = Level::INFO,
        value_name = "LOG_LEVEL",
        env = "JITLAYER_LOG_LEVEL",
        help = "The verbosity level used for logs.",
        long_help = "Possible values: info, debug, trace, warn, error",
        help_heading = "Logging options",
        global = true
    )]
    pub log_level: Level,
    #[arg(
        long = "log.color",
        default_value = "auto",
        help = "Output logs with ANSI color codes.",
        help_heading = "Logging options",
        env = "JITLAYER_LOG_COLOR",
        global = true,
        value_enum
    )]
    pub log_color: LogColor,
    #[arg(
        long = "stubs.always",
        action = ArgAction::SetTrue,
        help = "Route every external call through a stub.",
        help_heading = "Linker options",
        env = "JITLAYER_ALWAYS_EMIT_STUBS",
        global = true
    )]
    pub always_emit_stubs: bool,
    #[arg(
        long = "no-process-symbols",
        action = ArgAction::SetTrue,
        help = "Do not resolve symbols through the dynamic linker.",
        help_heading = "Linker options",
        env = "JITLAYER_NO_PROCESS_SYMBOLS",
        global = true
    )]
    pub no_process_symbols: bool,
    #[arg(
        long = "no-debugger",
        action = ArgAction::SetTrue,
        help = "Do not register loaded objects with the GDB JIT interface.",
        help_heading = "Debugger options",
        env = "JITLAYER_NO_DEBUGGER",
        global = true
    )]
    pub no_debugger: bool,
}

#[derive(ClapSubcommand)]
pub enum Subcommand {
    #[command(name = "run", about = "Load objects and call an entry point")]
    Run {
        #[arg(required = true, value_name = "OBJECT", help = "Relocatable ELF objects, loaded in order")]
        objects: Vec<PathBuf>,
        #[arg(
            long = "entry",
            default_value = "main",
            value_name = "SYMBOL",
            help = "Function to call, as `extern \"C\" fn() -> i64`"
        )]
        entry: String,
        #[arg(
            long = "define",
            value_name = "NAME=ADDRESS",
            value_parser = parse_define,
            help = "Bind a symbol to a fixed address before loading",
            action = ArgAction::Append
        )]
        defines: Vec<(String, u64)>,
    },
    #[command(name = "symbols", about = "Link objects without running them and list what they define")]
    Symbols {
        #[arg(required = true, value_name = "OBJECT")]
        objects: Vec<PathBuf>,
        #[arg(
            long = "define",
            value_name = "NAME=ADDRESS",
            value_parser = parse_define,
            action = ArgAction::Append
        )]
        defines: Vec<(String, u64)>,
    },
}

impl Subcommand {
    pub fn run(self, opts: &Options) -> eyre::Result<()> {
        match self {
            Subcommand::Run {
                objects,
                entry,
                defines,
            } => {
                let engine = init_engine(opts);
                load_objects(&engine, &defines, &objects)?;
                let result = call_entry(&engine, &entry)?;
                info!(entry = %entry, result, "Entry point returned");
                println!("{result}");
            }
            Subcommand::Symbols { objects, defines } => {
                let engine = init_inspection_engine(opts);
                let handles = load_objects(&engine, &defines, &objects)?;
                for handle in handles {
                    let Some(object) = engine.module_object(handle) else {
                        continue;
                    };
                    println!("{} (base {:#x}, {} bytes)", object.name(), object.base_address(), object.size());
                    for section in object.sections() {
                        println!(
                            "  section {:<20} {:?} {:#018x} {:>8}",
                            section.name, section.segment, section.address, section.size
                        );
                    }
                    for (name, symbol) in object.symbols() {
                        let kind = if symbol.flags.callable { "func" } else { "data" };
                        let visibility = if symbol.flags.exported { "export" } else { "hidden" };
                        println!("  {:#018x} {kind} {visibility} {name}", symbol.address);
                    }
                }
                let metrics = engine.metrics();
                info!(
                    modules = metrics.modules_added,
                    stubs = metrics.stubs_emitted,
                    redefinitions = metrics.redefinitions,
                    "Inspection complete"
                );
            }
        }
        Ok(())
    }
}

fn call_entry(engine: &JitEngine<ObjectFileLowering>, entry: &str) -> eyre::Result<i64> {
    let address = engine
        .get_function_address(entry)
        .ok_or_else(|| eyre::eyre!("entry point `{entry}` is not defined"))?;
    let address = usize::try_from(address)?;
    let pointer = std::ptr::with_exposed_provenance::<u8>(address);
    // SAFETY: the user asserts that `entry` is a function with this
    // signature; the engine keeps its code mapped until it is dropped.
    let function = unsafe { std::mem::transmute::<*const u8, extern "C" fn() -> i64>(pointer) };
    Ok(function())
}

/// Parse `NAME=ADDRESS`, with the address in decimal or `0x` hex.
pub fn parse_define(s: &str) -> Result<(String, u64), String> {
    let (name, address) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=ADDRESS, got `{s}`"))?;
    if name.is_empty() {
        return Err(format!("empty symbol name in `{s}`"));
    }
    let address = match address.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => address.parse(),
    }
    .map_err(|e| format!("invalid address in `{s}`: {e}"))?;
    Ok((name.to_string(), address))
}

/// When log lines carry ANSI color codes.
#[derive(Default, Debug, Copy, Clone, ValueEnum, PartialEq)]
pub enum LogColor {
    /// Only when stderr is a terminal.
    #[default]
    Auto,
    Always,
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_define_accepts_hex_and_decimal() {
        assert_eq!(parse_define("foo=0x1000"), Ok(("foo".to_string(), 0x1000)));
        assert_eq!(parse_define("bar=42"), Ok(("bar".to_string(), 42)));
    }

    #[test]
    fn test_parse_define_rejects_malformed_input() {
        assert!(parse_define("foo").is_err());
        assert!(parse_define("=0x10").is_err());
        assert!(parse_define("foo=0xzz").is_err());
    }

    #[test]
    fn test_cli_parses_run_command() {
        let cli = CLI::try_parse_from([
            "jitlayer",
            "--log.level",
            "debug",
            "run",
            "a.o",
            "b.o",
            "--entry",
            "start",
            "--define",
            "host=0x10",
        ])
        .unwrap();
        assert_eq!(cli.opts.log_level, Level::DEBUG);
        assert_eq!(cli.opts.log_color, LogColor::Auto);
        match cli.command {
            Subcommand::Run {
                objects,
                entry,
                defines,
            } => {
                assert_eq!(objects, vec![PathBuf::from("a.o"), PathBuf::from("b.o")]);
                assert_eq!(entry, "start");
                assert_eq!(defines, vec![("host".to_string(), 0x10)]);
            }
            Subcommand::Symbols { .. } => panic!("parsed the wrong subcommand"),
        }
    }

    #[test]
    fn test_log_color_accepts_only_known_values() {
        let cli = CLI::try_parse_from(["jitlayer", "--log.color", "never", "symbols", "a.o"]).unwrap();
        assert_eq!(cli.opts.log_color, LogColor::Never);
        assert!(CLI::try_parse_from(["jitlayer", "--log.color", "sometimes", "symbols", "a.o"]).is_err());
    }
}
