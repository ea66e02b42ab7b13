//! Target description and symbol name mangling.
//!
//! Every table in the JIT is keyed by canonical names. A logical name is
//! turned into its canonical form by prepending the target's global prefix
//! (`_` on Mach-O and 32-bit x86 COFF, nothing on ELF). A logical name that
//! starts with `\x01` opts out of mangling: the marker is dropped and the rest
//! is used verbatim.

use std::borrow::Borrow;
use std::fmt;

/// Marker that suppresses the global prefix.
const VERBATIM_MARKER: char = '\x01';

/// Object file format produced for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectFormat {
    Elf,
    MachO,
    Coff,
}

/// Instruction set architecture of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Aarch64,
    X86,
    Other,
}

/// The parts of a target description the JIT layer cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetInfo {
    pub architecture: Architecture,
    pub format: ObjectFormat,
    pub pointer_width: u8,
    pub little_endian: bool,
}

impl TargetInfo {
    /// Description of the process this code is running in.
    pub fn host() -> Self {
        let architecture = if cfg!(target_arch = "x86_64") {
            Architecture::X86_64
        } else if cfg!(target_arch = "aarch64") {
            Architecture::Aarch64
        } else if cfg!(target_arch = "x86") {
            Architecture::X86
        } else {
            Architecture::Other
        };
        let format = if cfg!(target_vendor = "apple") {
            ObjectFormat::MachO
        } else if cfg!(target_os = "windows") {
            ObjectFormat::Coff
        } else {
            ObjectFormat::Elf
        };
        let pointer_width = if cfg!(target_pointer_width = "64") {
            64
        } else {
            32
        };
        Self {
            architecture,
            format,
            pointer_width,
            little_endian: cfg!(target_endian = "little"),
        }
    }

    /// Character prepended to every global symbol name, if any.
    pub fn global_prefix(&self) -> Option<char> {
        match (self.format, self.architecture) {
            (ObjectFormat::MachO, _) => Some('_'),
            (ObjectFormat::Coff, Architecture::X86) => Some('_'),
            _ => None,
        }
    }
}

/// A symbol name in its target-specific mangled form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalName(String);

impl CanonicalName {
    /// Treat `name` as already mangled, e.g. a name read from an object file's
    /// symbol table.
    pub fn verbatim(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for CanonicalName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CanonicalName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Applies one target's mangling scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mangler {
    prefix: Option<char>,
}

impl Mangler {
    pub fn new(target: &TargetInfo) -> Self {
        Self {
            prefix: target.global_prefix(),
        }
    }

    /// Mangler for the host target.
    pub fn host() -> Self {
        Self::new(&TargetInfo::host())
    }

    /// Convert a logical name into its canonical form.
    pub fn mangle(&self, name: &str) -> CanonicalName {
        if let Some(rest) = name.strip_prefix(VERBATIM_MARKER) {
            return CanonicalName(rest.to_string());
        }
        match self.prefix {
            Some(prefix) => {
                let mut mangled = String::with_capacity(name.len().saturating_add(1));
                mangled.push(prefix);
                mangled.push_str(name);
                CanonicalName(mangled)
            }
            None => CanonicalName(name.to_string()),
        }
    }

    /// The name the dynamic linker knows a canonical name by. `dlsym`
    /// expects names without the global prefix.
    pub fn process_name<'a>(&self, name: &'a CanonicalName) -> &'a str {
        match self.prefix {
            Some(prefix) => name.as_str().strip_prefix(prefix).unwrap_or(name.as_str()),
            None => name.as_str(),
        }
    }
}
