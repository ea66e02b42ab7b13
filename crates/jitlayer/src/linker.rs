//! Loading relocatable ELF objects into memory.
//!
//! [`ObjectLinker::link`] takes one object image and produces a
//! [`LinkedObject`]: its allocatable sections copied into a block from the
//! [`MemoryManager`], every relocation applied and the block finalized. The
//! steps run in a fixed order so that nothing is allocated for an object
//! that cannot be linked:
//!
//! 1. validate the header (ELF64 relocatable, x86-64 or AArch64),
//! 2. lay sections out by segment and alignment, and reserve call stubs and
//!    GOT slots,
//! 3. resolve every undefined symbol the object references,
//! 4. allocate, copy, relocate and finalize.

use std::sync::Arc;

use bytes::Bytes;
use object::{
    BinaryFormat, Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationFlags,
    RelocationTarget, SectionIndex, SectionKind, SymbolIndex, SymbolKind, SymbolScope,
    SymbolSection,
};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::buffer::ObjectBuffer;
use crate::error::JitError;
use crate::mangle::{Architecture, CanonicalName, TargetInfo};
use crate::memory::{MemoryManager, OwnedMemory, SegmentLayout};
use crate::reloc::{self, GOT_SLOT_SIZE, RelocKind, STUB_SIZE};
use crate::resolver::SymbolResolver;
use crate::types::{Address, ResolvedSymbol, SymbolFlags};

/// Largest section alignment the page-aligned segments can honour.
const MAX_SECTION_ALIGN: u64 = 4096;

/// Offsets of the ELF64 header fields patched in the debug image.
const E_SHOFF: usize = 0x28;
const E_SHENTSIZE: usize = 0x3a;
/// Offset of `sh_addr` within an ELF64 section header.
const SH_ADDR: usize = 0x10;

/// Linker behaviour knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinkOptions {
    /// Send every branch to an undefined symbol through a stub.
    pub always_emit_stubs: bool,
}

/// Which segment of the block a section was placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Code,
    ReadOnly,
    Data,
}

/// A section after loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSection {
    pub name: String,
    pub segment: SegmentKind,
    pub address: Address,
    pub size: u64,
}

/// The object image kept alongside the loaded code.
#[derive(Debug, Clone)]
pub enum SavedImage {
    /// Copy of the object with section addresses rewritten to their load
    /// addresses; this is what the debugger is given.
    Debug(Box<[u8]>),
    /// The original bytes, kept when no debug image could be derived.
    Verbatim(Bytes),
}

impl SavedImage {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Debug(image) => image,
            Self::Verbatim(bytes) => bytes,
        }
    }

    pub fn is_debug(&self) -> bool {
        matches!(self, Self::Debug(_))
    }
}

/// Result of linking one object.
#[derive(Debug)]
pub struct LinkedObject {
    pub(crate) name: String,
    pub(crate) memory: OwnedMemory,
    pub(crate) sections: Vec<LoadedSection>,
    pub(crate) symbols: Vec<(CanonicalName, ResolvedSymbol)>,
    pub(crate) image: SavedImage,
    pub(crate) stubs: usize,
}

impl LinkedObject {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn memory(&self) -> &OwnedMemory {
        &self.memory
    }

    pub fn sections(&self) -> &[LoadedSection] {
        &self.sections
    }

    /// Named non-local definitions, in symbol table order.
    pub fn symbols(&self) -> &[(CanonicalName, ResolvedSymbol)] {
        &self.symbols
    }

    pub fn image(&self) -> &SavedImage {
        &self.image
    }

    /// Number of call stubs the object's branches were routed through.
    pub fn stubs(&self) -> usize {
        self.stubs
    }
}

/// One allocatable section's slot in the layout.
struct Placement<'data> {
    index: SectionIndex,
    name: String,
    segment: SegmentKind,
    offset: usize,
    size: usize,
    data: &'data [u8],
}

/// Where everything goes, before any memory exists.
#[derive(Default)]
struct Plan<'data> {
    placements: Vec<Placement<'data>>,
    code: usize,
    rodata: usize,
    data: usize,
    stub_offset: usize,
    stubs: Vec<SymbolIndex>,
    got_offset: usize,
    got: Vec<SymbolIndex>,
}

impl Plan<'_> {
    fn layout(&self) -> SegmentLayout {
        SegmentLayout {
            code: self.code,
            rodata: self.rodata,
            data: self.data,
        }
    }
}

/// Links relocatable objects into memory from a [`MemoryManager`].
pub struct ObjectLinker {
    memory: Arc<dyn MemoryManager>,
    target: TargetInfo,
    options: LinkOptions,
}

impl ObjectLinker {
    pub fn new(memory: Arc<dyn MemoryManager>, target: TargetInfo, options: LinkOptions) -> Self {
        Self {
            memory,
            target,
            options,
        }
    }

    pub fn target(&self) -> &TargetInfo {
        &self.target
    }

    /// Link `buffer`, resolving its undefined symbols through `resolver`.
    ///
    /// On error nothing stays allocated.
    pub fn link(
        &self,
        buffer: &ObjectBuffer,
        resolver: &SymbolResolver,
    ) -> Result<LinkedObject, JitError> {
        let module = buffer.name();
        let file = object::File::parse(buffer.as_slice())
            .map_err(|e| invalid(module, e.to_string()))?;
        let arch = self.check_header(&file, module)?;
        let plan = plan(&file, module, arch)?;
        let externals = resolve_externals(&file, &plan, module, resolver)?;

        let block = self.memory.allocate(plan.layout())?;
        let mut memory = OwnedMemory::new(block, Arc::clone(&self.memory));
        let base = memory.block().base_address();
        let rodata_base = offset_address(base, memory.block().rodata_offset(), module)?;
        let data_base = offset_address(base, memory.block().data_offset(), module)?;
        let segment_base = |segment: SegmentKind| match segment {
            SegmentKind::Code => base,
            SegmentKind::ReadOnly => rodata_base,
            SegmentKind::Data => data_base,
        };
        let segment_offset = |segment: SegmentKind| -> Result<usize, JitError> {
            let address = segment_base(segment);
            usize::try_from(address.wrapping_sub(base)).map_err(|_| layout_overflow(module))
        };

        let mut addresses: FxHashMap<SectionIndex, Address> = FxHashMap::default();
        let mut sections = Vec::with_capacity(plan.placements.len());
        for placement in &plan.placements {
            let address = offset_address(segment_base(placement.segment), placement.offset, module)?;
            addresses.insert(placement.index, address);
            sections.push(LoadedSection {
                name: placement.name.clone(),
                segment: placement.segment,
                address,
                size: u64::try_from(placement.size).map_err(|_| layout_overflow(module))?,
            });
        }

        let symbols = Symbols {
            file: &file,
            module,
            sections: &addresses,
            externals: &externals,
        };

        // SAFETY: the block was just allocated and is owned by `memory`; no
        // other reference to it exists until `link` returns.
        #[expect(unsafe_code)]
        let bytes = unsafe { memory.block_mut().bytes_mut() };

        for placement in &plan.placements {
            // Uninitialized sections stay zero.
            if placement.data.is_empty() {
                continue;
            }
            let start = checked_add(segment_offset(placement.segment)?, placement.offset, module)?;
            let end = checked_add(start, placement.data.len(), module)?;
            bytes
                .get_mut(start..end)
                .ok_or_else(|| layout_overflow(module))?
                .copy_from_slice(placement.data);
        }

        let got_start = checked_add(segment_offset(SegmentKind::ReadOnly)?, plan.got_offset, module)?;
        let mut got_slots: FxHashMap<SymbolIndex, Address> = FxHashMap::default();
        for (slot, index) in plan.got.iter().enumerate() {
            let offset = checked_add(got_start, checked_mul(slot, GOT_SLOT_SIZE, module)?, module)?;
            let value = symbols.address(*index)?;
            bytes
                .get_mut(offset..checked_add(offset, GOT_SLOT_SIZE, module)?)
                .ok_or_else(|| layout_overflow(module))?
                .copy_from_slice(&value.to_le_bytes());
            got_slots.insert(*index, offset_address(base, offset, module)?);
        }

        let mut stub_slots: FxHashMap<SymbolIndex, Address> = FxHashMap::default();
        for (slot, index) in plan.stubs.iter().enumerate() {
            let offset = checked_add(plan.stub_offset, checked_mul(slot, STUB_SIZE, module)?, module)?;
            let stub = reloc::stub_bytes(arch, symbols.address(*index)?)
                .ok_or_else(|| unsupported(module, format!("no call stubs for {arch:?}")))?;
            bytes
                .get_mut(offset..checked_add(offset, STUB_SIZE, module)?)
                .ok_or_else(|| layout_overflow(module))?
                .copy_from_slice(&stub);
            stub_slots.insert(*index, offset_address(base, offset, module)?);
        }

        let mut used_stubs: FxHashSet<SymbolIndex> = FxHashSet::default();
        for placement in &plan.placements {
            let section = file
                .section_by_index(placement.index)
                .map_err(|e| invalid(module, e.to_string()))?;
            let section_address = addresses
                .get(&placement.index)
                .copied()
                .ok_or_else(|| layout_overflow(module))?;
            let section_start = checked_add(segment_offset(placement.segment)?, placement.offset, module)?;
            for (offset, relocation) in section.relocations() {
                let Some(kind) = relocation_kind(arch, relocation.flags(), &placement.name, module)?
                else {
                    continue;
                };
                let offset = usize::try_from(offset).map_err(|_| layout_overflow(module))?;
                if checked_add(offset, kind.width(), module)? > placement.size {
                    return Err(invalid(
                        module,
                        format!("relocation at {offset:#x} is outside `{}`", placement.name),
                    ));
                }
                let place = offset_address(section_address, offset, module)?;
                let field_start = checked_add(section_start, offset, module)?;
                let field = bytes
                    .get_mut(field_start..)
                    .ok_or_else(|| layout_overflow(module))?;

                let (target, symbol) = match relocation.target() {
                    RelocationTarget::Symbol(index) => (symbols.address(index)?, Some(index)),
                    RelocationTarget::Section(index) => (
                        addresses.get(&index).copied().ok_or_else(|| {
                            invalid(module, format!("relocation against unloaded section {}", index.0))
                        })?,
                        None,
                    ),
                    RelocationTarget::Absolute => (0, None),
                    _ => return Err(invalid(module, "unknown relocation target".to_string())),
                };
                let addend = if relocation.has_implicit_addend() {
                    reloc::implicit_addend(kind, field).ok_or_else(|| layout_overflow(module))?
                } else {
                    relocation.addend()
                };

                let target = match symbol {
                    Some(index) if kind.uses_got() => got_slots
                        .get(&index)
                        .copied()
                        .ok_or_else(|| layout_overflow(module))?,
                    _ => target,
                };
                let stub = symbol
                    .filter(|_| kind.uses_stub())
                    .and_then(|index| stub_slots.get(&index).map(|slot| (index, *slot)));

                let result = match stub {
                    Some((index, slot)) if self.options.always_emit_stubs => {
                        used_stubs.insert(index);
                        reloc::apply(kind, field, place, slot, addend)
                    }
                    Some((index, slot)) => match reloc::apply(kind, field, place, target, addend) {
                        Err(_) => {
                            used_stubs.insert(index);
                            reloc::apply(kind, field, place, slot, addend)
                        }
                        ok => ok,
                    },
                    None => reloc::apply(kind, field, place, target, addend),
                };
                result.map_err(|value| JitError::RelocationOverflow {
                    symbol: symbol
                        .map(|index| symbols.name(index))
                        .unwrap_or_else(|| placement.name.clone()),
                    section: placement.name.clone(),
                    value,
                })?;
            }
        }

        let definitions = symbols.definitions()?;
        let image = match debug_image(&file, buffer.as_slice(), &addresses) {
            Some(image) => SavedImage::Debug(image),
            None => {
                tracing::debug!(module, "No debug image for object, keeping original bytes");
                SavedImage::Verbatim(buffer.data().clone())
            }
        };

        memory.finalize()?;
        tracing::debug!(
            module,
            base = format_args!("{base:#x}"),
            sections = sections.len(),
            symbols = definitions.len(),
            stubs = used_stubs.len(),
            "Linked object"
        );

        Ok(LinkedObject {
            name: module.to_string(),
            memory,
            sections,
            symbols: definitions,
            image,
            stubs: used_stubs.len(),
        })
    }

    fn check_header(&self, file: &object::File<'_>, module: &str) -> Result<Architecture, JitError> {
        if file.format() != BinaryFormat::Elf || !file.is_64() {
            return Err(unsupported(
                module,
                format!("{:?} objects are not loadable, only ELF64", file.format()),
            ));
        }
        if file.kind() != ObjectKind::Relocatable {
            return Err(unsupported(
                module,
                format!("expected a relocatable object, found {:?}", file.kind()),
            ));
        }
        if file.is_little_endian() != self.target.little_endian {
            return Err(unsupported(module, "object endianness differs from host".to_string()));
        }
        let arch = match file.architecture() {
            object::Architecture::X86_64 => Architecture::X86_64,
            object::Architecture::Aarch64 => Architecture::Aarch64,
            other => return Err(unsupported(module, format!("architecture {other:?}"))),
        };
        if self.memory.is_executable() && arch != self.target.architecture {
            return Err(unsupported(
                module,
                format!(
                    "object is for {arch:?} but host is {:?}",
                    self.target.architecture
                ),
            ));
        }
        Ok(arch)
    }
}

impl std::fmt::Debug for ObjectLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectLinker")
            .field("target", &self.target)
            .field("options", &self.options)
            .field("executable", &self.memory.is_executable())
            .finish()
    }
}

/// Symbol address lookups for one object once section addresses are known.
struct Symbols<'a, 'data> {
    file: &'a object::File<'data>,
    module: &'a str,
    sections: &'a FxHashMap<SectionIndex, Address>,
    externals: &'a FxHashMap<SymbolIndex, Address>,
}

impl Symbols<'_, '_> {
    fn name(&self, index: SymbolIndex) -> String {
        self.file
            .symbol_by_index(index)
            .ok()
            .and_then(|s| s.name().ok().map(str::to_string))
            .unwrap_or_else(|| format!("<symbol {}>", index.0))
    }

    fn address(&self, index: SymbolIndex) -> Result<Address, JitError> {
        let symbol = self
            .file
            .symbol_by_index(index)
            .map_err(|e| invalid(self.module, e.to_string()))?;
        match symbol.section() {
            SymbolSection::Section(section) => self
                .sections
                .get(&section)
                .and_then(|base| base.checked_add(symbol.address()))
                .ok_or_else(|| {
                    invalid(
                        self.module,
                        format!("symbol `{}` is in a section that is not loaded", self.name(index)),
                    )
                }),
            SymbolSection::Absolute => Ok(symbol.address()),
            SymbolSection::Undefined => self.externals.get(&index).copied().ok_or_else(|| {
                JitError::UnresolvedSymbol {
                    name: self.name(index),
                    module: self.module.to_string(),
                }
            }),
            SymbolSection::Common => Err(unsupported(
                self.module,
                format!("common symbol `{}`", self.name(index)),
            )),
            _ => Err(invalid(
                self.module,
                format!("symbol `{}` has no section", self.name(index)),
            )),
        }
    }

    /// Every named, non-local definition with its final address.
    fn definitions(&self) -> Result<Vec<(CanonicalName, ResolvedSymbol)>, JitError> {
        let mut definitions = Vec::new();
        for symbol in self.file.symbols() {
            if symbol.is_local() || matches!(symbol.kind(), SymbolKind::Section | SymbolKind::File) {
                continue;
            }
            match symbol.section() {
                SymbolSection::Section(_) | SymbolSection::Absolute => {}
                SymbolSection::Common => {
                    return Err(unsupported(
                        self.module,
                        format!("common symbol `{}`", self.name(symbol.index())),
                    ));
                }
                _ => continue,
            }
            let Ok(name) = symbol.name() else { continue };
            if name.is_empty() {
                continue;
            }
            let address = self.address(symbol.index())?;
            let flags = SymbolFlags {
                exported: symbol.scope() == SymbolScope::Dynamic,
                callable: symbol.kind() == SymbolKind::Text,
                weak: symbol.is_weak(),
            };
            definitions.push((
                CanonicalName::verbatim(name),
                ResolvedSymbol::new(address, flags),
            ));
        }
        Ok(definitions)
    }
}

fn plan<'data>(
    file: &object::File<'data>,
    module: &str,
    arch: Architecture,
) -> Result<Plan<'data>, JitError> {
    // Common symbols would need a bss slot the object never describes.
    if let Some(symbol) = file.symbols().find(|s| s.section() == SymbolSection::Common) {
        return Err(unsupported(
            module,
            format!("common symbol `{}`", symbol.name().unwrap_or("?")),
        ));
    }

    let mut plan = Plan::default();
    for section in file.sections() {
        let segment = match section.kind() {
            SectionKind::Text => SegmentKind::Code,
            SectionKind::ReadOnlyData
            | SectionKind::ReadOnlyDataWithRel
            | SectionKind::ReadOnlyString => SegmentKind::ReadOnly,
            SectionKind::Data | SectionKind::UninitializedData => SegmentKind::Data,
            SectionKind::Tls | SectionKind::UninitializedTls => {
                return Err(unsupported(
                    module,
                    format!("thread-local section `{}`", section.name().unwrap_or("?")),
                ));
            }
            _ => continue,
        };
        let name = section
            .name()
            .map_err(|e| invalid(module, e.to_string()))?
            .to_string();
        let align = section.align().max(1);
        if align > MAX_SECTION_ALIGN {
            return Err(unsupported(
                module,
                format!("section `{name}` needs {align}-byte alignment"),
            ));
        }
        let align = usize::try_from(align).map_err(|_| layout_overflow(module))?;
        let size = usize::try_from(section.size()).map_err(|_| layout_overflow(module))?;
        let data = if section.kind() == SectionKind::UninitializedData {
            &[][..]
        } else {
            section.data().map_err(|e| invalid(module, e.to_string()))?
        };
        let cursor = match segment {
            SegmentKind::Code => &mut plan.code,
            SegmentKind::ReadOnly => &mut plan.rodata,
            SegmentKind::Data => &mut plan.data,
        };
        let offset = reserve(cursor, align, size, module)?;
        plan.placements.push(Placement {
            index: section.index(),
            name,
            segment,
            offset,
            size,
            data,
        });
    }

    // Stubs and GOT slots are reserved per distinct symbol.
    let mut stubs = FxHashSet::default();
    let mut got = FxHashSet::default();
    for placement in &plan.placements {
        let section = file
            .section_by_index(placement.index)
            .map_err(|e| invalid(module, e.to_string()))?;
        for (_, relocation) in section.relocations() {
            let Some(kind) = relocation_kind(arch, relocation.flags(), &placement.name, module)?
            else {
                continue;
            };
            let RelocationTarget::Symbol(index) = relocation.target() else {
                continue;
            };
            if kind.uses_got() && got.insert(index) {
                plan.got.push(index);
            }
            if kind.uses_stub() && is_undefined(file, index) && stubs.insert(index) {
                plan.stubs.push(index);
            }
        }
    }
    if !plan.stubs.is_empty() {
        let len = checked_mul(plan.stubs.len(), STUB_SIZE, module)?;
        plan.stub_offset = reserve(&mut plan.code, STUB_SIZE, len, module)?;
    }
    if !plan.got.is_empty() {
        let len = checked_mul(plan.got.len(), GOT_SLOT_SIZE, module)?;
        plan.got_offset = reserve(&mut plan.rodata, GOT_SLOT_SIZE, len, module)?;
    }
    Ok(plan)
}

/// Resolve every undefined symbol referenced from a loaded section.
fn resolve_externals(
    file: &object::File<'_>,
    plan: &Plan<'_>,
    module: &str,
    resolver: &SymbolResolver,
) -> Result<FxHashMap<SymbolIndex, Address>, JitError> {
    let mut externals = FxHashMap::default();
    for placement in &plan.placements {
        let section = file
            .section_by_index(placement.index)
            .map_err(|e| invalid(module, e.to_string()))?;
        for (_, relocation) in section.relocations() {
            let RelocationTarget::Symbol(index) = relocation.target() else {
                continue;
            };
            if externals.contains_key(&index) || !is_undefined(file, index) {
                continue;
            }
            let symbol = file
                .symbol_by_index(index)
                .map_err(|e| invalid(module, e.to_string()))?;
            let name = symbol.name().map_err(|e| invalid(module, e.to_string()))?;
            let canonical = CanonicalName::verbatim(name);
            let address = match resolver.resolve_with_tier(&canonical) {
                Some((tier, resolved)) => {
                    tracing::debug!(
                        module,
                        symbol = name,
                        tier,
                        address = format_args!("{:#x}", resolved.address),
                        "Resolved external symbol"
                    );
                    resolved.address
                }
                // Undefined weak references bind to null.
                None if symbol.is_weak() => 0,
                None => {
                    return Err(JitError::UnresolvedSymbol {
                        name: name.to_string(),
                        module: module.to_string(),
                    });
                }
            };
            externals.insert(index, address);
        }
    }
    Ok(externals)
}

fn is_undefined(file: &object::File<'_>, index: SymbolIndex) -> bool {
    file.symbol_by_index(index)
        .is_ok_and(|s| s.section() == SymbolSection::Undefined)
}

fn relocation_kind(
    arch: Architecture,
    flags: RelocationFlags,
    section: &str,
    module: &str,
) -> Result<Option<RelocKind>, JitError> {
    let RelocationFlags::Elf { r_type } = flags else {
        return Err(invalid(module, format!("non-ELF relocation in `{section}`")));
    };
    reloc::classify(arch, r_type).map_err(|()| JitError::UnsupportedRelocation {
        r_type,
        section: section.to_string(),
    })
}

/// Copy of the object with every loaded section's `sh_addr` set to its load
/// address. `None` when the object carries no symbol table.
fn debug_image(
    file: &object::File<'_>,
    data: &[u8],
    addresses: &FxHashMap<SectionIndex, Address>,
) -> Option<Box<[u8]>> {
    if file.format() != BinaryFormat::Elf || !file.is_64() || file.symbol_table().is_none() {
        return None;
    }
    let mut image = data.to_vec();
    let shoff = usize::try_from(u64::from_le_bytes(
        image.get(E_SHOFF..E_SHOFF.checked_add(8)?)?.try_into().ok()?,
    ))
    .ok()?;
    let shentsize = usize::from(u16::from_le_bytes(
        image
            .get(E_SHENTSIZE..E_SHENTSIZE.checked_add(2)?)?
            .try_into()
            .ok()?,
    ));
    for (index, address) in addresses {
        let at = shoff
            .checked_add(index.0.checked_mul(shentsize)?)?
            .checked_add(SH_ADDR)?;
        image
            .get_mut(at..at.checked_add(8)?)?
            .copy_from_slice(&address.to_le_bytes());
    }
    Some(image.into_boxed_slice())
}

/// Place `size` bytes at the next `align`-aligned offset of a segment.
fn reserve(cursor: &mut usize, align: usize, size: usize, module: &str) -> Result<usize, JitError> {
    let offset = cursor
        .checked_next_multiple_of(align)
        .ok_or_else(|| layout_overflow(module))?;
    *cursor = checked_add(offset, size, module)?;
    Ok(offset)
}

fn checked_add(a: usize, b: usize, module: &str) -> Result<usize, JitError> {
    a.checked_add(b).ok_or_else(|| layout_overflow(module))
}

fn checked_mul(a: usize, b: usize, module: &str) -> Result<usize, JitError> {
    a.checked_mul(b).ok_or_else(|| layout_overflow(module))
}

fn offset_address(base: Address, offset: usize, module: &str) -> Result<Address, JitError> {
    u64::try_from(offset)
        .ok()
        .and_then(|offset| base.checked_add(offset))
        .ok_or_else(|| layout_overflow(module))
}

fn invalid(module: &str, reason: String) -> JitError {
    JitError::InvalidObject {
        module: module.to_string(),
        reason,
    }
}

fn unsupported(module: &str, reason: String) -> JitError {
    JitError::UnsupportedObject {
        module: module.to_string(),
        reason,
    }
}

fn layout_overflow(module: &str) -> JitError {
    invalid(module, "section layout overflows".to_string())
}
