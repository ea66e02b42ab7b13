//! Memory for linked code objects.
//!
//! The linker asks a [`MemoryManager`] for one contiguous block per object,
//! split into three page-aligned segments: code, read-only data and writable
//! data. Keeping one object in one block keeps intra-object PC-relative
//! references within range. Blocks never move; they are released only after
//! the owning code object is unloaded and the last reader is gone.

use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::Arc;

use crate::error::JitError;
use crate::types::Address;

/// Fallback page size when the platform does not report one.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Requested segment sizes, in bytes, before page rounding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentLayout {
    pub code: usize,
    pub rodata: usize,
    pub data: usize,
}

/// A block of memory holding one object's segments.
///
/// Segment boundaries are page-aligned so the manager can protect them
/// independently.
#[derive(Debug)]
pub struct MemoryBlock {
    base: NonNull<u8>,
    code_len: usize,
    rodata_len: usize,
    data_len: usize,
}

// SAFETY: the block is a plain address range. Mutation happens only while
// the linker has exclusive ownership; afterwards the code and read-only
// segments are immutable.
#[expect(unsafe_code)]
unsafe impl Send for MemoryBlock {}
#[expect(unsafe_code)]
unsafe impl Sync for MemoryBlock {}

impl MemoryBlock {
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Address of the first byte of the block.
    pub fn base_address(&self) -> Address {
        address_of(self.base.as_ptr())
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.code_len
            .saturating_add(self.rodata_len)
            .saturating_add(self.data_len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn code_len(&self) -> usize {
        self.code_len
    }

    pub fn rodata_len(&self) -> usize {
        self.rodata_len
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Offset of the read-only segment from the block base.
    pub fn rodata_offset(&self) -> usize {
        self.code_len
    }

    /// Offset of the writable segment from the block base.
    pub fn data_offset(&self) -> usize {
        self.code_len.saturating_add(self.rodata_len)
    }

    /// Whether `address` falls inside the block.
    pub fn contains(&self, address: Address) -> bool {
        let start = self.base_address();
        let len = u64::try_from(self.len()).unwrap_or(u64::MAX);
        address >= start && address.wrapping_sub(start) < len
    }

    /// Mutable view of the whole block.
    ///
    /// # Safety
    ///
    /// The caller must have exclusive access to the block and the block must
    /// not have been finalized yet.
    #[expect(unsafe_code)]
    pub(crate) unsafe fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: the manager handed out `len()` bytes at `base`; exclusivity
        // is the caller's obligation.
        unsafe { std::slice::from_raw_parts_mut(self.base.as_ptr(), self.len()) }
    }
}

/// Contract for the allocator that backs code objects.
pub trait MemoryManager: Send + Sync {
    /// Reserve a zeroed, writable block large enough for `layout`, with each
    /// segment rounded up to a page boundary.
    fn allocate(&self, layout: SegmentLayout) -> Result<MemoryBlock, JitError>;

    /// Apply final protections: code executable, read-only data read-only.
    /// Must also make freshly written code visible to instruction fetch.
    fn finalize(&self, block: &MemoryBlock) -> Result<(), JitError>;

    /// Return a block to the system.
    ///
    /// # Safety
    ///
    /// No address inside `block` may be used after this call.
    #[expect(unsafe_code)]
    unsafe fn release(&self, block: MemoryBlock);

    /// Whether finalized code in blocks from this manager can be executed.
    fn is_executable(&self) -> bool;
}

/// A [`MemoryBlock`] that goes back to its manager when dropped.
pub struct OwnedMemory {
    block: ManuallyDrop<MemoryBlock>,
    manager: Arc<dyn MemoryManager>,
}

impl OwnedMemory {
    pub(crate) fn new(block: MemoryBlock, manager: Arc<dyn MemoryManager>) -> Self {
        Self {
            block: ManuallyDrop::new(block),
            manager,
        }
    }

    pub fn block(&self) -> &MemoryBlock {
        &self.block
    }

    pub(crate) fn block_mut(&mut self) -> &mut MemoryBlock {
        &mut self.block
    }

    pub(crate) fn finalize(&self) -> Result<(), JitError> {
        self.manager.finalize(&self.block)
    }
}

impl Drop for OwnedMemory {
    #[expect(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: `block` is never used again after being taken here; whoever
        // held addresses into it has given them up by dropping the owner.
        unsafe {
            let block = ManuallyDrop::take(&mut self.block);
            self.manager.release(block);
        }
    }
}

impl std::fmt::Debug for OwnedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedMemory")
            .field("base", &format_args!("{:#x}", self.block.base_address()))
            .field("len", &self.block.len())
            .field("executable", &self.manager.is_executable())
            .finish()
    }
}

fn address_of(ptr: *const u8) -> Address {
    u64::try_from(ptr.expose_provenance()).unwrap_or(u64::MAX)
}

fn round_up(len: usize, page: usize) -> Result<usize, JitError> {
    len.checked_next_multiple_of(page)
        .ok_or_else(|| JitError::Allocation(format!("segment of {len} bytes is too large")))
}

fn rounded(layout: SegmentLayout, page: usize) -> Result<(usize, usize, usize, usize), JitError> {
    let code = round_up(layout.code, page)?;
    let rodata = round_up(layout.rodata, page)?;
    let data = round_up(layout.data, page)?;
    let total = code
        .checked_add(rodata)
        .and_then(|t| t.checked_add(data))
        .ok_or_else(|| JitError::Allocation("object layout overflows".to_string()))?;
    // An empty object still gets a page so its base address is unique.
    Ok((code, rodata, data, total.max(page)))
}

/// Page-aligned heap blocks that are never made executable.
///
/// Useful when objects only need to be linked and inspected, e.g. data-only
/// modules or tests that check relocation results.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapMemoryManager;

impl HeapMemoryManager {
    pub fn new() -> Self {
        Self
    }

    fn layout(total: usize) -> Result<std::alloc::Layout, JitError> {
        std::alloc::Layout::from_size_align(total, DEFAULT_PAGE_SIZE)
            .map_err(|e| JitError::Allocation(e.to_string()))
    }
}

impl MemoryManager for HeapMemoryManager {
    fn allocate(&self, layout: SegmentLayout) -> Result<MemoryBlock, JitError> {
        let (code_len, rodata_len, data_len, total) = rounded(layout, DEFAULT_PAGE_SIZE)?;
        let alloc_layout = Self::layout(total)?;
        // SAFETY: `total` is at least one page, so the layout is non-zero.
        #[expect(unsafe_code)]
        let ptr = unsafe { std::alloc::alloc_zeroed(alloc_layout) };
        let base = NonNull::new(ptr)
            .ok_or_else(|| JitError::Allocation(format!("heap block of {total} bytes")))?;
        // Unused tail space (empty objects) is attributed to the data segment.
        let data_len = data_len.max(total.saturating_sub(code_len.saturating_add(rodata_len)));
        Ok(MemoryBlock {
            base,
            code_len,
            rodata_len,
            data_len,
        })
    }

    fn finalize(&self, _block: &MemoryBlock) -> Result<(), JitError> {
        Ok(())
    }

    #[expect(unsafe_code)]
    unsafe fn release(&self, block: MemoryBlock) {
        if let Ok(layout) = Self::layout(block.len()) {
            // SAFETY: the block was produced by `allocate` with this layout.
            unsafe { std::alloc::dealloc(block.base.as_ptr(), layout) };
        }
    }

    fn is_executable(&self) -> bool {
        false
    }
}

/// Anonymous `mmap` blocks with `mprotect`-enforced segment permissions.
#[cfg(unix)]
#[derive(Debug, Clone, Copy)]
pub struct MmapMemoryManager {
    page_size: usize,
}

#[cfg(unix)]
impl MmapMemoryManager {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions.
        #[expect(unsafe_code)]
        let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = usize::try_from(reported)
            .ok()
            .filter(|p| p.is_power_of_two())
            .unwrap_or(DEFAULT_PAGE_SIZE);
        Self { page_size }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    #[expect(unsafe_code)]
    fn protect(&self, block: &MemoryBlock, offset: usize, len: usize, prot: libc::c_int) -> Result<(), JitError> {
        if len == 0 {
            return Ok(());
        }
        // SAFETY: `offset..offset + len` lies inside the mapping created by
        // `allocate` and is page aligned.
        let rc = unsafe {
            libc::mprotect(
                block.base.as_ptr().wrapping_add(offset).cast::<libc::c_void>(),
                len,
                prot,
            )
        };
        if rc != 0 {
            return Err(JitError::Allocation(format!(
                "mprotect failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

#[cfg(unix)]
impl Default for MmapMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl MemoryManager for MmapMemoryManager {
    fn allocate(&self, layout: SegmentLayout) -> Result<MemoryBlock, JitError> {
        let (code_len, rodata_len, data_len, total) = rounded(layout, self.page_size)?;
        // SAFETY: anonymous private mapping with no address hint.
        #[expect(unsafe_code)]
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::Allocation(format!(
                "mmap of {total} bytes failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let base = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| JitError::Allocation("mmap returned null".to_string()))?;
        let data_len = data_len.max(total.saturating_sub(code_len.saturating_add(rodata_len)));
        Ok(MemoryBlock {
            base,
            code_len,
            rodata_len,
            data_len,
        })
    }

    fn finalize(&self, block: &MemoryBlock) -> Result<(), JitError> {
        flush_icache(block.base.as_ptr(), block.code_len);
        self.protect(block, 0, block.code_len, libc::PROT_READ | libc::PROT_EXEC)?;
        self.protect(block, block.rodata_offset(), block.rodata_len, libc::PROT_READ)?;
        Ok(())
    }

    #[expect(unsafe_code)]
    unsafe fn release(&self, block: MemoryBlock) {
        // SAFETY: the mapping was created by `allocate` with exactly this length.
        let rc = unsafe { libc::munmap(block.base.as_ptr().cast::<libc::c_void>(), block.len()) };
        if rc != 0 {
            tracing::warn!(
                base = format_args!("{:#x}", block.base_address()),
                error = %std::io::Error::last_os_error(),
                "munmap failed while releasing code object"
            );
        }
    }

    fn is_executable(&self) -> bool {
        true
    }
}

/// Make newly written instructions visible to instruction fetch.
#[cfg(target_arch = "aarch64")]
#[expect(unsafe_code)]
fn flush_icache(start: *const u8, len: usize) {
    use std::arch::asm;

    if len == 0 {
        return;
    }
    let start = start.addr();
    let end = start.saturating_add(len);
    let ctr: u64;
    // SAFETY: CTR_EL0 is readable from EL0 on Linux.
    unsafe { asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let dline = 4usize << ((ctr >> 16) & 0xf);
    let iline = 4usize << (ctr & 0xf);

    let mut addr = start & !dline.wrapping_sub(1);
    while addr < end {
        // SAFETY: cleaning a cache line of mapped memory has no other effect.
        unsafe { asm!("dc cvau, {}", in(reg) addr, options(nostack)) };
        addr = addr.wrapping_add(dline);
    }
    // SAFETY: barrier.
    unsafe { asm!("dsb ish", options(nostack)) };
    let mut addr = start & !iline.wrapping_sub(1);
    while addr < end {
        // SAFETY: invalidating an instruction cache line has no other effect.
        unsafe { asm!("ic ivau, {}", in(reg) addr, options(nostack)) };
        addr = addr.wrapping_add(iline);
    }
    // SAFETY: barriers.
    unsafe { asm!("dsb ish", "isb", options(nostack)) };
}

/// x86 keeps instruction and data caches coherent.
#[cfg(not(target_arch = "aarch64"))]
fn flush_icache(_start: *const u8, _len: usize) {}
