//! GDB JIT interface.
//!
//! Debuggers and profilers that understand JIT code (gdb, lldb, perf with the
//! right plugins) look for two symbols in the process: the descriptor
//! `__jit_debug_descriptor`, which heads a doubly linked list of in-memory
//! object images, and the function `__jit_debug_register_code`, on which they
//! set a breakpoint. Every time the list changes we update the descriptor's
//! `action_flag` and `relevant_entry` and then call the function, so the
//! debugger can read the new image (or drop the old one) while the list is in
//! a consistent state.
//!
//! The `#[repr(C)]` layouts here must match the debugger's expectations
//! bit for bit. Raw list pointers never leave this module; callers only see
//! [`DebugRecordId`].

use std::cell::UnsafeCell;
use std::ptr;
use std::sync::Mutex;

use rustc_hash::FxHashMap;

use crate::error::JitError;

/// Version of the interface the descriptor implements.
pub const JIT_INTERFACE_VERSION: u32 = 1;

/// `jit_actions_t`, stored as a fixed-width `u32` in the descriptor.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitAction {
    NoAction = 0,
    Register = 1,
    Unregister = 2,
}

impl JitAction {
    /// Raw value as stored in `action_flag`.
    pub const fn code(self) -> u32 {
        match self {
            Self::NoAction => 0,
            Self::Register => 1,
            Self::Unregister => 2,
        }
    }
}

/// One node of the debugger-visible list (`struct jit_code_entry`).
#[repr(C)]
#[derive(Debug)]
pub struct JitCodeEntry {
    pub next_entry: *mut JitCodeEntry,
    pub prev_entry: *mut JitCodeEntry,
    pub symfile_addr: *const u8,
    pub symfile_size: u64,
}

/// List head read by the debugger (`struct jit_descriptor`).
#[repr(C)]
#[derive(Debug)]
pub struct JitDescriptor {
    pub version: u32,
    pub action_flag: u32,
    pub relevant_entry: *mut JitCodeEntry,
    pub first_entry: *mut JitCodeEntry,
}

impl JitDescriptor {
    pub const fn new() -> Self {
        Self {
            version: JIT_INTERFACE_VERSION,
            action_flag: JitAction::NoAction.code(),
            relevant_entry: ptr::null_mut(),
            first_entry: ptr::null_mut(),
        }
    }
}

impl Default for JitDescriptor {
    fn default() -> Self {
        Self::new()
    }
}

/// Interior-mutable storage with the exact layout of [`JitDescriptor`].
#[repr(transparent)]
pub struct DescriptorCell(UnsafeCell<JitDescriptor>);

// SAFETY: all writes go through `DebugRegistrar`, which serializes them with
// a mutex. The debugger only reads the descriptor while the process is
// stopped.
#[expect(unsafe_code)]
unsafe impl Sync for DescriptorCell {}

impl DescriptorCell {
    pub const fn new() -> Self {
        Self(UnsafeCell::new(JitDescriptor::new()))
    }

    fn get(&self) -> *mut JitDescriptor {
        self.0.get()
    }
}

impl Default for DescriptorCell {
    fn default() -> Self {
        Self::new()
    }
}

/// The descriptor the debugger reads. The version is set statically because
/// the debugger checks it before any registration happens.
#[unsafe(no_mangle)]
#[allow(non_upper_case_globals)]
pub static __jit_debug_descriptor: DescriptorCell = DescriptorCell::new();

/// Breakpoint target for the debugger. Must not be inlined or elided.
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn __jit_debug_register_code() {
    std::hint::black_box(());
}

/// Identifier of a registered debug record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DebugRecordId(u64);

/// Where a registrar keeps its list head.
enum DescriptorStorage {
    /// The process-wide `__jit_debug_descriptor`.
    Global(&'static DescriptorCell),
    /// A private descriptor, invisible to debuggers.
    Owned(Box<DescriptorCell>),
}

impl DescriptorStorage {
    fn get(&self) -> *mut JitDescriptor {
        match self {
            Self::Global(cell) => cell.get(),
            Self::Owned(cell) => cell.get(),
        }
    }
}

#[derive(Default)]
struct RegistrarState {
    entries: FxHashMap<DebugRecordId, *mut JitCodeEntry>,
    next_id: u64,
}

/// Summary of one list node, in list order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugEntryInfo {
    pub symfile_addr: usize,
    pub symfile_size: u64,
}

/// Owner of a debugger-visible list of object images.
///
/// Registration links the entry first and notifies second; the hook may
/// inspect the list immediately.
pub struct DebugRegistrar {
    descriptor: DescriptorStorage,
    notify: extern "C" fn(),
    state: Mutex<RegistrarState>,
}

// SAFETY: the raw entry pointers in `state` are only dereferenced with the
// mutex held, and entries are heap allocations owned by the registrar.
#[expect(unsafe_code)]
unsafe impl Send for DebugRegistrar {}
#[expect(unsafe_code)]
unsafe impl Sync for DebugRegistrar {}

lazy_static::lazy_static! {
    static ref GLOBAL_REGISTRAR: DebugRegistrar = DebugRegistrar {
        descriptor: DescriptorStorage::Global(&__jit_debug_descriptor),
        notify: __jit_debug_register_code,
        state: Mutex::new(RegistrarState::default()),
    };
}

impl DebugRegistrar {
    /// The registrar for the process-wide descriptor.
    pub fn global() -> &'static DebugRegistrar {
        &GLOBAL_REGISTRAR
    }

    /// A registrar with its own descriptor and notification hook. Nothing
    /// outside the process sees it.
    pub fn private(notify: extern "C" fn()) -> Self {
        Self {
            descriptor: DescriptorStorage::Owned(Box::new(DescriptorCell::new())),
            notify,
            state: Mutex::new(RegistrarState::default()),
        }
    }

    /// Link an image at the head of the list and notify the debugger.
    ///
    /// # Safety
    ///
    /// `image` must stay valid and unmoved until the record is unregistered.
    #[expect(unsafe_code)]
    pub unsafe fn register(&self, image: &[u8]) -> Result<DebugRecordId, JitError> {
        if image.is_empty() {
            return Err(JitError::DebugRegistration(
                "attempt to register an empty image".to_string(),
            ));
        }
        let symfile_size = u64::try_from(image.len())
            .map_err(|_| JitError::DebugRegistration("debug image too large".to_string()))?;
        let entry = Box::into_raw(Box::new(JitCodeEntry {
            next_entry: ptr::null_mut(),
            prev_entry: ptr::null_mut(),
            symfile_addr: image.as_ptr(),
            symfile_size,
        }));

        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut state = self.state.lock().unwrap();
        let descriptor = self.descriptor.get();
        // SAFETY: we hold the lock; `entry` is a fresh allocation and the
        // current head, if any, is a live entry owned by this registrar.
        unsafe {
            let head = (*descriptor).first_entry;
            (*entry).next_entry = head;
            if !head.is_null() {
                (*head).prev_entry = entry;
            }
            (*descriptor).first_entry = entry;
            (*descriptor).relevant_entry = entry;
            (*descriptor).action_flag = JitAction::Register.code();
        }
        (self.notify)();

        let id = DebugRecordId(state.next_id);
        state.next_id = state.next_id.wrapping_add(1);
        state.entries.insert(id, entry);
        tracing::debug!(
            record = id.0,
            symfile_size,
            "Registered JIT object with debugger"
        );
        Ok(id)
    }

    /// Unlink a record, notify the debugger, then free the record.
    pub fn unregister(&self, id: DebugRecordId) -> bool {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let mut state = self.state.lock().unwrap();
        let Some(entry) = state.entries.remove(&id) else {
            return false;
        };
        let descriptor = self.descriptor.get();
        // SAFETY: we hold the lock; `entry` and its neighbours are live
        // entries owned by this registrar.
        #[expect(unsafe_code)]
        unsafe {
            let prev = (*entry).prev_entry;
            let next = (*entry).next_entry;
            if prev.is_null() {
                (*descriptor).first_entry = next;
            } else {
                (*prev).next_entry = next;
            }
            if !next.is_null() {
                (*next).prev_entry = prev;
            }
            (*descriptor).relevant_entry = entry;
            (*descriptor).action_flag = JitAction::Unregister.code();
        }
        (self.notify)();
        // SAFETY: the entry is unlinked and the debugger has been told.
        #[expect(unsafe_code)]
        unsafe {
            (*descriptor).relevant_entry = ptr::null_mut();
            (*descriptor).action_flag = JitAction::NoAction.code();
            drop(Box::from_raw(entry));
        }
        tracing::debug!(record = id.0, "Unregistered JIT object from debugger");
        true
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let state = self.state.lock().unwrap();
        state.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Walk the list from `first_entry`, in list order.
    pub fn entries(&self) -> Vec<DebugEntryInfo> {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let _state = self.state.lock().unwrap();
        let mut out = Vec::new();
        // SAFETY: lock held; every reachable node is a live entry.
        #[expect(unsafe_code)]
        unsafe {
            let mut node = (*self.descriptor.get()).first_entry;
            while !node.is_null() {
                out.push(DebugEntryInfo {
                    symfile_addr: (*node).symfile_addr.addr(),
                    symfile_size: (*node).symfile_size,
                });
                node = (*node).next_entry;
            }
        }
        out
    }

    /// Whether the list is a well-formed doubly linked list whose length
    /// matches the number of live records: the head has no predecessor and
    /// every `next->prev` points back.
    pub fn is_well_formed(&self) -> bool {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let state = self.state.lock().unwrap();
        let mut count = 0usize;
        // SAFETY: lock held; every reachable node is a live entry.
        #[expect(unsafe_code)]
        unsafe {
            let descriptor = self.descriptor.get();
            if (*descriptor).version != JIT_INTERFACE_VERSION {
                return false;
            }
            let mut node = (*descriptor).first_entry;
            if !node.is_null() && !(*node).prev_entry.is_null() {
                return false;
            }
            while !node.is_null() {
                count = count.saturating_add(1);
                if count > state.entries.len() {
                    return false;
                }
                let next = (*node).next_entry;
                if !next.is_null() && (*next).prev_entry != node {
                    return false;
                }
                node = next;
            }
        }
        count == state.entries.len()
    }

    /// Current `action_flag` of the descriptor.
    pub fn last_action(&self) -> u32 {
        #[expect(clippy::unwrap_used, reason = "Mutex poisoning is unrecoverable")]
        let _state = self.state.lock().unwrap();
        // SAFETY: lock held.
        #[expect(unsafe_code)]
        let action = unsafe { (*self.descriptor.get()).action_flag };
        action
    }
}

impl Drop for DebugRegistrar {
    fn drop(&mut self) {
        let ids: Vec<DebugRecordId> = match self.state.get_mut() {
            Ok(state) => state.entries.keys().copied().collect(),
            Err(_) => return,
        };
        for id in ids {
            self.unregister(id);
        }
    }
}

impl std::fmt::Debug for DebugRegistrar {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugRegistrar")
            .field(
                "global",
                &matches!(self.descriptor, DescriptorStorage::Global(_)),
            )
            .field("records", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    static HOOK_CALLS: AtomicU64 = AtomicU64::new(0);

    extern "C" fn counting_hook() {
        HOOK_CALLS.fetch_add(1, Ordering::SeqCst);
    }

    extern "C" fn quiet_hook() {}

    #[test]
    fn test_descriptor_layout_matches_gdb() {
        assert_eq!(std::mem::size_of::<JitCodeEntry>(), 32);
        assert_eq!(std::mem::offset_of!(JitCodeEntry, next_entry), 0);
        assert_eq!(std::mem::offset_of!(JitCodeEntry, prev_entry), 8);
        assert_eq!(std::mem::offset_of!(JitCodeEntry, symfile_addr), 16);
        assert_eq!(std::mem::offset_of!(JitCodeEntry, symfile_size), 24);

        assert_eq!(std::mem::size_of::<JitDescriptor>(), 24);
        assert_eq!(std::mem::offset_of!(JitDescriptor, version), 0);
        assert_eq!(std::mem::offset_of!(JitDescriptor, action_flag), 4);
        assert_eq!(std::mem::offset_of!(JitDescriptor, relevant_entry), 8);
        assert_eq!(std::mem::offset_of!(JitDescriptor, first_entry), 16);
        assert_eq!(
            std::mem::size_of::<DescriptorCell>(),
            std::mem::size_of::<JitDescriptor>()
        );
    }

    #[test]
    fn test_register_links_at_head_and_notifies_once() {
        let registrar = DebugRegistrar::private(counting_hook);
        let a = vec![1u8; 16];
        let b = vec![2u8; 32];

        let before = HOOK_CALLS.load(Ordering::SeqCst);
        #[expect(unsafe_code)]
        let _ida = unsafe { registrar.register(&a) }.unwrap();
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), before + 1);
        #[expect(unsafe_code)]
        let _idb = unsafe { registrar.register(&b) }.unwrap();
        assert_eq!(HOOK_CALLS.load(Ordering::SeqCst), before + 2);

        let entries = registrar.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].symfile_addr, b.as_ptr().addr());
        assert_eq!(entries[0].symfile_size, 32);
        assert_eq!(entries[1].symfile_addr, a.as_ptr().addr());
        assert_eq!(registrar.last_action(), JitAction::Register.code());
        assert!(registrar.is_well_formed());
    }

    #[test]
    fn test_unregister_middle_relinks_neighbours() {
        let registrar = DebugRegistrar::private(quiet_hook);
        let images: Vec<Vec<u8>> = (1..=3u8).map(|i| vec![i; 8]).collect();
        #[expect(unsafe_code)]
        let ids: Vec<DebugRecordId> = images
            .iter()
            .map(|img| unsafe { registrar.register(img) }.unwrap())
            .collect();

        // List order is newest first: 3, 2, 1. Drop the middle one.
        assert!(registrar.unregister(ids[1]));
        assert!(registrar.is_well_formed());
        let addrs: Vec<usize> = registrar.entries().iter().map(|e| e.symfile_addr).collect();
        assert_eq!(addrs, vec![images[2].as_ptr().addr(), images[0].as_ptr().addr()]);
        assert_eq!(registrar.last_action(), JitAction::NoAction.code());

        // Then the head, then the tail.
        assert!(registrar.unregister(ids[2]));
        assert!(registrar.is_well_formed());
        assert!(registrar.unregister(ids[0]));
        assert!(registrar.is_well_formed());
        assert!(registrar.is_empty());
        assert!(registrar.entries().is_empty());
    }

    #[test]
    fn test_unregister_unknown_record_is_noop() {
        let registrar = DebugRegistrar::private(quiet_hook);
        let image = vec![0u8; 4];
        #[expect(unsafe_code)]
        let id = unsafe { registrar.register(&image) }.unwrap();
        assert!(registrar.unregister(id));
        assert!(!registrar.unregister(id));
        assert!(registrar.is_well_formed());
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let registrar = DebugRegistrar::private(quiet_hook);
        #[expect(unsafe_code)]
        let result = unsafe { registrar.register(&[]) };
        let err = result.unwrap_err();
        assert!(matches!(err, JitError::DebugRegistration(_)), "{err}");
        assert!(!err.is_fatal());
        assert!(registrar.is_empty());
    }

    #[test]
    fn test_global_descriptor_has_static_version() {
        // SAFETY: reading a field of the static descriptor.
        #[expect(unsafe_code)]
        let version = unsafe { (*__jit_debug_descriptor.get()).version };
        assert_eq!(version, JIT_INTERFACE_VERSION);
    }
}
