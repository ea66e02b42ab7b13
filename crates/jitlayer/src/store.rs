//! Code-object store.
//!
//! Owns every linked object until it is explicitly unloaded. Objects are
//! shared as `Arc<CodeObject>`: unloading drops the store's reference, and
//! the memory goes back to the manager when the last clone is gone, so a
//! reader that found an object through [`CodeObjectStore::lookup_address`]
//! never sees it freed underneath.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::linker::{LinkedObject, LoadedSection, SavedImage};
use crate::mangle::CanonicalName;
use crate::types::{Address, CodeObjectId, ResolvedSymbol};

/// Machine code and data of one linked module, resident in memory.
#[derive(Debug)]
pub struct CodeObject {
    id: CodeObjectId,
    linked: LinkedObject,
}

impl CodeObject {
    pub fn id(&self) -> CodeObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.linked.name()
    }

    /// Address of the first byte of the object's memory block.
    pub fn base_address(&self) -> Address {
        self.linked.memory().block().base_address()
    }

    /// Size of the memory block in bytes.
    pub fn size(&self) -> usize {
        self.linked.memory().block().len()
    }

    pub fn contains(&self, address: Address) -> bool {
        self.linked.memory().block().contains(address)
    }

    pub fn sections(&self) -> &[LoadedSection] {
        self.linked.sections()
    }

    pub fn symbols(&self) -> &[(CanonicalName, ResolvedSymbol)] {
        self.linked.symbols()
    }

    /// The object image kept for debuggers, or the original bytes.
    pub fn image(&self) -> &SavedImage {
        self.linked.image()
    }

    pub fn stubs(&self) -> usize {
        self.linked.stubs()
    }
}

/// Thread-safe registry of resident code objects.
#[derive(Debug, Default)]
pub struct CodeObjectStore {
    objects: RwLock<FxHashMap<CodeObjectId, Arc<CodeObject>>>,
    next_id: AtomicU64,
}

impl CodeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a linked object and keep it resident.
    pub fn retain(&self, linked: LinkedObject) -> Arc<CodeObject> {
        // Ids are never reused, so a released id stays dead.
        let id = CodeObjectId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let object = Arc::new(CodeObject { id, linked });
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut objects = self.objects.write().unwrap();
        objects.insert(id, Arc::clone(&object));
        tracing::debug!(
            object = %id,
            module = object.name(),
            base = format_args!("{:#x}", object.base_address()),
            size = object.size(),
            "Retained code object"
        );
        object
    }

    pub fn get(&self, id: CodeObjectId) -> Option<Arc<CodeObject>> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let objects = self.objects.read().unwrap();
        objects.get(&id).cloned()
    }

    /// Drop the store's ownership of an object.
    ///
    /// Returns the store's reference so the caller controls when it is
    /// dropped; `None` if the id is not resident.
    ///
    /// # Safety
    ///
    /// No code may still call into, or read data from, the object once every
    /// outstanding `Arc<CodeObject>` is dropped.
    #[expect(unsafe_code)]
    pub unsafe fn release(&self, id: CodeObjectId) -> Option<Arc<CodeObject>> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let mut objects = self.objects.write().unwrap();
        let object = objects.remove(&id)?;
        tracing::debug!(object = %id, module = object.name(), "Released code object");
        Some(object)
    }

    /// Find the object whose memory contains `address`, with the offset of
    /// `address` from the object's base.
    pub fn lookup_address(&self, address: Address) -> Option<(Arc<CodeObject>, u64)> {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let objects = self.objects.read().unwrap();
        objects
            .values()
            .find(|object| object.contains(address))
            .map(|object| (Arc::clone(object), address.wrapping_sub(object.base_address())))
    }

    pub fn len(&self) -> usize {
        #[expect(clippy::unwrap_used, reason = "RwLock poisoning is unrecoverable")]
        let objects = self.objects.read().unwrap();
        objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
