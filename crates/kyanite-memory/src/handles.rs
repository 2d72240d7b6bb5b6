//! The foreign handle table.
//!
//! Foreign code never holds raw object addresses; it holds slots in this
//! table and dereferences through them on every use. Strong entries are GC
//! roots. Weak entries do not keep their object alive and are nulled when
//! it dies. Registration goes through the facade, which also inflates the
//! object's header and pins it against mature-space evacuation.

use parking_lot::Mutex;

use crate::object::ObjectRef;

/// A slot in the foreign handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignHandle(u32);

impl ForeignHandle {
    /// The table slot index, stable for the handle's lifetime.
    pub fn index(self) -> u32 {
        self.0
    }
}

struct HandleEntry {
    /// Current object address; 0 when dead or free.
    object: usize,
    weak: bool,
    in_use: bool,
}

pub struct HandleTable {
    entries: Mutex<Vec<HandleEntry>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, obj: ObjectRef, weak: bool) -> ForeignHandle {
        let mut entries = self.entries.lock();
        for (index, entry) in entries.iter_mut().enumerate() {
            if !entry.in_use {
                entry.object = obj.addr();
                entry.weak = weak;
                entry.in_use = true;
                return ForeignHandle(index as u32);
            }
        }
        entries.push(HandleEntry {
            object: obj.addr(),
            weak,
            in_use: true,
        });
        ForeignHandle((entries.len() - 1) as u32)
    }

    /// The handle's current object, or `None` once the object died (weak
    /// handles only) or the handle was released.
    pub fn resolve(&self, handle: ForeignHandle) -> Option<ObjectRef> {
        let entries = self.entries.lock();
        let entry = entries.get(handle.0 as usize)?;
        if !entry.in_use || entry.object == 0 {
            return None;
        }
        Some(unsafe { ObjectRef::from_addr(entry.object) })
    }

    pub fn release(&self, handle: ForeignHandle) -> Option<ObjectRef> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(handle.0 as usize)?;
        if !entry.in_use {
            return None;
        }
        entry.in_use = false;
        let obj = match entry.object {
            0 => None,
            addr => Some(unsafe { ObjectRef::from_addr(addr) }),
        };
        entry.object = 0;
        obj
    }

    pub fn live_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.in_use)
            .count()
    }

    /// Visit every strong entry as a root; the visitor returns the new
    /// address when the object moved.
    pub(crate) fn update_strong<F: FnMut(ObjectRef) -> Option<ObjectRef>>(&self, mut f: F) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.in_use && !entry.weak && entry.object != 0 {
                let obj = unsafe { ObjectRef::from_addr(entry.object) };
                if let Some(moved) = f(obj) {
                    entry.object = moved.addr();
                }
            }
        }
    }

    /// Reconcile weak entries after a collection: `fate` returns the
    /// object's current address, or `None` when it died.
    pub(crate) fn prune_dead<F: FnMut(ObjectRef) -> Option<ObjectRef>>(&self, mut fate: F) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.in_use && entry.weak && entry.object != 0 {
                let obj = unsafe { ObjectRef::from_addr(entry.object) };
                entry.object = fate(obj).map_or(0, ObjectRef::addr);
            }
        }
    }
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}
