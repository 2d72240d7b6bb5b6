//! The remembered set: mature objects known to hold young pointers.
//!
//! Fed by the facade's write barrier, consumed as extra roots by the young
//! collector so it never scans the mature heap, and pruned at every mature
//! collection. The per-object remembered bit keeps the set duplicate-free.

use parking_lot::Mutex;

use crate::object::ObjectRef;

pub struct RememberedSet {
    objects: Mutex<Vec<ObjectRef>>,
}

impl RememberedSet {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(Vec::new()),
        }
    }

    /// Record `obj` as containing young pointers. Idempotent.
    pub fn remember(&self, obj: ObjectRef) {
        debug_assert!(!obj.is_young());
        if obj.test_and_set_remembered() {
            self.objects.lock().push(obj);
        }
    }

    /// The current entries, for root scanning.
    pub fn snapshot(&self) -> Vec<ObjectRef> {
        self.objects.lock().clone()
    }

    /// Drop entries `keep` rejects, clearing their remembered bit so they
    /// can re-enter later.
    pub fn prune<F: FnMut(ObjectRef) -> bool>(&self, mut keep: F) {
        let mut objects = self.objects.lock();
        objects.retain(|&obj| {
            if keep(obj) {
                true
            } else {
                obj.clear_remembered();
                false
            }
        });
    }

    /// Mature-collection prune: `fate` returns the entry's current address
    /// (objects may have been evacuated) or `None` to drop it. Dropped
    /// entries get their remembered bit cleared at their current address
    /// so the write barrier can re-record them later.
    pub fn retain_map<F: FnMut(ObjectRef) -> Option<ObjectRef>>(&self, mut fate: F) {
        let mut objects = self.objects.lock();
        let mut kept = Vec::with_capacity(objects.len());
        for &obj in objects.iter() {
            match fate(obj) {
                Some(current) => kept.push(current),
                None => obj.resolve().clear_remembered(),
            }
        }
        *objects = kept;
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

impl Default for RememberedSet {
    fn default() -> Self {
        Self::new()
    }
}
