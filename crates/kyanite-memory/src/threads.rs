//! Mutator thread records and the thread registry.
//!
//! Each mutator registers once and carries: an owned young allocation slab,
//! a run state the world coordinator steers, a shadow root table the
//! collectors rewrite in place, and a pending counter for foreign
//! allocation accounting (aggregated at safepoints).

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::ObjectRef;
use crate::young::Slab;

/// How a thread relates to the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    /// Participates in safepoints; the collector waits for it.
    Dependent = 0,
    /// In blocking I/O or foreign code; the collector ignores it.
    Independent = 1,
    /// Independent and parked on a condition variable.
    Sleeping = 2,
}

/// An index into a thread's shadow root table.
///
/// Collections rewrite root slots in place, so the handle stays valid
/// across relocation; re-read through [`ThreadRecord::get_root`] after any
/// safepoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootHandle(usize);

/// Per-mutator state.
pub struct ThreadRecord {
    id: u32,
    pub(crate) slab: UnsafeCell<Slab>,
    run_state: AtomicU8,
    /// Shadow root slots (object addresses; 0 = empty). This is the
    /// cooperative stack walker: code holds anything the collector must
    /// see in here.
    pub(crate) roots: Mutex<Vec<usize>>,
    /// Foreign bytes allocated since the last safepoint aggregation.
    pub(crate) foreign_pending: AtomicI64,
}

// The slab is only touched by the owning thread, or by the collector while
// the owner is stopped at a safepoint.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

impl ThreadRecord {
    fn new(id: u32) -> Self {
        Self {
            id,
            slab: UnsafeCell::new(Slab::empty()),
            run_state: AtomicU8::new(RunState::Dependent as u8),
            roots: Mutex::new(Vec::new()),
            foreign_pending: AtomicI64::new(0),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn run_state(&self) -> RunState {
        match self.run_state.load(Ordering::SeqCst) {
            0 => RunState::Dependent,
            1 => RunState::Independent,
            _ => RunState::Sleeping,
        }
    }

    pub(crate) fn set_run_state(&self, state: RunState) {
        self.run_state.store(state as u8, Ordering::SeqCst);
    }

    /// Slab access for the owning thread's allocation fast path.
    ///
    /// # Safety
    ///
    /// Only the owning thread may call this while running; the collector
    /// may call it only with the world stopped.
    pub(crate) unsafe fn slab_mut(&self) -> &mut Slab {
        unsafe { &mut *self.slab.get() }
    }

    // ------------------------------------------------------------------
    // Shadow roots
    // ------------------------------------------------------------------

    /// Pin `obj` into this thread's root set.
    pub fn push_root(&self, obj: ObjectRef) -> RootHandle {
        let mut roots = self.roots.lock();
        // Reuse a cleared slot before growing.
        if let Some(index) = roots.iter().position(|&slot| slot == 0) {
            roots[index] = obj.addr();
            return RootHandle(index);
        }
        roots.push(obj.addr());
        RootHandle(roots.len() - 1)
    }

    /// Current address of a rooted object. Re-resolves relocation.
    pub fn get_root(&self, handle: RootHandle) -> Option<ObjectRef> {
        let roots = self.roots.lock();
        match roots.get(handle.0).copied() {
            Some(0) | None => None,
            Some(addr) => Some(unsafe { ObjectRef::from_addr(addr) }),
        }
    }

    /// Replace a rooted object.
    pub fn set_root(&self, handle: RootHandle, obj: ObjectRef) {
        let mut roots = self.roots.lock();
        if let Some(slot) = roots.get_mut(handle.0) {
            *slot = obj.addr();
        }
    }

    /// Release a root slot.
    pub fn clear_root(&self, handle: RootHandle) {
        let mut roots = self.roots.lock();
        if let Some(slot) = roots.get_mut(handle.0) {
            *slot = 0;
        }
    }
}

/// Registry of every live mutator.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadRecord>>>,
    next_id: AtomicU32,
}

impl ThreadRegistry {
    pub fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
            // Thread id 0 is reserved as "no thread" in lock owner fields.
            next_id: AtomicU32::new(1),
        }
    }

    pub fn register(&self) -> Arc<ThreadRecord> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = Arc::new(ThreadRecord::new(id));
        self.threads.lock().push(Arc::clone(&record));
        record
    }

    pub fn unregister(&self, record: &Arc<ThreadRecord>) {
        self.threads
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, record));
    }

    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.lock().clone()
    }

    pub fn for_each<F: FnMut(&Arc<ThreadRecord>)>(&self, mut f: F) {
        for record in self.threads.lock().iter() {
            f(record);
        }
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.lock().is_empty()
    }

    /// After `fork`, only the calling thread survives.
    pub(crate) fn retain_only(&self, survivor: &Arc<ThreadRecord>) {
        let mut threads = self.threads.lock();
        threads.retain(|existing| Arc::ptr_eq(existing, survivor));
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        Self::new()
    }
}
