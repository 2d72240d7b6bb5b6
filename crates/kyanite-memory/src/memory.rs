//! The object memory facade and collection driver.
//!
//! `ObjectMemory` owns the three pools, the inflated header table, the
//! foreign handle table, the remembered set, and the world coordinator,
//! and is the only entry point mutators use: size-routed allocation,
//! identity assignment, the header inflation family, object locking with
//! contention, foreign allocation accounting, and the safepoint-driven
//! collection driver.

use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::config::Config;
use crate::handles::{ForeignHandle, HandleTable};
use crate::header::{HeaderWord, Meaning, THIN_LOCK_MAX_COUNT};
use crate::immix::collect::MatureCollection;
use crate::immix::marker::ImmixMarker;
use crate::immix::{mark_object, ImmixSpace, MarkStack};
use crate::inflated::{InflatedHeaderTable, LockStatus};
use crate::large::LargeSpace;
use crate::metrics::{CollectionKind, MemoryMetrics};
use crate::object::{
    align_up, ObjectPosition, ObjectRef, TypeInfo, TypeTable, Zone, HEADER_BYTES, WORD,
};
use crate::remember::RememberedSet;
use crate::services::{
    CodeManager, FinalizerService, NullCodeManager, NullFinalizer, NullSymbolTable, SymbolTable,
};
use crate::sync::{LockOrder, SpinLock};
use crate::threads::{ThreadRecord, ThreadRegistry};
use crate::world::WorldState;
use crate::young::{YoungCollection, YoungSpace};

/// Bytes of per-thread foreign allocation buffered before flushing into
/// the global budget.
const FOREIGN_FLUSH_BYTES: i64 = 1024 * 1024;

/// How often a contention waiter re-checks the header without a wakeup.
const CONTENTION_RECHECK: Duration = Duration::from_millis(10);

/// Errors surfaced to mutators.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    /// All three pools refused the request; collection flags are set, so
    /// the caller should reach a safepoint and retry.
    #[error("out of memory allocating {0} bytes")]
    OutOfMemory(usize),
}

/// The object memory core.
pub struct ObjectMemory {
    config: Config,
    types: TypeTable,

    young: UnsafeCell<YoungSpace>,
    immix: UnsafeCell<ImmixSpace>,
    large: UnsafeCell<LargeSpace>,

    inflated: InflatedHeaderTable,
    handles: HandleTable,
    remembered: RememberedSet,
    weak_refs: Mutex<Vec<ObjectRef>>,
    internal_roots: Mutex<Vec<usize>>,

    world: WorldState,
    registry: ThreadRegistry,

    finalizer: Box<dyn FinalizerService>,
    code_manager: Box<dyn CodeManager>,
    symbols: Box<dyn SymbolTable>,
    metrics: MemoryMetrics,

    /// Current mark epoch, alternating between 2 and 3 at each mature
    /// collection.
    epoch: AtomicU8,
    collect_young_flag: AtomicBool,
    collect_mature_flag: AtomicBool,
    mature_in_progress: AtomicBool,
    mature_finish_ready: AtomicBool,
    allow_gc: AtomicBool,
    /// Driver reentrancy check: at most one collection at a time.
    in_collection: AtomicBool,

    allocation_lock: SpinLock,
    inflation_lock: SpinLock,
    contention_lock: Mutex<()>,
    contention_var: Condvar,

    last_object_id: AtomicU64,
    foreign_budget: AtomicI64,

    mark_stack: Mutex<MarkStack>,
    /// Insertion-barrier feed for the concurrent marker.
    mark_feed: SegQueue<ObjectRef>,
    marker: Mutex<Option<ImmixMarker>>,
}

// The unsafe cells are only touched under the allocation lock or with the
// world stopped; everything else is internally synchronized.
unsafe impl Send for ObjectMemory {}
unsafe impl Sync for ObjectMemory {}

impl ObjectMemory {
    /// Build a memory with no-op collaborators.
    pub fn new(config: Config) -> io::Result<Arc<ObjectMemory>> {
        Self::with_services(
            config,
            Box::new(NullFinalizer),
            Box::new(NullCodeManager),
            Box::new(NullSymbolTable),
        )
    }

    /// Build a memory wired to the given collaborator services.
    pub fn with_services(
        config: Config,
        finalizer: Box<dyn FinalizerService>,
        code_manager: Box<dyn CodeManager>,
        symbols: Box<dyn SymbolTable>,
    ) -> io::Result<Arc<ObjectMemory>> {
        let young = YoungSpace::new(config.young_bytes)?;
        let foreign_budget = config.malloc_threshold as i64;
        let mark_stack_limit = config.mark_stack_limit;
        let concurrent = config.immix_concurrent;

        let mem = Arc::new(ObjectMemory {
            config,
            types: TypeTable::new(),
            young: UnsafeCell::new(young),
            immix: UnsafeCell::new(ImmixSpace::new()),
            large: UnsafeCell::new(LargeSpace::new()),
            inflated: InflatedHeaderTable::new(),
            handles: HandleTable::new(),
            remembered: RememberedSet::new(),
            weak_refs: Mutex::new(Vec::new()),
            internal_roots: Mutex::new(Vec::new()),
            world: WorldState::new(),
            registry: ThreadRegistry::new(),
            finalizer,
            code_manager,
            symbols,
            metrics: MemoryMetrics::new(),
            epoch: AtomicU8::new(2),
            collect_young_flag: AtomicBool::new(false),
            collect_mature_flag: AtomicBool::new(false),
            mature_in_progress: AtomicBool::new(false),
            mature_finish_ready: AtomicBool::new(false),
            allow_gc: AtomicBool::new(true),
            in_collection: AtomicBool::new(false),
            allocation_lock: SpinLock::new(LockOrder::Allocation),
            inflation_lock: SpinLock::new(LockOrder::Inflation),
            contention_lock: Mutex::new(()),
            contention_var: Condvar::new(),
            last_object_id: AtomicU64::new(1),
            foreign_budget: AtomicI64::new(foreign_budget),
            mark_stack: Mutex::new(MarkStack::new(mark_stack_limit)),
            mark_feed: SegQueue::new(),
            marker: Mutex::new(None),
        });

        if concurrent {
            *mem.marker.lock() = Some(ImmixMarker::start(&mem));
        }
        Ok(mem)
    }

    // ------------------------------------------------------------------
    // Shared-state accessors for the collectors
    // ------------------------------------------------------------------

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn types(&self) -> &TypeTable {
        &self.types
    }

    /// Register a type layout; the returned tag goes into `new_object`.
    pub fn register_type(&self, info: TypeInfo) -> u16 {
        self.types.register(info)
    }

    pub fn metrics(&self) -> &MemoryMetrics {
        &self.metrics
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    pub fn inflated(&self) -> &InflatedHeaderTable {
        &self.inflated
    }

    pub(crate) fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub(crate) fn remembered(&self) -> &RememberedSet {
        &self.remembered
    }

    pub(crate) fn weak_refs(&self) -> &Mutex<Vec<ObjectRef>> {
        &self.weak_refs
    }

    pub(crate) fn internal_roots(&self) -> &Mutex<Vec<usize>> {
        &self.internal_roots
    }

    pub(crate) fn finalizer(&self) -> &dyn FinalizerService {
        self.finalizer.as_ref()
    }

    pub(crate) fn code_manager(&self) -> &dyn CodeManager {
        self.code_manager.as_ref()
    }

    pub(crate) fn symbols(&self) -> &dyn SymbolTable {
        self.symbols.as_ref()
    }

    /// The current mark epoch (2 or 3).
    pub fn epoch(&self) -> u8 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn rotate_mark(&self) {
        let next = if self.epoch() == 2 { 3 } else { 2 };
        self.epoch.store(next, Ordering::SeqCst);
    }

    pub(crate) fn collect_mature_flag(&self) -> &AtomicBool {
        &self.collect_mature_flag
    }

    pub(crate) fn mark_stack(&self) -> &Mutex<MarkStack> {
        &self.mark_stack
    }

    pub(crate) fn mark_feed(&self) -> &SegQueue<ObjectRef> {
        &self.mark_feed
    }

    pub(crate) fn note_watch(&self, obj: ObjectRef, phase: &str) {
        if let Some(addr) = self.config.watch_address {
            if addr == obj.addr() {
                tracing::info!(address = obj.addr(), phase, "watched object");
            }
        }
    }

    // SAFETY: the space cells are only handed out mutably under the
    // allocation spinlock or with the world stopped.
    unsafe fn young_mut(&self) -> &mut YoungSpace {
        unsafe { &mut *self.young.get() }
    }

    unsafe fn immix_mut(&self) -> &mut ImmixSpace {
        unsafe { &mut *self.immix.get() }
    }

    unsafe fn large_mut(&self) -> &mut LargeSpace {
        unsafe { &mut *self.large.get() }
    }

    // ------------------------------------------------------------------
    // Threads and run states
    // ------------------------------------------------------------------

    /// Register the calling thread as a dependent mutator.
    pub fn register_thread(&self) -> Arc<ThreadRecord> {
        let record = self.registry.register();
        self.world.become_dependent(&record);
        record
    }

    /// Remove a mutator. The record must not be used afterwards.
    pub fn unregister_thread(&self, record: &Arc<ThreadRecord>) {
        self.flush_foreign(record);
        if record.run_state() == crate::threads::RunState::Dependent {
            self.world.become_independent(record);
        }
        self.registry.unregister(record);
    }

    /// Leave the collector's jurisdiction before blocking I/O or foreign
    /// code. Managed objects must not be touched until dependent again.
    pub fn become_independent(&self, record: &ThreadRecord) {
        self.world.become_independent(record);
    }

    /// Re-enter the collector's jurisdiction; blocks while the world is
    /// stopped.
    pub fn become_dependent(&self, record: &ThreadRecord) {
        self.world.become_dependent(record);
    }

    /// The safepoint poll. Pauses for a peer driver, or drives a pending
    /// collection itself.
    pub fn checkpoint(&self, record: &ThreadRecord) {
        self.flush_foreign(record);
        if self.world.should_stop() {
            self.world.checkpoint(record);
        } else {
            self.collect_maybe(record);
        }
    }

    // ------------------------------------------------------------------
    // Allocation
    // ------------------------------------------------------------------

    /// Allocate a zero-filled object, routed by size.
    pub fn new_object(
        &self,
        record: &ThreadRecord,
        class: usize,
        body_bytes: usize,
        tag: u16,
    ) -> Result<ObjectRef, MemoryError> {
        let obj = self.new_object_dirty(record, class, body_bytes, tag)?;
        unsafe {
            std::ptr::write_bytes(obj.body_ptr(), 0, align_up(body_bytes, WORD));
        }
        Ok(obj)
    }

    /// Allocate without clearing the payload; for callers about to
    /// overwrite every field.
    pub fn new_object_dirty(
        &self,
        record: &ThreadRecord,
        class: usize,
        body_bytes: usize,
        tag: u16,
    ) -> Result<ObjectRef, MemoryError> {
        self.checkpoint(record);

        let total = HEADER_BYTES + align_up(body_bytes, WORD);
        if total > self.config.large_object_threshold {
            return self.allocate_large(class, body_bytes, tag, false);
        }

        // Slab fast path, lock-free for the owning thread.
        let slab = unsafe { record.slab_mut() };
        if let Some(addr) = slab.allocate(total) {
            let obj = unsafe { ObjectRef::initialize(addr, tag, class, body_bytes, Zone::Young) };
            self.metrics.count_young_allocation(total);
            self.note_watch(obj, "allocation");
            return Ok(obj);
        }

        if self.refill_slab(record) {
            let slab = unsafe { record.slab_mut() };
            if let Some(addr) = slab.allocate(total) {
                let obj =
                    unsafe { ObjectRef::initialize(addr, tag, class, body_bytes, Zone::Young) };
                self.metrics.count_young_allocation(total);
                self.note_watch(obj, "allocation");
                return Ok(obj);
            }
        }

        self.allocate_object_slow(class, body_bytes, tag)
    }

    /// Allocate a zero-filled object directly in the mature space.
    pub fn new_object_mature(
        &self,
        record: &ThreadRecord,
        class: usize,
        body_bytes: usize,
        tag: u16,
    ) -> Result<ObjectRef, MemoryError> {
        let obj = self.new_object_mature_dirty(record, class, body_bytes, tag)?;
        unsafe {
            std::ptr::write_bytes(obj.body_ptr(), 0, align_up(body_bytes, WORD));
        }
        Ok(obj)
    }

    pub fn new_object_mature_dirty(
        &self,
        record: &ThreadRecord,
        class: usize,
        body_bytes: usize,
        tag: u16,
    ) -> Result<ObjectRef, MemoryError> {
        self.checkpoint(record);

        let total = HEADER_BYTES + align_up(body_bytes, WORD);
        if total > self.config.large_object_threshold {
            return self.allocate_large(class, body_bytes, tag, false);
        }

        let _guard = self.allocation_lock.lock();
        let immix = unsafe { self.immix_mut() };
        if let Some(addr) = immix.allocate(total, &self.collect_mature_flag) {
            let obj = unsafe { ObjectRef::initialize(addr, tag, class, body_bytes, Zone::Mature) };
            obj.set_in_immix();
            self.allocate_black(obj);
            self.metrics.count_immix_allocation(total);
            self.note_watch(obj, "mature allocation");
            return Ok(obj);
        }
        drop(_guard);
        self.allocate_large(class, body_bytes, tag, false)
    }

    /// Allocate in the large space regardless of size, for objects that
    /// must never move and should survive routine collection pressure
    /// (class metaobjects, system constants).
    pub fn new_object_enduring(
        &self,
        record: &ThreadRecord,
        class: usize,
        body_bytes: usize,
        tag: u16,
    ) -> Result<ObjectRef, MemoryError> {
        self.checkpoint(record);
        let obj = self.allocate_large(class, body_bytes, tag, true)?;
        Ok(obj)
    }

    fn allocate_large(
        &self,
        class: usize,
        body_bytes: usize,
        tag: u16,
        enduring: bool,
    ) -> Result<ObjectRef, MemoryError> {
        let _guard = self.allocation_lock.lock();
        let large = unsafe { self.large_mut() };
        let obj = large
            .allocate(tag, class, body_bytes, &self.collect_mature_flag)
            .ok_or(MemoryError::OutOfMemory(body_bytes))?;
        if enduring {
            obj.set_enduring();
        }
        self.allocate_black(obj);
        self.metrics.count_large_allocation(obj.total_bytes());
        self.note_watch(obj, "large allocation");
        Ok(obj)
    }

    /// The escalation path: young, then immix, then large, raising
    /// collection flags along the way.
    fn allocate_object_slow(
        &self,
        class: usize,
        body_bytes: usize,
        tag: u16,
    ) -> Result<ObjectRef, MemoryError> {
        let total = HEADER_BYTES + align_up(body_bytes, WORD);
        let _guard = self.allocation_lock.lock();

        let young = unsafe { self.young_mut() };
        if let Some(addr) = young.allocate(total) {
            let obj = unsafe { ObjectRef::initialize(addr, tag, class, body_bytes, Zone::Young) };
            self.metrics.count_young_allocation(total);
            self.note_watch(obj, "allocation");
            return Ok(obj);
        }

        self.collect_young_flag.store(true, Ordering::SeqCst);
        tracing::debug!(bytes = total, "young space full, escalating to immix");

        let immix = unsafe { self.immix_mut() };
        if let Some(addr) = immix.allocate(total, &self.collect_mature_flag) {
            let obj = unsafe { ObjectRef::initialize(addr, tag, class, body_bytes, Zone::Mature) };
            obj.set_in_immix();
            self.allocate_black(obj);
            self.metrics.count_immix_allocation(total);
            self.note_watch(obj, "allocation");
            return Ok(obj);
        }

        tracing::debug!(bytes = total, "immix refused allocation, escalating to large");
        let large = unsafe { self.large_mut() };
        let obj = large
            .allocate(tag, class, body_bytes, &self.collect_mature_flag)
            .ok_or(MemoryError::OutOfMemory(body_bytes))?;
        self.allocate_black(obj);
        self.metrics.count_large_allocation(obj.total_bytes());
        self.note_watch(obj, "allocation");
        Ok(obj)
    }

    /// New mature-pool objects are born marked while a concurrent mark is
    /// in flight, or the sweep that follows would free them.
    fn allocate_black(&self, obj: ObjectRef) {
        if self.mature_in_progress.load(Ordering::SeqCst) {
            mark_object(obj, self.epoch());
        }
    }

    /// Refill the calling thread's slab from to-space. Returns false when
    /// the young space is exhausted (and flags a young collection).
    pub fn refill_slab(&self, record: &ThreadRecord) -> bool {
        let _guard = self.allocation_lock.lock();
        let young = unsafe { self.young_mut() };
        let slab = unsafe { record.slab_mut() };

        // Roll the slab's tallies into the global counters before reuse.
        self.metrics
            .young_objects
            .fetch_add(slab.allocations(), Ordering::Relaxed);

        match young.allocate_for_slab(self.config.slab_size) {
            Some(addr) => {
                slab.refill(addr, self.config.slab_size);
                self.metrics.slab_refills.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => {
                slab.refill(0, 0);
                self.metrics.slab_refill_fails.fetch_add(1, Ordering::Relaxed);
                self.collect_young_flag.store(true, Ordering::SeqCst);
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    /// Assign (or read) the object's identity number. Stable across
    /// relocation for the rest of the object's life.
    pub fn assign_object_id(&self, obj: ObjectRef) -> u64 {
        loop {
            let word = obj.header().read();
            match word.meaning() {
                Meaning::Empty => {
                    let id = self.last_object_id.fetch_add(1, Ordering::SeqCst);
                    if obj.header().cas(word, HeaderWord::with_object_id(id)) {
                        return id;
                    }
                }
                Meaning::ObjId => return word.object_id(),
                Meaning::ThinLock => {
                    let id = self.last_object_id.fetch_add(1, Ordering::SeqCst);
                    self.inflate_for_id(obj, id);
                    if let Some(id) = self.object_id(obj) {
                        return id;
                    }
                }
                Meaning::Inflated => {
                    let record = self.inflated.get(word.inflated_index());
                    if record.object_id() == 0 {
                        // Assignment is serialized with other inflation
                        // writers.
                        let _guard = self.inflation_lock.lock();
                        if record.object_id() == 0 {
                            let id = self.last_object_id.fetch_add(1, Ordering::SeqCst);
                            record.set_object_id(id);
                        }
                    }
                    return record.object_id();
                }
            }
        }
    }

    /// The object's identity, if one was assigned.
    pub fn object_id(&self, obj: ObjectRef) -> Option<u64> {
        let word = obj.header().read();
        match word.meaning() {
            Meaning::ObjId => Some(word.object_id()),
            Meaning::Inflated => match self.inflated.get(word.inflated_index()).object_id() {
                0 => None,
                id => Some(id),
            },
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Inflation
    // ------------------------------------------------------------------

    /// Promote the header to an inflated record carrying identity `id`.
    fn inflate_for_id(&self, obj: ObjectRef, id: u64) {
        let _guard = self.inflation_lock.lock();
        loop {
            let orig = obj.header().read();
            if orig.is_inflated() {
                let record = self.inflated.get(orig.inflated_index());
                if record.object_id() == 0 {
                    record.set_object_id(id);
                }
                return;
            }
            let index = self.inflated.allocate(self.epoch());
            let record = self.inflated.get(index);
            record.absorb(orig);
            record.set_object_id(id);
            if obj.header().cas(orig, HeaderWord::inflated(index)) {
                return;
            }
            self.inflated.release(index);
        }
    }

    /// Promote the header for a foreign handle; the handle cookie lands in
    /// the inflated record.
    fn inflate_for_handle(&self, obj: ObjectRef, cookie: usize) {
        let _guard = self.inflation_lock.lock();
        loop {
            let orig = obj.header().read();
            if orig.is_inflated() {
                self.inflated.get(orig.inflated_index()).set_handle(cookie);
                return;
            }
            let index = self.inflated.allocate(self.epoch());
            let record = self.inflated.get(index);
            record.absorb(orig);
            record.set_handle(cookie);
            if obj.header().cas(orig, HeaderWord::inflated(index)) {
                return;
            }
            self.inflated.release(index);
        }
    }

    /// Inflate an identity-bearing header and take its mutex in one step.
    fn inflate_and_lock(&self, obj: ObjectRef, tid: u32) -> LockStatus {
        let _guard = self.inflation_lock.lock();
        loop {
            let orig = obj.header().read();
            match orig.meaning() {
                Meaning::ObjId => {
                    let index = self.inflated.allocate(self.epoch());
                    let record = self.inflated.get(index);
                    record.absorb(orig);
                    record.initialize_mutex(tid, 1);
                    if obj.header().cas(orig, HeaderWord::inflated(index)) {
                        return LockStatus::Locked;
                    }
                    self.inflated.release(index);
                }
                // Raced into another state; the caller re-reads.
                _ => return LockStatus::Error,
            }
        }
    }

    /// A thin lock's recursion counter saturated: carry owner and count
    /// into an inflated mutex. Ownership survives exactly.
    fn inflate_lock_count_overflow(&self, obj: ObjectRef, tid: u32, new_count: u32) -> bool {
        let _guard = self.inflation_lock.lock();
        loop {
            let orig = obj.header().read();
            if orig.meaning() != Meaning::ThinLock || orig.lock_owner() != tid {
                return false;
            }
            let index = self.inflated.allocate(self.epoch());
            let record = self.inflated.get(index);
            record.initialize_mutex(tid, new_count);
            if obj.header().cas(orig, HeaderWord::inflated(index)) {
                return true;
            }
            self.inflated.release(index);
        }
    }

    /// The owner is unlocking a contended thin lock: install an unowned
    /// inflated record so waiters have a real mutex to take.
    fn inflate_for_contention(&self, obj: ObjectRef) -> bool {
        let _guard = self.inflation_lock.lock();
        loop {
            let orig = obj.header().read();
            match orig.meaning() {
                Meaning::Inflated => return true,
                Meaning::ThinLock => {
                    let index = self.inflated.allocate(self.epoch());
                    if obj.header().cas(orig, HeaderWord::inflated(index)) {
                        return true;
                    }
                    self.inflated.release(index);
                }
                _ => return false,
            }
        }
    }

    // ------------------------------------------------------------------
    // Locking
    // ------------------------------------------------------------------

    /// Lock `obj` for `record`, thin when possible, inflating under
    /// contention, recursion overflow, or an identity-bearing header.
    pub fn lock_object(
        &self,
        record: &ThreadRecord,
        obj: ObjectRef,
        timeout: Option<Duration>,
        interrupt: Option<&AtomicBool>,
    ) -> LockStatus {
        let tid = record.id();
        loop {
            // Chase forwarding: a rooted object may have been relocated by
            // a collection since the caller picked up its reference.
            let obj = obj.resolve();
            let word = obj.header().read();
            match word.meaning() {
                Meaning::Empty => {
                    if obj
                        .header()
                        .cas(word, HeaderWord::thin_lock(tid, 1, false))
                    {
                        return LockStatus::Locked;
                    }
                }
                Meaning::ObjId => match self.inflate_and_lock(obj, tid) {
                    LockStatus::Locked => return LockStatus::Locked,
                    _ => continue,
                },
                Meaning::ThinLock => {
                    if word.lock_owner() == tid {
                        let count = word.lock_count();
                        if count < THIN_LOCK_MAX_COUNT {
                            let new =
                                HeaderWord::thin_lock(tid, count + 1, word.lock_contended());
                            if obj.header().cas(word, new) {
                                return LockStatus::Locked;
                            }
                        } else if self.inflate_lock_count_overflow(obj, tid, count + 1) {
                            return LockStatus::Locked;
                        }
                    } else {
                        match self.contend_for_lock(record, obj, timeout, interrupt) {
                            LockStatus::Error => continue,
                            status => return status,
                        }
                    }
                }
                Meaning::Inflated => {
                    let ih = self.inflated.get(word.inflated_index());
                    self.world.become_independent(record);
                    let status = ih.lock(tid, timeout, interrupt);
                    self.world.become_dependent(record);
                    return status;
                }
            }
        }
    }

    /// Release one level of the lock held on `obj`.
    pub fn unlock_object(&self, record: &ThreadRecord, obj: ObjectRef) -> LockStatus {
        let tid = record.id();
        loop {
            let obj = obj.resolve();
            let word = obj.header().read();
            match word.meaning() {
                Meaning::ThinLock if word.lock_owner() == tid => {
                    let count = word.lock_count();
                    if count > 1 {
                        let new =
                            HeaderWord::thin_lock(tid, count - 1, word.lock_contended());
                        if obj.header().cas(word, new) {
                            return LockStatus::Unlocked;
                        }
                    } else if word.lock_contended() {
                        // A waiter asked for a real mutex; give it one,
                        // unowned, and wake the contenders.
                        if self.inflate_for_contention(obj) {
                            self.release_contention();
                            return LockStatus::Unlocked;
                        }
                    } else if obj.header().cas(word, HeaderWord::EMPTY) {
                        return LockStatus::Unlocked;
                    }
                }
                Meaning::Inflated => {
                    let ih = self.inflated.get(word.inflated_index());
                    let status = ih.unlock(tid);
                    if status == LockStatus::Unlocked {
                        self.release_contention();
                    }
                    return status;
                }
                _ => return LockStatus::Error,
            }
        }
    }

    /// Wait for a thin lock held by another thread.
    ///
    /// Registers the contended bit (asking the owner to inflate on
    /// unlock), waits for the inflation, then takes the inflated mutex.
    /// Timeout and interrupt exits leave the header thin-locked by the
    /// owner or already inflated, both safe.
    pub fn contend_for_lock(
        &self,
        record: &ThreadRecord,
        obj: ObjectRef,
        timeout: Option<Duration>,
        interrupt: Option<&AtomicBool>,
    ) -> LockStatus {
        let deadline = timeout.map(|t| Instant::now() + t);

        // Register intent: the contended bit survives until the owner
        // inflates.
        loop {
            let word = obj.header().read();
            match word.meaning() {
                Meaning::Inflated => break,
                Meaning::ThinLock => {
                    if word.lock_contended() || obj.header().cas(word, word.with_lock_contended())
                    {
                        break;
                    }
                }
                // The lock went away mid-register; retry the fast path.
                _ => return LockStatus::Error,
            }
        }

        // Wait for the owner's unlock to inflate the header, re-resolving
        // forwarding in case a collection moved the object while parked.
        while !obj.resolve().header().read().is_inflated() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return LockStatus::Timeout;
                }
            }
            if let Some(flag) = interrupt {
                if flag.swap(false, Ordering::SeqCst) {
                    return LockStatus::Interrupted;
                }
            }
            let wait_until = match deadline {
                Some(deadline) => deadline.min(Instant::now() + CONTENTION_RECHECK),
                None => Instant::now() + CONTENTION_RECHECK,
            };
            self.world.become_sleeping(record);
            {
                let mut guard = self.contention_lock.lock();
                if !obj.resolve().header().read().is_inflated() {
                    let _ = self.contention_var.wait_until(&mut guard, wait_until);
                }
            }
            self.world.become_dependent(record);
        }

        let word = obj.resolve().header().read();
        debug_assert!(word.is_inflated());
        let ih = self.inflated.get(word.inflated_index());
        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        self.world.become_independent(record);
        let status = ih.lock(record.id(), remaining, interrupt);
        self.world.become_dependent(record);
        status
    }

    /// Wake every thread parked in `contend_for_lock`.
    pub fn release_contention(&self) {
        let _guard = self.contention_lock.lock();
        self.contention_var.notify_all();
    }

    // ------------------------------------------------------------------
    // Foreign handles and weak references
    // ------------------------------------------------------------------

    /// Register a foreign handle: the object's header is inflated, the
    /// handle recorded, and the object pinned against mature-space
    /// evacuation. Foreign code dereferences through the returned handle,
    /// which collections keep current.
    pub fn register_foreign_handle(&self, obj: ObjectRef, weak: bool) -> ForeignHandle {
        let handle = self.handles.register(obj, weak);
        // Cookie 0 means no handle, so indices are stored off by one.
        self.inflate_for_handle(obj, handle.index() as usize + 1);
        obj.set_pinned();
        self.metrics.foreign_handles.fetch_add(1, Ordering::Relaxed);
        handle
    }

    /// Drop a foreign handle, unpinning its object.
    pub fn unregister_foreign_handle(&self, handle: ForeignHandle) {
        if let Some(obj) = self.handles.release(handle) {
            obj.clear_pinned();
            let word = obj.header().read();
            if word.is_inflated() {
                self.inflated.get(word.inflated_index()).clear_handle();
            }
        }
    }

    /// Declare `obj` a weak container: its reference slots no longer keep
    /// referents alive and are nulled when they die.
    pub fn register_weak_container(&self, obj: ObjectRef) {
        obj.set_weak_container();
        self.weak_refs.lock().push(obj);
    }

    /// Register `obj` for finalization with the finalizer service.
    pub fn needs_finalization(&self, obj: ObjectRef) {
        self.finalizer.record(obj);
    }

    /// Attach a managed finalizer object.
    pub fn set_finalizer(&self, obj: ObjectRef, finalizer: ObjectRef) {
        self.finalizer.set_finalizer(obj, finalizer);
    }

    /// Pin an object into the internal root table; returns the slot for
    /// later removal.
    pub fn add_internal_root(&self, obj: ObjectRef) -> usize {
        let mut roots = self.internal_roots.lock();
        if let Some(index) = roots.iter().position(|&slot| slot == 0) {
            roots[index] = obj.addr();
            return index;
        }
        roots.push(obj.addr());
        roots.len() - 1
    }

    pub fn remove_internal_root(&self, index: usize) {
        let mut roots = self.internal_roots.lock();
        if let Some(slot) = roots.get_mut(index) {
            *slot = 0;
        }
    }

    // ------------------------------------------------------------------
    // Write barrier
    // ------------------------------------------------------------------

    /// Store `value` into reference slot `slot` of `target`, with the
    /// generational and concurrent-mark barriers applied. The remembered
    /// set record precedes the store, so the record is visible before the
    /// pointer is.
    pub fn write_ref(&self, target: ObjectRef, slot: usize, value: Option<ObjectRef>) {
        if let Some(value) = value {
            if !target.is_young() && value.is_young() {
                self.remembered.remember(target);
            }
            if self.mature_in_progress.load(Ordering::SeqCst) {
                self.mark_feed.push(value);
            }
        }
        target.set_ref_slot(slot, value);
    }

    // ------------------------------------------------------------------
    // Foreign allocation accounting and code resources
    // ------------------------------------------------------------------

    /// Account `bytes` of raw allocation made outside the managed heap.
    /// When the process-wide budget is spent, a mature collection is
    /// requested so foreign growth cannot starve the collector.
    pub fn track_foreign_allocation(&self, record: &ThreadRecord, bytes: usize) {
        let pending = record
            .foreign_pending
            .fetch_add(bytes as i64, Ordering::Relaxed)
            + bytes as i64;
        if pending >= FOREIGN_FLUSH_BYTES {
            self.flush_foreign(record);
        }
    }

    fn flush_foreign(&self, record: &ThreadRecord) {
        let pending = record.foreign_pending.swap(0, Ordering::Relaxed);
        if pending == 0 {
            return;
        }
        let left = self.foreign_budget.fetch_sub(pending, Ordering::SeqCst) - pending;
        if left <= 0 {
            self.collect_mature_flag.store(true, Ordering::SeqCst);
            self.foreign_budget
                .store(self.config.malloc_threshold as i64, Ordering::SeqCst);
        }
    }

    /// Record a compiled-code resource with the code manager.
    pub fn add_code_resource(&self, bytes: usize) {
        self.metrics.code_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        if self.code_manager.add_resource(bytes) {
            self.collect_mature_flag.store(true, Ordering::SeqCst);
        }
    }

    // ------------------------------------------------------------------
    // Collection driver
    // ------------------------------------------------------------------

    pub fn can_gc(&self) -> bool {
        self.allow_gc.load(Ordering::SeqCst)
    }

    pub fn set_allow_gc(&self, allow: bool) {
        self.allow_gc.store(allow, Ordering::SeqCst);
    }

    /// Explicitly request a young collection at the next safepoint.
    pub fn request_young_collection(&self) {
        self.collect_young_flag.store(true, Ordering::SeqCst);
    }

    /// Explicitly request a mature collection at the next safepoint.
    pub fn request_mature_collection(&self) {
        self.collect_mature_flag.store(true, Ordering::SeqCst);
    }

    fn collection_pending(&self) -> bool {
        // While the marker is in flight, only its finish request stops the
        // world; young and mature requests queue behind it.
        if self.mature_in_progress.load(Ordering::SeqCst) {
            return self.mature_finish_ready.load(Ordering::SeqCst);
        }
        self.collect_young_flag.load(Ordering::SeqCst)
            || self.collect_mature_flag.load(Ordering::SeqCst)
    }

    /// Drive any pending collection from a safepoint. The caller must be
    /// a registered, dependent thread with its roots reachable through
    /// its shadow root table.
    pub fn collect_maybe(&self, record: &ThreadRecord) {
        if !self.can_gc() || !self.collection_pending() {
            return;
        }

        while !self.world.stop_the_world(record) {
            // A peer driver got there first; cooperate with it and
            // re-check whether any work is left.
            self.world.checkpoint(record);
            if !self.collection_pending() {
                return;
            }
        }

        if !self.collection_pending() {
            self.world.restart_world(record);
            return;
        }

        // Exactly one collection may run at a time.
        assert!(
            !self.in_collection.swap(true, Ordering::SeqCst),
            "overlapping collections"
        );

        self.finalizer.start_collection();

        if self.mature_in_progress.load(Ordering::SeqCst) {
            // Young collections wait until the concurrent cycle retires;
            // allocation escalates to the mature pools meanwhile.
            if self.mature_finish_ready.swap(false, Ordering::SeqCst) {
                self.collect_mature_finish();
            }
        } else {
            if self.collect_young_flag.load(Ordering::SeqCst) {
                self.collect_young_stw();
            }
            if self.collect_mature_flag.load(Ordering::SeqCst) {
                if self.config.immix_concurrent {
                    self.collect_mature_start();
                } else {
                    self.collect_mature_stw();
                }
            }
        }

        self.in_collection.store(false, Ordering::SeqCst);
        self.world.restart_world(record);
    }

    fn collect_young_stw(&self) {
        let _span = tracing::debug_span!("gc_collect", kind = "young").entered();
        let start = Instant::now();
        self.collect_young_flag.store(false, Ordering::SeqCst);

        unsafe {
            let young = self.young_mut();
            let immix = self.immix_mut();
            let large = self.large_mut();
            YoungCollection::new(self, young, immix, large).run();
        }

        self.metrics.record_pause(CollectionKind::Young, start.elapsed());
        self.finalizer.finish_collection();
        tracing::debug!(pause_us = start.elapsed().as_micros() as u64, "young collection done");
    }

    fn collect_mature_stw(&self) {
        let _span = tracing::debug_span!("gc_collect", kind = "mature").entered();
        let start = Instant::now();
        self.collect_mature_flag.store(false, Ordering::SeqCst);

        self.code_manager.clear_marks();

        let (immix_stats, large_stats) = unsafe {
            let immix = self.immix_mut();
            let large = self.large_mut();
            let mut gc = MatureCollection::new(self, immix, large, true);
            let mut stack = self.mark_stack.lock();
            gc.prepare();
            gc.scan_roots(&mut stack);
            gc.process_to_fixpoint(&mut stack);
            gc.finish_closure(&mut stack);
            gc.sweep()
        };

        self.rotate_mark();
        self.metrics.mature_collection_finished(
            CollectionKind::Mature,
            (immix_stats.live_lines * crate::immix::LINE_BYTES) as u64,
            large_stats.freed_objects as u64,
            large_stats.freed_bytes as u64,
        );
        self.metrics.record_pause(CollectionKind::Mature, start.elapsed());
        self.finalizer.finish_collection();
        tracing::debug!(
            live_fraction = immix_stats.live_fraction(),
            freed_large = large_stats.freed_objects,
            "mature collection done"
        );
    }

    /// Concurrent cycle, first half: snapshot the roots under the stopped
    /// world and hand the closure to the marker thread.
    fn collect_mature_start(&self) {
        let _span = tracing::debug_span!("gc_collect", kind = "mature_concurrent_start").entered();
        self.collect_mature_flag.store(false, Ordering::SeqCst);
        self.mature_in_progress.store(true, Ordering::SeqCst);

        self.code_manager.clear_marks();

        unsafe {
            let immix = self.immix_mut();
            let large = self.large_mut();
            let mut gc = MatureCollection::new(self, immix, large, false);
            let mut stack = self.mark_stack.lock();
            gc.prepare();
            gc.scan_roots(&mut stack);
        }

        let marker = self.marker.lock();
        marker
            .as_ref()
            .expect("concurrent collection without a marker thread")
            .request_mark();
    }

    /// Called by the marker thread when its worklist runs dry.
    pub(crate) fn concurrent_mark_drained(&self) {
        self.mature_finish_ready.store(true, Ordering::SeqCst);
    }

    /// Concurrent cycle, second half: finish the closure under the
    /// stopped world and sweep.
    fn collect_mature_finish(&self) {
        let _span = tracing::debug_span!("gc_collect", kind = "mature_concurrent_finish").entered();
        let start = Instant::now();

        let (immix_stats, large_stats) = unsafe {
            let immix = self.immix_mut();
            let large = self.large_mut();
            let mut gc = MatureCollection::new(self, immix, large, false);
            let mut stack = self.mark_stack.lock();
            // Re-scan roots to catch references created since the
            // snapshot; the write-barrier feed covers heap edges.
            gc.scan_roots(&mut stack);
            gc.process_to_fixpoint(&mut stack);
            gc.finish_closure(&mut stack);
            gc.sweep()
        };

        self.rotate_mark();
        self.mature_in_progress.store(false, Ordering::SeqCst);
        self.metrics.mature_collection_finished(
            CollectionKind::MatureConcurrent,
            (immix_stats.live_lines * crate::immix::LINE_BYTES) as u64,
            large_stats.freed_objects as u64,
            large_stats.freed_bytes as u64,
        );
        self.metrics
            .record_pause(CollectionKind::MatureConcurrent, start.elapsed());
        self.finalizer.finish_collection();
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Which pool hosts `obj`, if any.
    pub fn validate_object(&self, obj: ObjectRef) -> ObjectPosition {
        let _guard = self.allocation_lock.lock();
        unsafe {
            if (*self.young.get()).contains(obj.addr()) {
                return ObjectPosition::Young;
            }
            if (*self.immix.get()).contains(obj.addr()) {
                return ObjectPosition::Mature;
            }
            if (*self.large.get()).contains(obj.addr()) {
                return ObjectPosition::Large;
            }
        }
        ObjectPosition::Unknown
    }

    /// Whether a concurrent mature mark is currently overlapped with
    /// mutation.
    pub fn mature_mark_in_progress(&self) -> bool {
        self.mature_in_progress.load(Ordering::SeqCst)
    }

    /// Number of mature objects currently in the remembered set.
    pub fn remembered_set_len(&self) -> usize {
        self.remembered.len()
    }

    // ------------------------------------------------------------------
    // Fork support
    // ------------------------------------------------------------------

    /// Reset the memory in the child after `fork`: every lock
    /// reinitialized, dead thread records dropped, concurrent-mark state
    /// cleared, the world running with `current` as its only thread.
    pub fn after_fork_child(mem: &Arc<ObjectMemory>, current: &Arc<ThreadRecord>) {
        // The marker thread did not survive the fork; drop its handle
        // without joining and spawn a fresh one if needed.
        let old_marker = mem.marker.lock().take();
        if let Some(marker) = old_marker {
            marker.abandon();
        }

        mem.allocation_lock.reinit();
        mem.inflation_lock.reinit();
        // SAFETY: single-threaded child; any holder died in the parent.
        unsafe {
            if mem.contention_lock.is_locked() {
                mem.contention_lock.force_unlock();
            }
        }
        mem.world.reinit();
        mem.registry.retain_only(current);
        current.set_run_state(crate::threads::RunState::Dependent);

        mem.mature_in_progress.store(false, Ordering::SeqCst);
        mem.mature_finish_ready.store(false, Ordering::SeqCst);
        mem.in_collection.store(false, Ordering::SeqCst);
        *mem.mark_stack.lock() = MarkStack::new(mem.config.mark_stack_limit);
        while mem.mark_feed.pop().is_some() {}

        if mem.config.immix_concurrent {
            *mem.marker.lock() = Some(ImmixMarker::start(mem));
        }
    }
}

impl Drop for ObjectMemory {
    fn drop(&mut self) {
        if let Some(marker) = self.marker.lock().take() {
            marker.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config {
            young_bytes: 64 * 1024,
            slab_size: 4096,
            ..Config::default()
        }
    }

    #[test]
    fn slab_fast_path_allocates_young() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();

        let obj = mem.new_object(&thread, 1, 64, 0).unwrap();
        assert_eq!(obj.zone(), Zone::Young);
        assert_eq!(obj.class(), 1);
        assert_eq!(mem.validate_object(obj), ObjectPosition::Young);
        assert_eq!(mem.metrics().slab_refills.load(Ordering::Relaxed), 1);

        // Second small object comes from the same slab, no refill.
        let other = mem.new_object(&thread, 1, 64, 0).unwrap();
        assert_ne!(obj, other);
        assert_eq!(mem.metrics().slab_refills.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn oversize_requests_route_to_large() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();

        let obj = mem
            .new_object(&thread, 0, mem.config().large_object_threshold + 1, 0)
            .unwrap();
        assert_eq!(obj.zone(), Zone::Large);
        assert_eq!(mem.validate_object(obj), ObjectPosition::Large);
    }

    #[test]
    fn mature_allocation_skips_young() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();

        let obj = mem.new_object_mature(&thread, 0, 128, 0).unwrap();
        assert_eq!(obj.zone(), Zone::Mature);
        assert!(obj.is_in_immix());
        assert_eq!(mem.validate_object(obj), ObjectPosition::Mature);
    }

    #[test]
    fn enduring_allocation_forces_large() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();

        let obj = mem.new_object_enduring(&thread, 0, 64, 0).unwrap();
        assert_eq!(obj.zone(), Zone::Large);
        assert!(obj.is_enduring());
    }

    #[test]
    fn young_exhaustion_escalates_and_flags() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();
        mem.set_allow_gc(false);

        // Fill the young half; escalation must kick in without failing.
        let mut zones = Vec::new();
        for _ in 0..40 {
            let obj = mem.new_object(&thread, 0, 2000, 0).unwrap();
            zones.push(obj.zone());
        }
        assert!(zones.contains(&Zone::Young));
        assert!(zones.contains(&Zone::Mature));
        assert!(mem.collect_young_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn object_ids_are_monotone_and_stable() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();

        let a = mem.new_object(&thread, 0, 32, 0).unwrap();
        let b = mem.new_object(&thread, 0, 32, 0).unwrap();
        assert_eq!(mem.object_id(a), None);

        let id_a = mem.assign_object_id(a);
        let id_b = mem.assign_object_id(b);
        assert!(id_b > id_a);
        assert_eq!(mem.assign_object_id(a), id_a);
        assert_eq!(mem.object_id(a), Some(id_a));
    }

    #[test]
    fn thin_lock_fast_path() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();
        let obj = mem.new_object(&thread, 0, 32, 0).unwrap();

        assert_eq!(mem.lock_object(&thread, obj, None, None), LockStatus::Locked);
        let word = obj.header().read();
        assert_eq!(word.meaning(), Meaning::ThinLock);
        assert_eq!(word.lock_owner(), thread.id());
        assert_eq!(word.lock_count(), 1);

        // Recursive.
        assert_eq!(mem.lock_object(&thread, obj, None, None), LockStatus::Locked);
        assert_eq!(obj.header().read().lock_count(), 2);

        assert_eq!(mem.unlock_object(&thread, obj), LockStatus::Unlocked);
        assert_eq!(mem.unlock_object(&thread, obj), LockStatus::Unlocked);
        assert_eq!(obj.header().read().meaning(), Meaning::Empty);

        // Unlocking an unlocked object is an error.
        assert_eq!(mem.unlock_object(&thread, obj), LockStatus::Error);
    }

    #[test]
    fn locking_an_identified_object_inflates() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();
        let obj = mem.new_object(&thread, 0, 32, 0).unwrap();

        let id = mem.assign_object_id(obj);
        assert_eq!(mem.lock_object(&thread, obj, None, None), LockStatus::Locked);
        assert!(obj.header().read().is_inflated());
        // Identity survived the inflation.
        assert_eq!(mem.object_id(obj), Some(id));
        assert_eq!(mem.unlock_object(&thread, obj), LockStatus::Unlocked);
    }

    #[test]
    fn recursion_overflow_inflates_preserving_count() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();
        let obj = mem.new_object(&thread, 0, 32, 0).unwrap();

        for _ in 0..=THIN_LOCK_MAX_COUNT {
            assert_eq!(mem.lock_object(&thread, obj, None, None), LockStatus::Locked);
        }
        let word = obj.header().read();
        assert!(word.is_inflated());
        let record = mem.inflated().get(word.inflated_index());
        assert_eq!(
            record.lock_state(),
            (thread.id(), THIN_LOCK_MAX_COUNT + 1)
        );
    }

    #[test]
    fn foreign_accounting_requests_mature_collection() {
        let mut config = small_config();
        config.malloc_threshold = 2 * 1024 * 1024;
        let mem = ObjectMemory::new(config).unwrap();
        let thread = mem.register_thread();

        for _ in 0..3 {
            mem.track_foreign_allocation(&thread, 1024 * 1024);
        }
        assert!(mem.collect_mature_flag.load(Ordering::SeqCst));
    }

    #[test]
    fn internal_roots_recycle_slots() {
        let mem = ObjectMemory::new(small_config()).unwrap();
        let thread = mem.register_thread();
        let a = mem.new_object(&thread, 0, 32, 0).unwrap();
        let b = mem.new_object(&thread, 0, 32, 0).unwrap();

        let slot_a = mem.add_internal_root(a);
        mem.remove_internal_root(slot_a);
        let slot_b = mem.add_internal_root(b);
        assert_eq!(slot_a, slot_b);
    }
}
