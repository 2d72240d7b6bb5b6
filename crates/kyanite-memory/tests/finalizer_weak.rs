//! Finalizer ordering and weak reference reconciliation.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use kyanite_memory::{
    Config, FinalizerService, NullCodeManager, NullSymbolTable, ObjectMemory, ObjectRef,
    ObjectTracer,
};

/// A finalizer queue in the shape the runtime uses: entries are traced at
/// every collection; entries found dead are queued and dispatched from
/// `finish_collection`, exactly once.
#[derive(Default)]
struct RecordingFinalizer {
    entries: Mutex<Vec<usize>>,
    pending: Mutex<Vec<usize>>,
    finalized: Mutex<Vec<usize>>,
    /// Observations of the watched weak slot taken just before each
    /// finalizer dispatch.
    weak_cleared_first: Mutex<Vec<bool>>,
    /// The weak container whose slot 0 should be inspected at dispatch.
    watched_weak: Mutex<Option<ObjectRef>>,
    collections_started: AtomicUsize,
}

impl FinalizerService for RecordingFinalizer {
    fn start_collection(&self) {
        self.collections_started.fetch_add(1, Ordering::SeqCst);
    }

    fn record(&self, obj: ObjectRef) {
        self.entries.lock().push(obj.addr());
    }

    fn walk(&self, tracer: &mut dyn ObjectTracer) {
        let mut entries = self.entries.lock();
        let mut pending = self.pending.lock();
        let mut kept = Vec::new();
        for &addr in entries.iter() {
            let obj = unsafe { ObjectRef::from_addr(addr) };
            let (current, live) = tracer.trace(obj);
            if live {
                kept.push(current.addr());
            } else {
                // Dead: dispatch after this collection and stop keeping
                // the object alive beyond the grace cycle.
                pending.push(current.addr());
            }
        }
        *entries = kept;
    }

    fn finish_collection(&self) {
        let watched = *self.watched_weak.lock();
        let mut pending = self.pending.lock();
        for addr in pending.drain(..) {
            if let Some(weak) = watched {
                let cleared = weak.ref_slot(0).is_none();
                self.weak_cleared_first.lock().push(cleared);
            }
            self.finalized.lock().push(addr);
        }
    }
}

fn memory_with_finalizer() -> (std::sync::Arc<ObjectMemory>, Arc<RecordingFinalizer>) {
    let finalizer = Arc::new(RecordingFinalizer::default());
    let service = Arc::clone(&finalizer);

    // Box a forwarder so the test keeps its handle on the shared state.
    struct Forward(Arc<RecordingFinalizer>);
    impl FinalizerService for Forward {
        fn start_collection(&self) {
            self.0.start_collection();
        }
        fn finish_collection(&self) {
            self.0.finish_collection();
        }
        fn record(&self, obj: ObjectRef) {
            self.0.record(obj);
        }
        fn walk(&self, tracer: &mut dyn ObjectTracer) {
            self.0.walk(tracer);
        }
    }

    let mem = ObjectMemory::with_services(
        Config {
            young_bytes: 64 * 1024,
            ..Config::default()
        },
        Box::new(Forward(service)),
        Box::new(NullCodeManager),
        Box::new(NullSymbolTable),
    )
    .unwrap();
    (mem, finalizer)
}

/// S4: drop the last strong reference to a finalizable object, collect,
/// and the callback runs exactly once, after weak references to the
/// object observe null.
#[test]
fn finalizer_runs_once_after_weak_clear() {
    let (mem, finalizer) = memory_with_finalizer();
    let thread = mem.register_thread();
    let pair = common::ref_type(&mem, "pair", 1);

    // A mature weak container pointing at the doomed object.
    let weak = mem.new_object_mature(&thread, 0, 16, pair).unwrap();
    let _weak_root = thread.push_root(weak);
    mem.register_weak_container(weak);

    let doomed = mem.new_object_mature(&thread, 0, 32, 0).unwrap();
    mem.write_ref(weak, 0, Some(doomed));
    mem.needs_finalization(doomed);
    *finalizer.watched_weak.lock() = Some(weak);

    // First mature collection: the object is unreachable; the walk grants
    // it a grace cycle and queues the callback.
    common::run_mature_collection(&mem, &thread);

    let finalized = finalizer.finalized.lock().clone();
    assert_eq!(finalized.len(), 1, "finalizer must run exactly once");
    assert_eq!(finalized[0], doomed.addr());

    // Weak references were nulled before the callback observed the world.
    assert_eq!(weak.ref_slot(0), None);
    let observations = finalizer.weak_cleared_first.lock().clone();
    assert_eq!(observations, vec![true]);

    // A second collection must not re-finalize.
    common::run_mature_collection(&mem, &thread);
    assert_eq!(finalizer.finalized.lock().len(), 1);
}

/// The young-generation twin of the ordering scenario: a finalizable
/// young object with no strong root is nulled out of weak references by
/// the young collection before its callback runs, even though the
/// finalizer walk copies it for a grace cycle.
#[test]
fn young_finalizer_runs_after_weak_clear() {
    let (mem, finalizer) = memory_with_finalizer();
    let thread = mem.register_thread();
    let pair = common::ref_type(&mem, "pair", 1);

    let weak = mem.new_object_mature(&thread, 0, 16, pair).unwrap();
    let _weak_root = thread.push_root(weak);
    mem.register_weak_container(weak);

    let doomed = mem.new_object(&thread, 0, 32, 0).unwrap();
    mem.write_ref(weak, 0, Some(doomed));
    mem.needs_finalization(doomed);
    *finalizer.watched_weak.lock() = Some(weak);

    common::run_young_collection(&mem, &thread);

    // The callback ran exactly once, and only after the weak slot was
    // nulled; the grace-cycle copy must not resurrect the weak edge.
    assert_eq!(finalizer.finalized.lock().len(), 1);
    assert_eq!(weak.ref_slot(0), None);
    let observations = finalizer.weak_cleared_first.lock().clone();
    assert_eq!(observations, vec![true]);

    common::run_young_collection(&mem, &thread);
    assert_eq!(finalizer.finalized.lock().len(), 1);
}

/// Weak slots to surviving objects are kept (and rewritten on
/// relocation), not cleared.
#[test]
fn weak_slots_keep_survivors() {
    let (mem, _finalizer) = memory_with_finalizer();
    let thread = mem.register_thread();
    let pair = common::ref_type(&mem, "pair", 1);

    let weak = mem.new_object_mature(&thread, 0, 16, pair).unwrap();
    let _weak_root = thread.push_root(weak);
    mem.register_weak_container(weak);

    let survivor = mem.new_object(&thread, 0, 32, 0).unwrap();
    let survivor_root = thread.push_root(survivor);
    mem.write_ref(weak, 0, Some(survivor));

    // The young survivor moves; the weak slot must follow it.
    common::run_young_collection(&mem, &thread);
    let moved = thread.get_root(survivor_root).unwrap();
    assert_ne!(moved.addr(), survivor.addr());
    assert_eq!(weak.ref_slot(0), Some(moved));

    // Still strongly referenced at the mature collection: kept.
    common::run_mature_collection(&mem, &thread);
    assert_eq!(weak.ref_slot(0), Some(thread.get_root(survivor_root).unwrap()));
}

/// A weak slot whose young referent dies is nulled by the young
/// collection.
#[test]
fn young_collection_clears_dead_weak_referents() {
    let (mem, _finalizer) = memory_with_finalizer();
    let thread = mem.register_thread();
    let pair = common::ref_type(&mem, "pair", 1);

    let weak = mem.new_object_mature(&thread, 0, 16, pair).unwrap();
    let _weak_root = thread.push_root(weak);
    mem.register_weak_container(weak);

    let doomed = mem.new_object(&thread, 0, 32, 0).unwrap();
    mem.write_ref(weak, 0, Some(doomed));
    // No strong root for `doomed`.

    common::run_young_collection(&mem, &thread);
    assert_eq!(weak.ref_slot(0), None);
}

/// The start/finish callbacks bracket every collection.
#[test]
fn collection_callbacks_fire() {
    let (mem, finalizer) = memory_with_finalizer();
    let thread = mem.register_thread();

    common::run_young_collection(&mem, &thread);
    common::run_mature_collection(&mem, &thread);
    assert_eq!(finalizer.collections_started.load(Ordering::SeqCst), 2);
}
