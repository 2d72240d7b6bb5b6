//! Collaborator interfaces.
//!
//! The core does not own the finalizer queue, the compiled-code manager,
//! or the symbol table; it calls into them at fixed points of every
//! collection through these traits. All methods default to no-ops so
//! embedders implement only what they use.

use crate::object::ObjectRef;

/// Handed to collaborators during a collection so they can keep their
/// objects alive and learn where those objects moved.
pub trait ObjectTracer {
    /// Trace `obj` as live for this cycle. Returns the object's current
    /// address (it may have been copied) and whether it was already
    /// reachable before this call kept it alive.
    fn trace(&mut self, obj: ObjectRef) -> (ObjectRef, bool);
}

/// The finalizer service, external to the core.
///
/// `walk` is called once per collection, after the transitive closure of
/// ordinary roots and after weak references have been reconciled, so a
/// finalizable object's death is observable through weak references before
/// its finalizer ever runs. Entries traced during `walk` stay alive for
/// one more cycle.
pub trait FinalizerService: Send + Sync {
    /// A collection cycle is beginning (world stopped).
    fn start_collection(&self) {}

    /// The cycle finished; queued finalizers may now be dispatched.
    fn finish_collection(&self) {}

    /// Register `obj` for finalization.
    fn record(&self, _obj: ObjectRef) {}

    /// Attach a managed finalizer object to `obj`.
    fn set_finalizer(&self, _obj: ObjectRef, _finalizer: ObjectRef) {}

    /// Present every recorded entry to the tracer.
    fn walk(&self, _tracer: &mut dyn ObjectTracer) {}
}

/// Manager of compiled-code resources swept alongside the mature heap.
pub trait CodeManager: Send + Sync {
    /// A mature mark is starting; drop last cycle's marks.
    fn clear_marks(&self) {}

    /// The mark finished; release unmarked resources.
    fn sweep(&self) {}

    /// A resource of `bytes` was added. Return true to request a mature
    /// collection.
    fn add_resource(&self, _bytes: usize) -> bool {
        false
    }
}

/// The symbol table; traced once per mature collection.
pub trait SymbolTable: Send + Sync {
    fn trace_marks(&self, _tracer: &mut dyn ObjectTracer) {}
}

/// Default collaborators that do nothing.
pub struct NullFinalizer;
impl FinalizerService for NullFinalizer {}

pub struct NullCodeManager;
impl CodeManager for NullCodeManager {}

pub struct NullSymbolTable;
impl SymbolTable for NullSymbolTable {}
