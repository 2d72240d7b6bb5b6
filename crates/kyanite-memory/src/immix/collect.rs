//! The mature collection: mark, evacuate, reconcile, sweep.
//!
//! One `MatureCollection` drives a full stop-the-world cycle, or the
//! stop-the-world bookends of a concurrent cycle (root snapshot at the
//! start, closure completion at the finish). The in-flight middle of a
//! concurrent cycle lives on the marker thread and marks strictly in
//! place; evacuation only happens under a stopped world.

use crate::immix::{copy_object_to, mark_object, BlockMeta, ImmixSpace, ImmixSweepStats, MarkStack};
use crate::large::{LargeSpace, SweepStats};
use crate::memory::ObjectMemory;
use crate::object::{scan_refs, ObjectRef};
use crate::services::ObjectTracer;
use crate::young::{has_young_refs, scan_weak_slots, WeakFate};

pub(crate) struct MatureCollection<'a> {
    mem: &'a ObjectMemory,
    immix: &'a mut ImmixSpace,
    large: &'a mut LargeSpace,
    epoch: u8,
    /// Whether trace may evacuate fragmented-block objects. Off for the
    /// concurrent bookends.
    evacuate: bool,
}

impl<'a> MatureCollection<'a> {
    pub(crate) fn new(
        mem: &'a ObjectMemory,
        immix: &'a mut ImmixSpace,
        large: &'a mut LargeSpace,
        evacuate: bool,
    ) -> Self {
        let epoch = mem.epoch();
        Self {
            mem,
            immix,
            large,
            epoch,
            evacuate,
        }
    }

    /// Reset line marks and pick defragmentation candidates. Runs once per
    /// cycle, before any root is traced.
    pub(crate) fn prepare(&mut self) {
        self.immix.clear_line_marks();
        if self.evacuate {
            self.immix
                .select_evacuation_candidates(self.mem.config().evacuation_hole_threshold);
        }
    }

    /// Trace every root into the mark stack, rewriting root slots that
    /// point at evacuated objects.
    pub(crate) fn scan_roots(&mut self, stack: &mut MarkStack) {
        let mem = self.mem;

        for record in mem.registry().snapshot() {
            let mut roots = record.roots.lock();
            for slot in roots.iter_mut() {
                if *slot != 0 {
                    let obj = unsafe { ObjectRef::from_addr(*slot) };
                    if let Some(moved) = self.trace(stack, obj) {
                        *slot = moved.addr();
                    }
                }
            }
        }

        {
            let mut roots = mem.internal_roots().lock();
            for slot in roots.iter_mut() {
                if *slot != 0 {
                    let obj = unsafe { ObjectRef::from_addr(*slot) };
                    if let Some(moved) = self.trace(stack, obj) {
                        *slot = moved.addr();
                    }
                }
            }
        }

        mem.handles().update_strong(|obj| self.trace(stack, obj));
    }

    /// Trace one reference. Returns the object's new address when this
    /// cycle moved it, `None` otherwise (matching the slot-rewrite
    /// contract of `scan_refs`).
    pub(crate) fn trace(&mut self, stack: &mut MarkStack, obj: ObjectRef) -> Option<ObjectRef> {
        if let Some(target) = obj.forwarding() {
            return Some(target);
        }
        if obj.is_marked(self.epoch) {
            return None;
        }

        self.mem.note_watch(obj, "mature trace");

        if self.evacuate && obj.is_in_immix() && !obj.is_pinned() {
            let meta = unsafe { BlockMeta::of(obj.addr()) };
            if meta.is_evacuate() {
                if let Some(addr) = self
                    .immix
                    .allocate_for_evacuation(obj.total_bytes(), self.mem.collect_mature_flag())
                {
                    let copy = unsafe { copy_object_to(obj, addr) };
                    obj.forward_to(copy);
                    mark_object(copy, self.epoch);
                    self.mark_inflated(copy);
                    stack.push(copy);
                    return Some(copy);
                }
            }
        }

        mark_object(obj, self.epoch);
        self.mark_inflated(obj);
        stack.push(obj);
        None
    }

    fn mark_inflated(&self, obj: ObjectRef) {
        let word = obj.header().read();
        if word.is_inflated() {
            self.mem.inflated().get(word.inflated_index()).mark(self.epoch);
        }
    }

    fn scan_object(&mut self, stack: &mut MarkStack, obj: ObjectRef) {
        if obj.is_scanned() {
            return;
        }
        obj.set_scanned();
        if obj.is_weak_container() {
            return;
        }
        let mem = self.mem;
        scan_refs(obj, mem.types(), |r| self.trace(stack, r));
    }

    /// Drain the mark stack, the write-barrier feed, and any dirty blocks
    /// produced by stack overflow, to fixpoint.
    pub(crate) fn process_to_fixpoint(&mut self, stack: &mut MarkStack) {
        loop {
            while let Some(obj) = stack.pop() {
                self.scan_object(stack, obj);
            }
            while let Some(obj) = self.mem.mark_feed().pop() {
                self.trace(stack, obj);
            }
            let overflowed = stack.take_overflowed();
            let mut rescued = Vec::new();
            if overflowed {
                self.immix.drain_dirty_blocks(self.epoch, |obj| rescued.push(obj));
            }
            for obj in rescued {
                stack.push(obj);
            }
            if stack.is_empty() && self.mem.mark_feed().is_empty() {
                break;
            }
        }
    }

    /// Everything after the ordinary transitive closure: weak references,
    /// then finalizer entries (which may extend the closure), then the
    /// symbol table, then the remembered set prune.
    pub(crate) fn finish_closure(&mut self, stack: &mut MarkStack) {
        // Weak references are cleaned before finalizers keep extra objects
        // alive, so nothing observes a finalizable object through a weak
        // reference.
        self.reconcile_weak_refs();

        let mem = self.mem;
        {
            let mut tracer = MatureTracer {
                gc: &mut *self,
                stack: &mut *stack,
            };
            mem.finalizer().walk(&mut tracer);
        }
        self.process_to_fixpoint(stack);

        {
            let mut tracer = MatureTracer {
                gc: &mut *self,
                stack: &mut *stack,
            };
            mem.symbols().trace_marks(&mut tracer);
        }
        self.process_to_fixpoint(stack);

        let epoch = self.epoch;
        mem.remembered().retain_map(|obj| {
            let current = obj.resolve();
            if current.is_marked(epoch) && has_young_refs(current, mem) {
                Some(current)
            } else {
                None
            }
        });
    }

    fn reconcile_weak_refs(&mut self) {
        let mem = self.mem;
        let epoch = self.epoch;
        let mut weak = mem.weak_refs().lock();
        weak.retain_mut(|container| {
            let current = container.resolve();
            if !current.is_marked(epoch) {
                return false;
            }
            *container = current;
            scan_weak_slots(current, mem, |r| {
                let referent = r.resolve();
                if !referent.is_marked(epoch) {
                    WeakFate::Clear
                } else if referent != r {
                    WeakFate::Rewrite(referent)
                } else {
                    WeakFate::Keep
                }
            });
            true
        });
    }

    /// Reclaim storage in every pool, in mark-bit-safety order: handle
    /// pruning and inflated-header sweep still read marks, so they run
    /// before the spaces free anything.
    pub(crate) fn sweep(&mut self) -> (ImmixSweepStats, SweepStats) {
        let mem = self.mem;
        let epoch = self.epoch;

        mem.code_manager().sweep();

        mem.handles().prune_dead(|obj| {
            let current = obj.resolve();
            if current.is_marked(epoch) {
                Some(current)
            } else {
                None
            }
        });

        mem.inflated().sweep(epoch);
        let large_stats = self.large.sweep(epoch);
        let immix_stats = self.immix.sweep(epoch, mem.collect_mature_flag());
        (immix_stats, large_stats)
    }
}

struct MatureTracer<'b, 'a> {
    gc: &'b mut MatureCollection<'a>,
    stack: &'b mut MarkStack,
}

impl ObjectTracer for MatureTracer<'_, '_> {
    fn trace(&mut self, obj: ObjectRef) -> (ObjectRef, bool) {
        let live = obj.resolve().is_marked(self.gc.epoch);
        let current = match self.gc.trace(self.stack, obj) {
            Some(moved) => moved,
            None => obj,
        };
        (current, live)
    }
}

/// In-place tracing for the concurrent marker: marks objects and lines
/// and pushes newly marked objects, never moving anything. Shared slot
/// rewriting is limited to forwarding left by a previous stop-the-world
/// phase.
pub(crate) fn trace_in_place(
    mem: &ObjectMemory,
    stack: &mut MarkStack,
    obj: ObjectRef,
    epoch: u8,
) -> Option<ObjectRef> {
    let current = obj.resolve();
    if mark_object(current, epoch) {
        let word = current.header().read();
        if word.is_inflated() {
            mem.inflated().get(word.inflated_index()).mark(epoch);
        }
        stack.push(current);
    }
    if current != obj {
        Some(current)
    } else {
        None
    }
}

/// Scan one object for the concurrent marker.
pub(crate) fn scan_in_place(mem: &ObjectMemory, stack: &mut MarkStack, obj: ObjectRef, epoch: u8) {
    if obj.is_scanned() {
        return;
    }
    obj.set_scanned();
    if obj.is_weak_container() {
        return;
    }
    scan_refs(obj, mem.types(), |r| trace_in_place(mem, stack, r, epoch));
}

/// One bounded slice of concurrent marking. Returns true while work
/// remains.
///
/// Dirty blocks from mark-stack overflow are left for the finish
/// safepoint: re-scanning them walks chunk metadata the allocator may be
/// growing concurrently, so it only happens with the world stopped.
pub(crate) fn concurrent_mark_step(mem: &ObjectMemory, budget: usize) -> bool {
    let epoch = mem.epoch();
    let mut stack = mem.mark_stack().lock();

    let mut scanned = 0;
    while scanned < budget {
        if let Some(obj) = stack.pop() {
            scan_in_place(mem, &mut stack, obj, epoch);
            scanned += 1;
            continue;
        }
        if let Some(obj) = mem.mark_feed().pop() {
            trace_in_place(mem, &mut stack, obj, epoch);
            continue;
        }
        return false;
    }
    true
}
