//! The large object space: a mark-sweep free-list over the OS allocator.
//!
//! Takes objects above the immix per-object cap, immix overflow during
//! promotion, and enduring allocations. Objects here never move; their
//! address is stable for their lifetime. Marking rides the shared epoch;
//! sweep walks the live list and returns unmarked storage to the
//! underlying allocator.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::object::{align_up, ObjectRef, Zone, HEADER_BYTES, WORD};

/// Bytes of large allocation between automatic collection requests.
const COLLECT_LIMIT: usize = 16 * 1024 * 1024;

/// What one sweep reclaimed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub freed_objects: usize,
    pub freed_bytes: usize,
}

pub struct LargeSpace {
    entries: Vec<ObjectRef>,
    bytes: usize,
    allocated_since_collection: usize,
}

impl LargeSpace {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            bytes: 0,
            allocated_since_collection: 0,
        }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn object_count(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.entries.iter().any(|obj| obj.addr() == addr)
    }

    fn layout_for(total_bytes: usize) -> Layout {
        Layout::from_size_align(total_bytes, WORD).expect("oversized large allocation")
    }

    fn raw_allocate(
        &mut self,
        total_bytes: usize,
        collect_flag: &AtomicBool,
    ) -> Option<usize> {
        let ptr = unsafe { alloc_zeroed(Self::layout_for(total_bytes)) };
        if ptr.is_null() {
            return None;
        }
        self.bytes += total_bytes;
        self.allocated_since_collection += total_bytes;
        if self.allocated_since_collection >= COLLECT_LIMIT {
            collect_flag.store(true, Ordering::SeqCst);
            self.allocated_since_collection = 0;
        }
        Some(ptr as usize)
    }

    /// Allocate a fresh zeroed object.
    pub fn allocate(
        &mut self,
        tag: u16,
        class: usize,
        body_bytes: usize,
        collect_flag: &AtomicBool,
    ) -> Option<ObjectRef> {
        let total = HEADER_BYTES + align_up(body_bytes, WORD);
        let addr = self.raw_allocate(total, collect_flag)?;
        let obj = unsafe { ObjectRef::initialize(addr, tag, class, body_bytes, Zone::Large) };
        self.entries.push(obj);
        Some(obj)
    }

    /// Take in an object another space could not hold, leaving a
    /// forwarding pointer behind.
    pub fn move_object(
        &mut self,
        obj: ObjectRef,
        collect_flag: &AtomicBool,
    ) -> Option<ObjectRef> {
        let total = obj.total_bytes();
        let addr = self.raw_allocate(total, collect_flag)?;
        unsafe {
            std::ptr::copy_nonoverlapping(obj.addr() as *const u8, addr as *mut u8, total);
        }
        let copy = unsafe { ObjectRef::from_addr(addr) };
        copy.set_zone(Zone::Large);
        self.entries.push(copy);
        obj.forward_to(copy);
        Some(copy)
    }

    /// Free every object not marked with the current epoch.
    pub fn sweep(&mut self, epoch: u8) -> SweepStats {
        let mut stats = SweepStats::default();
        self.entries.retain(|&obj| {
            if obj.is_marked(epoch) {
                true
            } else {
                let total = obj.total_bytes();
                stats.freed_objects += 1;
                stats.freed_bytes += total;
                unsafe {
                    dealloc(obj.addr() as *mut u8, Self::layout_for(total));
                }
                false
            }
        });
        self.bytes -= stats.freed_bytes;
        self.allocated_since_collection = 0;
        stats
    }
}

impl Default for LargeSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LargeSpace {
    fn drop(&mut self) {
        for obj in self.entries.drain(..) {
            let total = obj.total_bytes();
            unsafe {
                dealloc(obj.addr() as *mut u8, Self::layout_for(total));
            }
        }
    }
}
