//! In-process memory and collection counters.
//!
//! Cumulative atomic counters in the taxonomy the runtime's diagnostics
//! expect, plus a summary of the most recent collection. Nothing here is
//! shipped anywhere; consumers read the counters in process.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

/// Which collection produced a [`CollectionSummary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CollectionKind {
    #[default]
    None,
    Young,
    Mature,
    MatureConcurrent,
}

/// Summary of the most recent collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionSummary {
    pub kind: CollectionKind,
    pub duration: Duration,
    /// Young survivors' bytes after a young collection; live line bytes
    /// after a mature one.
    pub surviving_bytes: u64,
    pub large_freed_objects: u64,
    pub large_freed_bytes: u64,
}

/// Cumulative counters for the object memory.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    pub young_objects: AtomicU64,
    pub young_bytes: AtomicU64,
    pub promoted_objects: AtomicU64,
    pub promoted_bytes: AtomicU64,
    pub slab_refills: AtomicU64,
    pub slab_refill_fails: AtomicU64,
    pub immix_objects: AtomicU64,
    pub immix_bytes: AtomicU64,
    pub large_objects: AtomicU64,
    pub large_bytes: AtomicU64,
    pub code_bytes: AtomicU64,
    pub foreign_handles: AtomicU64,
    pub young_collections: AtomicU64,
    pub full_collections: AtomicU64,
    pub young_pause_us: AtomicU64,
    pub mature_pause_us: AtomicU64,

    last_collection: Mutex<CollectionSummary>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_young_allocation(&self, bytes: usize) {
        self.young_objects.fetch_add(1, Ordering::Relaxed);
        self.young_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_immix_allocation(&self, bytes: usize) {
        self.immix_objects.fetch_add(1, Ordering::Relaxed);
        self.immix_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn count_large_allocation(&self, bytes: usize) {
        self.large_objects.fetch_add(1, Ordering::Relaxed);
        self.large_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_promoted(&self, objects: u64, bytes: u64) {
        self.promoted_objects.fetch_add(objects, Ordering::Relaxed);
        self.promoted_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn young_collection_finished(&self, surviving_bytes: u64) {
        self.young_collections.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_collection.lock();
        last.kind = CollectionKind::Young;
        last.surviving_bytes = surviving_bytes;
    }

    pub fn mature_collection_finished(
        &self,
        kind: CollectionKind,
        surviving_bytes: u64,
        large_freed_objects: u64,
        large_freed_bytes: u64,
    ) {
        self.full_collections.fetch_add(1, Ordering::Relaxed);
        let mut last = self.last_collection.lock();
        last.kind = kind;
        last.surviving_bytes = surviving_bytes;
        last.large_freed_objects = large_freed_objects;
        last.large_freed_bytes = large_freed_bytes;
    }

    pub fn record_pause(&self, kind: CollectionKind, duration: Duration) {
        let us = duration.as_micros() as u64;
        match kind {
            CollectionKind::Young => {
                self.young_pause_us.fetch_add(us, Ordering::Relaxed);
            }
            CollectionKind::Mature | CollectionKind::MatureConcurrent => {
                self.mature_pause_us.fetch_add(us, Ordering::Relaxed);
            }
            CollectionKind::None => {}
        }
        self.last_collection.lock().duration = duration;
    }

    /// Snapshot of the most recent collection.
    pub fn last_collection(&self) -> CollectionSummary {
        *self.last_collection.lock()
    }
}
