//! The object memory core of the Kyanite runtime.
//!
//! This crate allocates every heap object, reclaims unreachable ones, and
//! coordinates the world-stop that collection needs. Three pools share the
//! work:
//!
//! - a **young generation**: a semispace copier with per-thread
//!   allocation slabs,
//! - a **mature space**: a block/line mark-region (Immix) heap that
//!   defragments by evacuating during trace,
//! - a **large space**: a mark-sweep free list for oversize objects,
//!   immix overflow, and enduring allocations.
//!
//! Every object carries a packed [`header::HeaderWord`] encoding one of
//! four meanings (empty, identity, thin lock, inflated) in a single
//! machine word; richer state (a real mutex, a foreign handle, identity
//! alongside either) lives in the [`inflated::InflatedHeaderTable`].
//! All header transitions are single-word CAS, promote-only.
//!
//! Mutators are OS threads registered with [`ObjectMemory`]. They poll
//! safepoints at allocation and explicit checkpoints; the collection
//! driver stops the world cooperatively, runs the flagged collections,
//! and restarts it. With `immix_concurrent` enabled, mature marking
//! overlaps mutation on a dedicated marker thread, fed by the write
//! barrier, and the world stops only to snapshot roots and to finish.
//!
//! # Example
//!
//! ```
//! use kyanite_memory::{Config, ObjectMemory, TypeInfo};
//!
//! let mem = ObjectMemory::new(Config::default()).unwrap();
//! let thread = mem.register_thread();
//!
//! let pair = mem.register_type(TypeInfo { name: "pair", ref_slots: 2 });
//! let obj = mem.new_object(&thread, 0, 16, pair).unwrap();
//! let handle = thread.push_root(obj);
//!
//! let id = mem.assign_object_id(obj);
//! mem.request_young_collection();
//! mem.checkpoint(&thread);
//!
//! let obj = thread.get_root(handle).unwrap();
//! assert_eq!(mem.object_id(obj), Some(id));
//! ```

mod config;
mod handles;
mod large;
mod memory;
mod metrics;
mod object;
mod remember;
mod services;
mod sync;
mod threads;
mod world;
mod young;

pub mod header;
pub mod immix;
pub mod inflated;

pub use config::Config;
pub use handles::ForeignHandle;
pub use immix::{ImmixSweepStats, BLOCK_BYTES, LINE_BYTES, MAX_IMMIX_OBJECT};
pub use inflated::{InflatedHeader, InflatedHeaderTable, LockStatus};
pub use large::SweepStats;
pub use memory::{MemoryError, ObjectMemory};
pub use metrics::{CollectionKind, CollectionSummary, MemoryMetrics};
pub use object::{ObjectPosition, ObjectRef, TypeInfo, TypeTable, Zone, HEADER_BYTES, WORD};
pub use services::{
    CodeManager, FinalizerService, NullCodeManager, NullFinalizer, NullSymbolTable, ObjectTracer,
    SymbolTable,
};
pub use threads::{RootHandle, RunState, ThreadRecord, ThreadRegistry};
pub use world::WorldState;
