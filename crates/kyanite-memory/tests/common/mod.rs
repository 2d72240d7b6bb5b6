//! Shared helpers for the scenario tests.

#![allow(dead_code)]

use std::sync::Arc;

use kyanite_memory::{Config, ObjectMemory, ObjectRef, ThreadRecord, TypeInfo};

/// A memory with a small young generation, so collections are easy to
/// provoke.
pub fn small_memory() -> Arc<ObjectMemory> {
    ObjectMemory::new(small_config()).unwrap()
}

pub fn small_config() -> Config {
    Config {
        young_bytes: 64 * 1024,
        ..Config::default()
    }
}

/// Register a type whose first `ref_slots` payload words are references.
pub fn ref_type(mem: &ObjectMemory, name: &'static str, ref_slots: u32) -> u16 {
    mem.register_type(TypeInfo { name, ref_slots })
}

/// Fill an object's payload with a recognizable byte pattern (skipping
/// reference slots).
pub fn stamp(obj: ObjectRef, refs: usize, seed: u8) {
    let bytes = obj.body_bytes();
    let start = refs * kyanite_memory::WORD;
    unsafe {
        for i in start..bytes {
            *obj.body_ptr().add(i) = seed.wrapping_add(i as u8);
        }
    }
}

/// Check the pattern written by [`stamp`].
pub fn check_stamp(obj: ObjectRef, refs: usize, seed: u8) -> bool {
    let bytes = obj.body_bytes();
    let start = refs * kyanite_memory::WORD;
    unsafe {
        (start..bytes).all(|i| *obj.body_ptr().add(i) == seed.wrapping_add(i as u8))
    }
}

/// Run one safepoint that drives a requested young collection.
pub fn run_young_collection(mem: &ObjectMemory, thread: &ThreadRecord) {
    mem.request_young_collection();
    mem.checkpoint(thread);
}

/// Run one safepoint that drives a requested mature collection.
pub fn run_mature_collection(mem: &ObjectMemory, thread: &ThreadRecord) {
    mem.request_mature_collection();
    mem.checkpoint(thread);
}
