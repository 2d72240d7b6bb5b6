//! Concurrent mature marking overlapped with mutation.

mod common;

use std::time::{Duration, Instant};

use kyanite_memory::{Config, ObjectMemory, ObjectPosition, ObjectRef, ThreadRecord};

fn concurrent_memory() -> std::sync::Arc<ObjectMemory> {
    ObjectMemory::new(Config {
        young_bytes: 64 * 1024,
        immix_concurrent: true,
        ..Config::default()
    })
    .unwrap()
}

/// Wait until the in-flight concurrent cycle retires, polling safepoints
/// so the finish handoff can run on this thread.
fn drive_to_finish(mem: &ObjectMemory, thread: &ThreadRecord) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        mem.checkpoint(thread);
        let collections = mem
            .metrics()
            .full_collections
            .load(std::sync::atomic::Ordering::Relaxed);
        if !mem.mature_mark_in_progress() && collections > 0 {
            return;
        }
        assert!(Instant::now() < deadline, "concurrent mark never finished");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// S5: mutate a shared list while a concurrent mark is in flight. Every
/// object reachable at the finish safepoint survives the sweep; the graph
/// stays intact.
#[test]
fn mutation_during_concurrent_mark_loses_nothing() {
    let mem = concurrent_memory();
    let thread = mem.register_thread();
    let node = common::ref_type(&mem, "node", 1);

    // A mature list of 32 nodes, head rooted. Payload: one ref slot plus
    // stamped bytes.
    let mut head: Option<ObjectRef> = None;
    for seed in 0..32u8 {
        let obj = mem.new_object_mature(&thread, 0, 64, node).unwrap();
        common::stamp(obj, 1, seed);
        mem.write_ref(obj, 0, head);
        head = Some(obj);
    }
    let head = head.unwrap();
    let head_root = thread.push_root(head);

    // Kick off the concurrent cycle.
    mem.request_mature_collection();
    mem.checkpoint(&thread);

    // Mutate while the marker runs: prepend new nodes, every store going
    // through the write barrier's insertion feed.
    let mut new_head = thread.get_root(head_root).unwrap();
    for seed in 32..96u8 {
        let obj = mem.new_object_mature(&thread, 0, 64, node).unwrap();
        common::stamp(obj, 1, seed);
        mem.write_ref(obj, 0, Some(new_head));
        new_head = obj;
        thread.set_root(head_root, new_head);
        mem.checkpoint(&thread);
    }

    drive_to_finish(&mem, &thread);

    // Walk the whole list: every node valid, every payload intact.
    let mut cursor = Some(thread.get_root(head_root).unwrap());
    let mut count = 0;
    let mut seeds = Vec::new();
    while let Some(obj) = cursor {
        assert_ne!(mem.validate_object(obj), ObjectPosition::Unknown);
        seeds.push(obj);
        count += 1;
        cursor = obj.ref_slot(0);
    }
    assert_eq!(count, 96, "list nodes were lost during concurrent mark");
    for (i, obj) in seeds.iter().enumerate() {
        let seed = (96 - 1 - i) as u8;
        assert!(common::check_stamp(*obj, 1, seed), "payload of node {i} corrupted");
    }
}

/// Objects unlinked before the cycle starts are reclaimed by its sweep;
/// objects reachable at the finish safepoint are not.
#[test]
fn concurrent_sweep_frees_only_unreachable() {
    let mem = concurrent_memory();
    let thread = mem.register_thread();

    // Large-space garbage is the observable: freed objects are counted.
    let keep = mem.new_object_enduring(&thread, 0, 10_000, 0).unwrap();
    let _keep_root = thread.push_root(keep);
    for _ in 0..8 {
        let _garbage = mem.new_object_enduring(&thread, 0, 10_000, 0).unwrap();
    }

    mem.request_mature_collection();
    mem.checkpoint(&thread);
    drive_to_finish(&mem, &thread);

    let last = mem.metrics().last_collection();
    assert_eq!(last.large_freed_objects, 8);
    assert_eq!(mem.validate_object(keep), ObjectPosition::Large);
}

/// Allocations made while the marker is running are born marked and
/// survive the cycle's sweep even if no barrier ever saw them.
#[test]
fn objects_allocated_during_mark_survive() {
    let mem = concurrent_memory();
    let thread = mem.register_thread();

    mem.request_mature_collection();
    mem.checkpoint(&thread);

    let fresh = mem.new_object_mature(&thread, 0, 128, 0).unwrap();
    common::stamp(fresh, 0, 0x77);
    let root = thread.push_root(fresh);

    drive_to_finish(&mem, &thread);

    let obj = thread.get_root(root).unwrap();
    assert_eq!(mem.validate_object(obj), ObjectPosition::Mature);
    assert!(common::check_stamp(obj, 0, 0x77));
}
