//! Cross-cutting collection invariants.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use kyanite_memory::{ObjectPosition, Zone};

/// No double free: a batch of dead large objects is freed by exactly one
/// sweep; the next collection frees nothing further.
#[test]
fn dead_large_objects_are_freed_exactly_once() {
    let mem = common::small_memory();
    let thread = mem.register_thread();

    let keep = mem.new_object_enduring(&thread, 0, 8_000, 0).unwrap();
    let _keep_root = thread.push_root(keep);
    for _ in 0..10 {
        let _garbage = mem.new_object_enduring(&thread, 0, 8_000, 0).unwrap();
    }

    common::run_mature_collection(&mem, &thread);
    assert_eq!(mem.metrics().last_collection().large_freed_objects, 10);

    common::run_mature_collection(&mem, &thread);
    assert_eq!(
        mem.metrics().last_collection().large_freed_objects,
        0,
        "a second sweep found something to free again"
    );
    assert_eq!(mem.validate_object(keep), ObjectPosition::Large);
}

/// Mark-epoch idempotence: two collections over an unchanged graph agree
/// on the reachable set.
#[test]
fn repeated_collections_agree_on_liveness() {
    let mem = common::small_memory();
    let thread = mem.register_thread();
    let pair = common::ref_type(&mem, "pair", 1);

    // A small mature graph: chain of 16 nodes plus one large leaf.
    let leaf = mem.new_object_enduring(&thread, 0, 9_000, 0).unwrap();
    let mut head = leaf;
    for _ in 0..16 {
        let node = mem.new_object_mature(&thread, 0, 16, pair).unwrap();
        mem.write_ref(node, 0, Some(head));
        head = node;
    }
    let _root = thread.push_root(head);

    common::run_mature_collection(&mem, &thread);
    let first = mem.metrics().last_collection().surviving_bytes;

    common::run_mature_collection(&mem, &thread);
    let second = mem.metrics().last_collection().surviving_bytes;

    assert_eq!(first, second, "reachability differed between identical marks");
    assert_eq!(mem.metrics().last_collection().large_freed_objects, 0);
}

/// At most one collection runs at a time, however many threads race to
/// request and drive one. (The driver asserts on overlap, so this test
/// fails by panic.)
#[test]
fn concurrent_drivers_serialize() {
    let mem = common::small_memory();
    let main = mem.register_thread();

    let mut workers = Vec::new();
    for _ in 0..4 {
        let mem = Arc::clone(&mem);
        workers.push(std::thread::spawn(move || {
            let thread = mem.register_thread();
            for round in 0..200 {
                let obj = mem.new_object(&thread, 0, 64, 0).unwrap();
                let root = thread.push_root(obj);
                if round % 10 == 0 {
                    mem.request_young_collection();
                }
                if round % 50 == 0 {
                    mem.request_mature_collection();
                }
                mem.checkpoint(&thread);
                thread.clear_root(root);
            }
            mem.unregister_thread(&thread);
        }));
    }

    // Joining is blocking I/O as far as the collector is concerned.
    mem.become_independent(&main);
    for worker in workers {
        worker.join().unwrap();
    }
    mem.become_dependent(&main);

    mem.checkpoint(&main);
    assert!(mem.metrics().young_collections.load(Ordering::Relaxed) > 0);
}

/// Objects pinned by a foreign handle are never relocated by the mature
/// collector, and the handle table always resolves to the current
/// address.
#[test]
fn foreign_handles_pin_and_track() {
    let mem = common::small_memory();
    let thread = mem.register_thread();

    let obj = mem.new_object_mature(&thread, 0, 64, 0).unwrap();
    let _root = thread.push_root(obj);
    common::stamp(obj, 0, 0x3C);

    let handle = mem.register_foreign_handle(obj, false);
    assert!(obj.is_pinned());
    assert!(obj.header().read().is_inflated());

    // Strong handle keeps the object alive with no other reference.
    thread.clear_root(_root);
    common::run_mature_collection(&mem, &thread);

    let resolved = mem.handles().resolve(handle).expect("handle lost its object");
    assert_eq!(resolved.addr(), obj.addr(), "pinned object moved");
    assert!(common::check_stamp(resolved, 0, 0x3C));

    // Released handles stop keeping the object alive.
    mem.unregister_foreign_handle(handle);
    assert!(!obj.is_pinned());
    common::run_mature_collection(&mem, &thread);
    assert_eq!(mem.handles().resolve(handle), None);
}

/// A weak foreign handle observes its object's death.
#[test]
fn weak_foreign_handles_null_on_death() {
    let mem = common::small_memory();
    let thread = mem.register_thread();

    let obj = mem.new_object_mature(&thread, 0, 64, 0).unwrap();
    let handle = mem.register_foreign_handle(obj, true);
    assert_eq!(mem.handles().resolve(handle), Some(obj));

    // No strong reference anywhere: the next mature collection kills it.
    common::run_mature_collection(&mem, &thread);
    assert_eq!(mem.handles().resolve(handle), None);
}

/// Young survivors keep their payload and class through repeated
/// collections; ages climb until promotion.
#[test]
fn survivors_stay_intact_through_collections() {
    let mem = common::small_memory();
    let thread = mem.register_thread();

    let mut roots = Vec::new();
    for seed in 0..16u8 {
        let obj = mem.new_object(&thread, seed as usize, 72, 0).unwrap();
        common::stamp(obj, 0, seed);
        roots.push(thread.push_root(obj));
    }

    for _ in 0..4 {
        common::run_young_collection(&mem, &thread);
    }

    for (i, &root) in roots.iter().enumerate() {
        let obj = thread.get_root(root).unwrap();
        assert_eq!(obj.zone(), Zone::Mature, "survivor {i} was not promoted");
        assert_eq!(obj.class(), i);
        assert!(common::check_stamp(obj, 0, i as u8), "survivor {i} corrupted");
    }
}
