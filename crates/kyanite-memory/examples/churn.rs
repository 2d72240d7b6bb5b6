//! Allocation churn demo: builds and drops linked structures across the
//! three pools, driving young and mature collections, then prints the
//! counters.
//!
//! Run with `cargo run --example churn`.

use std::sync::atomic::Ordering;

use kyanite_memory::{Config, ObjectMemory, TypeInfo};

fn main() {
    let mem = ObjectMemory::new(Config {
        young_bytes: 1024 * 1024,
        ..Config::default()
    })
    .unwrap();
    let thread = mem.register_thread();

    let node = mem.register_type(TypeInfo {
        name: "node",
        ref_slots: 1,
    });

    // Keep one list alive across the whole run; let everything else die.
    let keeper = mem.new_object(&thread, 0, 64, node).unwrap();
    let keeper_root = thread.push_root(keeper);

    for round in 0..64 {
        let mut head = thread.get_root(keeper_root).unwrap();
        for _ in 0..256 {
            let obj = mem.new_object(&thread, 0, 64, node).unwrap();
            mem.write_ref(obj, 0, Some(head));
            head = obj;
        }
        // Root only every eighth round's list; the rest becomes garbage.
        if round % 8 == 0 {
            thread.set_root(keeper_root, head);
        }

        let big = mem.new_object(&thread, 0, 16 * 1024, 0).unwrap();
        let _ = big;

        mem.checkpoint(&thread);
    }

    mem.request_mature_collection();
    mem.checkpoint(&thread);

    let metrics = mem.metrics();
    println!(
        "young: {} objects / {} collections",
        metrics.young_objects.load(Ordering::Relaxed),
        metrics.young_collections.load(Ordering::Relaxed),
    );
    println!(
        "promoted: {} objects ({} bytes)",
        metrics.promoted_objects.load(Ordering::Relaxed),
        metrics.promoted_bytes.load(Ordering::Relaxed),
    );
    println!(
        "large: {} objects, full collections: {}",
        metrics.large_objects.load(Ordering::Relaxed),
        metrics.full_collections.load(Ordering::Relaxed),
    );
    println!("last collection: {:?}", metrics.last_collection());

    mem.unregister_thread(&thread);
}
