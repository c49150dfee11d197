//! Deferred accounting and emergency collection.

mod common;

use amcgc::{AmcOptions, MessageKind};
use common::*;

/// Hash-array allocation defers its accounting: a large volume of it does
/// not provoke a collection, because a collection would immediately stale
/// the client's location dependency on the array.
#[test]
fn deferred_allocation_does_not_trigger_collection() {
    let mut arena = test_arena(256 << 20);
    arena.message_enable(MessageKind::GcBegin);
    let chain = test_chain(&mut arena, &[(64, 0.9)]);
    let fmt = arena.format_create(CellFormat).unwrap();
    let pool = arena
        .pool_create_amc(
            fmt,
            AmcOptions {
                chain: Some(chain),
                ..AmcOptions::default()
            },
        )
        .unwrap();
    let hash_ap = arena.ap_create(pool, true).unwrap();

    // Ten times the nursery capacity, all deferred.
    for _ in 0..80 {
        alloc_leaf(&mut arena, hash_ap, 8 << 10);
    }
    assert!(
        !arena.message_poll(),
        "deferred allocation provoked a collection"
    );

    // An explicit collection still reclaims it.
    arena.ap_destroy(hash_ap);
    arena.collect("reclaim hash arrays").unwrap();
    assert!(arena.message_poll());
    assert!(arena.pool_total_size(pool) < 16 << 10);
}

/// Ordinary allocation at the same volume does trigger collection.
#[test]
fn ordinary_allocation_triggers_collection() {
    let mut arena = test_arena(256 << 20);
    arena.message_enable(MessageKind::GcBegin);
    let chain = test_chain(&mut arena, &[(64, 0.9)]);
    let fmt = arena.format_create(CellFormat).unwrap();
    let pool = arena
        .pool_create_amc(
            fmt,
            AmcOptions {
                chain: Some(chain),
                ..AmcOptions::default()
            },
        )
        .unwrap();
    let ap = arena.ap_create(pool, false).unwrap();

    for _ in 0..80 {
        alloc_leaf(&mut arena, ap, 8 << 10);
    }
    assert!(
        arena.message_poll(),
        "expected the capacity trigger to start a collection"
    );
}

/// A ramp that sees no collection enters and exits cleanly.
#[test]
fn empty_ramp_is_a_noop() {
    let mut arena = test_arena(256 << 20);
    let (pool, ap) = amc_setup(&mut arena, AmcOptions::default());
    arena.ramp_begin(pool);
    arena.ramp_begin(pool); // ramps nest
    let _x = alloc(&mut arena, ap, 1);
    arena.ramp_end(pool);
    arena.ramp_end(pool);
    // Collection still works afterwards.
    arena.collect("after ramp").unwrap();
}

/// When the commit limit leaves no room to copy survivors, the collection
/// enters emergency mode, preserves everything in place, and completes.
#[test]
fn emergency_pins_instead_of_copying() {
    let mut arena = test_arena(256 << 20);
    arena.message_enable(MessageKind::GcEnd);
    let (_pool, ap) = amc_setup(&mut arena, AmcOptions::default());
    let (table, _root) = root_table(&mut arena, 16);

    for slot in table.iter_mut() {
        let obj = alloc(&mut arena, ap, 7);
        *slot = obj;
    }
    let before: Vec<_> = table.to_vec();

    // No headroom to forward anything.
    arena.set_commit_limit(arena.committed());
    arena.collect("emergency").unwrap();

    // Everything survived in place: no crash, no movement.
    assert_eq!(table.to_vec(), before);
    for &obj in table.iter() {
        assert!(is_object(obj));
        assert!(forwarded_to(obj).is_none());
    }
    match arena.message_get(MessageKind::GcEnd).unwrap() {
        amcgc::Message::GcEnd { live, .. } => assert!(live > 0),
        _ => unreachable!(),
    }

    // With the limit restored, the next collection moves them.
    arena.set_commit_limit(usize::MAX);
    arena.release();
    arena.collect("recovery").unwrap();
    assert_ne!(table.to_vec(), before, "objects should move once room exists");
    for &obj in table.iter() {
        assert!(is_object(obj));
    }
}
