//! Ambiguous references, nailing, and pinning policies.

mod common;

use amcgc::{Address, AmcOptions};
use common::*;

/// An ambiguous root pointing into the middle of an object pins it in
/// place under the interior policy.
#[test]
fn ambiguous_interior_pointer_pins() {
    let mut arena = test_arena(256 << 20);
    let (_pool, ap) = amc_setup(
        &mut arena,
        AmcOptions {
            interior: Some(true),
            ..AmcOptions::default()
        },
    );

    let a = alloc(&mut arena, ap, 3);
    set_slot(a, 2, Address::from_usize(0));
    let mid = a + 2 * WORD;

    // A heap-resident cell holding only the interior pointer, registered
    // as an ambiguous root.
    let amb: &'static mut [usize] = Box::leak(vec![mid.as_usize()].into_boxed_slice());
    let base = Address::from_ptr(amb.as_ptr());
    arena
        .root_create_thread(base, base + WORD, 0, 0)
        .unwrap();

    arena.collect("pin").unwrap();

    // The object was preserved exactly where it stood.
    assert!(forwarded_to(a).is_none());
    assert_eq!(get_slot(a, 0), Address::ZERO);
    assert_eq!(arena.addr_object(mid), Ok(a));
}

/// Under the base-only policy an interior pointer does not pin: the object
/// is evacuated when an exact reference requires it to live.
#[test]
fn base_policy_ignores_interior_pointers() {
    let mut arena = test_arena(256 << 20);
    let (_pool, ap) = amc_setup(
        &mut arena,
        AmcOptions {
            interior: Some(false),
            ..AmcOptions::default()
        },
    );
    let (table, _root) = root_table(&mut arena, 1);

    let a = alloc(&mut arena, ap, 3);
    table[0] = a;
    let mid = a + 2 * WORD;
    let amb: &'static mut [usize] = Box::leak(vec![mid.as_usize()].into_boxed_slice());
    let base = Address::from_ptr(amb.as_ptr());
    arena
        .root_create_thread(base, base + WORD, 0, 0)
        .unwrap();

    arena.collect("no pin").unwrap();

    // The interior nail did not pin the object, so the exact root moved it.
    assert_ne!(table[0], a, "object should have been evacuated");
}

/// Under the base policy a pointer at the object's base does pin.
#[test]
fn base_policy_pins_on_base_pointer() {
    let mut arena = test_arena(256 << 20);
    let (_pool, ap) = amc_setup(
        &mut arena,
        AmcOptions {
            interior: Some(false),
            ..AmcOptions::default()
        },
    );
    let (table, _root) = root_table(&mut arena, 1);

    let a = alloc(&mut arena, ap, 3);
    table[0] = a;
    let amb: &'static mut [usize] = Box::leak(vec![a.as_usize()].into_boxed_slice());
    let base = Address::from_ptr(amb.as_ptr());
    arena
        .root_create_thread(base, base + WORD, 0, 0)
        .unwrap();

    arena.collect("pin base").unwrap();

    assert_eq!(table[0], a, "pinned object must not move");
    assert!(forwarded_to(a).is_none());
}

/// Tagged ambiguous scanning only considers words matching the tag
/// pattern.
#[test]
fn tag_pattern_filters_ambiguous_words() {
    let mut arena = test_arena(256 << 20);
    let (_pool, ap) = amc_setup(&mut arena, AmcOptions::default());
    let (table, _root) = root_table(&mut arena, 1);

    let a = alloc(&mut arena, ap, 1);
    let b = alloc(&mut arena, ap, 1);
    table[0] = b; // keep b alive exactly

    // a's only reference is tagged with a low bit, and the root's mask
    // demands untagged words, so it must not keep a alive or pin it.
    let amb: &'static mut [usize] = Box::leak(vec![a.as_usize() | 1].into_boxed_slice());
    let base = Address::from_ptr(amb.as_ptr());
    arena.root_create_thread(base, base + WORD, 1, 0).unwrap();

    arena.collect("tagged").unwrap();

    assert_ne!(table[0], b, "b was exact-reachable and moved");
    // a is gone; nothing pinned its segment in place, so the old cell is
    // now padding or forwarding debris, not a live object.
    assert!(!is_object(a) || forwarded_to(a).is_some());
}
