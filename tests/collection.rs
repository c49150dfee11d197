//! End-to-end collection scenarios.

mod common;

use amcgc::{Address, AmcOptions, MessageKind};
use common::*;

/// Pure leaf collection: a large volume of unreachable AMCZ allocation is
/// reclaimed and committed memory returns near its baseline.
#[test]
fn leaf_collection_reclaims_everything() {
    let mut arena = test_arena(512 << 20);
    arena.message_enable(MessageKind::GcEnd);
    let chain = test_chain(&mut arena, &[(6000, 0.90), (8000, 0.65), (16000, 0.50)]);
    let fmt = arena.format_create(CellFormat).unwrap();
    let pool = arena
        .pool_create_amcz(
            fmt,
            AmcOptions {
                chain: Some(chain),
                ..AmcOptions::default()
            },
        )
        .unwrap();
    let ap = arena.ap_create(pool, false).unwrap();

    let baseline = arena.committed();
    for _ in 0..1000 {
        alloc_leaf(&mut arena, ap, 1 << 20);
    }
    // The chain capacities force collections along the way, so committed
    // memory never approaches the gigabyte that was allocated.
    assert!(
        arena.committed() < baseline + (64 << 20),
        "committed {} grew unboundedly",
        arena.committed()
    );

    arena.ap_destroy(ap);
    arena.collect("test drain").unwrap();

    assert!(
        arena.committed() < baseline + (8 << 20),
        "committed {} did not return to baseline {}",
        arena.committed(),
        baseline
    );
    assert!(arena.message_poll(), "collections should have reported");
    let mut ends = 0;
    while let Some(m) = arena.message_get(MessageKind::GcEnd) {
        match m {
            amcgc::Message::GcEnd { condemned, .. } => {
                assert!(condemned > 0);
                ends += 1;
            }
            _ => unreachable!(),
        }
    }
    assert!(ends > 1, "expected several collection cycles, got {}", ends);

    arena.pool_destroy(pool);
    assert_eq!(arena.format_destroy(fmt), Ok(()));
}

/// Forwarding chain: an object reachable from an exact root keeps its
/// referent alive; both are evacuated and the reference is updated.
#[test]
fn forwarding_updates_references() {
    let mut arena = test_arena(256 << 20);
    let (pool, ap) = amc_setup(&mut arena, AmcOptions::default());
    let (table, _root) = root_table(&mut arena, 1);

    let a = alloc(&mut arena, ap, 2);
    let b = alloc(&mut arena, ap, 1);
    set_slot(b, 0, Address::from_usize(0)); // leaf payload slot
    set_slot(a, 0, b);
    table[0] = a;

    arena.collect("move everything").unwrap();

    let a2 = table[0];
    assert_ne!(a2, a, "A should have been evacuated");
    let b2 = get_slot(a2, 0);
    assert_ne!(b2, b, "B should have been evacuated");
    // B was forwarded exactly once and A's field snapped to the new copy.
    assert!(forwarded_to(b2).is_none());
    assert_eq!(get_slot(a2, 1), Address::ZERO);

    // The old nursery content has been reclaimed: what remains of the pool
    // is the survivors plus the fresh nursery segment.
    assert!(arena.pool_total_size(pool) <= 64 << 10);
}

/// Commit race: a flip between reserve and commit fails the commit, and
/// the client's retry succeeds.
#[test]
fn commit_fails_across_a_flip() {
    let mut arena = test_arena(256 << 20);
    let (_pool, ap) = amc_setup(&mut arena, AmcOptions::default());

    // Warm the buffer so the reserve below is a fast-path reserve.
    alloc(&mut arena, ap, 1);

    let size = 2 * WORD;
    let p = arena.ap_reserve(ap, size).unwrap();
    unsafe {
        p.store::<usize>((size << 2) | 1);
        (p + WORD).store(Address::ZERO);
    }

    // A whole collection happens while the object is mid-initialization.
    arena.collect("race").unwrap();

    assert!(
        !arena.ap_commit(ap, p, size),
        "commit must fail when a flip intervened"
    );

    // The client retries: fresh reserve, initialize, commit.
    let q = arena.ap_reserve(ap, size).unwrap();
    unsafe {
        q.store::<usize>((size << 2) | 1);
        (q + WORD).store(Address::ZERO);
    }
    assert!(arena.ap_commit(ap, q, size));
    assert_ne!(p, q);
}

/// Messages report each cycle's accounting.
#[test]
fn gc_messages_are_delivered() {
    let mut arena = test_arena(256 << 20);
    arena.message_enable(MessageKind::GcBegin);
    arena.message_enable(MessageKind::GcEnd);
    let (_pool, ap) = amc_setup(&mut arena, AmcOptions::default());
    let (table, _root) = root_table(&mut arena, 1);
    table[0] = alloc(&mut arena, ap, 4);

    arena.collect("report").unwrap();

    let begin = arena.message_get(MessageKind::GcBegin).unwrap();
    assert_eq!(begin, amcgc::Message::GcBegin { why: "report" });
    match arena.message_get(MessageKind::GcEnd).unwrap() {
        amcgc::Message::GcEnd {
            live, condemned, ..
        } => {
            assert!(live > 0, "the rooted object survived");
            assert!(condemned >= live);
        }
        _ => unreachable!(),
    }
}

/// Walking visits exactly the live black objects.
#[test]
fn walk_visits_survivors() {
    let mut arena = test_arena(256 << 20);
    let (pool, ap) = amc_setup(&mut arena, AmcOptions::default());
    let (table, _root) = root_table(&mut arena, 2);
    table[0] = alloc(&mut arena, ap, 1);
    table[1] = alloc(&mut arena, ap, 3);
    let _garbage = alloc(&mut arena, ap, 5);

    arena.collect("walk").unwrap();

    let mut seen = Vec::new();
    arena.pool_walk(pool, &mut |obj| {
        // The walk yields padding too; the stepper filters it, as clients
        // of the walk interface do.
        if is_object(obj) {
            seen.push(obj);
        }
    });
    assert!(seen.contains(&table[0]));
    assert!(seen.contains(&table[1]));
    // Survivors only: the garbage object was reclaimed.
    assert_eq!(seen.len(), 2);
}

/// Random churn: a rotating root set over randomly sized objects survives
/// many collection cycles with its contents intact.
#[test]
fn random_churn_soak() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut arena = test_arena(256 << 20);
    let chain = test_chain(&mut arena, &[(256, 0.9), (1024, 0.6)]);
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
    let (table, _root) = root_table(&mut arena, 64);
    // Expected (slot count, payload) per root index. Payloads are tagged
    // small integers, which exact scanning must leave alone.
    let mut expected: Vec<Option<(usize, usize)>> = vec![None; table.len()];

    let mut rng = StdRng::seed_from_u64(0x90_c0_11_ec);
    for i in 0..4000 {
        let slots = rng.gen_range(2..=24);
        let obj = alloc(&mut arena, ap, slots);
        let payload = (i << 3) | 1;
        set_slot(obj, 0, Address::from_usize(payload));
        // Sometimes link to a survivor, so inter-object references cross
        // collection cycles.
        let j = rng.gen_range(0..table.len());
        if !table[j].is_zero() {
            set_slot(obj, 1, table[j]);
        }
        let k = rng.gen_range(0..table.len());
        table[k] = obj;
        expected[k] = Some((slots, payload));
    }

    arena.collect("soak").unwrap();

    for (k, exp) in expected.iter().enumerate() {
        if let Some((_slots, payload)) = exp {
            let obj = table[k];
            assert!(is_object(obj));
            assert_eq!(get_slot(obj, 0), Address::from_usize(*payload));
            // The linked survivor, if any, is a live object too.
            let link = get_slot(obj, 1);
            if !link.is_zero() {
                assert!(is_object(link));
            }
        }
    }
}

/// Interior pointers resolve to object bases, but not once the object has
/// been forwarded away.
#[test]
fn addr_object_finds_bases() {
    let mut arena = test_arena(256 << 20);
    let (_pool, ap) = amc_setup(&mut arena, AmcOptions::default());
    let (table, _root) = root_table(&mut arena, 1);
    let a = alloc(&mut arena, ap, 3);
    table[0] = a;

    let mid = a + 2 * WORD;
    assert_eq!(arena.addr_object(mid), Ok(a));

    arena.collect("relocate").unwrap();
    let a2 = table[0];
    assert_eq!(arena.addr_object(a2 + WORD), Ok(a2));
}
