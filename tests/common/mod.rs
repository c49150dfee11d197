//! A small formatted-object client used by the integration tests.
//!
//! Objects are word-aligned cells: a header word encoding kind and total
//! size, followed by reference slots. Forwarding markers and padding carry
//! the same header layout, so `skip` walks anything.

#![allow(dead_code)]

use amcgc::{
    Address, AmcOptions, Arena, ArenaOptions, BufferId, GenParams, MockVmem, ObjectFormat,
    PoolId, Result, ScanState,
};

pub const WORD: usize = std::mem::size_of::<usize>();

const KIND_MASK: usize = 3;
const KIND_OBJ: usize = 1;
const KIND_PAD: usize = 2;
const KIND_FWD: usize = 3;

pub struct CellFormat;

unsafe fn header(p: Address) -> usize {
    p.load::<usize>()
}

unsafe fn total_size(p: Address) -> usize {
    header(p) >> 2
}

impl ObjectFormat for CellFormat {
    fn alignment(&self) -> usize {
        WORD
    }

    unsafe fn scan(&self, ss: &mut ScanState, base: Address, limit: Address) -> Result<()> {
        let mut p = base;
        while p < limit {
            let h = header(p);
            let size = h >> 2;
            assert!(size >= WORD, "corrupt header at {:?}", p);
            if h & KIND_MASK == KIND_OBJ {
                let slots = size / WORD - 1;
                for i in 0..slots {
                    let slot = p + (i + 1) * WORD;
                    let mut r: Address = slot.load();
                    // Null and tagged-integer slots are not references.
                    if !r.is_zero() && r.as_usize() & 1 == 0 {
                        let old = r;
                        ss.fix(&mut r)?;
                        if r != old {
                            slot.store(r);
                        }
                    }
                }
            }
            p += size;
        }
        Ok(())
    }

    unsafe fn skip(&self, object: Address) -> Address {
        object + total_size(object)
    }

    unsafe fn forward(&self, old: Address, new: Address) {
        let size = total_size(old);
        assert!(size >= 2 * WORD, "object too small to forward");
        old.store::<usize>((size << 2) | KIND_FWD);
        (old + WORD).store(new);
    }

    unsafe fn is_moved(&self, object: Address) -> Option<Address> {
        if header(object) & KIND_MASK == KIND_FWD {
            Some((object + WORD).load())
        } else {
            None
        }
    }

    unsafe fn pad(&self, base: Address, size: usize) {
        assert!(size >= WORD);
        base.store::<usize>((size << 2) | KIND_PAD);
    }
}

/// Allocate an object with `slots` reference slots, all null.
pub fn alloc(arena: &mut Arena, ap: BufferId, slots: usize) -> Address {
    assert!(slots >= 1, "objects must be big enough to forward");
    let size = (slots + 1) * WORD;
    loop {
        let p = arena.ap_reserve(ap, size).expect("reserve failed");
        unsafe {
            p.store::<usize>((size << 2) | KIND_OBJ);
            for i in 0..slots {
                (p + (i + 1) * WORD).store(Address::ZERO);
            }
        }
        if arena.ap_commit(ap, p, size) {
            return p;
        }
    }
}

/// Allocate a leaf block of `size` bytes (header only initialized).
pub fn alloc_leaf(arena: &mut Arena, ap: BufferId, size: usize) -> Address {
    assert!(size >= 2 * WORD && size % WORD == 0);
    loop {
        let p = arena.ap_reserve(ap, size).expect("reserve failed");
        unsafe {
            p.store::<usize>((size << 2) | KIND_OBJ);
        }
        if arena.ap_commit(ap, p, size) {
            return p;
        }
    }
}

pub fn set_slot(obj: Address, i: usize, value: Address) {
    unsafe { (obj + (i + 1) * WORD).store(value) }
}

pub fn get_slot(obj: Address, i: usize) -> Address {
    unsafe { (obj + (i + 1) * WORD).load() }
}

pub fn is_object(p: Address) -> bool {
    unsafe { header(p) & KIND_MASK == KIND_OBJ }
}

pub fn forwarded_to(obj: Address) -> Option<Address> {
    unsafe {
        if header(obj) & KIND_MASK == KIND_FWD {
            Some((obj + WORD).load())
        } else {
            None
        }
    }
}

/// An arena on mock (recorded-protection) memory with tight spare limits,
/// so committed sizes are observable.
pub fn test_arena(reservation: usize) -> Arena {
    let _ = env_logger::builder().is_test(true).try_init();
    let options = ArenaOptions {
        reservation,
        spare_commit_limit: 0,
        ..ArenaOptions::default()
    };
    Arena::with_vmem(Box::new(MockVmem::new()), options).expect("arena creation failed")
}

pub fn test_chain(arena: &mut Arena, caps_kb: &[(usize, f64)]) -> amcgc::ChainId {
    let params: Vec<GenParams> = caps_kb
        .iter()
        .map(|&(kb, mortality)| GenParams {
            capacity: kb * 1024,
            mortality,
        })
        .collect();
    arena.chain_create(&params).expect("chain creation failed")
}

/// An AMC pool over the cell format with an allocation point.
pub fn amc_setup(arena: &mut Arena, opts: AmcOptions) -> (PoolId, BufferId) {
    let fmt = arena.format_create(CellFormat).unwrap();
    let pool = arena.pool_create_amc(fmt, opts).unwrap();
    let ap = arena.ap_create(pool, false).unwrap();
    (pool, ap)
}

/// A leaked, heap-resident root table the collector can update in place.
pub fn root_table(arena: &mut Arena, len: usize) -> (&'static mut [Address], amcgc::RootId) {
    let table: &'static mut [Address] = Box::leak(vec![Address::ZERO; len].into_boxed_slice());
    let base = Address::from_ptr(table.as_mut_ptr());
    let root = arena.root_create_table(base, len).unwrap();
    (table, root)
}
