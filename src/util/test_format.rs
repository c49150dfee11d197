//! A minimal formatted-object client for in-crate tests.
//!
//! One header word encodes kind and total size; object slots follow.

use crate::format::ObjectFormat;
use crate::res::Result;
use crate::trace::scan::ScanState;
use crate::util::address::Address;

pub const WORD: usize = std::mem::size_of::<usize>();

const KIND_MASK: usize = 3;
const KIND_OBJ: usize = 1;
const KIND_PAD: usize = 2;
const KIND_FWD: usize = 3;

pub struct TestFormat;

unsafe fn total_size(p: Address) -> usize {
    p.load::<usize>() >> 2
}

impl ObjectFormat for TestFormat {
    fn alignment(&self) -> usize {
        WORD
    }

    unsafe fn scan(&self, ss: &mut ScanState, base: Address, limit: Address) -> Result<()> {
        let mut p = base;
        while p < limit {
            let h = p.load::<usize>();
            let size = h >> 2;
            if h & KIND_MASK == KIND_OBJ {
                for i in 0..(size / WORD - 1) {
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
        old.store::<usize>((size << 2) | KIND_FWD);
        (old + WORD).store(new);
    }

    unsafe fn is_moved(&self, object: Address) -> Option<Address> {
        if object.load::<usize>() & KIND_MASK == KIND_FWD {
            Some((object + WORD).load())
        } else {
            None
        }
    }

    unsafe fn pad(&self, base: Address, size: usize) {
        base.store::<usize>((size << 2) | KIND_PAD);
    }
}

/// Allocate an object with `slots` null reference slots through `ap`.
pub fn alloc_obj(
    arena: &mut crate::arena::Arena,
    ap: crate::buffer::BufferId,
    slots: usize,
) -> Address {
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

pub fn set_slot(obj: Address, i: usize, value: Address) {
    unsafe { (obj + (i + 1) * WORD).store(value) }
}
