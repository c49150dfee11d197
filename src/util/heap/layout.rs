//! Placement of segments within the arena's reservation.
//!
//! The reservation is striped into zones; the free list can be asked to
//! place a segment inside a preferred zone set so that generations end up
//! with usefully small zone summaries. Placement preference is best-effort:
//! falling back to an arbitrary address is always sound, it merely widens
//! the owning generation's condemnation set.

use crate::util::address::{Address, AddressRange, ByteSize};
use crate::util::refset::RefSet;

pub struct AddressSpace {
    base: Address,
    limit: Address,
    zone_shift: usize,
    /// Free ranges, sorted by base, coalesced.
    free: Vec<AddressRange>,
}

impl AddressSpace {
    pub fn new(base: Address, size: ByteSize, zone_shift: usize) -> AddressSpace {
        AddressSpace {
            base,
            limit: base + size,
            zone_shift,
            free: vec![AddressRange::new(base, base + size)],
        }
    }

    pub fn base(&self) -> Address {
        self.base
    }

    pub fn limit(&self) -> Address {
        self.limit
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.base <= addr && addr < self.limit
    }

    /// Allocate `size` bytes (already aligned by the caller), preferring a
    /// placement whose zones are a subset of `pref`. Returns None when the
    /// reservation is exhausted.
    pub fn alloc(&mut self, size: ByteSize, pref: RefSet) -> Option<Address> {
        debug_assert!(size > 0);
        if pref != RefSet::EMPTY && pref != RefSet::UNIV {
            if let Some(addr) = self.alloc_in_zones(size, pref) {
                return Some(addr);
            }
        }
        self.alloc_first_fit(size)
    }

    fn alloc_first_fit(&mut self, size: ByteSize) -> Option<Address> {
        let i = self.free.iter().position(|r| r.size() >= size)?;
        let base = self.free[i].base;
        self.take(i, base, size);
        Some(base)
    }

    fn alloc_in_zones(&mut self, size: ByteSize, pref: RefSet) -> Option<Address> {
        let stripe = 1usize << self.zone_shift;
        for i in 0..self.free.len() {
            let range = self.free[i];
            // Candidate starts: the range base, then each stripe boundary
            // inside the range.
            let mut start = range.base;
            loop {
                if start + size > range.limit {
                    break;
                }
                if RefSet::of_range(start, start + size, self.zone_shift).subset_of(pref) {
                    self.take(i, start, size);
                    return Some(start);
                }
                let next = (start + 1usize).align_up(stripe);
                if next <= start {
                    break;
                }
                start = next;
            }
        }
        None
    }

    /// Carve `[start, start+size)` out of free range `i`.
    fn take(&mut self, i: usize, start: Address, size: ByteSize) {
        let range = self.free[i];
        debug_assert!(range.base <= start && start + size <= range.limit);
        let before = AddressRange::new(range.base, start);
        let after = AddressRange::new(start + size, range.limit);
        match (before.size() > 0, after.size() > 0) {
            (false, false) => {
                self.free.remove(i);
            }
            (true, false) => self.free[i] = before,
            (false, true) => self.free[i] = after,
            (true, true) => {
                self.free[i] = before;
                self.free.insert(i + 1, after);
            }
        }
    }

    /// Return `[base, base+size)` to the free list, coalescing neighbours.
    pub fn free(&mut self, base: Address, size: ByteSize) {
        debug_assert!(self.contains(base));
        let limit = base + size;
        let i = self
            .free
            .iter()
            .position(|r| r.base >= limit)
            .unwrap_or(self.free.len());
        // Must not overlap the neighbours.
        debug_assert!(i == 0 || self.free[i - 1].limit <= base);
        self.free.insert(i, AddressRange::new(base, limit));
        // Coalesce with the following range, then the preceding one.
        if i + 1 < self.free.len() && self.free[i].limit == self.free[i + 1].base {
            self.free[i] = AddressRange::new(self.free[i].base, self.free[i + 1].limit);
            self.free.remove(i + 1);
        }
        if i > 0 && self.free[i - 1].limit == self.free[i].base {
            self.free[i - 1] = AddressRange::new(self.free[i - 1].base, self.free[i].limit);
            self.free.remove(i);
        }
    }
}
