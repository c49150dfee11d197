//! Zone-set algebra.
//!
//! A [`RefSet`] is a word-sized bitset approximating a set of reference
//! targets. Bit `i` covers *zone* `i`, the partition of the address space
//! given by `(addr >> zone_shift) mod ZONE_COUNT`. The approximation is
//! sound: any reference stored in a range is covered by the union of the
//! range's whole zones. Zone summaries let the collector answer "could this
//! segment contain a reference into the white set?" in O(1), pruning scans.

use crate::util::address::{Address, Word};
use crate::util::constants::ZONE_COUNT;

#[derive(Copy, Clone, PartialEq, Eq, Default)]
pub struct RefSet(Word);

impl RefSet {
    pub const EMPTY: RefSet = RefSet(0);
    pub const UNIV: RefSet = RefSet(!0);

    pub const fn raw(self) -> Word {
        self.0
    }

    /// The set containing exactly the zone of `addr`.
    pub fn of_addr(addr: Address, zone_shift: usize) -> RefSet {
        RefSet(1 << addr.zone(zone_shift))
    }

    /// The union of the whole zones covering `[base, limit)`.
    pub fn of_range(base: Address, limit: Address, zone_shift: usize) -> RefSet {
        debug_assert!(base <= limit);
        if base == limit {
            return RefSet::EMPTY;
        }
        // A range spanning ZONE_COUNT zones or more covers them all.
        if (limit - base) >> zone_shift >= ZONE_COUNT {
            return RefSet::UNIV;
        }
        let first = base.zone(zone_shift);
        let last = (limit - 1usize).zone(zone_shift);
        if first <= last {
            let width = last - first + 1;
            if width == ZONE_COUNT {
                RefSet::UNIV
            } else {
                RefSet(((1 << width) - 1) << first)
            }
        } else {
            // The range wraps around the top zone.
            let high = !0 << first;
            let low = (1 << (last + 1)) - 1;
            RefSet(high | low)
        }
    }

    pub fn add(self, addr: Address, zone_shift: usize) -> RefSet {
        self.union(RefSet::of_addr(addr, zone_shift))
    }

    pub const fn union(self, other: RefSet) -> RefSet {
        RefSet(self.0 | other.0)
    }

    pub const fn inter(self, other: RefSet) -> RefSet {
        RefSet(self.0 & other.0)
    }

    pub const fn diff(self, other: RefSet) -> RefSet {
        RefSet(self.0 & !other.0)
    }

    /// Is `self` a subset of `other`?
    pub const fn subset_of(self, other: RefSet) -> bool {
        self.0 & !other.0 == 0
    }

    /// Is `self` a superset of `other`?
    pub const fn superset_of(self, other: RefSet) -> bool {
        other.0 & !self.0 == 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, addr: Address, zone_shift: usize) -> bool {
        !self.inter(RefSet::of_addr(addr, zone_shift)).is_empty()
    }

    pub const fn contains_zone(self, zone: usize) -> bool {
        self.0 & (1 << zone) != 0
    }

    pub const fn with_zone(self, zone: usize) -> RefSet {
        RefSet(self.0 | (1 << zone))
    }
}

impl std::fmt::Debug for RefSet {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "RefSet({:#x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIFT: usize = 16;

    fn addr(zone: usize, offset: usize) -> Address {
        Address::from_usize((zone << SHIFT) + offset)
    }

    #[test]
    fn algebra() {
        let a = RefSet::of_addr(addr(1, 0), SHIFT);
        let b = RefSet::of_addr(addr(5, 12), SHIFT);
        let ab = a.union(b);
        assert!(a.subset_of(ab));
        assert!(b.subset_of(ab));
        assert_eq!(ab.inter(a), a);
        assert_eq!(ab.diff(a), b);
        assert!(RefSet::EMPTY.subset_of(a));
        assert!(RefSet::UNIV.superset_of(ab));
    }

    #[test]
    fn range_covers_addrs_within() {
        let base = addr(2, 100);
        let limit = addr(4, 50);
        let rs = RefSet::of_range(base, limit, SHIFT);
        // Every address in the range is covered.
        assert!(rs.contains(base, SHIFT));
        assert!(rs.contains(addr(3, 0), SHIFT));
        assert!(rs.contains(limit - 1usize, SHIFT));
        // The limit itself is exclusive, and zone 4 is still covered
        // because the range reaches into it.
        assert!(rs.contains_zone(4));
        assert!(!rs.contains_zone(5));
        assert!(!rs.contains_zone(1));
    }

    #[test]
    fn range_wraps() {
        let base = addr(ZONE_COUNT - 2, 0);
        let limit = addr(ZONE_COUNT + 1, 0); // wraps into zone 0
        let rs = RefSet::of_range(base, limit, SHIFT);
        assert!(rs.contains_zone(ZONE_COUNT - 2));
        assert!(rs.contains_zone(ZONE_COUNT - 1));
        assert!(rs.contains_zone(0));
        assert!(!rs.contains_zone(1));
    }

    #[test]
    fn huge_range_is_univ() {
        let base = Address::from_usize(0);
        let limit = Address::from_usize(ZONE_COUNT << SHIFT);
        assert_eq!(RefSet::of_range(base, limit, SHIFT), RefSet::UNIV);
    }

    #[test]
    fn empty_range() {
        let a = addr(3, 3);
        assert_eq!(RefSet::of_range(a, a, SHIFT), RefSet::EMPTY);
    }
}
