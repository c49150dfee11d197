//! Location dependencies.
//!
//! A location dependency lets the client use the current address of a
//! movable object (say, as a hash key) and later ask whether that use might
//! have been invalidated by a move. The arena keeps an epoch counter,
//! aged at each flip with the refset of zones that collection may move,
//! plus a bounded history so arbitrarily old dependencies still answer
//! correctly (conservatively) without false negatives.

use atomic::{Atomic, Ordering};

use crate::util::address::Address;
use crate::util::constants::LD_HISTORY_LENGTH;
use crate::util::refset::RefSet;

/// Epoch state owned by the arena. `epoch` is read lock-free by
/// [`LocationDependency::is_stale`]; the history is only written under the
/// arena borrow during flip.
pub struct EpochHistory {
    epoch: Atomic<usize>,
    /// `history[e % LEN]` is the refset moved by the flip that began epoch
    /// `e + 1`, for the most recent LEN epochs.
    history: [RefSet; LD_HISTORY_LENGTH],
    /// Union of everything moved in epochs that have fallen off `history`.
    prehistory: RefSet,
}

impl EpochHistory {
    pub fn new() -> EpochHistory {
        EpochHistory {
            epoch: Atomic::new(0),
            history: [RefSet::EMPTY; LD_HISTORY_LENGTH],
            prehistory: RefSet::EMPTY,
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    /// Age the epoch with the refset of zones this collection may move.
    /// Called at flip.
    pub fn age(&mut self, may_move: RefSet) {
        let e = self.epoch.load(Ordering::Relaxed);
        if e >= LD_HISTORY_LENGTH {
            // The slot we are about to overwrite falls into prehistory.
            self.prehistory = self.prehistory.union(self.history[e % LD_HISTORY_LENGTH]);
        }
        self.history[e % LD_HISTORY_LENGTH] = may_move;
        self.epoch.store(e + 1, Ordering::Release);
    }

    /// Union of refsets moved since `since`.
    fn moved_since(&self, since: usize) -> RefSet {
        let now = self.epoch.load(Ordering::Acquire);
        debug_assert!(since <= now);
        if since == now {
            return RefSet::EMPTY;
        }
        if now - since > LD_HISTORY_LENGTH {
            // Too old for the history window; answer conservatively.
            let mut rs = self.prehistory;
            for h in &self.history {
                rs = rs.union(*h);
            }
            return rs;
        }
        let mut rs = RefSet::EMPTY;
        for e in since..now {
            rs = rs.union(self.history[e % LD_HISTORY_LENGTH]);
        }
        rs
    }
}

impl Default for EpochHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// A client-held dependency on the locations of some set of objects.
#[derive(Copy, Clone, Debug)]
pub struct LocationDependency {
    epoch: usize,
    rs: RefSet,
}

impl LocationDependency {
    /// A fresh dependency, depending on nothing.
    pub fn reset(history: &EpochHistory) -> LocationDependency {
        LocationDependency {
            epoch: history.epoch(),
            rs: RefSet::EMPTY,
        }
    }

    /// Depend on the current location of `addr`.
    pub fn add(&mut self, history: &EpochHistory, addr: Address, zone_shift: usize) {
        // Adding re-bases a dependency that currently depends on nothing.
        if self.rs.is_empty() {
            self.epoch = history.epoch();
        }
        self.rs = self.rs.add(addr, zone_shift);
    }

    /// Merge another dependency into this one.
    pub fn merge(&mut self, other: &LocationDependency) {
        self.epoch = self.epoch.min(other.epoch);
        self.rs = self.rs.union(other.rs);
    }

    /// Could any object this dependency covers have moved since it was
    /// recorded? False means definitely not.
    pub fn is_stale(&self, history: &EpochHistory) -> bool {
        !history.moved_since(self.epoch).inter(self.rs).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHIFT: usize = 16;

    fn addr(zone: usize) -> Address {
        Address::from_usize(zone << SHIFT)
    }

    #[test]
    fn fresh_dependency_is_not_stale() {
        let h = EpochHistory::new();
        let ld = LocationDependency::reset(&h);
        assert!(!ld.is_stale(&h));
    }

    #[test]
    fn staleness_tracks_zones() {
        let mut h = EpochHistory::new();
        let mut ld = LocationDependency::reset(&h);
        ld.add(&h, addr(3), SHIFT);
        // A flip that moves a different zone does not invalidate.
        h.age(RefSet::of_addr(addr(9), SHIFT));
        assert!(!ld.is_stale(&h));
        // A flip that moves zone 3 does.
        h.age(RefSet::of_addr(addr(3), SHIFT));
        assert!(ld.is_stale(&h));
    }

    #[test]
    fn old_dependencies_answer_conservatively() {
        let mut h = EpochHistory::new();
        let mut ld = LocationDependency::reset(&h);
        ld.add(&h, addr(3), SHIFT);
        for _ in 0..(LD_HISTORY_LENGTH * 2 + 1) {
            h.age(RefSet::of_addr(addr(3), SHIFT));
        }
        assert!(ld.is_stale(&h));
    }

    #[test]
    fn merge_takes_oldest_epoch() {
        let mut h = EpochHistory::new();
        let mut a = LocationDependency::reset(&h);
        a.add(&h, addr(1), SHIFT);
        h.age(RefSet::of_addr(addr(2), SHIFT));
        let mut b = LocationDependency::reset(&h);
        b.add(&h, addr(2), SHIFT);
        b.merge(&a);
        // b now depends on zone 2 as of the older epoch; the aged move of
        // zone 2 makes it stale.
        assert!(b.is_stale(&h));
    }
}
