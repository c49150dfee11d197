//! The shield: memory-protection barriers between the collector and the
//! mutator.
//!
//! Raising a shield mode on a segment forbids the mutator that kind of
//! access; the collector gains access by exposing the segment, which stands
//! the protection down while the segment is being operated on. Exposure
//! nests. Protection is delegated to the arena's [`VirtualMemory`]
//! implementation.
//!
//! [`VirtualMemory`]: crate::util::heap::vmem::VirtualMemory

use bitflags::bitflags;

use crate::arena::Arena;
use crate::seg::SegId;

bitflags! {
    /// Kinds of mutator access a shield can forbid.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct AccessSet: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl Arena {
    /// Forbid the mutator the accesses in `mode` on `seg`.
    pub(crate) fn shield_raise(&mut self, seg: SegId, mode: AccessSet) {
        let s = &mut self.segs[seg];
        debug_assert!(s.sm.intersection(mode).is_empty());
        s.sm |= mode;
        self.shield_sync(seg);
    }

    /// Stand down the accesses in `mode` on `seg`.
    pub(crate) fn shield_lower(&mut self, seg: SegId, mode: AccessSet) {
        let s = &mut self.segs[seg];
        debug_assert!(s.sm.contains(mode));
        s.sm &= !mode;
        self.shield_sync(seg);
    }

    /// Give the collector access to `seg`. Must be balanced by
    /// [`shield_cover`].
    ///
    /// [`shield_cover`]: Arena::shield_cover
    pub(crate) fn shield_expose(&mut self, seg: SegId) {
        let s = &mut self.segs[seg];
        s.depth += 1;
        if s.depth == 1 && !s.sm.is_empty() {
            let (base, size) = (s.base, s.size());
            self.vmem.protect(base, size, AccessSet::empty());
        }
    }

    /// End an exposure of `seg`, restoring its protection.
    pub(crate) fn shield_cover(&mut self, seg: SegId) {
        let s = &mut self.segs[seg];
        debug_assert!(s.depth > 0);
        s.depth -= 1;
        if s.depth == 0 {
            self.shield_sync(seg);
        }
    }

    /// Suspend the mutator threads. Idempotent.
    pub(crate) fn shield_suspend(&mut self) {
        if !self.suspended {
            self.vmem.suspend_threads();
            self.suspended = true;
        }
    }

    /// Resume the mutator threads.
    pub(crate) fn shield_resume(&mut self) {
        if self.suspended {
            self.vmem.resume_threads();
            self.suspended = false;
        }
    }

    fn shield_sync(&mut self, seg: SegId) {
        let s = &self.segs[seg];
        if s.depth == 0 {
            let (base, size, sm) = (s.base, s.size(), s.sm);
            self.vmem.protect(base, size, sm);
        }
    }

    /// Stand down every shield so a debugger or postmortem handler can walk
    /// the heap. The arena is not usable for allocation afterwards.
    pub fn postmortem(&mut self) {
        for seg in self.segs.handles() {
            let s = &mut self.segs[seg];
            s.sm = AccessSet::empty();
            s.depth = 0;
            let (base, size) = (s.base, s.size());
            self.vmem.protect(base, size, AccessSet::empty());
        }
    }
}
