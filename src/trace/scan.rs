//! Scan states and the fix protocol entry points.
//!
//! A scan state is the cursor for one scan: the traces being worked for,
//! the rank of the references being scanned, the union of those traces'
//! white sets, and the two accumulated summaries. `unfixed` summarizes
//! every reference seen as scanned; `fixed` summarizes references after
//! fixing. The post-scan summary of the scanned material is
//! `fixed ∪ (unfixed − white)`: white references are guaranteed to have
//! been presented to fix, so the summary reflects their post-images.

use std::sync::Arc;

use crate::arena::Arena;
use crate::format::ObjectFormat;
use crate::policy::{amc, PoolData};
use crate::res::Result;
use crate::trace::{Rank, TraceSet};
use crate::util::address::{Address, ByteSize, Word};
use crate::util::refset::RefSet;

#[derive(Copy, Clone, Default)]
pub struct ScanStats {
    pub fix_ref_count: usize,
    pub seg_ref_count: usize,
    pub white_seg_ref_count: usize,
    pub nail_count: usize,
    pub snap_count: usize,
    pub forward_count: usize,
    pub copied_size: ByteSize,
    pub scanned_size: ByteSize,
}

pub struct ScanState<'a> {
    pub arena: &'a mut Arena,
    pub traces: TraceSet,
    pub rank: Rank,
    pub zone_shift: usize,
    /// Union of the white sets of `traces`.
    pub white: RefSet,
    pub unfixed_summary: RefSet,
    pub fixed_summary: RefSet,
    /// When set, fix pins instead of forwarding.
    pub emergency: bool,
    /// Cleared by fix when it moves an object that had not been reached
    /// before; consulted by weak-reference splatting policies.
    pub was_marked: bool,
    pub stats: ScanStats,
}

impl<'a> ScanState<'a> {
    pub fn new(arena: &'a mut Arena, traces: TraceSet, rank: Rank, white: RefSet) -> ScanState<'a> {
        let emergency = traces.iter().any(|ti| arena.trace(ti).emergency);
        let zone_shift = arena.zone_shift();
        ScanState {
            arena,
            traces,
            rank,
            zone_shift,
            white,
            unfixed_summary: RefSet::EMPTY,
            fixed_summary: RefSet::EMPTY,
            emergency,
            was_marked: true,
            stats: ScanStats::default(),
        }
    }

    /// The summary of the scanned material after fixing.
    pub fn summary(&self) -> RefSet {
        self.fixed_summary
            .union(self.unfixed_summary.diff(self.white))
    }

    /// Force the summary to `summary`, discarding the unfixed
    /// accumulation. Needed after a multi-pass nailed scan, where fixed
    /// references were re-seen as input and the unfixed summary is no
    /// longer purely unfixed.
    pub fn set_summary(&mut self, summary: RefSet) {
        self.unfixed_summary = RefSet::EMPTY;
        self.fixed_summary = summary;
        debug_assert_eq!(self.summary(), summary);
    }

    /// Fix one reference slot. Every scanned reference must pass through
    /// here; references outside the white zones are only summarized.
    pub fn fix(&mut self, ref_io: &mut Address) -> Result<()> {
        let r = *ref_io;
        self.unfixed_summary = self.unfixed_summary.add(r, self.zone_shift);
        if !self.white.contains(r, self.zone_shift) {
            return Ok(());
        }
        if self.emergency {
            self.fix_emergency(ref_io);
            Ok(())
        } else {
            self.fix_normal(ref_io)
        }
    }

    fn fix_normal(&mut self, ref_io: &mut Address) -> Result<()> {
        self.stats.fix_ref_count += 1;
        let r = *ref_io;
        if let Some(seg) = self.arena.seg_of_addr(r) {
            self.stats.seg_ref_count += 1;
            if !self.arena.seg(seg).white.inter(self.traces).is_empty() {
                self.stats.white_seg_ref_count += 1;
                let pool = self.arena.seg(seg).pool;
                debug_assert!(matches!(self.arena.pool(pool).data, PoolData::Amc(_)));
                amc::seg_fix(self, seg, ref_io)?;
            }
        } else {
            // Only an ambiguous reference may point outside the managed
            // heap and still look like it points into the reservation.
            debug_assert!(
                self.rank < Rank::Exact || !self.arena.is_reserved(r),
                "exact reference to unmanaged address {:?}",
                r
            );
        }
        self.fixed_summary = self.fixed_summary.add(*ref_io, self.zone_shift);
        Ok(())
    }

    /// The emergency fix: forwarding space is exhausted, so preserve by
    /// pinning. Cannot fail.
    fn fix_emergency(&mut self, ref_io: &mut Address) {
        self.stats.fix_ref_count += 1;
        let r = *ref_io;
        if let Some(seg) = self.arena.seg_of_addr(r) {
            self.stats.seg_ref_count += 1;
            if !self.arena.seg(seg).white.inter(self.traces).is_empty() {
                self.stats.white_seg_ref_count += 1;
                let pool = self.arena.seg(seg).pool;
                debug_assert!(matches!(self.arena.pool(pool).data, PoolData::Amc(_)));
                amc::seg_fix_emergency(self, seg, ref_io);
            }
        } else {
            debug_assert!(
                self.rank < Rank::Exact || !self.arena.is_reserved(r),
                "exact reference to unmanaged address {:?}",
                r
            );
        }
        self.fixed_summary = self.fixed_summary.add(*ref_io, self.zone_shift);
    }

    /// Scan a contiguous area of exact references.
    pub fn scan_area(&mut self, base: Address, limit: Address) -> Result<()> {
        debug_assert!(base <= limit);
        let mut p = base;
        while p < limit {
            let mut r: Address = unsafe { p.load() };
            let old = r;
            self.fix(&mut r)?;
            if r != old {
                unsafe { p.store(r) };
            }
            p += std::mem::size_of::<Address>();
        }
        self.stats.scanned_size += limit - base;
        Ok(())
    }

    /// Scan a contiguous area of tagged words: a word is treated as a
    /// reference when `(word & mask) == pattern`.
    pub fn scan_area_masked(
        &mut self,
        base: Address,
        limit: Address,
        mask: Word,
        pattern: Word,
    ) -> Result<()> {
        debug_assert!(base <= limit);
        let mut p = base;
        while p < limit {
            let word: Word = unsafe { p.load() };
            if word & mask == pattern {
                let mut r = Address::from_usize(word);
                let old = r;
                self.fix(&mut r)?;
                if r != old {
                    unsafe { p.store(r) };
                }
            }
            p += std::mem::size_of::<Word>();
        }
        self.stats.scanned_size += limit - base;
        Ok(())
    }

    /// Scan `[base, limit)` of formatted objects with `format`.
    pub fn scan_formatted(
        &mut self,
        format: &Arc<dyn ObjectFormat>,
        base: Address,
        limit: Address,
    ) -> Result<()> {
        trace!("scan_formatted [{:?}, {:?})", base, limit);
        let res = unsafe { format.scan(self, base, limit) };
        self.stats.scanned_size += limit - base;
        res
    }
}
