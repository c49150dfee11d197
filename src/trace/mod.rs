//! Traces: collection cycles and their state machine.
//!
//! One trace is one collection. A trace is created, condemns a refset,
//! flips (scanning roots and raising barriers), is incrementally advanced
//! by the poll driver until no grey segments remain, reclaims its white
//! segments, and is destroyed.

pub mod scan;

use bitflags::bitflags;
use enum_map::{Enum, EnumMap};

use crate::arena::Arena;
use crate::message::Message;
use crate::policy::{amc, PoolAttr, PoolData};
use crate::res::{Res, Result};
use crate::root::{root_scan, Root};
use crate::seg::SegId;
use crate::shield::AccessSet;
use crate::trace::scan::{ScanState, ScanStats};
use crate::util::address::{Address, ByteSize};
use crate::util::constants::{POLL_QUANTUM, TRACE_MAX};
use crate::util::refset::RefSet;

/// Reference ranks, in scanning order. Rank of a reference bounds how it
/// may be treated: ambiguous references pin, exact references keep alive,
/// weak references are splatted when their target dies.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Enum)]
pub enum Rank {
    Ambig,
    Exact,
    Final,
    Weak,
}

bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
    pub struct RankSet: u8 {
        const AMBIG = 1 << 0;
        const EXACT = 1 << 1;
        const FINAL = 1 << 2;
        const WEAK = 1 << 3;
    }
}

impl RankSet {
    pub fn of(rank: Rank) -> RankSet {
        match rank {
            Rank::Ambig => RankSet::AMBIG,
            Rank::Exact => RankSet::EXACT,
            Rank::Final => RankSet::FINAL,
            Rank::Weak => RankSet::WEAK,
        }
    }

    /// The lowest rank in the set, which is the rank the content must be
    /// scanned at.
    pub fn min_rank(self) -> Option<Rank> {
        for rank in [Rank::Ambig, Rank::Exact, Rank::Final, Rank::Weak] {
            if self.contains(RankSet::of(rank)) {
                return Some(rank);
            }
        }
        None
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TraceId(pub(crate) usize);

impl TraceId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A set of trace ids, one bit each.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub struct TraceSet(u32);

impl TraceSet {
    pub const EMPTY: TraceSet = TraceSet(0);

    pub fn single(ti: TraceId) -> TraceSet {
        TraceSet(1 << ti.0)
    }

    pub fn add(self, ti: TraceId) -> TraceSet {
        TraceSet(self.0 | (1 << ti.0))
    }

    pub fn del(self, ti: TraceId) -> TraceSet {
        TraceSet(self.0 & !(1 << ti.0))
    }

    pub fn contains(self, ti: TraceId) -> bool {
        self.0 & (1 << ti.0) != 0
    }

    pub fn union(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 | other.0)
    }

    pub fn inter(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & other.0)
    }

    pub fn diff(self, other: TraceSet) -> TraceSet {
        TraceSet(self.0 & !other.0)
    }

    pub fn subset_of(self, other: TraceSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = TraceId> {
        (0..TRACE_MAX).filter(move |i| self.0 & (1 << i) != 0).map(TraceId)
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceState {
    Init,
    /// Condemned but not yet flipped. Transient: every trace currently
    /// flips at start. The state exists for a future read-barrier
    /// collector that runs grey-mutator phases.
    Unflipped,
    Flipped,
    Reclaim,
    Finished,
}

/// Scan accounting is kept per phase.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Enum)]
pub enum AccountingPhase {
    RootScan,
    SegScan,
    SingleScan,
}

#[derive(Copy, Clone, Default)]
pub struct PhaseStats {
    pub scan_count: usize,
    pub scanned_size: ByteSize,
    pub copied_size: ByteSize,
}

#[derive(Default)]
pub struct TraceStats {
    pub phase: EnumMap<AccountingPhase, PhaseStats>,
    pub fix_ref_count: usize,
    pub seg_ref_count: usize,
    pub white_seg_ref_count: usize,
    pub nail_count: usize,
    pub snap_count: usize,
    pub forward_count: usize,
    /// Bytes preserved by copying, per this trace.
    pub forwarded_size: ByteSize,
    pub preserved_in_place_count: usize,
    pub preserved_in_place_size: ByteSize,
    pub reclaim_count: usize,
    pub reclaim_size: ByteSize,
    pub fault_count: usize,
}

pub struct Trace {
    pub ti: TraceId,
    pub state: TraceState,
    /// Approximation of the condemned set.
    pub white: RefSet,
    /// Subset of `white` that may move.
    pub may_move: RefSet,
    pub emergency: bool,
    pub condemned: ByteSize,
    pub not_condemned: ByteSize,
    /// Bytes of grey material at start.
    pub foundation: ByteSize,
    /// Bytes of segment scanning per poll.
    pub rate: ByteSize,
    pub why: &'static str,
    pub stats: TraceStats,
}

impl Trace {
    fn new(ti: TraceId, why: &'static str) -> Trace {
        Trace {
            ti,
            state: TraceState::Init,
            white: RefSet::EMPTY,
            may_move: RefSet::EMPTY,
            emergency: false,
            condemned: 0,
            not_condemned: 0,
            foundation: 0,
            rate: 0,
            why,
            stats: TraceStats::default(),
        }
    }

    /// The measure of work done: only segment scanning is regulated.
    fn work_clock(&self) -> ByteSize {
        self.stats.phase[AccountingPhase::SegScan].scanned_size
    }
}

impl Arena {
    pub(crate) fn trace(&self, ti: TraceId) -> &Trace {
        self.traces[ti.0].as_ref().expect("no such trace")
    }

    pub(crate) fn trace_mut(&mut self, ti: TraceId) -> &mut Trace {
        self.traces[ti.0].as_mut().expect("no such trace")
    }

    /// Union of the white sets of `ts`.
    pub(crate) fn white_union(&self, ts: TraceSet) -> RefSet {
        let mut white = RefSet::EMPTY;
        for ti in ts.iter() {
            white = white.union(self.trace(ti).white);
        }
        white
    }

    /// Allocate a trace slot. The mutator is suspended from here until the
    /// flip completes, so condemnation sees a quiescent heap.
    pub(crate) fn trace_create(&mut self, why: &'static str) -> Result<TraceId> {
        for i in 0..TRACE_MAX {
            let ti = TraceId(i);
            if !self.busy_traces.contains(ti) {
                debug_assert!(self.traces[i].is_none());
                self.traces[i] = Some(Trace::new(ti, why));
                self.busy_traces = self.busy_traces.add(ti);
                self.shield_suspend();
                debug!("trace {:?} created ({})", ti, why);
                return Ok(ti);
            }
        }
        Err(Res::Limit)
    }

    pub(crate) fn trace_destroy(&mut self, ti: TraceId) {
        debug_assert_eq!(self.trace(ti).state, TraceState::Finished);
        let (live, condemned, not_condemned, reclaimed) = {
            let trace = self.trace(ti);
            (
                trace.stats.forwarded_size + trace.stats.preserved_in_place_size,
                trace.condemned,
                trace.not_condemned,
                trace.stats.reclaim_size,
            )
        };
        debug!(
            "trace {:?} finished: condemned {} live {} reclaimed {}",
            ti, condemned, live, reclaimed
        );
        self.messages.post(Message::GcEnd {
            live,
            condemned,
            not_condemned,
        });
        for chain in self.chains.handles() {
            for gen in &mut self.chains[chain].gens {
                gen.end_trace(ti);
            }
        }
        self.busy_traces = self.busy_traces.del(ti);
        self.flipped_traces = self.flipped_traces.del(ti);
        self.traces[ti.0] = None;
        // A trace abandoned before its flip leaves the mutator suspended.
        if self.busy_traces.is_empty() {
            self.shield_resume();
        }
    }

    /// Add a segment to the white set of a trace, giving the pool the
    /// opportunity to refuse.
    pub(crate) fn trace_add_white(&mut self, ti: TraceId, seg: SegId) -> Result<()> {
        debug_assert!(!self.segs[seg].white.contains(ti));
        let pool = self.segs[seg].pool;
        let attrs = self.pools[pool].attrs();
        debug_assert!(attrs.contains(PoolAttr::GC));
        debug_assert!(matches!(self.pools[pool].data, PoolData::Amc(_)));
        amc::seg_whiten(self, ti, seg)?;
        if self.segs[seg].white.contains(ti) {
            let rs = self.refset_of_seg(seg);
            let moving = attrs.contains(PoolAttr::MOVING_GC);
            let trace = self.trace_mut(ti);
            trace.white = trace.white.union(rs);
            if moving {
                trace.may_move = trace.may_move.union(rs);
            }
        }
        Ok(())
    }

    /// Condemn every GC segment whose zones fall entirely within
    /// `condemned_set`.
    pub(crate) fn trace_condemn_refset(
        &mut self,
        ti: TraceId,
        condemned_set: RefSet,
    ) -> Result<()> {
        debug_assert_eq!(self.trace(ti).state, TraceState::Init);
        debug_assert_eq!(self.trace(ti).white, RefSet::EMPTY);
        debug_assert!(!condemned_set.is_empty());
        for seg in self.segs.handles() {
            debug_assert!(!self.segs[seg].grey.contains(ti));
            debug_assert!(!self.segs[seg].white.contains(ti));
            let pool = self.segs[seg].pool;
            if self.pools[pool].attrs().contains(PoolAttr::GC)
                && condemned_set.superset_of(self.refset_of_seg(seg))
            {
                self.trace_add_white(ti, seg)?;
            }
        }
        debug_assert!(condemned_set.superset_of(self.trace(ti).white));
        Ok(())
    }

    /// Condemn and start collecting. `mortality` is the expected dead
    /// fraction of the condemned set; `finishing_size` is how many further
    /// bytes of allocation the trace should finish within.
    pub(crate) fn trace_start(&mut self, ti: TraceId, mortality: f64, finishing_size: ByteSize) {
        debug_assert_eq!(self.trace(ti).state, TraceState::Init);
        debug_assert!((0.0..=1.0).contains(&mortality));

        // From the white set, derive the grey foundation: anything that
        // might refer into the white set must be scanned.
        let white = self.trace(ti).white;
        let mut foundation = 0;
        for seg in self.segs.handles() {
            let s = &self.segs[seg];
            debug_assert!(!s.grey.contains(ti));
            if !s.rank_set.is_empty()
                && !s.white.contains(ti)
                && !s.summary.inter(white).is_empty()
            {
                debug_assert!(self.pools[s.pool].attrs().contains(PoolAttr::SCAN));
                let grey = s.grey.add(ti);
                foundation += s.size();
                self.seg_set_grey(seg, grey);
            }
        }

        let trace = self.trace_mut(ti);
        trace.foundation = foundation;
        let survivors = (trace.condemned as f64 * (1.0 - mortality)) as ByteSize;
        let polls = (finishing_size / POLL_QUANTUM).max(1);
        trace.rate = (trace.foundation + survivors) / polls + 1;
        trace.state = TraceState::Unflipped;
        let why = trace.why;
        self.traces_not_condemned_update(ti);

        self.messages.post(Message::GcBegin { why });
        info!(
            "collection started ({}): condemned {} foundation {} rate {}",
            why,
            self.trace(ti).condemned,
            foundation,
            self.trace(ti).rate
        );

        // All traces currently flip at start.
        self.trace_flip(ti);
    }

    fn traces_not_condemned_update(&mut self, ti: TraceId) {
        let in_use = self.committed().saturating_sub(self.spare_committed());
        let trace = self.trace_mut(ti);
        trace.not_condemned = in_use.saturating_sub(trace.condemned);
    }

    /// Blacken the mutator: trap buffers, age location dependencies, scan
    /// all roots, and raise read barriers on grey segments.
    pub(crate) fn trace_flip(&mut self, ti: TraceId) {
        self.shield_suspend();
        debug_assert_eq!(self.trace(ti).state, TraceState::Unflipped);
        debug_assert!(!self.flipped_traces.contains(ti));

        self.buffer_flip_all();

        // mayMove conservatively approximates the refset of references
        // that may move during this collection.
        let may_move = self.trace(ti).may_move;
        if !may_move.is_empty() {
            self.epochs.age(may_move);
        }

        // All roots must be scanned now: there is no mechanism for
        // shielding them, so they cannot be left grey.
        let ts = TraceSet::single(ti);
        for rank in [Rank::Ambig, Rank::Exact] {
            let roots: Vec<Root> = self
                .roots
                .iter()
                .map(|(_, r)| *r)
                .filter(|r| r.rank == rank)
                .collect();
            for root in roots {
                self.trace_scan_root_recover(ts, rank, root);
            }
        }

        // The mutator is now black: it must not obtain white pointers by
        // reading grey segments, so those become read-protected.
        for seg in self.segs.handles() {
            let s = &self.segs[seg];
            if s.grey.contains(ti)
                && s.grey.inter(self.flipped_traces).is_empty()
                && !s.sm.contains(AccessSet::READ)
            {
                self.shield_raise(seg, AccessSet::READ);
            }
        }

        self.trace_mut(ti).state = TraceState::Flipped;
        self.flipped_traces = self.flipped_traces.add(ti);
        debug!("trace {:?} flipped", ti);

        self.shield_resume();
    }

    /// Scan one root, retrying in emergency mode on resource exhaustion.
    fn trace_scan_root_recover(&mut self, ts: TraceSet, rank: Rank, root: Root) {
        let mut retried = false;
        loop {
            let white = self.white_union(ts);
            let mut ss = ScanState::new(self, ts, rank, white);
            let res = root_scan(&mut ss, root);
            let stats = ss.stats;
            self.trace_update_counts(ts, AccountingPhase::RootScan, &stats);
            match res {
                Ok(()) => return,
                Err(e) => {
                    assert!(e.is_alloc_failure(), "root scan failed: {}", e);
                    assert!(!retried, "emergency root scan failed");
                    warn!("root scan hit {}; entering emergency mode", e);
                    for t in ts.iter() {
                        self.trace_mut(t).emergency = true;
                    }
                    retried = true;
                }
            }
        }
    }

    fn trace_update_counts(&mut self, ts: TraceSet, phase: AccountingPhase, stats: &ScanStats) {
        for ti in ts.iter() {
            let trace = self.trace_mut(ti);
            let p = &mut trace.stats.phase[phase];
            p.scan_count += 1;
            p.scanned_size += stats.scanned_size;
            p.copied_size += stats.copied_size;
            trace.stats.fix_ref_count += stats.fix_ref_count;
            trace.stats.seg_ref_count += stats.seg_ref_count;
            trace.stats.white_seg_ref_count += stats.white_seg_ref_count;
            trace.stats.nail_count += stats.nail_count;
            trace.stats.snap_count += stats.snap_count;
            trace.stats.forward_count += stats.forward_count;
        }
    }

    /// Scan a segment to remove its greyness for `ts`.
    pub(crate) fn trace_scan_seg(&mut self, ts: TraceSet, rank: Rank, seg: SegId) -> Result<()> {
        debug_assert!(!self.segs[seg].grey.inter(ts).is_empty());
        let white = self.white_union(ts);

        // Only scan the segment if it can refer to the white set;
        // otherwise it can be blackened outright.
        let old_summary = self.segs[seg].summary;
        if old_summary.inter(white).is_empty() {
            let grey = self.segs[seg].grey.diff(ts);
            self.seg_set_grey(seg, grey);
            return Ok(());
        }

        let mut ss = ScanState::new(self, ts, rank, white);
        ss.arena.shield_expose(seg);
        debug_assert!(matches!(
            ss.arena.pool(ss.arena.seg(seg).pool).data,
            PoolData::Amc(_)
        ));
        let res = amc::seg_scan(&mut ss, seg);
        ss.arena.shield_cover(seg);

        // Whether or not the scan was total, what was seen as unfixed must
        // already have been covered by the segment summary.
        debug_assert!(ss.unfixed_summary.subset_of(old_summary.union(ss.fixed_summary)));

        let summary = ss.summary();
        let stats = ss.stats;
        let total = match res {
            Ok(total) => total,
            Err(_) => false,
        };
        // A partial scan widens the summary; a total scan replaces it.
        let new_summary = if total {
            summary
        } else {
            old_summary.union(summary)
        };
        self.seg_set_summary(seg, new_summary);
        self.trace_update_counts(ts, AccountingPhase::SegScan, &stats);

        match res {
            Ok(_) => {
                // The segment is black for ts only on success.
                let grey = self.segs[seg].grey.diff(ts);
                self.seg_set_grey(seg, grey);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn trace_scan_seg_recover(&mut self, ts: TraceSet, rank: Rank, seg: SegId) {
        let mut retried = false;
        loop {
            match self.trace_scan_seg(ts, rank, seg) {
                Ok(()) => return,
                Err(e) => {
                    assert!(e.is_alloc_failure(), "segment scan failed: {}", e);
                    assert!(!retried, "emergency segment scan failed");
                    warn!("segment scan hit {}; entering emergency mode", e);
                    for t in ts.iter() {
                        self.trace_mut(t).emergency = true;
                    }
                    retried = true;
                }
            }
        }
    }

    /// Scan a single reference slot under the barrier.
    pub fn trace_scan_single_ref(
        &mut self,
        ts: TraceSet,
        rank: Rank,
        seg: SegId,
        ref_io: &mut Address,
    ) -> Result<()> {
        let white = self.white_union(ts);
        if self.segs[seg].summary.inter(white).is_empty() {
            return Ok(());
        }
        self.shield_expose(seg);
        let mut ss = ScanState::new(self, ts, rank, white);
        let res = ss.fix(ref_io);
        let mut stats = ss.stats;
        stats.scanned_size = std::mem::size_of::<Address>();
        let fixed = *ref_io;
        let zone_shift = self.zone_shift();
        let summary = self.segs[seg].summary.add(fixed, zone_shift);
        self.seg_set_summary(seg, summary);
        self.shield_cover(seg);
        self.trace_update_counts(ts, AccountingPhase::SingleScan, &stats);
        res
    }

    /// Find a segment grey for `ti`, lowest scan rank first.
    fn trace_find_grey(&self, ti: TraceId) -> Option<(SegId, Rank)> {
        let mut found: Option<(SegId, Rank)> = None;
        for (seg, s) in self.segs.iter() {
            if !s.grey.contains(ti) {
                continue;
            }
            let rank = s.rank_set.min_rank().expect("grey leaf segment");
            match found {
                Some((_, best)) if best <= rank => {}
                _ => found = Some((seg, rank)),
            }
        }
        found
    }

    fn trace_run(&mut self, ti: TraceId) -> Result<()> {
        debug_assert_eq!(self.trace(ti).state, TraceState::Flipped);
        if let Some((seg, rank)) = self.trace_find_grey(ti) {
            self.trace_scan_seg(TraceSet::single(ti), rank, seg)
        } else {
            self.trace_mut(ti).state = TraceState::Reclaim;
            Ok(())
        }
    }

    fn trace_reclaim(&mut self, ti: TraceId) {
        debug_assert_eq!(self.trace(ti).state, TraceState::Reclaim);
        for seg in self.segs.handles() {
            if self.segs.get(seg).is_none() {
                continue;
            }
            debug_assert!(!self.segs[seg].grey.contains(ti));
            if self.segs[seg].white.contains(ti) {
                debug_assert!(self.pools[self.segs[seg].pool]
                    .attrs()
                    .contains(PoolAttr::GC));
                self.trace_mut(ti).stats.reclaim_count += 1;
                debug_assert!(matches!(
                    self.pools[self.segs[seg].pool].data,
                    PoolData::Amc(_)
                ));
                amc::seg_reclaim(self, ti, seg);
                // If the segment survived reclaim it is no longer white.
                debug_assert!(self
                    .segs
                    .get(seg)
                    .map_or(true, |s| !s.white.contains(ti)));
            }
        }
        self.trace_mut(ti).state = TraceState::Finished;
    }

    /// Progress the trace by one step.
    pub(crate) fn trace_step(&mut self, ti: TraceId) -> Result<()> {
        match self.trace(ti).state {
            TraceState::Flipped => self.trace_run(ti),
            TraceState::Reclaim => {
                self.trace_reclaim(ti);
                Ok(())
            }
            state => unreachable!("trace stepped in state {:?}", state),
        }
    }

    /// Progress the trace by its rate quantum, expediting in emergency mode
    /// if scanning runs out of resources.
    pub(crate) fn trace_poll(&mut self, ti: TraceId) {
        let poll_end = self.trace(ti).work_clock() + self.trace(ti).rate;
        loop {
            if let Err(e) = self.trace_step(ti) {
                assert!(e.is_alloc_failure(), "trace step failed: {}", e);
                warn!("collection hit {}; expediting in emergency mode", e);
                self.trace_expedite(ti);
                return;
            }
            let trace = self.trace(ti);
            if trace.state == TraceState::Finished || trace.work_clock() >= poll_end {
                return;
            }
        }
    }

    /// Drive the trace to completion in emergency mode: all further fixes
    /// pin instead of forwarding, so no step can fail.
    pub(crate) fn trace_expedite(&mut self, ti: TraceId) {
        self.trace_mut(ti).emergency = true;
        while self.trace(ti).state != TraceState::Finished {
            self.trace_step(ti)
                .expect("emergency trace step cannot fail");
        }
    }

    /// The barrier entry point: the mutator faulted on `addr` with the
    /// access kinds in `mode`. The embedding's fault handler calls this and
    /// then resumes the faulting thread.
    pub fn access(&mut self, addr: Address, mode: AccessSet) {
        let seg = self
            .seg_of_addr(addr)
            .expect("barrier fault outside the arena");

        // A read fault can only happen on a segment grey for a flipped
        // trace; a write fault only while the summary is tighter than the
        // mutator's (universal) summary.
        debug_assert!(
            (mode & self.segs[seg].sm & AccessSet::READ).is_empty()
                || !self.segs[seg].grey.inter(self.flipped_traces).is_empty()
        );
        debug_assert!(
            (mode & self.segs[seg].sm & AccessSet::WRITE).is_empty()
                || self.segs[seg].summary != RefSet::UNIV
        );

        if !(mode & self.segs[seg].sm & AccessSet::READ).is_empty() {
            let traces = self.flipped_traces;
            // Scanning at Exact is conservative; the trace's current phase
            // rank would be tighter.
            self.trace_scan_seg_recover(traces, Rank::Exact, seg);
            debug_assert!(self.segs[seg].grey.inter(traces).is_empty());
            for ti in traces.iter() {
                self.trace_mut(ti).stats.fault_count += 1;
            }
        }

        // Write-barrier handling must follow: the scan above may have
        // tightened the summary and raised the write barrier.
        if !(mode & self.segs[seg].sm & AccessSet::WRITE).is_empty() {
            self.seg_set_summary(seg, RefSet::UNIV);
        }

        debug_assert!((mode & self.segs[seg].sm).is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::amc::AmcOptions;
    use crate::util::heap::vmem::MockVmem;
    use crate::util::options::{ArenaOptions, GenParams};
    use crate::util::test_format::{alloc_obj, set_slot, TestFormat};

    #[test]
    fn trace_set_algebra() {
        let a = TraceId(0);
        let ts = TraceSet::single(a);
        assert!(ts.contains(a));
        assert!(ts.subset_of(ts));
        assert!(TraceSet::EMPTY.subset_of(ts));
        assert!(ts.del(a).is_empty());
        assert_eq!(ts.iter().count(), 1);
    }

    #[test]
    fn rank_set_min_rank() {
        assert_eq!(RankSet::EXACT.min_rank(), Some(Rank::Exact));
        assert_eq!(
            (RankSet::AMBIG | RankSet::WEAK).min_rank(),
            Some(Rank::Ambig)
        );
        assert_eq!(RankSet::empty().min_rank(), None);
        assert!(Rank::Ambig < Rank::Exact);
    }

    fn test_arena() -> Arena {
        let options = ArenaOptions {
            reservation: 128 << 20,
            spare_commit_limit: 0,
            ..ArenaOptions::default()
        };
        Arena::with_vmem(Box::new(MockVmem::new()), options).unwrap()
    }

    /// After the flip, a segment grey for the flipped trace is
    /// read-protected; a barrier access scans it, blackening it and
    /// standing the barrier down.
    #[test]
    fn read_barrier_protocol() {
        let mut arena = test_arena();
        let chain = arena
            .chain_create(&[GenParams {
                capacity: 1 << 20,
                mortality: 0.9,
            }])
            .unwrap();
        let fmt = arena.format_create(TestFormat).unwrap();
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

        let table: &'static mut [Address] =
            Box::leak(vec![Address::ZERO; 1].into_boxed_slice());
        let a = alloc_obj(&mut arena, ap, 2);
        let b = alloc_obj(&mut arena, ap, 1);
        set_slot(a, 0, b);
        table[0] = a;
        arena
            .root_create_table(Address::from_ptr(table.as_mut_ptr()), 1)
            .unwrap();

        arena.start_collect("barrier test").unwrap();

        // The flip forwarded A (it is a root) into to-space, which is now
        // grey for the flipped trace and therefore read-protected.
        let ti = arena.busy_traces.iter().next().unwrap();
        assert_eq!(arena.trace(ti).state, TraceState::Flipped);
        let grey: Vec<SegId> = arena
            .segs
            .handles()
            .into_iter()
            .filter(|&s| !arena.segs[s].grey.is_empty())
            .collect();
        assert!(!grey.is_empty(), "to-space should be grey after the flip");
        for &seg in &grey {
            assert!(
                arena.segs[seg].sm.contains(AccessSet::READ),
                "grey segments must be read-protected after the flip"
            );
        }

        // The mutator faults on one of them; the barrier scan blackens it.
        let fault_at = arena.segs[grey[0]].base;
        arena.access(fault_at, AccessSet::READ);
        assert!(arena.segs[grey[0]].grey.is_empty());
        assert!(!arena.segs[grey[0]].sm.contains(AccessSet::READ));
        assert_eq!(arena.trace(ti).stats.fault_count, 1);

        arena.park();
        // Everything is consistent after the cycle.
        let a2 = table[0];
        assert_ne!(a2, a);
        assert!(!arena.busy_traces.iter().any(|_| true));
    }

    /// A write-barrier fault widens the summary to universal and stands
    /// the write barrier down.
    #[test]
    fn write_barrier_widens_summary() {
        let mut arena = test_arena();
        let fmt = arena.format_create(TestFormat).unwrap();
        let pool = arena.pool_create_amc(fmt, AmcOptions::default()).unwrap();
        let ap = arena.ap_create(pool, false).unwrap();
        let table: &'static mut [Address] =
            Box::leak(vec![Address::ZERO; 1].into_boxed_slice());
        table[0] = alloc_obj(&mut arena, ap, 2);
        arena
            .root_create_table(Address::from_ptr(table.as_mut_ptr()), 1)
            .unwrap();

        arena.collect("tighten summaries").unwrap();

        // The survivor's segment was scanned totally, so its summary is
        // tight and its write barrier is up.
        let seg = arena.seg_of_addr(table[0]).unwrap();
        assert_ne!(arena.segs[seg].summary, crate::util::refset::RefSet::UNIV);
        assert!(arena.segs[seg].sm.contains(AccessSet::WRITE));

        arena.access(table[0], AccessSet::WRITE);
        assert_eq!(arena.segs[seg].summary, crate::util::refset::RefSet::UNIV);
        assert!(!arena.segs[seg].sm.contains(AccessSet::WRITE));
    }
}
