//! The arena: root container for all managed memory and collector state.
//!
//! Every pool, segment, buffer, root, chain and trace lives in a slab owned
//! by the arena and is addressed by handle, so there are no ownership
//! cycles. All collector operations take `&mut Arena`: the single arena
//! lock that serializes the collector is the Rust borrow. A multi-threaded
//! embedding wraps the arena in its own mutex and its fault handler calls
//! [`Arena::access`].

use std::sync::Arc;

use crate::chain::{Chain, ChainId};
use crate::format::{FormatId, ObjectFormat};
use crate::message::{Message, MessageKind, MessageQueue};
use crate::policy::{Pool, PoolId};
use crate::res::{Res, Result};
use crate::root::Root;
use crate::seg::{AmcSegData, Seg, SegData, SegId};
use crate::shield::AccessSet;
use crate::trace::{Trace, TraceId, TraceSet, TraceState};
use crate::util::address::{Address, AddressRange, ByteSize};
use crate::util::constants::{BYTES_IN_PAGE, TRACE_MAX};
use crate::util::heap::layout::AddressSpace;
use crate::util::heap::vmem::{SysVmem, VirtualMemory};
use crate::util::ld::{EpochHistory, LocationDependency};
use crate::util::options::{ArenaOptions, GenParams};
use crate::util::refset::RefSet;
use crate::util::slab::Slab;

/// A set of (old, new) relocation pairs, applied by
/// [`Arena::transform_apply`].
pub struct Transform {
    pairs: Vec<(Address, Address)>,
}

impl Transform {
    pub fn add(&mut self, old: Address, new: Address) {
        self.pairs.push((old, new));
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

pub struct Arena {
    pub(crate) vmem: Box<dyn VirtualMemory>,
    pub(crate) layout: AddressSpace,
    pub(crate) options: ArenaOptions,
    pub(crate) zone_shift: usize,
    /// Committed bytes, including spare committed memory.
    pub(crate) committed: ByteSize,
    pub(crate) commit_limit: ByteSize,
    /// Committed-but-free ranges retained for reuse.
    pub(crate) spare: Vec<AddressRange>,
    pub(crate) spare_committed: ByteSize,

    pub(crate) segs: Slab<Seg>,
    /// Segment handles sorted by base address, for segment-of-address.
    pub(crate) seg_index: Vec<SegId>,
    pub(crate) pools: Slab<Pool>,
    pub(crate) buffers: Slab<crate::buffer::Buffer>,
    pub(crate) roots: Slab<Root>,
    pub(crate) chains: Slab<Chain>,
    pub(crate) default_chain: ChainId,
    pub(crate) formats: Slab<Arc<dyn ObjectFormat>>,

    pub(crate) traces: [Option<Trace>; TRACE_MAX],
    pub(crate) busy_traces: TraceSet,
    pub(crate) flipped_traces: TraceSet,

    pub(crate) epochs: EpochHistory,
    pub(crate) messages: MessageQueue,

    pub(crate) clamped: bool,
    pub(crate) inside_poll: bool,
    pub(crate) suspended: bool,
    pub(crate) threads_registered: usize,
    pub(crate) next_pref_zone: usize,
    pub(crate) pause_time: f64,
}

impl Arena {
    /// Create an arena backed by the OS virtual-memory implementation.
    pub fn new(options: ArenaOptions) -> Result<Arena> {
        Arena::with_vmem(Box::new(SysVmem::new()), options)
    }

    /// Create an arena on a caller-supplied virtual-memory implementation.
    pub fn with_vmem(mut vmem: Box<dyn VirtualMemory>, options: ArenaOptions) -> Result<Arena> {
        let zone_shift = options.effective_zone_shift();
        let base = vmem.reserve(options.reservation)?;
        let layout = AddressSpace::new(base, options.reservation, zone_shift);
        let mut chains = Slab::new();
        let mut next_pref_zone = 0;
        let default_chain = chains.insert(Chain::new(&options.default_chain, &mut next_pref_zone));
        info!(
            "arena created: reservation {:#x} at {:?}, zone shift {}",
            options.reservation, base, zone_shift
        );
        Ok(Arena {
            commit_limit: options.commit_limit,
            pause_time: options.pause_time,
            vmem,
            layout,
            zone_shift,
            committed: 0,
            spare: Vec::new(),
            spare_committed: 0,
            segs: Slab::new(),
            seg_index: Vec::new(),
            pools: Slab::new(),
            buffers: Slab::new(),
            roots: Slab::new(),
            chains,
            default_chain,
            formats: Slab::new(),
            traces: std::array::from_fn(|_| None),
            busy_traces: TraceSet::EMPTY,
            flipped_traces: TraceSet::EMPTY,
            epochs: EpochHistory::new(),
            messages: MessageQueue::new(),
            clamped: false,
            inside_poll: false,
            suspended: false,
            threads_registered: 0,
            next_pref_zone,
            options,
        })
    }

    pub(crate) fn seg(&self, seg: SegId) -> &Seg {
        &self.segs[seg]
    }

    pub(crate) fn pool(&self, pool: PoolId) -> &Pool {
        &self.pools[pool]
    }

    pub fn zone_shift(&self) -> usize {
        self.zone_shift
    }

    /// Committed bytes, including spare committed memory.
    pub fn committed(&self) -> ByteSize {
        self.committed
    }

    pub fn spare_committed(&self) -> ByteSize {
        self.spare_committed
    }

    pub fn commit_limit(&self) -> ByteSize {
        self.commit_limit
    }

    pub fn set_commit_limit(&mut self, limit: ByteSize) {
        self.commit_limit = limit;
    }

    pub fn spare_commit_limit(&self) -> ByteSize {
        self.options.spare_commit_limit
    }

    pub fn set_spare_commit_limit(&mut self, limit: ByteSize) {
        self.options.spare_commit_limit = limit;
        self.spare_shrink();
    }

    pub fn pause_time(&self) -> f64 {
        self.pause_time
    }

    pub fn set_pause_time(&mut self, pause_time: f64) {
        self.pause_time = pause_time;
    }

    /// Is `addr` within the arena's reservation?
    pub(crate) fn is_reserved(&self, addr: Address) -> bool {
        self.layout.contains(addr)
    }

    /// The zones covered by a segment.
    pub(crate) fn refset_of_seg(&self, seg: SegId) -> RefSet {
        let s = &self.segs[seg];
        RefSet::of_range(s.base, s.limit, self.zone_shift)
    }

    /// Constant-time-ish segment lookup by address.
    pub fn seg_of_addr(&self, addr: Address) -> Option<SegId> {
        let pos = self
            .seg_index
            .partition_point(|&id| self.segs[id].base <= addr);
        if pos == 0 {
            return None;
        }
        let seg = self.seg_index[pos - 1];
        if self.segs[seg].contains(addr) {
            Some(seg)
        } else {
            None
        }
    }

    /// Allocate and commit a segment for `pool`, preferring the zones in
    /// `pref`.
    pub(crate) fn seg_alloc(
        &mut self,
        pool: PoolId,
        size: ByteSize,
        pref: RefSet,
        gen: usize,
    ) -> Result<SegId> {
        debug_assert!(size > 0 && size % BYTES_IN_PAGE == 0);
        let base = if let Some(base) = self.spare_take(size, pref) {
            base
        } else if self.committed + size > self.commit_limit {
            // Over the commit limit; spare memory is the only way out.
            self.spare_take(size, RefSet::EMPTY)
                .ok_or(Res::CommitLimit)?
        } else if let Some(base) = self.layout.alloc(size, pref) {
            self.vmem.commit(base, size)?;
            self.committed += size;
            base
        } else {
            self.spare_take(size, RefSet::EMPTY).ok_or(Res::Resource)?
        };

        let seg = self.segs.insert(Seg {
            pool,
            base,
            limit: base + size,
            rank_set: crate::trace::RankSet::empty(),
            summary: RefSet::EMPTY,
            grey: TraceSet::EMPTY,
            white: TraceSet::EMPTY,
            nailed: TraceSet::EMPTY,
            sm: AccessSet::empty(),
            depth: 0,
            buffer: None,
            data: SegData::Amc(AmcSegData::new(gen)),
        });
        let pos = self
            .seg_index
            .partition_point(|&id| self.segs[id].base < base);
        self.seg_index.insert(pos, seg);
        self.pools[pool].amc_mut().gens[gen].pgen.account_alloc(size);
        trace!("segment {:?} allocated [{:?}, {:?})", seg, base, base + size);
        Ok(seg)
    }

    /// Free a segment, retaining its memory as spare up to the spare commit
    /// limit.
    pub(crate) fn seg_free(&mut self, seg: SegId) {
        let s = self.segs.remove(seg);
        debug_assert!(s.buffer.is_none());
        let pos = self
            .seg_index
            .iter()
            .position(|&id| id == seg)
            .expect("segment missing from index");
        self.seg_index.remove(pos);
        if !s.sm.is_empty() || s.depth > 0 {
            self.vmem.protect(s.base, s.size(), AccessSet::empty());
        }
        trace!("segment {:?} freed [{:?}, {:?})", seg, s.base, s.limit);
        self.spare.push(AddressRange::new(s.base, s.limit));
        self.spare_committed += s.size();
        self.spare_shrink();
    }

    fn spare_shrink(&mut self) {
        while self.spare_committed > self.options.spare_commit_limit {
            let r = self.spare.pop().expect("spare accounting out of sync");
            self.vmem.decommit(r.base, r.size());
            self.committed -= r.size();
            self.spare_committed -= r.size();
            self.layout.free(r.base, r.size());
        }
    }

    fn spare_take(&mut self, size: ByteSize, pref: RefSet) -> Option<Address> {
        let zone_shift = self.zone_shift;
        let i = self.spare.iter().position(|r| {
            r.size() >= size
                && (pref.is_empty()
                    || RefSet::of_range(r.base, r.base + size, zone_shift).subset_of(pref))
        })?;
        let r = self.spare[i];
        let base = r.base;
        if r.size() == size {
            self.spare.remove(i);
        } else {
            self.spare[i] = AddressRange::new(base + size, r.limit);
        }
        self.spare_committed -= size;
        Some(base)
    }

    // -- colour and summary maintenance ---------------------------------

    /// Set a segment's greyness, maintaining the read barrier: a segment
    /// grey for a flipped trace must be read-protected (unless nailed
    /// handling already preserves it).
    pub(crate) fn seg_set_grey(&mut self, seg: SegId, grey: TraceSet) {
        let s = &mut self.segs[seg];
        debug_assert!(grey.is_empty() || !s.rank_set.is_empty());
        let old = s.grey;
        if old == grey {
            return;
        }
        s.grey = grey;
        let flipped = self.flipped_traces;
        let was = !old.inter(flipped).is_empty();
        let now = !grey.inter(flipped).is_empty();
        let has_read = self.segs[seg].sm.contains(AccessSet::READ);
        if now && !was && !has_read {
            self.shield_raise(seg, AccessSet::READ);
        } else if !now && was && has_read {
            self.shield_lower(seg, AccessSet::READ);
        }
    }

    /// Set a segment's summary, maintaining the write barrier: a summary
    /// tighter than universal is only sound while mutator writes are
    /// trapped.
    pub(crate) fn seg_set_summary(&mut self, seg: SegId, summary: RefSet) {
        let s = &mut self.segs[seg];
        if s.rank_set.is_empty() {
            debug_assert!(summary.is_empty());
            s.summary = summary;
            return;
        }
        s.summary = summary;
        let has_write = s.sm.contains(AccessSet::WRITE);
        let need = summary != RefSet::UNIV;
        if need && !has_write {
            self.shield_raise(seg, AccessSet::WRITE);
        } else if !need && has_write {
            self.shield_lower(seg, AccessSet::WRITE);
        }
    }

    pub(crate) fn seg_set_rank_and_summary(
        &mut self,
        seg: SegId,
        rank_set: crate::trace::RankSet,
        summary: RefSet,
    ) {
        self.segs[seg].rank_set = rank_set;
        if rank_set.is_empty() {
            debug_assert!(summary.is_empty());
            self.segs[seg].summary = summary;
        } else {
            self.seg_set_summary(seg, summary);
        }
    }

    // -- generation accounting ------------------------------------------

    pub(crate) fn gen_desc_condemned(
        &mut self,
        pool: PoolId,
        gen_idx: usize,
        ti: TraceId,
        size: ByteSize,
    ) {
        let (chain, chain_gen) = {
            let pgen = &self.pools[pool].amc().gens[gen_idx].pgen;
            (pgen.chain, pgen.gen)
        };
        self.chains[chain].gens[chain_gen].note_condemned(ti, size);
        self.trace_mut(ti).condemned += size;
    }

    pub(crate) fn gen_desc_survived(
        &mut self,
        pool: PoolId,
        gen_idx: usize,
        ti: TraceId,
        forwarded: ByteSize,
        preserved_in_place: ByteSize,
    ) {
        let (chain, chain_gen) = {
            let pgen = &self.pools[pool].amc().gens[gen_idx].pgen;
            (pgen.chain, pgen.gen)
        };
        self.chains[chain].gens[chain_gen].note_survived(ti, forwarded + preserved_in_place);
        let stats = &mut self.trace_mut(ti).stats;
        stats.forwarded_size += forwarded;
        stats.preserved_in_place_size += preserved_in_place;
    }

    // -- chains ----------------------------------------------------------

    pub fn chain_create(&mut self, params: &[GenParams]) -> Result<ChainId> {
        if params.is_empty() || params.iter().any(|p| !(0.0..=1.0).contains(&p.mortality)) {
            return Err(Res::Param);
        }
        let mut cursor = self.next_pref_zone;
        let chain = Chain::new(params, &mut cursor);
        self.next_pref_zone = cursor;
        Ok(self.chains.insert(chain))
    }

    pub fn chain_destroy(&mut self, chain: ChainId) -> Result<()> {
        if chain == self.default_chain {
            return Err(Res::Param);
        }
        if self.pools.iter().any(|(_, p)| p.amc().chain == chain) {
            return Err(Res::Fail);
        }
        self.chains.remove(chain);
        Ok(())
    }

    // -- formats ---------------------------------------------------------

    pub fn format_create<F: ObjectFormat + 'static>(&mut self, format: F) -> Result<FormatId> {
        if !format.alignment().is_power_of_two() {
            return Err(Res::Param);
        }
        Ok(self.formats.insert(Arc::new(format)))
    }

    /// Destroy a format. Fails while any pool still uses it.
    pub fn format_destroy(&mut self, format: FormatId) -> Result<()> {
        {
            let f = self.formats.get(format).ok_or(Res::Param)?;
            if Arc::strong_count(f) > 1 {
                return Err(Res::Fail);
            }
        }
        self.formats.remove(format);
        Ok(())
    }

    // -- threads ---------------------------------------------------------

    /// Register the calling thread as a mutator.
    pub fn thread_register(&mut self) {
        self.threads_registered += 1;
    }

    pub fn thread_deregister(&mut self) {
        debug_assert!(self.threads_registered > 0);
        self.threads_registered -= 1;
    }

    // -- location dependencies ------------------------------------------

    pub fn ld_reset(&self) -> LocationDependency {
        LocationDependency::reset(&self.epochs)
    }

    pub fn ld_add(&self, ld: &mut LocationDependency, addr: Address) {
        ld.add(&self.epochs, addr, self.zone_shift);
    }

    pub fn ld_merge(&self, ld: &mut LocationDependency, from: &LocationDependency) {
        ld.merge(from);
    }

    /// Might the object at `addr` (or any object the dependency covers)
    /// have moved since the dependency was recorded?
    pub fn ld_is_stale(&self, ld: &LocationDependency, _addr: Address) -> bool {
        ld.is_stale(&self.epochs)
    }

    pub fn ld_is_stale_any(&self, ld: &LocationDependency) -> bool {
        ld.is_stale(&self.epochs)
    }

    // -- messages --------------------------------------------------------

    pub fn message_enable(&mut self, kind: MessageKind) {
        self.messages.enable(kind);
    }

    pub fn message_disable(&mut self, kind: MessageKind) {
        self.messages.disable(kind);
    }

    pub fn message_poll(&self) -> bool {
        self.messages.poll()
    }

    pub fn message_queue_kind(&self) -> Option<MessageKind> {
        self.messages.queue_kind()
    }

    pub fn message_get(&mut self, kind: MessageKind) -> Option<Message> {
        self.messages.get(kind)
    }

    pub fn message_discard(&mut self) {
        self.messages.discard();
    }

    // -- finalization and transforms ------------------------------------

    /// Request finalization of the object `_ref`. Message-based delivery
    /// is not implemented by this arena class.
    pub fn finalize(&mut self, _ref: Address) -> Result<()> {
        Err(Res::Unimpl)
    }

    pub fn definalize(&mut self, _ref: Address) -> Result<()> {
        Err(Res::Unimpl)
    }

    /// Begin assembling a transform: a set of (old, new) pairs to be
    /// applied as one atomic broadcast relocation.
    pub fn transform_create(&mut self) -> Transform {
        Transform { pairs: Vec::new() }
    }

    /// Apply a transform. Atomic broadcast relocation is not implemented
    /// by this arena class.
    pub fn transform_apply(&mut self, _transform: &Transform) -> Result<()> {
        Err(Res::Unimpl)
    }

    pub fn transform_destroy(&mut self, transform: Transform) {
        drop(transform);
    }

    // -- collection control ---------------------------------------------

    /// The poll driver: called from allocation slow paths. Advances the
    /// active trace by its rate quantum, or starts a collection when a
    /// generation is over capacity.
    pub fn poll(&mut self) {
        if self.inside_poll || self.clamped {
            return;
        }
        self.inside_poll = true;
        if let Some(ti) = self.busy_traces.iter().next() {
            self.trace_poll(ti);
            if self.trace(ti).state == TraceState::Finished {
                self.trace_destroy(ti);
            }
        } else if let Some((chain, gen)) = self.collection_due() {
            if let Err(e) = self.collect_gen(chain, gen, "generation capacity exceeded") {
                debug!("deferred collection could not start: {}", e);
            }
        }
        self.inside_poll = false;
    }

    /// The oldest generation whose un-deferred new allocation exceeds its
    /// capacity, if any.
    fn collection_due(&self) -> Option<(ChainId, usize)> {
        let mut due: Option<(ChainId, usize)> = None;
        for chain in self.chains.iter().map(|(id, _)| id).collect::<Vec<_>>() {
            // The dynamic generation never triggers by size.
            let count = self.chains[chain].len() - 1;
            for gen in 0..count {
                let mut new_size = 0;
                for (_, pool) in self.pools.iter() {
                    let amc = pool.amc();
                    if amc.chain == chain {
                        new_size += amc.gens[gen].pgen.new_size;
                    }
                }
                if new_size >= self.chains[chain].gens[gen].capacity {
                    match due {
                        Some((_, g)) if g >= gen => {}
                        _ => due = Some((chain, gen)),
                    }
                }
            }
        }
        due
    }

    /// Start a collection of generations `0..=gen` of `chain`.
    fn collect_gen(&mut self, chain: ChainId, gen: usize, why: &'static str) -> Result<()> {
        let mut condemned = RefSet::EMPTY;
        for i in 0..=gen {
            condemned = condemned.union(self.chains[chain].gens[i].zones);
        }
        if condemned.is_empty() {
            return Ok(());
        }
        let ti = self.trace_create(why)?;
        if let Err(e) = self.trace_condemn_refset(ti, condemned) {
            self.trace_mut(ti).state = TraceState::Finished;
            self.trace_destroy(ti);
            return Err(e);
        }
        let mortality = self.chains[chain].gens[gen].mortality;
        let capacity = self.chains[chain].gens[gen].capacity;
        let finishing = ((capacity as f64) * self.options.incrementality) as ByteSize;
        self.trace_start(ti, mortality, finishing);
        Ok(())
    }

    /// Begin a full collection, to proceed incrementally under polling.
    pub fn start_collect(&mut self, why: &'static str) -> Result<()> {
        self.drain_traces();
        let ti = self.trace_create(why)?;
        if let Err(e) = self.trace_condemn_refset(ti, RefSet::UNIV) {
            self.trace_mut(ti).state = TraceState::Finished;
            self.trace_destroy(ti);
            return Err(e);
        }
        let condemned = self.trace(ti).condemned;
        let finishing = ((condemned as f64) * self.options.incrementality).max(1.0) as ByteSize;
        self.trace_start(ti, 0.5, finishing);
        Ok(())
    }

    /// Collect the whole arena and wait for it to finish. Leaves the arena
    /// parked; call [`release`] to resume deferred collection.
    ///
    /// [`release`]: Arena::release
    pub fn collect(&mut self, why: &'static str) -> Result<()> {
        self.start_collect(why)?;
        self.park();
        Ok(())
    }

    /// Finish all in-flight collection and prevent further collector
    /// activity until released.
    pub fn park(&mut self) {
        self.clamped = true;
        self.drain_traces();
    }

    /// Prevent collection progress except by explicit request.
    pub fn clamp(&mut self) {
        self.clamped = true;
    }

    /// Resume deferred collection.
    pub fn release(&mut self) {
        self.clamped = false;
    }

    fn drain_traces(&mut self) {
        while let Some(ti) = self.busy_traces.iter().next() {
            self.trace_poll(ti);
            if self.trace(ti).state == TraceState::Finished {
                self.trace_destroy(ti);
            }
        }
    }

    /// Do up to `interval` seconds of collection work. Returns whether any
    /// work was done.
    pub fn step(&mut self, interval: f64) -> bool {
        let deadline = self.vmem.clock() + interval;
        let mut worked = false;
        while let Some(ti) = self.busy_traces.iter().next() {
            self.trace_poll(ti);
            worked = true;
            if self.trace(ti).state == TraceState::Finished {
                self.trace_destroy(ti);
            }
            if self.vmem.clock() >= deadline {
                break;
            }
        }
        worked
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        let base = self.layout.base();
        let size = self.layout.limit() - base;
        self.vmem.release(base, size);
    }
}
