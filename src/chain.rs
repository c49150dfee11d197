//! Generation chains and per-pool generation accounting.
//!
//! A chain is an ordered list of generation descriptors. Pools bucket their
//! segments into generations; the accounting kept here decides when the
//! poll driver schedules a collection, and of which generations.

use crate::trace::TraceId;
use crate::util::address::ByteSize;
use crate::util::constants::TRACE_MAX;
use crate::util::options::GenParams;
use crate::util::refset::RefSet;
use crate::util::slab::Handle;

pub type ChainId = Handle<Chain>;

/// One generation in a chain.
pub struct GenDesc {
    /// New allocation this generation tolerates before the poll driver
    /// schedules a collection of it (and of everything younger).
    pub capacity: ByteSize,
    /// Expected fraction of condemned content that dies.
    pub mortality: f64,
    /// Zone stripes this generation prefers its segments placed in.
    pub pref: RefSet,
    /// Zones actually occupied by this generation's segments. Condemning
    /// the generation means condemning these zones.
    pub zones: RefSet,
    /// Bytes condemned per in-flight trace.
    pub condemned: [ByteSize; TRACE_MAX],
    /// Bytes that survived per in-flight trace (forwarded or preserved in
    /// place).
    pub survived: [ByteSize; TRACE_MAX],
    /// Lifetime totals, for mortality observation.
    pub total_condemned: ByteSize,
    pub total_survived: ByteSize,
}

impl GenDesc {
    fn new(capacity: ByteSize, mortality: f64, pref: RefSet) -> GenDesc {
        GenDesc {
            capacity,
            mortality,
            pref,
            zones: RefSet::EMPTY,
            condemned: [0; TRACE_MAX],
            survived: [0; TRACE_MAX],
            total_condemned: 0,
            total_survived: 0,
        }
    }

    pub fn note_condemned(&mut self, ti: TraceId, size: ByteSize) {
        self.condemned[ti.index()] += size;
        self.total_condemned += size;
    }

    pub fn note_survived(&mut self, ti: TraceId, size: ByteSize) {
        self.survived[ti.index()] += size;
        self.total_survived += size;
    }

    pub fn end_trace(&mut self, ti: TraceId) {
        self.condemned[ti.index()] = 0;
        self.survived[ti.index()] = 0;
    }
}

pub struct Chain {
    /// Client generations followed by the dynamic (top) generation, which
    /// forwards to itself and never triggers a collection by size.
    pub gens: Vec<GenDesc>,
}

impl Chain {
    /// Build a chain from client parameters. `zone_cursor` hands out
    /// preferred zone stripes; generations get disjoint stripes until the
    /// zones run out.
    pub fn new(params: &[GenParams], zone_cursor: &mut usize) -> Chain {
        let mut gens: Vec<GenDesc> = params
            .iter()
            .map(|p| GenDesc::new(p.capacity, p.mortality, Self::next_pref(zone_cursor)))
            .collect();
        // The dynamic generation.
        gens.push(GenDesc::new(
            ByteSize::MAX / 2,
            0.5,
            Self::next_pref(zone_cursor),
        ));
        Chain { gens }
    }

    /// The number of generations, including the dynamic one.
    pub fn len(&self) -> usize {
        self.gens.len()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Stripes of 4 zones per generation, wrapping when exhausted.
    fn next_pref(zone_cursor: &mut usize) -> RefSet {
        const STRIPE_ZONES: usize = 4;
        let mut pref = RefSet::EMPTY;
        for _ in 0..STRIPE_ZONES {
            pref = pref.with_zone(*zone_cursor % crate::util::constants::ZONE_COUNT);
            *zone_cursor += 1;
        }
        pref
    }
}

/// Per-pool, per-generation size accounting.
///
/// total = free + buffered + new + newDeferred + old + oldDeferred at all
/// times. Deferred totals do not count towards the collection trigger.
pub struct PoolGen {
    pub chain: ChainId,
    /// Generation index within the chain.
    pub gen: usize,
    pub total_size: ByteSize,
    pub free_size: ByteSize,
    pub buffered_size: ByteSize,
    pub new_size: ByteSize,
    pub new_deferred_size: ByteSize,
    pub old_size: ByteSize,
    pub old_deferred_size: ByteSize,
}

impl PoolGen {
    pub fn new(chain: ChainId, gen: usize) -> PoolGen {
        PoolGen {
            chain,
            gen,
            total_size: 0,
            free_size: 0,
            buffered_size: 0,
            new_size: 0,
            new_deferred_size: 0,
            old_size: 0,
            old_deferred_size: 0,
        }
    }

    /// A segment was allocated for this generation.
    pub fn account_alloc(&mut self, size: ByteSize) {
        self.total_size += size;
        self.free_size += size;
    }

    /// A buffer was filled from free space.
    pub fn account_fill(&mut self, size: ByteSize) {
        debug_assert!(self.free_size >= size);
        self.free_size -= size;
        self.buffered_size += size;
    }

    /// A buffer was emptied: `used` bytes were handed to the client (or
    /// padded), `unused` returned to free.
    pub fn account_empty(&mut self, used: ByteSize, unused: ByteSize, deferred: bool) {
        debug_assert!(self.buffered_size >= used + unused);
        self.buffered_size -= used + unused;
        self.free_size += unused;
        if deferred {
            self.new_deferred_size += used;
        } else {
            self.new_size += used;
        }
    }

    /// A segment was condemned for the first time: its content ages from
    /// buffered/new to old.
    pub fn account_age(&mut self, was_buffered: ByteSize, was_new: ByteSize, deferred: bool) {
        debug_assert!(self.buffered_size >= was_buffered);
        self.buffered_size -= was_buffered;
        if deferred {
            debug_assert!(self.new_deferred_size >= was_new);
            self.new_deferred_size -= was_new;
            self.old_deferred_size += was_buffered + was_new;
        } else {
            debug_assert!(self.new_size >= was_new);
            self.new_size -= was_new;
            self.old_size += was_buffered + was_new;
        }
    }

    /// Deferred accounting materializes (ramp exit).
    pub fn account_undefer(&mut self, old: ByteSize, new: ByteSize) {
        debug_assert!(self.old_deferred_size >= old);
        debug_assert!(self.new_deferred_size >= new);
        self.old_deferred_size -= old;
        self.old_size += old;
        self.new_deferred_size -= new;
        self.new_size += new;
    }

    /// A segment is being freed; `free + old + new` must equal its size.
    pub fn account_free(
        &mut self,
        seg_size: ByteSize,
        free: ByteSize,
        old: ByteSize,
        new: ByteSize,
        deferred: bool,
    ) {
        debug_assert_eq!(free + old + new, seg_size);
        debug_assert!(self.total_size >= seg_size);
        self.total_size -= seg_size;
        debug_assert!(self.free_size >= free);
        self.free_size -= free;
        if deferred {
            debug_assert!(self.old_deferred_size >= old && self.new_deferred_size >= new);
            self.old_deferred_size -= old;
            self.new_deferred_size -= new;
        } else {
            debug_assert!(self.old_size >= old && self.new_size >= new);
            self.old_size -= old;
            self.new_size -= new;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pgen() -> PoolGen {
        PoolGen::new(ChainId::from_raw(0), 0)
    }

    #[test]
    fn fill_empty_age_free_balances() {
        let mut pg = pgen();
        pg.account_alloc(0x1000);
        assert_eq!(pg.total_size, 0x1000);
        assert_eq!(pg.free_size, 0x1000);

        pg.account_fill(0x1000);
        assert_eq!(pg.buffered_size, 0x1000);

        pg.account_empty(0x1000, 0, false);
        assert_eq!(pg.new_size, 0x1000);
        assert_eq!(pg.buffered_size, 0);

        pg.account_age(0, 0x1000, false);
        assert_eq!(pg.old_size, 0x1000);
        assert_eq!(pg.new_size, 0);

        pg.account_free(0x1000, 0, 0x1000, 0, false);
        assert_eq!(pg.total_size, 0);
        assert_eq!(pg.old_size, 0);
    }

    #[test]
    fn deferred_accounting_does_not_touch_live_totals() {
        let mut pg = pgen();
        pg.account_alloc(0x2000);
        pg.account_fill(0x2000);
        pg.account_empty(0x2000, 0, true);
        assert_eq!(pg.new_size, 0);
        assert_eq!(pg.new_deferred_size, 0x2000);

        pg.account_undefer(0, 0x2000);
        assert_eq!(pg.new_size, 0x2000);
        assert_eq!(pg.new_deferred_size, 0);
    }

    #[test]
    fn chain_appends_dynamic_gen() {
        let mut cursor = 0;
        let chain = Chain::new(
            &[GenParams {
                capacity: 1024,
                mortality: 0.9,
            }],
            &mut cursor,
        );
        assert_eq!(chain.len(), 2);
        assert!(chain.gens[1].capacity > chain.gens[0].capacity);
        // Disjoint zone stripes.
        assert!(chain.gens[0].pref.inter(chain.gens[1].pref).is_empty());
    }
}
