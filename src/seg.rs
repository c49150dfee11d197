//! Segments: contiguous aligned ranges owned by a pool and tracked by the
//! collector.

use crate::buffer::BufferId;
use crate::policy::PoolId;
use crate::shield::AccessSet;
use crate::trace::{RankSet, TraceSet};
use crate::util::address::{Address, ByteSize};
use crate::util::constants::TRACE_MAX;
use crate::util::nailboard::Nailboard;
use crate::util::refset::RefSet;
use crate::util::slab::Handle;

pub type SegId = Handle<Seg>;

/// Class-specific segment state. The class check is a tag test.
pub enum SegData {
    Amc(AmcSegData),
}

/// AMC-specific fields.
///
/// `accounted_as_buffered` is true while the segment has an attached buffer
/// and its size is held against the generation's buffered total; a condemned
/// segment can still have a buffer attached after this goes false.
///
/// `old` is true once the segment has been condemned at least once, moving
/// its size from the generation's new total to its old total.
///
/// `deferred` is true when the segment's accounting is excluded from the
/// collection trigger: segments created during a ramp, and hash-array
/// allocations (which must not provoke a collection that would immediately
/// stale the client's location dependency).
pub struct AmcSegData {
    /// Index of the owning generation within the pool.
    pub gen: usize,
    /// Nailboard, present while the segment is nailed with per-position
    /// detail.
    pub board: Option<Nailboard>,
    /// Bytes forwarded out of this segment, per trace.
    pub forwarded: [ByteSize; TRACE_MAX],
    pub accounted_as_buffered: bool,
    pub old: bool,
    pub deferred: bool,
}

impl AmcSegData {
    pub fn new(gen: usize) -> AmcSegData {
        AmcSegData {
            gen,
            board: None,
            forwarded: [0; TRACE_MAX],
            accounted_as_buffered: false,
            old: false,
            deferred: false,
        }
    }
}

pub struct Seg {
    pub pool: PoolId,
    pub base: Address,
    pub limit: Address,
    /// Ranks of references the segment may contain. Empty for leaf
    /// segments, which are never grey.
    pub rank_set: RankSet,
    /// Approximation of the targets of all references in the segment.
    /// Sound: always a superset of the true post-fix summary, unless the
    /// write barrier is down, in which case it must be universal.
    pub summary: RefSet,
    pub grey: TraceSet,
    pub white: TraceSet,
    pub nailed: TraceSet,
    /// Shield mode: access kinds currently forbidden to the mutator.
    pub sm: AccessSet,
    /// Shield expose depth; protection is in force only at depth zero.
    pub depth: usize,
    pub buffer: Option<BufferId>,
    pub data: SegData,
}

impl Seg {
    pub fn size(&self) -> ByteSize {
        self.limit - self.base
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.base <= addr && addr < self.limit
    }

    pub fn amc(&self) -> &AmcSegData {
        match &self.data {
            SegData::Amc(d) => d,
        }
    }

    pub fn amc_mut(&mut self) -> &mut AmcSegData {
        match &mut self.data {
            SegData::Amc(d) => d,
        }
    }

    pub fn has_nailboard(&self) -> bool {
        self.amc().board.is_some()
    }

    #[cfg(feature = "extreme_assertions")]
    pub fn check(&self) {
        assert!(self.base < self.limit);
        if self.has_nailboard() {
            assert!(!self.nailed.is_empty());
        }
        // A segment grey for a trace must be able to hold references.
        if !self.grey.is_empty() {
            assert!(!self.rank_set.is_empty());
        }
    }
}
