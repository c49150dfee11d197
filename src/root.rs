//! Roots: the places outside the heap where the mutator keeps references.

use crate::arena::Arena;
use crate::format::FormatId;
use crate::res::{Res, Result};
use crate::trace::scan::ScanState;
use crate::trace::Rank;
use crate::util::address::{Address, Word};
use crate::util::refset::RefSet;
use crate::util::slab::Handle;

pub type RootId = Handle<Root>;

/// A caller-provided scanner for a region the collector cannot interpret
/// itself. The closure word is passed back verbatim.
pub type AreaScanFn = fn(&mut ScanState, Address, Address, Word) -> Result<()>;

#[derive(Copy, Clone)]
pub enum RootKind {
    /// A table of exact references.
    Table { base: Address, count: usize },
    /// A table of words that are references when `(word & mask) == pattern`.
    TaggedArea {
        base: Address,
        limit: Address,
        mask: Word,
        pattern: Word,
    },
    /// A region scanned by a caller-provided function.
    Area {
        base: Address,
        limit: Address,
        scan: AreaScanFn,
        closure: Word,
    },
    /// A thread's stack and registers, scanned ambiguously with a tag
    /// filter. The collector treats `[base, limit)` as the cold-to-hot
    /// extent at scan time.
    Thread {
        base: Address,
        limit: Address,
        mask: Word,
        pattern: Word,
    },
    /// A caller-managed region of formatted objects, scanned with the
    /// format's own scanner.
    Fmt {
        format: FormatId,
        base: Address,
        limit: Address,
    },
}

#[derive(Copy, Clone)]
pub struct Root {
    pub rank: Rank,
    pub kind: RootKind,
    /// Approximation of the targets of the root's references. Universal
    /// until a scan tightens it; roots are mutator-writable, so it is only
    /// tightened for the duration of a trace.
    pub summary: RefSet,
}

impl Arena {
    /// Register a table of exact references.
    pub fn root_create_table(&mut self, base: Address, count: usize) -> Result<RootId> {
        if base.is_zero() {
            return Err(Res::Param);
        }
        Ok(self.roots.insert(Root {
            rank: Rank::Exact,
            kind: RootKind::Table { base, count },
            summary: RefSet::UNIV,
        }))
    }

    /// Register a table of tagged words at the given rank.
    pub fn root_create_tagged(
        &mut self,
        rank: Rank,
        base: Address,
        limit: Address,
        mask: Word,
        pattern: Word,
    ) -> Result<RootId> {
        if base >= limit || rank > Rank::Exact {
            return Err(Res::Param);
        }
        Ok(self.roots.insert(Root {
            rank,
            kind: RootKind::TaggedArea {
                base,
                limit,
                mask,
                pattern,
            },
            summary: RefSet::UNIV,
        }))
    }

    /// Register a region scanned by a caller-provided function.
    pub fn root_create_area(
        &mut self,
        rank: Rank,
        base: Address,
        limit: Address,
        scan: AreaScanFn,
        closure: Word,
    ) -> Result<RootId> {
        if base >= limit || rank > Rank::Exact {
            return Err(Res::Param);
        }
        Ok(self.roots.insert(Root {
            rank,
            kind: RootKind::Area {
                base,
                limit,
                scan,
                closure,
            },
            summary: RefSet::UNIV,
        }))
    }

    /// Register a caller-managed region of formatted objects as a root.
    pub fn root_create_fmt(
        &mut self,
        rank: Rank,
        format: FormatId,
        base: Address,
        limit: Address,
    ) -> Result<RootId> {
        if base >= limit || rank > Rank::Exact || self.formats.get(format).is_none() {
            return Err(Res::Param);
        }
        Ok(self.roots.insert(Root {
            rank,
            kind: RootKind::Fmt {
                format,
                base,
                limit,
            },
            summary: RefSet::UNIV,
        }))
    }

    /// Register a thread's stack as an ambiguous root.
    pub fn root_create_thread(
        &mut self,
        base: Address,
        limit: Address,
        mask: Word,
        pattern: Word,
    ) -> Result<RootId> {
        if base >= limit {
            return Err(Res::Param);
        }
        Ok(self.roots.insert(Root {
            rank: Rank::Ambig,
            kind: RootKind::Thread {
                base,
                limit,
                mask,
                pattern,
            },
            summary: RefSet::UNIV,
        }))
    }

    pub fn root_destroy(&mut self, root: RootId) {
        self.roots.remove(root);
    }
}

/// Scan one root. Called under a scan state whose rank matches the root's.
pub(crate) fn root_scan(ss: &mut ScanState, root: Root) -> Result<()> {
    debug_assert_eq!(ss.rank, root.rank);
    match root.kind {
        RootKind::Table { base, count } => {
            let limit = base + count * std::mem::size_of::<Address>();
            ss.scan_area(base, limit)
        }
        RootKind::TaggedArea {
            base,
            limit,
            mask,
            pattern,
        }
        | RootKind::Thread {
            base,
            limit,
            mask,
            pattern,
        } => ss.scan_area_masked(base, limit, mask, pattern),
        RootKind::Area {
            base,
            limit,
            scan,
            closure,
        } => scan(ss, base, limit, closure),
        RootKind::Fmt {
            format,
            base,
            limit,
        } => {
            let format = ss.arena.formats[format].clone();
            ss.scan_formatted(&format, base, limit)
        }
    }
}
