//! Buffers (allocation points): bump-allocator views into a segment.
//!
//! A buffer is either a *mutator* buffer — the fast allocation path handed
//! to the client — or a *forwarding* buffer owned by a generation, which
//! receives objects copied out of condemned segments.
//!
//! The client protocol is reserve / initialize / commit. A flip traps every
//! buffer; a commit that races a flip fails, and the client must re-reserve
//! and re-initialize. The trap is an atomic mode word so the check does not
//! need the arena.

use atomic::{Atomic, Ordering};

use crate::arena::Arena;
use crate::policy::{PoolData, PoolId};
use crate::res::{Res, Result};
use crate::seg::SegId;
use crate::trace::RankSet;
use crate::util::address::{Address, ByteSize};
use crate::util::slab::Handle;

pub type BufferId = Handle<Buffer>;

pub mod mode {
    /// The buffer has a segment attached.
    pub const ATTACHED: u8 = 1 << 0;
    /// A flip has trapped the buffer; the next commit must fail.
    pub const FLIPPED: u8 = 1 << 1;
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BufferKind {
    Mutator { for_hash_arrays: bool },
    Forward,
}

pub struct Buffer {
    pub pool: PoolId,
    pub kind: BufferKind,
    pub seg: Option<SegId>,
    /// The generation newly attached segments join. For a mutator buffer
    /// this is the nursery; for a forwarding buffer, the promotion target.
    pub gen: usize,
    pub rank_set: RankSet,
    /// Start of the region this buffer is responsible for. Condemnation
    /// raises it to the scan limit so post-flip allocation is
    /// distinguishable.
    pub base: Address,
    /// Below `init` the memory is initialized.
    pub init: Address,
    /// Below `alloc` the memory is reserved.
    pub alloc: Address,
    pub limit: Address,
    /// Value of `init` at the last flip.
    pub init_at_flip: Address,
    pub mode: Atomic<u8>,
}

impl Buffer {
    pub(crate) fn new(pool: PoolId, kind: BufferKind, gen: usize, rank_set: RankSet) -> Buffer {
        Buffer {
            pool,
            kind,
            seg: None,
            gen,
            rank_set,
            base: Address::ZERO,
            init: Address::ZERO,
            alloc: Address::ZERO,
            limit: Address::ZERO,
            init_at_flip: Address::ZERO,
            mode: Atomic::new(0),
        }
    }

    pub fn is_mutator(&self) -> bool {
        matches!(self.kind, BufferKind::Mutator { .. })
    }

    pub fn for_hash_arrays(&self) -> bool {
        matches!(
            self.kind,
            BufferKind::Mutator {
                for_hash_arrays: true
            }
        )
    }

    pub fn is_attached(&self) -> bool {
        self.mode.load(Ordering::Relaxed) & mode::ATTACHED != 0
    }

    pub fn is_flipped(&self) -> bool {
        self.mode.load(Ordering::Relaxed) & mode::FLIPPED != 0
    }

    /// Nothing reserved and nothing attached: safe to refill.
    pub fn is_reset(&self) -> bool {
        !self.is_attached() && self.init == self.alloc
    }

    /// The limit of what the collector has observed. Everything between
    /// here and `init` was allocated after the flip and is already black.
    pub fn scan_limit(&self) -> Address {
        if self.is_flipped() {
            self.init_at_flip
        } else {
            self.init
        }
    }

    pub(crate) fn check_invariant(&self) {
        if self.is_attached() {
            debug_assert!(self.base <= self.scan_limit());
            debug_assert!(self.scan_limit() <= self.init);
            debug_assert!(self.init <= self.alloc);
            debug_assert!(self.alloc <= self.limit);
        }
    }
}

impl Arena {
    /// Create an allocation point on `pool` for the calling mutator thread.
    pub fn ap_create(&mut self, pool: PoolId, for_hash_arrays: bool) -> Result<BufferId> {
        let p = self.pools.get(pool).ok_or(Res::Param)?;
        let (gen, rank_set) = match &p.data {
            PoolData::Amc(amc) => (amc.nursery, amc.rank_set),
        };
        let buf = self.buffers.insert(Buffer::new(
            pool,
            BufferKind::Mutator { for_hash_arrays },
            gen,
            rank_set,
        ));
        Ok(buf)
    }

    /// Destroy an allocation point, flushing its segment back to the pool.
    pub fn ap_destroy(&mut self, buf: BufferId) {
        self.buffer_detach(buf);
        self.buffers.remove(buf);
    }

    /// Reserve `size` bytes of uninitialized memory. The client initializes
    /// the object and then calls [`ap_commit`]; if that fails, the object
    /// must be re-reserved and re-initialized.
    ///
    /// [`ap_commit`]: Arena::ap_commit
    pub fn ap_reserve(&mut self, buf: BufferId, size: ByteSize) -> Result<Address> {
        debug_assert!(self.buffers[buf].is_mutator());
        self.buffer_reserve_inner(buf, size, true)
    }

    /// Commit the object at `p`. Returns false if a flip intervened since
    /// the reserve, in which case the object is not part of the committed
    /// world and the client must retry.
    pub fn ap_commit(&mut self, buf: BufferId, p: Address, size: ByteSize) -> bool {
        debug_assert!(self.buffers[buf].is_mutator());
        self.buffer_commit(buf, p, size)
    }

    /// Push an allocation frame. Stacked freeing is a manual-pool affair;
    /// AMC does not implement it.
    pub fn ap_frame_push(&mut self, _buf: BufferId) -> Result<()> {
        Err(Res::Unimpl)
    }

    /// Pop an allocation frame.
    pub fn ap_frame_pop(&mut self, _buf: BufferId) -> Result<()> {
        Err(Res::Unimpl)
    }

    pub(crate) fn buffer_reserve_inner(
        &mut self,
        buf: BufferId,
        size: ByteSize,
        allow_poll: bool,
    ) -> Result<Address> {
        let alignment = self.pools[self.buffers[buf].pool].alignment;
        if size == 0 || size % alignment != 0 {
            return Err(Res::Param);
        }
        {
            let b = &mut self.buffers[buf];
            b.check_invariant();
            debug_assert_eq!(b.init, b.alloc, "reserve with a reservation outstanding");
            // A flipped buffer is trapped: reserves go the slow way and
            // re-attach, so that the only commit that can fail is one
            // whose reserve predated the flip.
            if b.is_attached() && !b.is_flipped() && b.init + size <= b.limit {
                b.alloc = b.init + size;
                return Ok(b.init);
            }
        }
        // Slow path. Mutator refills give the collector its slice of time
        // first; this is one of the places a flip can happen.
        if allow_poll {
            self.poll();
        }
        self.buffer_detach(buf);
        let pool = self.buffers[buf].pool;
        debug_assert!(matches!(self.pools[pool].data, PoolData::Amc(_)));
        crate::policy::amc::buffer_fill(self, buf, size)?;
        let b = &mut self.buffers[buf];
        debug_assert!(b.is_attached());
        debug_assert!(b.init + size <= b.limit);
        b.alloc = b.init + size;
        Ok(b.init)
    }

    pub(crate) fn buffer_commit(&mut self, buf: BufferId, p: Address, size: ByteSize) -> bool {
        let b = &mut self.buffers[buf];
        debug_assert_eq!(p + size, b.alloc);
        debug_assert_eq!(b.init + size, b.alloc);
        b.init = b.alloc;
        // Trip: a flip happened between reserve and commit. The object was
        // initialized into the pre-flip world, so it cannot be handed out;
        // its memory stays behind as committed garbage.
        let m = b.mode.load(Ordering::Acquire);
        if m & mode::FLIPPED != 0 {
            b.mode.store(m & !mode::FLIPPED, Ordering::Release);
            return false;
        }
        true
    }

    /// Detach the buffer from its segment, flushing the unused tail back to
    /// the pool.
    pub(crate) fn buffer_detach(&mut self, buf: BufferId) {
        let b = &self.buffers[buf];
        debug_assert_eq!(b.init, b.alloc, "detach with a reservation outstanding");
        if let Some(seg) = b.seg {
            let (pool, base, init, limit) = (b.pool, b.base, b.init, b.limit);
            debug_assert!(matches!(self.pools[pool].data, PoolData::Amc(_)));
            crate::policy::amc::seg_buffer_empty(self, seg, base, init, limit);
            self.segs[seg].buffer = None;
        }
        let b = &mut self.buffers[buf];
        b.seg = None;
        b.base = Address::ZERO;
        b.init = Address::ZERO;
        b.alloc = Address::ZERO;
        b.limit = Address::ZERO;
        b.init_at_flip = Address::ZERO;
        b.mode.store(0, Ordering::Release);
    }

    /// Trap every buffer at flip time.
    pub(crate) fn buffer_flip_all(&mut self) {
        for buf in self.buffers.handles() {
            let b = &mut self.buffers[buf];
            let m = b.mode.load(Ordering::Acquire);
            if m & mode::ATTACHED != 0 && m & mode::FLIPPED == 0 {
                b.init_at_flip = b.init;
                b.mode.store(m | mode::FLIPPED, Ordering::Release);
            }
        }
    }

    /// The scanned limit of a segment: the attached buffer's scan limit, or
    /// the segment limit if no buffer is attached.
    pub(crate) fn seg_buffer_scan_limit(&self, seg: SegId) -> Address {
        match self.segs[seg].buffer {
            Some(buf) => self.buffers[buf].scan_limit(),
            None => self.segs[seg].limit,
        }
    }
}
