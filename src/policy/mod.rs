//! Pool classes.
//!
//! A pool is an allocation strategy. Pool classes are tagged variants
//! sharing a common prefix of fields; dispatching on the tag replaces the
//! virtual table of a class hierarchy, and the class check is the tag test.
//! The only automatic class in scope is AMC (with its AMCZ leaf variant);
//! non-moving and manual classes are external collaborators.

pub mod amc;

use std::sync::Arc;

use bitflags::bitflags;

use crate::format::ObjectFormat;
use crate::util::address::ByteSize;
use crate::util::slab::Handle;

pub type PoolId = Handle<Pool>;

bitflags! {
    /// Class attributes consulted by the trace engine.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct PoolAttr: u8 {
        /// The pool's segments are collectable (may be condemned).
        const GC = 1 << 0;
        /// Condemned objects may move.
        const MOVING_GC = 1 << 1;
        /// The pool's segments may contain references and can be scanned.
        const SCAN = 1 << 2;
    }
}

pub enum PoolData {
    Amc(amc::AmcPool),
}

pub struct Pool {
    pub format: Arc<dyn ObjectFormat>,
    pub alignment: ByteSize,
    pub align_shift: usize,
    pub data: PoolData,
}

impl Pool {
    pub fn attrs(&self) -> PoolAttr {
        match &self.data {
            PoolData::Amc(amc) => {
                let mut attr = PoolAttr::GC | PoolAttr::MOVING_GC;
                if !amc.rank_set.is_empty() {
                    attr |= PoolAttr::SCAN;
                }
                attr
            }
        }
    }

    pub fn amc(&self) -> &amc::AmcPool {
        match &self.data {
            PoolData::Amc(amc) => amc,
        }
    }

    pub fn amc_mut(&mut self) -> &mut amc::AmcPool {
        match &mut self.data {
            PoolData::Amc(amc) => amc,
        }
    }
}
