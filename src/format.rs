//! Object formats: the client's description of its object layout.
//!
//! A format gives the collector the capability to walk, scan, relocate and
//! pad the client's objects without knowing their types. All methods take
//! *client pointers* — addresses `header_size` bytes past the start of the
//! underlying memory block.
//!
//! Format methods are called with exclusive access to the object for the
//! duration of the call. They must be re-entrant, must not allocate, must
//! not call back into the collector (other than [`ScanState::fix`] from
//! `scan`), and must be safe to run from a fault handler with a bounded
//! stack.
//!
//! [`ScanState::fix`]: crate::trace::scan::ScanState::fix

use std::sync::Arc;

use crate::res::Result;
use crate::trace::scan::ScanState;
use crate::util::address::{Address, ByteSize};
use crate::util::slab::Handle;

pub trait ObjectFormat {
    /// Alignment of all objects in this format. A power of two.
    fn alignment(&self) -> ByteSize;

    /// Bytes between the start of an object's memory block and the client
    /// pointer to it.
    fn header_size(&self) -> ByteSize {
        0
    }

    /// Fix every reference field of every object in `[base, limit)` by
    /// calling `ss.fix`. `base` and `limit` are client pointers; the range
    /// holds whole objects.
    ///
    /// # Safety
    /// The range must hold initialized, formatted objects.
    unsafe fn scan(&self, ss: &mut ScanState, base: Address, limit: Address) -> Result<()>;

    /// The client pointer just past `object`.
    ///
    /// # Safety
    /// `object` must be a formatted object (or padding, or a forwarding
    /// marker).
    unsafe fn skip(&self, object: Address) -> Address;

    /// Replace `old` with a forwarding marker pointing at `new`. The marker
    /// must occupy exactly the old object's extent (`skip` keeps returning
    /// the same limit).
    ///
    /// # Safety
    /// `old` must be a formatted object; its new copy at `new` must already
    /// be complete.
    unsafe fn forward(&self, old: Address, new: Address);

    /// If `object` is a forwarding marker, the address it forwards to.
    ///
    /// # Safety
    /// `object` must be a formatted object, padding, or forwarding marker.
    unsafe fn is_moved(&self, object: Address) -> Option<Address>;

    /// Write a padding object over `[base, base+size)`. `base` is *not* a
    /// client pointer: padding covers raw memory. Padding must be
    /// acceptable to `skip` and `scan`, down to `alignment` bytes.
    ///
    /// # Safety
    /// The range must be committed and otherwise unused.
    unsafe fn pad(&self, base: Address, size: ByteSize);

    /// Optional: the class of `object`, for inspection tools.
    ///
    /// # Safety
    /// `object` must be a formatted object.
    unsafe fn class(&self, object: Address) -> Option<Address> {
        let _ = object;
        None
    }
}

pub type FormatId = Handle<Arc<dyn ObjectFormat>>;
