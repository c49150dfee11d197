//! The OS virtual-memory surface the collector consumes.
//!
//! The arena is parameterized over this trait; the collector itself never
//! calls the OS directly. [`SysVmem`] is the production implementation for
//! unix-likes. [`MockVmem`] backs tests and embeddings that handle
//! protection themselves: memory is really mapped, but protection and
//! thread-suspension requests are recorded rather than enforced.

use std::collections::HashMap;
use std::time::Instant;

use crate::res::{Res, Result};
use crate::shield::AccessSet;
use crate::util::address::{Address, ByteSize};

pub trait VirtualMemory {
    /// Reserve `size` bytes of address space, inaccessible until committed.
    fn reserve(&mut self, size: ByteSize) -> Result<Address>;

    /// Return a reservation to the OS.
    fn release(&mut self, base: Address, size: ByteSize);

    /// Make `[base, base+size)` readable and writable.
    fn commit(&mut self, base: Address, size: ByteSize) -> Result<()>;

    /// Return the pages of `[base, base+size)` to the OS, leaving the range
    /// reserved.
    fn decommit(&mut self, base: Address, size: ByteSize);

    /// Forbid the kinds of access in `forbidden` on `[base, base+size)`.
    /// An empty set restores full access.
    fn protect(&mut self, base: Address, size: ByteSize, forbidden: AccessSet);

    /// Suspend all registered mutator threads except the caller.
    fn suspend_threads(&mut self);

    /// Resume threads suspended by [`suspend_threads`].
    ///
    /// [`suspend_threads`]: VirtualMemory::suspend_threads
    fn resume_threads(&mut self);

    /// Monotonic seconds since an arbitrary origin.
    fn clock(&self) -> f64;
}

/// mmap/mprotect-backed implementation for unix-likes.
///
/// Thread suspension is left to the embedding: a runtime that registers
/// threads installs its own suspension mechanism (signals, safepoints) and
/// overrides this type or wraps it.
pub struct SysVmem {
    start: Instant,
}

impl SysVmem {
    pub fn new() -> SysVmem {
        SysVmem {
            start: Instant::now(),
        }
    }
}

impl Default for SysVmem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemory for SysVmem {
    fn reserve(&mut self, size: ByteSize) -> Result<Address> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Res::Memory);
        }
        Ok(Address::from_ptr(ptr))
    }

    fn release(&mut self, base: Address, size: ByteSize) {
        unsafe {
            libc::munmap(base.to_mut_ptr(), size);
        }
    }

    fn commit(&mut self, base: Address, size: ByteSize) -> Result<()> {
        let ret = unsafe {
            libc::mprotect(
                base.to_mut_ptr(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            return Err(Res::Memory);
        }
        Ok(())
    }

    fn decommit(&mut self, base: Address, size: ByteSize) {
        unsafe {
            libc::madvise(base.to_mut_ptr(), size, libc::MADV_DONTNEED);
            libc::mprotect(base.to_mut_ptr(), size, libc::PROT_NONE);
        }
    }

    fn protect(&mut self, base: Address, size: ByteSize, forbidden: AccessSet) {
        let prot = if forbidden.contains(AccessSet::READ) {
            // Forbidding reads forbids everything.
            libc::PROT_NONE
        } else if forbidden.contains(AccessSet::WRITE) {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let ret = unsafe { libc::mprotect(base.to_mut_ptr(), size, prot) };
        assert_eq!(ret, 0, "mprotect failed on {:?}+{:#x}", base, size);
    }

    fn suspend_threads(&mut self) {
        trace!("suspend_threads: no registered suspension mechanism");
    }

    fn resume_threads(&mut self) {
        trace!("resume_threads: no registered suspension mechanism");
    }

    fn clock(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Mapped memory with recorded (unenforced) protection. Used by the test
/// suite and by embeddings that drive barriers through their own fault
/// handling.
pub struct MockVmem {
    start: Instant,
    reservation: Option<(Address, ByteSize)>,
    protections: HashMap<Address, AccessSet>,
    pub suspend_count: usize,
    pub resume_count: usize,
}

impl MockVmem {
    pub fn new() -> MockVmem {
        MockVmem {
            start: Instant::now(),
            reservation: None,
            protections: HashMap::new(),
            suspend_count: 0,
            resume_count: 0,
        }
    }

    /// The recorded protection for the range starting at `base`.
    pub fn protection_at(&self, base: Address) -> AccessSet {
        self.protections.get(&base).copied().unwrap_or(AccessSet::empty())
    }

    /// The current reservation, if any.
    pub fn reservation(&self) -> Option<(Address, ByteSize)> {
        self.reservation
    }
}

impl Default for MockVmem {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemory for MockVmem {
    fn reserve(&mut self, size: ByteSize) -> Result<Address> {
        // Really map the memory (NORESERVE, readable and writable) so the
        // mutator under test can use it without fault handling.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Res::Memory);
        }
        let base = Address::from_ptr(ptr);
        self.reservation = Some((base, size));
        Ok(base)
    }

    fn release(&mut self, base: Address, size: ByteSize) {
        unsafe {
            libc::munmap(base.to_mut_ptr(), size);
        }
        self.reservation = None;
    }

    fn commit(&mut self, _base: Address, _size: ByteSize) -> Result<()> {
        Ok(())
    }

    fn decommit(&mut self, base: Address, size: ByteSize) {
        unsafe {
            libc::madvise(base.to_mut_ptr(), size, libc::MADV_DONTNEED);
        }
    }

    fn protect(&mut self, base: Address, _size: ByteSize, forbidden: AccessSet) {
        if forbidden.is_empty() {
            self.protections.remove(&base);
        } else {
            self.protections.insert(base, forbidden);
        }
    }

    fn suspend_threads(&mut self) {
        self.suspend_count += 1;
    }

    fn resume_threads(&mut self) {
        self.resume_count += 1;
    }

    fn clock(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
