//! An embeddable, incremental, generational, mostly-copying garbage
//! collector for language runtimes.
//!
//! The client describes its object layout through an [`ObjectFormat`],
//! allocates through bump-allocating allocation points, and registers the
//! roots from which its objects are reachable. The collector discovers
//! references, moves live objects between generations, reclaims dead ones,
//! and coordinates with the mutator through memory-protection barriers
//! driven by the embedding's fault handler.
//!
//! The root type is [`Arena`]. A minimal client:
//!
//! ```no_run
//! use amcgc::{Arena, ArenaOptions, AmcOptions};
//! # struct MyFormat;
//! # impl amcgc::ObjectFormat for MyFormat {
//! #     fn alignment(&self) -> usize { 8 }
//! #     unsafe fn scan(&self, _: &mut amcgc::ScanState, _: amcgc::Address, _: amcgc::Address) -> amcgc::Result<()> { Ok(()) }
//! #     unsafe fn skip(&self, p: amcgc::Address) -> amcgc::Address { p }
//! #     unsafe fn forward(&self, _: amcgc::Address, _: amcgc::Address) {}
//! #     unsafe fn is_moved(&self, _: amcgc::Address) -> Option<amcgc::Address> { None }
//! #     unsafe fn pad(&self, _: amcgc::Address, _: usize) {}
//! # }
//!
//! let mut arena = Arena::new(ArenaOptions::default()).unwrap();
//! let fmt = arena.format_create(MyFormat).unwrap();
//! let pool = arena.pool_create_amc(fmt, AmcOptions::default()).unwrap();
//! let ap = arena.ap_create(pool, false).unwrap();
//! loop {
//!     let p = arena.ap_reserve(ap, 16).unwrap();
//!     // ... initialize the object at p ...
//!     if arena.ap_commit(ap, p, 16) {
//!         break;
//!     }
//! }
//! ```

#[macro_use]
extern crate log;

pub mod arena;
pub mod buffer;
pub mod chain;
pub mod format;
pub mod message;
pub mod policy;
pub mod res;
pub mod root;
pub mod seg;
pub mod shield;
pub mod trace;
pub mod util;

pub use arena::Arena;
pub use buffer::BufferId;
pub use chain::ChainId;
pub use format::{FormatId, ObjectFormat};
pub use message::{Message, MessageKind};
pub use policy::amc::AmcOptions;
pub use policy::PoolId;
pub use res::{Res, Result};
pub use root::RootId;
pub use shield::AccessSet;
pub use trace::scan::ScanState;
pub use trace::Rank;
pub use util::address::{Address, ByteSize, Word};
pub use util::heap::vmem::{MockVmem, SysVmem, VirtualMemory};
pub use util::ld::LocationDependency;
pub use util::options::{ArenaOptions, GenParams};
pub use util::refset::RefSet;
