//! Result codes for collector operations.

use thiserror::Error;

/// Failure codes surfaced by the collector. Contract violations are not
/// reported this way; they assert.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Res {
    /// Unspecified failure.
    #[error("operation failed")]
    Fail,
    /// No free trace slot.
    #[error("no trace id available")]
    Limit,
    /// Out of memory while allocating collector metadata.
    #[error("out of resources")]
    Resource,
    /// An invalid parameter was passed.
    #[error("invalid parameter")]
    Param,
    /// The operation is not implemented by this pool or arena class.
    #[error("unimplemented")]
    Unimpl,
    /// The arena commit limit would be exceeded.
    #[error("commit limit exceeded")]
    CommitLimit,
    /// The OS refused to provide memory.
    #[error("out of committable memory")]
    Memory,
}

impl Res {
    /// The allocation-failure family. The poll driver treats these as a
    /// signal to enter emergency tracing rather than as errors.
    pub fn is_alloc_failure(self) -> bool {
        matches!(self, Res::CommitLimit | Res::Memory | Res::Resource)
    }
}

pub type Result<T> = std::result::Result<T, Res>;
