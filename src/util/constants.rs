/// log2 of the number of bits in a byte
pub const LOG_BITS_IN_BYTE: usize = 3;
/// The number of bits in a byte
pub const BITS_IN_BYTE: usize = 1 << LOG_BITS_IN_BYTE;

/// log2 of the number of bytes in a word
#[cfg(target_pointer_width = "64")]
pub const LOG_BYTES_IN_WORD: usize = 3;
#[cfg(target_pointer_width = "32")]
pub const LOG_BYTES_IN_WORD: usize = 2;
/// The number of bytes in a word
pub const BYTES_IN_WORD: usize = 1 << LOG_BYTES_IN_WORD;
/// log2 of the number of bits in a word
pub const LOG_BITS_IN_WORD: usize = LOG_BITS_IN_BYTE + LOG_BYTES_IN_WORD;
/// The number of bits in a word
pub const BITS_IN_WORD: usize = 1 << LOG_BITS_IN_WORD;

/// log2 of the number of bytes in a page
pub const LOG_BYTES_IN_PAGE: usize = 12;
/// The number of bytes in a page
pub const BYTES_IN_PAGE: usize = 1 << LOG_BYTES_IN_PAGE;

/// log2 of the number of bytes in a kilobyte
pub const LOG_BYTES_IN_KBYTE: usize = 10;
/// The number of bytes in a kilobyte
pub const BYTES_IN_KBYTE: usize = 1 << LOG_BYTES_IN_KBYTE;

/// log2 of the number of bytes in a megabyte
pub const LOG_BYTES_IN_MBYTE: usize = 20;
/// The number of bytes in a megabyte
pub const BYTES_IN_MBYTE: usize = 1 << LOG_BYTES_IN_MBYTE;

/// The number of zones a reference summary distinguishes. One bit per zone
/// in a word-sized set.
pub const ZONE_COUNT: usize = BITS_IN_WORD;

/// The maximum number of traces that can be in progress on one arena at a
/// time. The engine is written over trace sets, but whiten and ramp
/// accounting assume single-trace exclusivity, so this is pinned to 1.
pub const TRACE_MAX: usize = 1;

/// Length of the location-dependency epoch history kept by the arena.
pub const LD_HISTORY_LENGTH: usize = 16;

/// Bytes of segment-scan work performed per poll quantum.
pub const POLL_QUANTUM: usize = 64 * BYTES_IN_KBYTE;
