use crate::util::address::{Address, ByteSize};
use crate::util::constants::*;

pub fn page_align_up(size: ByteSize) -> ByteSize {
    raw_align_up(size, BYTES_IN_PAGE)
}

pub fn is_page_aligned(addr: Address) -> bool {
    addr.is_aligned_to(BYTES_IN_PAGE)
}

pub fn raw_align_up(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (val + align - 1) & !(align - 1)
}

pub fn raw_align_down(val: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    val & !(align - 1)
}

pub fn bytes_to_pages_up(bytes: ByteSize) -> usize {
    (bytes + BYTES_IN_PAGE - 1) >> LOG_BYTES_IN_PAGE
}

pub fn pages_to_bytes(pages: usize) -> ByteSize {
    pages << LOG_BYTES_IN_PAGE
}

/// Number of words needed to hold `bits` bits.
pub fn words_for_bits(bits: usize) -> usize {
    (bits + BITS_IN_WORD - 1) >> LOG_BITS_IN_WORD
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_round_trip() {
        assert_eq!(raw_align_up(1, 8), 8);
        assert_eq!(raw_align_up(8, 8), 8);
        assert_eq!(raw_align_down(15, 8), 8);
        assert_eq!(bytes_to_pages_up(1), 1);
        assert_eq!(bytes_to_pages_up(BYTES_IN_PAGE + 1), 2);
    }
}
