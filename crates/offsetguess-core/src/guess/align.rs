//! Alignment-aware candidate offset search

/// Return the smallest offset `>= offset` such that `base + offset` is a
/// multiple of `size`, or `None` when that offset does not fit in a `u64`.
///
/// Compilers never place a field at an address that is not aligned to its
/// size, so only aligned candidates are worth probing. The driver resubmits
/// `previous + 1` after every failed attempt, which makes this function move
/// on to the next aligned address: the sequence of candidates is every
/// multiple of `size` at or above the starting point, each visited once.
pub fn next_aligned_offset(base: u64, offset: u64, size: u64) -> Option<u64> {
    if size <= 1 {
        return Some(offset);
    }
    match base.wrapping_add(offset) % size {
        0 => Some(offset),
        remainder => offset.checked_add(size - remainder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worked_example() {
        assert_eq!(next_aligned_offset(0xffff_8880_0000_1003, 0, 8), Some(5));
    }

    #[test]
    fn test_already_aligned_is_kept() {
        assert_eq!(next_aligned_offset(0x1000, 0, 8), Some(0));
        assert_eq!(next_aligned_offset(0x1000, 16, 4), Some(16));
        assert_eq!(next_aligned_offset(0x1001, 7, 8), Some(7));
    }

    #[test]
    fn test_result_is_smallest_aligned_offset() {
        for size in [1u64, 2, 4, 8] {
            for base in 0x1000u64..0x1010 {
                for offset in 0u64..64 {
                    let next = next_aligned_offset(base, offset, size).unwrap();
                    assert!(next >= offset);
                    assert_eq!((base + next) % size, 0, "base={base:#x} offset={offset}");
                    // Nothing between offset and next is aligned
                    assert!((offset..next).all(|o| (base + o) % size != 0));
                }
            }
        }
    }

    #[test]
    fn test_retry_protocol_enumerates_every_aligned_offset() {
        for size in [1u64, 2, 4, 8] {
            for base in [0x2000u64, 0x2001, 0x2003, 0x2006] {
                let start = 3;
                let mut visited = Vec::new();
                let mut offset = start;
                while offset < 128 {
                    let next = next_aligned_offset(base, offset, size).unwrap();
                    if next >= 128 {
                        break;
                    }
                    visited.push(next);
                    offset = next + 1;
                }

                let expected: Vec<u64> = (start..128).filter(|o| (base + o) % size == 0).collect();
                assert_eq!(visited, expected, "size={size} base={base:#x}");
            }
        }
    }

    #[test]
    fn test_zero_size_does_not_divide() {
        assert_eq!(next_aligned_offset(0x1003, 9, 0), Some(9));
    }

    #[test]
    fn test_offset_past_address_space_has_no_candidate() {
        assert_eq!(next_aligned_offset(0x1000, u64::MAX - 1, 4), None);
        assert_eq!(next_aligned_offset(0x1003, u64::MAX, 8), None);
        // Already aligned at the very top is still representable
        assert_eq!(next_aligned_offset(0, u64::MAX - 7, 8), Some(u64::MAX - 7));
        assert_eq!(next_aligned_offset(0x1000, u64::MAX, 1), Some(u64::MAX));
    }
}
