//! Sub-batch index arithmetic for bounding per-call memory use.

use anyhow::{bail, Result};

/// Model requires spatial dimensions to be multiples of this.
pub const PAD_ALIGN: usize = 16;

/// Split `[0, len)` into contiguous `(start, end)` ranges of at most
/// `batch_size` items, in order. The last range may be shorter.
pub fn sub_batch_ranges(len: usize, batch_size: usize) -> Result<Vec<(usize, usize)>> {
    if batch_size == 0 {
        bail!("batch_size must be positive");
    }

    let num_full = len / batch_size;
    let remainder = len % batch_size;

    let mut ranges = Vec::with_capacity(num_full + usize::from(remainder > 0));
    for i in 0..num_full {
        let start = i * batch_size;
        ranges.push((start, start + batch_size));
    }
    if remainder > 0 {
        ranges.push((len - remainder, len));
    }

    Ok(ranges)
}

/// Smallest multiple of [`PAD_ALIGN`] that is >= `dim`.
pub fn align_up(dim: usize) -> usize {
    dim.div_ceil(PAD_ALIGN) * PAD_ALIGN
}

/// Padded spatial dimensions the model accepts for an `(h, w)` input.
pub fn padded_dims(h: usize, w: usize) -> (usize, usize) {
    (align_up(h), align_up(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Ranges must partition `[0, len)` exactly, preserving order.
    fn assert_partitions(len: usize, batch_size: usize) {
        let ranges = sub_batch_ranges(len, batch_size).expect("positive batch size");
        let mut cursor = 0;
        for (i, (start, end)) in ranges.iter().enumerate() {
            assert_eq!(*start, cursor, "range {i} does not continue the previous one");
            assert!(end > start, "range {i} is empty");
            assert!(end - start <= batch_size, "range {i} exceeds batch size");
            if i + 1 < ranges.len() {
                assert_eq!(end - start, batch_size, "only the last range may be short");
            }
            cursor = *end;
        }
        assert_eq!(cursor, len, "ranges do not cover the full batch");
    }

    #[test]
    fn test_sub_batch_ranges_partition() {
        for len in [1, 2, 3, 7, 8, 9, 16, 31] {
            for batch_size in [1, 2, 3, 8, 64] {
                assert_partitions(len, batch_size);
            }
        }
    }

    #[test]
    fn test_sub_batch_ranges_exact_division() {
        let ranges = sub_batch_ranges(8, 4).unwrap();
        assert_eq!(ranges, vec![(0, 4), (4, 8)]);
    }

    #[test]
    fn test_sub_batch_ranges_short_tail() {
        let ranges = sub_batch_ranges(10, 4).unwrap();
        assert_eq!(ranges, vec![(0, 4), (4, 8), (8, 10)]);
    }

    #[test]
    fn test_sub_batch_ranges_oversized_batch() {
        let ranges = sub_batch_ranges(3, 8).unwrap();
        assert_eq!(ranges, vec![(0, 3)]);
    }

    #[test]
    fn test_sub_batch_ranges_empty_input() {
        let ranges = sub_batch_ranges(0, 4).unwrap();
        assert!(ranges.is_empty());
    }

    #[test]
    fn test_sub_batch_ranges_zero_batch_size_errors() {
        let err = sub_batch_ranges(4, 0).unwrap_err();
        assert_eq!(err.to_string(), "batch_size must be positive");
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(1), 16);
        assert_eq!(align_up(16), 16);
        assert_eq!(align_up(17), 32);
        assert_eq!(align_up(720), 720);
        assert_eq!(align_up(721), 736);
    }

    #[test]
    fn test_padded_dims_smallest_multiples() {
        for h in [1usize, 15, 16, 17, 100, 719, 720] {
            for w in [1usize, 15, 16, 17, 100, 1280, 1281] {
                let (ph, pw) = padded_dims(h, w);
                assert!(ph >= h && pw >= w);
                assert_eq!(ph % PAD_ALIGN, 0);
                assert_eq!(pw % PAD_ALIGN, 0);
                assert!(ph < h + PAD_ALIGN, "{ph} is not the smallest multiple for {h}");
                assert!(pw < w + PAD_ALIGN, "{pw} is not the smallest multiple for {w}");
            }
        }
    }
}
