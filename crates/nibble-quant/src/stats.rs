//! Per-block statistics over a flattened tensor

use std::ops::Range;

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use crate::error::{QuantError, Result};

/// Partition of `numel` elements into contiguous blocks of `block_size`.
///
/// The last block is partial when `block_size` does not divide `numel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    numel: usize,
    block_size: usize,
}

impl BlockLayout {
    /// Creates a layout; a zero block size is rejected
    pub fn new(numel: usize, block_size: usize) -> Result<Self> {
        if block_size == 0 {
            return Err(QuantError::invalid_block_size(block_size, "block layout"));
        }
        Ok(Self { numel, block_size })
    }

    /// Number of elements covered
    pub fn numel(&self) -> usize {
        self.numel
    }

    /// Nominal block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of blocks, counting a trailing partial block
    pub fn num_blocks(&self) -> usize {
        self.numel.div_ceil(self.block_size)
    }

    /// Element range of block `index`
    pub fn block_range(&self, index: usize) -> Range<usize> {
        let start = index * self.block_size;
        let end = (start + self.block_size).min(self.numel);
        start..end
    }

    /// Whether block `index` holds fewer than `block_size` elements
    pub fn is_partial(&self, index: usize) -> bool {
        self.block_range(index).len() < self.block_size
    }
}

#[inline]
fn nan_max(a: f32, b: f32) -> f32 {
    if a.is_nan() || b.is_nan() {
        f32::NAN
    } else {
        a.max(b)
    }
}

/// Absolute maximum of one block.
///
/// NaN is propagated rather than skipped (unlike `f32::max`), so a poisoned
/// block is never mistaken for a finite one.
#[inline]
pub fn absmax(block: &[f32]) -> f32 {
    block.iter().fold(0.0f32, |acc, &v| nan_max(acc, v.abs()))
}

/// Computes one absolute-maximum scale per block.
///
/// Only the elements present in a block contribute, so a trailing partial
/// block is never padded. Blocks are reduced independently (in parallel with
/// the `parallel` feature) and the result is identical either way.
pub fn block_absmax(data: &[f32], block_size: usize) -> Result<Vec<f32>> {
    let layout = BlockLayout::new(data.len(), block_size)?;

    #[cfg(feature = "parallel")]
    let scales: Vec<f32> = data.par_chunks(block_size).map(absmax).collect();
    #[cfg(not(feature = "parallel"))]
    let scales: Vec<f32> = data.chunks(block_size).map(absmax).collect();

    debug_assert_eq!(scales.len(), layout.num_blocks());
    ensure_finite(&scales, "block absmax")?;
    Ok(scales)
}

/// Fails with `NumericOverflow` on the first non-finite value
pub fn ensure_finite(values: &[f32], what: &str) -> Result<()> {
    match values.iter().position(|v| !v.is_finite()) {
        Some(index) => Err(QuantError::numeric_overflow(
            index,
            values[index],
            format!("{} of block {}", what, index),
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_partial_block() {
        let layout = BlockLayout::new(130, 64).unwrap();
        assert_eq!(layout.num_blocks(), 3);
        assert_eq!(layout.block_range(2), 128..130);
        assert!(layout.is_partial(2));
        assert!(!layout.is_partial(1));
    }

    #[test]
    fn test_layout_rejects_zero_block_size() {
        let err = BlockLayout::new(10, 0).unwrap_err();
        assert_eq!(err.code(), "QUANT_INVALID_BLOCK_SIZE");
    }

    #[test]
    fn test_absmax_per_block() {
        let mut data = vec![1.0f32; 256];
        for (i, v) in data[192..].iter_mut().enumerate() {
            *v = if i % 2 == 0 { 3.0 } else { -3.0 };
        }
        let scales = block_absmax(&data, 64).unwrap();
        assert_eq!(scales, vec![1.0, 1.0, 1.0, 3.0]);
    }

    #[test]
    fn test_partial_block_uses_only_present_elements() {
        let data = vec![0.5f32, -2.0, 0.25];
        let scales = block_absmax(&data, 2).unwrap();
        assert_eq!(scales, vec![2.0, 0.25]);
    }

    #[test]
    fn test_zero_block_has_zero_scale() {
        let data = vec![0.0f32; 8];
        assert_eq!(block_absmax(&data, 4).unwrap(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_non_finite_is_reported_with_block_index() {
        let mut data = vec![1.0f32; 12];
        data[9] = f32::NAN;
        match block_absmax(&data, 4).unwrap_err() {
            QuantError::NumericOverflow { block_index, .. } => assert_eq!(block_index, 2),
            other => panic!("unexpected error: {other}"),
        }

        data[9] = f32::INFINITY;
        assert!(block_absmax(&data, 4).unwrap_err().is_numeric_error());
    }

    #[test]
    fn test_empty_input() {
        assert!(block_absmax(&[], 64).unwrap().is_empty());
    }
}
