//! Second-level quantization of per-block scales
//!
//! First-level scales are centred on their mean and the deviations are
//! quantized in groups with the signed 8-bit dynamic map. Each group keeps one
//! f32 absmax; the whole tensor keeps one f32 offset. This takes scale
//! metadata from 32 bits to roughly 8 bits per block.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::blockwise::{decode_block, encode_block};
use crate::codebook::{Codebook, CodebookKind};
use crate::config::DEFAULT_DOUBLE_QUANT_GROUP;
use crate::error::{QuantError, Result};
use crate::stats::{block_absmax, ensure_finite};

/// Codebook used for scale deviations
pub const SECONDARY_CODEBOOK: CodebookKind = CodebookKind::DynamicSigned8;

/// Double-quantized scale metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoubleQuantScales {
    /// One 8-bit index per first-level scale
    pub indices: Vec<u8>,
    /// One absmax per group of `group_size` deviations
    pub group_scales: Vec<f32>,
    /// Mean of the first-level scales
    pub offset: f32,
    /// Scales per group
    pub group_size: usize,
}

impl DoubleQuantScales {
    /// Number of first-level scales described
    pub fn num_scales(&self) -> usize {
        self.indices.len()
    }

    /// Number of second-level groups
    pub fn num_groups(&self) -> usize {
        self.group_scales.len()
    }

    /// Storage footprint in bytes
    pub fn size_bytes(&self) -> usize {
        self.indices.len() + self.group_scales.len() * 4 + 4
    }

    /// Largest error the second level can add to one decoded scale in `group`
    pub fn step_bound(&self, group: usize) -> f32 {
        Codebook::get(SECONDARY_CODEBOOK).max_step() * self.group_scales[group]
    }
}

/// Quantizes and restores first-level scales
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DoubleQuantizer {
    group_size: usize,
}

impl Default for DoubleQuantizer {
    fn default() -> Self {
        Self { group_size: DEFAULT_DOUBLE_QUANT_GROUP }
    }
}

impl DoubleQuantizer {
    /// Creates a quantizer with `group_size` scales per second-level group
    pub fn new(group_size: usize) -> Result<Self> {
        if group_size == 0 {
            return Err(QuantError::invalid_config(
                "CONFIG_DOUBLE_QUANT_GROUP",
                "double quantization group size must be positive",
                "group_size",
                "0",
                "Use the default group size of 256",
            ));
        }
        Ok(Self { group_size })
    }

    /// Scales per group
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Quantizes first-level scales.
    ///
    /// Scales must be finite; a non-finite scale or group statistic is
    /// reported as `NumericOverflow` naming its index.
    pub fn quantize(&self, scales: &[f32]) -> Result<DoubleQuantScales> {
        ensure_finite(scales, "first-level scale")?;

        let offset = if scales.is_empty() {
            0.0
        } else {
            (scales.iter().map(|&s| s as f64).sum::<f64>() / scales.len() as f64) as f32
        };

        let deviations: Vec<f32> = scales.iter().map(|&s| s - offset).collect();
        let group_scales = block_absmax(&deviations, self.group_size)?;

        let codebook = Codebook::get(SECONDARY_CODEBOOK);
        let mut indices = vec![0u8; scales.len()];
        for ((group, codes), &group_scale) in deviations
            .chunks(self.group_size)
            .zip(indices.chunks_mut(self.group_size))
            .zip(&group_scales)
        {
            encode_block(group, group_scale, codebook, codes);
        }

        trace!(
            "Double-quantized {} scales into {} groups (offset {})",
            scales.len(),
            group_scales.len(),
            offset
        );

        Ok(DoubleQuantScales { indices, group_scales, offset, group_size: self.group_size })
    }

    /// Restores first-level scales as `code * group_scale + offset`, clamped
    /// at zero.
    pub fn dequantize(&self, quantized: &DoubleQuantScales) -> Vec<f32> {
        let codebook = Codebook::get(SECONDARY_CODEBOOK);
        let mut scales = vec![0.0f32; quantized.indices.len()];
        for ((codes, out), &group_scale) in quantized
            .indices
            .chunks(self.group_size)
            .zip(scales.chunks_mut(self.group_size))
            .zip(&quantized.group_scales)
        {
            decode_block(codes, group_scale, codebook, out);
            for scale in out.iter_mut() {
                *scale = (*scale + quantized.offset).max(0.0);
            }
        }
        scales
    }
}
