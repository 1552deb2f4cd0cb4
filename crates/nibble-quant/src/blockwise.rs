//! Block-wise codebook quantization
//!
//! Each block of `block_size` elements is normalised by its absmax scale and
//! every element is mapped to the nearest codebook entry. 4-bit indices are
//! packed two per byte, low nibble first; 8-bit indices take one byte each.

use std::borrow::Cow;

#[cfg(feature = "parallel")]
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::codebook::{Codebook, CodebookKind};
use crate::config::QuantConfig;
use crate::double_quant::{DoubleQuantScales, DoubleQuantizer};
use crate::error::{QuantError, Result};
use crate::shape::Shape;
use crate::stats::{block_absmax, BlockLayout};
use crate::tensor::{ComputeDType, Tensor, TensorView};
use crate::validation::QuantValidator;

/// Per-block scales, either stored in full or double-quantized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScaleMetadata {
    /// One f32 absmax per block
    Full(Vec<f32>),
    /// Scales quantized a second time
    Double(DoubleQuantScales),
}

impl ScaleMetadata {
    /// Number of block scales described
    pub fn num_scales(&self) -> usize {
        match self {
            ScaleMetadata::Full(scales) => scales.len(),
            ScaleMetadata::Double(dq) => dq.num_scales(),
        }
    }

    /// Whether the scales are double-quantized
    pub fn is_double(&self) -> bool {
        matches!(self, ScaleMetadata::Double(_))
    }

    /// Storage footprint in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            ScaleMetadata::Full(scales) => scales.len() * 4,
            ScaleMetadata::Double(dq) => dq.size_bytes(),
        }
    }

    /// Effective per-block scales used for decoding
    pub fn resolve(&self) -> Result<Cow<'_, [f32]>> {
        match self {
            ScaleMetadata::Full(scales) => Ok(Cow::Borrowed(scales)),
            ScaleMetadata::Double(dq) => {
                Ok(Cow::Owned(DoubleQuantizer::new(dq.group_size)?.dequantize(dq)))
            }
        }
    }
}

/// Result of [`quantize`]: packed indices plus everything needed to invert them
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensor {
    data: Vec<u8>,
    scales: ScaleMetadata,
    shape: Shape,
    block_size: usize,
    codebook: CodebookKind,
}

impl QuantizedTensor {
    /// Assembles an artifact from its parts; consistency is checked on dequantize
    pub fn from_parts(
        data: Vec<u8>,
        scales: ScaleMetadata,
        shape: Shape,
        block_size: usize,
        codebook: CodebookKind,
    ) -> Self {
        Self { data, scales, shape, block_size, codebook }
    }

    /// Packed indices
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Scale metadata
    pub fn scales(&self) -> &ScaleMetadata {
        &self.scales
    }

    /// Shape of the original tensor
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    /// Number of original elements
    pub fn numel(&self) -> usize {
        self.shape.numel()
    }

    /// Elements per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Codebook the indices refer to
    pub fn codebook(&self) -> CodebookKind {
        self.codebook
    }

    /// Storage footprint of indices and scale metadata in bytes
    pub fn size_bytes(&self) -> usize {
        self.data.len() + self.scales.size_bytes()
    }

    /// Ratio of the f32 footprint to the quantized footprint
    pub fn compression_ratio(&self) -> f32 {
        let quantized = self.size_bytes();
        if quantized == 0 {
            return 1.0;
        }
        (self.numel() * std::mem::size_of::<f32>()) as f32 / quantized as f32
    }
}

/// Bytes needed to store `numel` indices of `bits` width
pub fn packed_len(numel: usize, bits: u8) -> usize {
    if bits == 4 {
        numel.div_ceil(2)
    } else {
        numel
    }
}

/// Packs 4-bit indices two per byte; element `i` lands in byte `i / 2`, low
/// nibble for even `i`. A trailing odd element leaves the high nibble zero.
pub fn pack_nibbles(codes: &[u8]) -> Vec<u8> {
    codes
        .chunks(2)
        .map(|pair| {
            let lo = pair[0] & 0x0F;
            let hi = pair.get(1).map_or(0, |&c| c & 0x0F);
            lo | (hi << 4)
        })
        .collect()
}

/// Unpacks the first `numel` 4-bit indices
pub fn unpack_nibbles(packed: &[u8], numel: usize) -> Vec<u8> {
    let mut codes = Vec::with_capacity(numel);
    for &byte in packed {
        codes.push(byte & 0x0F);
        codes.push(byte >> 4);
    }
    codes.truncate(numel);
    codes
}

/// Encodes one block against a known scale.
///
/// A zero scale stores the codebook's zero index for every element. The
/// scale must be finite.
#[inline]
pub fn encode_block(values: &[f32], scale: f32, codebook: &Codebook, codes: &mut [u8]) {
    debug_assert_eq!(values.len(), codes.len());
    if scale == 0.0 {
        codes.fill(codebook.zero_index());
        return;
    }
    for (code, &v) in codes.iter_mut().zip(values) {
        *code = codebook.nearest(v / scale);
    }
}

/// Decodes one block as `C[i] * scale`; a zero scale yields exact zeros
#[inline]
pub fn decode_block(codes: &[u8], scale: f32, codebook: &Codebook, out: &mut [f32]) {
    debug_assert_eq!(codes.len(), out.len());
    if scale == 0.0 {
        out.fill(0.0);
        return;
    }
    for (o, &code) in out.iter_mut().zip(codes) {
        *o = codebook.value(code) * scale;
    }
}

fn encode_blocks(data: &[f32], scales: &[f32], block_size: usize, codebook: &Codebook) -> Vec<u8> {
    let mut codes = vec![0u8; data.len()];

    #[cfg(feature = "parallel")]
    codes
        .par_chunks_mut(block_size)
        .zip(data.par_chunks(block_size))
        .zip(scales.par_iter())
        .for_each(|((c, v), &s)| encode_block(v, s, codebook, c));

    #[cfg(not(feature = "parallel"))]
    codes
        .chunks_mut(block_size)
        .zip(data.chunks(block_size))
        .zip(scales.iter())
        .for_each(|((c, v), &s)| encode_block(v, s, codebook, c));

    codes
}

fn decode_blocks(codes: &[u8], scales: &[f32], block_size: usize, codebook: &Codebook) -> Vec<f32> {
    let mut out = vec![0.0f32; codes.len()];

    #[cfg(feature = "parallel")]
    out.par_chunks_mut(block_size)
        .zip(codes.par_chunks(block_size))
        .zip(scales.par_iter())
        .for_each(|((o, c), &s)| decode_block(c, s, codebook, o));

    #[cfg(not(feature = "parallel"))]
    out.chunks_mut(block_size)
        .zip(codes.chunks(block_size))
        .zip(scales.iter())
        .for_each(|((o, c), &s)| decode_block(c, s, codebook, o));

    out
}

/// Quantizes a tensor view.
///
/// Block scales are absmax values over exactly the elements of each block, so
/// a block size that does not divide the element count leaves a smaller final
/// block. Non-finite input is rejected with `NumericOverflow`.
pub fn quantize(view: &TensorView<'_>, config: &QuantConfig) -> Result<QuantizedTensor> {
    let data = view.data();
    let kind = config.codebook();
    let codebook = Codebook::get(kind);
    let layout = BlockLayout::new(data.len(), config.block_size())?;

    let scales = block_absmax(data, layout.block_size())?;
    let codes = encode_blocks(data, &scales, layout.block_size(), codebook);

    let packed = match kind.bits() {
        4 => pack_nibbles(&codes),
        _ => codes,
    };

    let scales = if config.double_quant() {
        let quantizer = DoubleQuantizer::new(config.double_quant_group())?;
        ScaleMetadata::Double(quantizer.quantize(&scales)?)
    } else {
        ScaleMetadata::Full(scales)
    };

    trace!(
        "Quantized {} elements with {} into {} blocks ({} bytes)",
        data.len(),
        kind,
        layout.num_blocks(),
        packed.len()
    );

    Ok(QuantizedTensor {
        data: packed,
        scales,
        shape: view.shape().clone(),
        block_size: layout.block_size(),
        codebook: kind,
    })
}

/// Reconstructs a tensor with the original shape.
///
/// The artifact is checked against `config` before any index is read. Values
/// are rounded through the configured compute dtype; a value that overflows
/// the narrower dtype is reported as `NumericOverflow`.
pub fn dequantize(quantized: &QuantizedTensor, config: &QuantConfig) -> Result<Tensor> {
    QuantValidator::validate_artifact(quantized, config)?;

    let numel = quantized.numel();
    let codebook = Codebook::get(quantized.codebook);
    let codes: Cow<'_, [u8]> = match quantized.codebook.bits() {
        4 => Cow::Owned(unpack_nibbles(&quantized.data, numel)),
        _ => Cow::Borrowed(&quantized.data),
    };
    let scales = quantized.scales.resolve()?;

    let mut values = decode_blocks(&codes, &scales, quantized.block_size, codebook);
    round_to_dtype(&mut values, config.compute_dtype(), quantized.block_size)?;

    trace!(
        "Dequantized {} elements from {} as {}",
        numel,
        quantized.codebook,
        config.compute_dtype()
    );

    Tensor::from_vec(values, quantized.shape.clone())
}

fn round_to_dtype(values: &mut [f32], dtype: ComputeDType, block_size: usize) -> Result<()> {
    if dtype == ComputeDType::F32 {
        return Ok(());
    }
    for (i, v) in values.iter_mut().enumerate() {
        let rounded = dtype.round(*v);
        if !rounded.is_finite() {
            return Err(QuantError::numeric_overflow(
                i / block_size,
                *v,
                format!("{} value at element {}", dtype, i),
            ));
        }
        *v = rounded;
    }
    Ok(())
}
