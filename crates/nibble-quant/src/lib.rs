//! Nibble Quant: block-wise low-bit quantization
//!
//! This crate compresses f32 tensors into 4-bit (NF4, FP4) or 8-bit (dynamic
//! map) codebook indices with one absmax scale per block, and optionally
//! quantizes those scales a second time.
//!
//! # Features
//!
//! - **Codebooks**: NF4 and FP4 16-entry tables, signed and unsigned 256-entry dynamic maps
//! - **Block-wise scales**: absmax per block, partial final blocks, exact zeros
//! - **Double quantization**: 8-bit scale metadata with a shared offset
//! - **Compute dtypes**: dequantize to f32, or round through f16/bf16
//! - **Parallel**: blocks are encoded and decoded with rayon (`parallel` feature)
//!
//! # Example
//!
//! ```rust
//! use nibble_quant::{dequantize, quantize, CodebookKind, QuantConfig, Shape, TensorView};
//!
//! let weights: Vec<f32> = (0..256).map(|i| (i as f32 * 0.1).sin()).collect();
//! let view = TensorView::new(&weights, Shape::matrix(16, 16))?;
//!
//! let config = QuantConfig::builder()
//!     .codebook(CodebookKind::Nf4)
//!     .block_size(64)
//!     .double_quant(true)
//!     .build()?;
//!
//! let packed = quantize(&view, &config)?;
//! assert_eq!(packed.data().len(), 128);
//!
//! let restored = dequantize(&packed, &config)?;
//! assert_eq!(restored.shape(), view.shape());
//! # Ok::<(), nibble_quant::QuantError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod blockwise;
pub mod codebook;
pub mod config;
pub mod double_quant;
pub mod error;
pub mod shape;
pub mod stats;
pub mod tensor;
pub mod validation;

// Re-export main types
pub use blockwise::{
    decode_block, dequantize, encode_block, pack_nibbles, packed_len, quantize, unpack_nibbles,
    QuantizedTensor, ScaleMetadata,
};
pub use codebook::{Codebook, CodebookKind, FP4_LEVELS, NF4_LEVELS};
pub use config::{QuantConfig, QuantConfigBuilder, QuantSettings};
pub use double_quant::{DoubleQuantScales, DoubleQuantizer};
pub use error::{QuantError, Result};
pub use shape::Shape;
pub use stats::{absmax, block_absmax, BlockLayout};
pub use tensor::{ComputeDType, Tensor, TensorView};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        dequantize, quantize, validation::QuantValidator, Codebook, CodebookKind, ComputeDType,
        QuantConfig, QuantError, QuantizedTensor, Result, ScaleMetadata, Shape, Tensor,
        TensorView,
    };
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_weight_codebook_round_trips_shape() {
        let data: Vec<f32> = (0..70).map(|i| i as f32 - 35.0).collect();
        let view = TensorView::new(&data, Shape::from_slice(&[2, 5, 7])).unwrap();
        for kind in [CodebookKind::Nf4, CodebookKind::Fp4, CodebookKind::DynamicSigned8] {
            let config = QuantConfig::builder().codebook(kind).block_size(16).build().unwrap();
            let restored = dequantize(&quantize(&view, &config).unwrap(), &config).unwrap();
            assert_eq!(restored.shape(), view.shape(), "{}", kind);
        }
    }
}
