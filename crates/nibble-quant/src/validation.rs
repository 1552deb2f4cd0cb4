//! Consistency checks for quantized artifacts
//!
//! Dequantization trusts nothing it did not produce itself: an artifact is
//! checked against the caller's config and against its own shape before any
//! index is read.

use crate::blockwise::{packed_len, QuantizedTensor, ScaleMetadata};
use crate::config::QuantConfig;
use crate::error::{QuantError, Result};
use crate::stats::BlockLayout;

/// Artifact validation utilities
pub struct QuantValidator;

impl QuantValidator {
    /// Validates an artifact against the config it is about to be decoded with
    pub fn validate_artifact(quantized: &QuantizedTensor, config: &QuantConfig) -> Result<()> {
        Self::validate_against_config(quantized, config)?;
        Self::validate_layout(quantized)?;
        Self::validate_scales(quantized.scales())
    }

    /// Codebook, block size and double-quant flag must match the config
    pub fn validate_against_config(quantized: &QuantizedTensor, config: &QuantConfig) -> Result<()> {
        if quantized.codebook() != config.codebook() {
            return Err(QuantError::corrupt_artifact(
                "ARTIFACT_CODEBOOK_MISMATCH",
                "artifact was quantized with a different codebook",
                "codebook",
                config.codebook().name(),
                quantized.codebook().name(),
            ));
        }

        if quantized.block_size() != config.block_size() {
            return Err(QuantError::corrupt_artifact(
                "ARTIFACT_BLOCK_SIZE_MISMATCH",
                "artifact was quantized with a different block size",
                "block_size",
                config.block_size().to_string(),
                quantized.block_size().to_string(),
            ));
        }

        if quantized.scales().is_double() != config.double_quant() {
            return Err(QuantError::corrupt_artifact(
                "ARTIFACT_DOUBLE_QUANT_MISMATCH",
                "scale metadata does not match the double quantization setting",
                "double_quant",
                config.double_quant().to_string(),
                quantized.scales().is_double().to_string(),
            ));
        }

        if let ScaleMetadata::Double(dq) = quantized.scales() {
            if dq.group_size != config.double_quant_group() {
                return Err(QuantError::corrupt_artifact(
                    "ARTIFACT_GROUP_SIZE_MISMATCH",
                    "artifact was double-quantized with a different group size",
                    "double_quant_group",
                    config.double_quant_group().to_string(),
                    dq.group_size.to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Packed length and scale count must agree with the shape
    pub fn validate_layout(quantized: &QuantizedTensor) -> Result<()> {
        let numel = quantized.shape().checked_numel()?;
        if quantized.block_size() == 0 {
            return Err(QuantError::corrupt_artifact(
                "ARTIFACT_ZERO_BLOCK_SIZE",
                "artifact declares a zero block size",
                "block_size",
                "a positive block size",
                "0",
            ));
        }
        let layout = BlockLayout::new(numel, quantized.block_size())?;

        let expected = packed_len(numel, quantized.codebook().bits());
        if quantized.data().len() != expected {
            return Err(QuantError::corrupt_artifact(
                "ARTIFACT_PACKED_LENGTH",
                format!("packed index length does not match shape {}", quantized.shape()),
                "data",
                format!("{} bytes", expected),
                format!("{} bytes", quantized.data().len()),
            ));
        }

        let scales = quantized.scales().num_scales();
        if scales != layout.num_blocks() {
            return Err(QuantError::corrupt_artifact(
                "ARTIFACT_SCALE_COUNT",
                "scale count does not match the number of blocks",
                "scales",
                format!("{} scales", layout.num_blocks()),
                format!("{} scales", scales),
            ));
        }

        Ok(())
    }

    /// Scale values must be usable: finite, non-negative, with one group
    /// scale per group when double-quantized
    pub fn validate_scales(scales: &ScaleMetadata) -> Result<()> {
        match scales {
            ScaleMetadata::Full(values) => {
                if let Some(i) = values.iter().position(|s| !s.is_finite() || *s < 0.0) {
                    return Err(QuantError::corrupt_artifact(
                        "ARTIFACT_BAD_SCALE",
                        format!("scale of block {} is negative or not finite", i),
                        "scales",
                        "a finite non-negative value",
                        values[i].to_string(),
                    ));
                }
            }
            ScaleMetadata::Double(dq) => {
                if dq.group_size == 0 {
                    return Err(QuantError::corrupt_artifact(
                        "ARTIFACT_ZERO_GROUP_SIZE",
                        "double quantization group size is zero",
                        "group_size",
                        "a positive group size",
                        "0",
                    ));
                }
                let groups = dq.indices.len().div_ceil(dq.group_size);
                if dq.group_scales.len() != groups {
                    return Err(QuantError::corrupt_artifact(
                        "ARTIFACT_GROUP_COUNT",
                        "second-level scale count does not match the number of groups",
                        "group_scales",
                        format!("{} groups", groups),
                        format!("{} groups", dq.group_scales.len()),
                    ));
                }
                if !dq.offset.is_finite() || dq.group_scales.iter().any(|g| !g.is_finite()) {
                    return Err(QuantError::corrupt_artifact(
                        "ARTIFACT_BAD_SCALE",
                        "double-quantized scale metadata is not finite",
                        "group_scales",
                        "finite values",
                        "non-finite value",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Two buffers that are combined element-wise must have equal lengths
    pub fn validate_same_length(expected: usize, actual: usize, operation: &str) -> Result<()> {
        if expected != actual {
            return Err(QuantError::shape_mismatch(
                "LENGTH_MISMATCH",
                format!("buffer lengths differ in {}", operation),
                format!("{} elements", expected),
                format!("{} elements", actual),
                operation,
            ));
        }
        Ok(())
    }
}
