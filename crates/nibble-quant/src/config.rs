//! Quantization configuration, validated once at construction

use serde::{Deserialize, Serialize};

use crate::codebook::CodebookKind;
use crate::error::{QuantError, Result};
use crate::tensor::ComputeDType;

/// Default number of elements sharing one scale
pub const DEFAULT_BLOCK_SIZE: usize = 64;

/// Default number of first-level scales sharing one second-level scale
pub const DEFAULT_DOUBLE_QUANT_GROUP: usize = 256;

/// Raw, unvalidated quantization settings as read from a caller's config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantSettings {
    /// Elements per block
    pub block_size: usize,
    /// Codebook used for weights
    pub codebook: CodebookKind,
    /// Whether per-block scales are themselves quantized
    pub double_quant: bool,
    /// Scales per second-level group when `double_quant` is set
    pub double_quant_group: usize,
    /// Precision of dequantized output
    pub compute_dtype: ComputeDType,
}

impl Default for QuantSettings {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            codebook: CodebookKind::Nf4,
            double_quant: false,
            double_quant_group: DEFAULT_DOUBLE_QUANT_GROUP,
            compute_dtype: ComputeDType::F32,
        }
    }
}

/// Validated, immutable quantization configuration.
///
/// The conservative baseline (`Default`) is NF4, block size 64, f32 compute
/// and no double quantization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "QuantSettings", into = "QuantSettings")]
pub struct QuantConfig {
    block_size: usize,
    codebook: CodebookKind,
    double_quant: bool,
    double_quant_group: usize,
    compute_dtype: ComputeDType,
}

impl Default for QuantConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            codebook: CodebookKind::Nf4,
            double_quant: false,
            double_quant_group: DEFAULT_DOUBLE_QUANT_GROUP,
            compute_dtype: ComputeDType::F32,
        }
    }
}

impl QuantConfig {
    /// Validates raw settings
    pub fn new(settings: QuantSettings) -> Result<Self> {
        if settings.block_size == 0 {
            return Err(QuantError::invalid_block_size(settings.block_size, "quantization config"));
        }

        if !settings.codebook.is_signed() {
            return Err(QuantError::unsupported_codebook(
                "CODEBOOK_NOT_PROVISIONED",
                "unsigned codebooks cannot represent signed weights",
                settings.codebook.name(),
                "weight quantization",
            ));
        }

        if settings.double_quant && settings.double_quant_group == 0 {
            return Err(QuantError::invalid_config(
                "CONFIG_DOUBLE_QUANT_GROUP",
                "double quantization group size must be positive",
                "double_quant_group",
                "0",
                "Use the default group size of 256",
            ));
        }

        Ok(Self {
            block_size: settings.block_size,
            codebook: settings.codebook,
            double_quant: settings.double_quant,
            double_quant_group: settings.double_quant_group,
            compute_dtype: settings.compute_dtype,
        })
    }

    /// Starts a builder from the default settings
    pub fn builder() -> QuantConfigBuilder {
        QuantConfigBuilder { settings: QuantSettings::default() }
    }

    /// Elements per block
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Codebook used for weights
    pub fn codebook(&self) -> CodebookKind {
        self.codebook
    }

    /// Whether scales are double-quantized
    pub fn double_quant(&self) -> bool {
        self.double_quant
    }

    /// Scales per second-level group
    pub fn double_quant_group(&self) -> usize {
        self.double_quant_group
    }

    /// Precision of dequantized output
    pub fn compute_dtype(&self) -> ComputeDType {
        self.compute_dtype
    }
}

impl TryFrom<QuantSettings> for QuantConfig {
    type Error = QuantError;

    fn try_from(settings: QuantSettings) -> Result<Self> {
        QuantConfig::new(settings)
    }
}

impl From<QuantConfig> for QuantSettings {
    fn from(config: QuantConfig) -> Self {
        Self {
            block_size: config.block_size,
            codebook: config.codebook,
            double_quant: config.double_quant,
            double_quant_group: config.double_quant_group,
            compute_dtype: config.compute_dtype,
        }
    }
}

/// Builder for [`QuantConfig`]
#[derive(Debug, Clone)]
pub struct QuantConfigBuilder {
    settings: QuantSettings,
}

impl QuantConfigBuilder {
    /// Sets the block size
    pub fn block_size(mut self, block_size: usize) -> Self {
        self.settings.block_size = block_size;
        self
    }

    /// Sets the codebook
    pub fn codebook(mut self, codebook: CodebookKind) -> Self {
        self.settings.codebook = codebook;
        self
    }

    /// Enables or disables double quantization
    pub fn double_quant(mut self, enabled: bool) -> Self {
        self.settings.double_quant = enabled;
        self
    }

    /// Sets the double quantization group size
    pub fn double_quant_group(mut self, group: usize) -> Self {
        self.settings.double_quant_group = group;
        self
    }

    /// Sets the compute dtype
    pub fn compute_dtype(mut self, dtype: ComputeDType) -> Self {
        self.settings.compute_dtype = dtype;
        self
    }

    /// Validates and builds the configuration
    pub fn build(self) -> Result<QuantConfig> {
        QuantConfig::new(self.settings)
    }
}
