//! Configuration for the paged optimizer

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::paging::policy::{CapacityPolicy, NeverMigrate, PressurePolicy, WatermarkPolicy};
use crate::state::StateMode;
use crate::{OptimError, Result};

/// Main configuration for [`crate::PagedAdam`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Adam hyperparameters
    pub adam: AdamParams,

    /// Optimizer state representation
    pub state: StateQuantConfig,

    /// Fast/slow tier budgets
    pub paging: PagingConfig,
}

/// Adam hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamParams {
    /// Step size
    pub learning_rate: f32,

    /// First moment decay
    pub beta1: f32,

    /// Second moment decay
    pub beta2: f32,

    /// Denominator guard
    pub epsilon: f32,

    /// Decoupled weight decay (AdamW); zero disables it
    pub weight_decay: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

impl AdamParams {
    /// Checks every hyperparameter range
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(OptimError::invalid_parameter(
                "ADAM_INVALID_LEARNING_RATE",
                "learning rate must be positive and finite",
                "learning_rate",
                self.learning_rate.to_string(),
                "(0, inf)",
            ));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(OptimError::invalid_parameter(
                    "ADAM_INVALID_BETA",
                    "moment decay must lie in [0, 1)",
                    name,
                    beta.to_string(),
                    "[0, 1)",
                ));
            }
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(OptimError::invalid_parameter(
                "ADAM_INVALID_EPSILON",
                "epsilon must be positive and finite",
                "epsilon",
                self.epsilon.to_string(),
                "(0, inf)",
            ));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(OptimError::invalid_parameter(
                "ADAM_INVALID_WEIGHT_DECAY",
                "weight decay must be non-negative and finite",
                "weight_decay",
                self.weight_decay.to_string(),
                "[0, inf)",
            ));
        }
        Ok(())
    }
}

/// How moment buffers are stored
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateQuantConfig {
    /// Full precision or block-wise 8-bit
    pub mode: StateMode,

    /// Elements per quantization block
    pub block_size: usize,

    /// Full-precision outliers kept per block
    pub outliers: usize,

    /// Parameters with fewer elements keep full-precision state
    pub min_quantized_numel: usize,

    /// Check every re-encoded block against its error bound
    pub verify_roundtrip: bool,
}

impl Default for StateQuantConfig {
    fn default() -> Self {
        Self {
            mode: StateMode::Blockwise8,
            block_size: 256,
            outliers: 2,
            min_quantized_numel: 4096,
            verify_roundtrip: false,
        }
    }
}

impl StateQuantConfig {
    /// Mode actually used for a parameter with `numel` elements
    pub fn mode_for(&self, numel: usize) -> StateMode {
        if numel < self.min_quantized_numel {
            StateMode::Full32
        } else {
            self.mode
        }
    }
}

/// Fast-tier budget, slow-tier capacity and migration behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PagingConfig {
    /// Bytes of state allowed in the fast tier
    pub fast_capacity_bytes: usize,

    /// Bytes the default host slow tier can hold
    pub slow_capacity_bytes: usize,

    /// Retries for a transfer that fails transiently
    pub max_transfer_retries: u32,

    /// When to migrate pages out of the fast tier
    pub policy: PolicyConfig,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            fast_capacity_bytes: 256 * 1024 * 1024,
            slow_capacity_bytes: 2 * 1024 * 1024 * 1024,
            max_transfer_retries: 3,
            policy: PolicyConfig::Capacity,
        }
    }
}

/// Serializable choice of pressure policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicyConfig {
    /// Migrate only what an incoming allocation needs
    Capacity,
    /// Start above `high`, keep going down to `low` (fractions of the budget)
    Watermark { high: f64, low: f64 },
    /// Never migrate
    Never,
}

impl PolicyConfig {
    /// Builds the policy object
    pub fn build(&self) -> Box<dyn PressurePolicy> {
        match *self {
            PolicyConfig::Capacity => Box::new(CapacityPolicy),
            PolicyConfig::Watermark { high, low } => Box::new(WatermarkPolicy::new(high, low)),
            PolicyConfig::Never => Box::new(NeverMigrate),
        }
    }
}

impl PagingConfig {
    /// Checks budgets and policy bounds
    pub fn validate(&self) -> Result<()> {
        if self.fast_capacity_bytes == 0 {
            return Err(OptimError::configuration(
                "CONFIG_FAST_CAPACITY",
                "fast_capacity_bytes must be greater than 0",
                "paging configuration",
                "Set a fast-tier budget in bytes",
            ));
        }
        if let PolicyConfig::Watermark { high, low } = self.policy {
            if !(0.0 < low && low <= high && high <= 1.0) {
                return Err(OptimError::configuration(
                    "CONFIG_WATERMARKS",
                    format!("watermarks must satisfy 0 < low <= high <= 1 (got low {}, high {})", low, high),
                    "paging configuration",
                    "Use for example high = 0.9 and low = 0.7",
                ));
            }
        }
        Ok(())
    }
}

impl OptimizerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            let mut err = OptimError::from(e);
            if let OptimError::Io { path: p, .. } = &mut err {
                *p = Some(path.to_path_buf());
            }
            err
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            let mut err = OptimError::from(e);
            if let OptimError::Configuration { config_path, .. } = &mut err {
                *config_path = Some(path.to_path_buf());
            }
            err
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.adam.validate()?;

        if self.state.block_size == 0 {
            return Err(OptimError::Configuration {
                code: "CONFIG_STATE_BLOCK_SIZE",
                message: "state block_size must be greater than 0".to_string(),
                context: "state configuration".to_string(),
                suggestion: "Use a block size such as 256 or 2048".to_string(),
                config_path: None,
                field_name: Some("state.block_size".to_string()),
            });
        }

        if self.state.outliers > self.state.block_size {
            return Err(OptimError::Configuration {
                code: "CONFIG_STATE_OUTLIERS",
                message: format!(
                    "outliers per block ({}) exceed the block size ({})",
                    self.state.outliers, self.state.block_size
                ),
                context: "state configuration".to_string(),
                suggestion: "Keep a handful of outliers per block, or 0 to disable them".to_string(),
                config_path: None,
                field_name: Some("state.outliers".to_string()),
            });
        }

        self.paging.validate()
    }
}
