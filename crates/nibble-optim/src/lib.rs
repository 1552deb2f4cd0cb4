//! Nibble Optim - paged, 8-bit optimizer state
//!
//! This crate keeps Adam moment buffers block-wise quantized to 8 bits and
//! lets them migrate between a capacity-limited fast tier and a larger slow
//! tier on memory pressure. Migration back is synchronous: a step never reads
//! state whose migration has not finished.

// Module declarations
pub mod adam;
pub mod config;
pub mod paging;
pub mod state;

use std::path::PathBuf;

use nibble_quant::QuantError;
use thiserror::Error;

/// Errors raised by the optimizer, its state codec and the paging manager
#[derive(Error, Debug)]
pub enum OptimError {
    /// Neither tier can hold a page, or a transfer kept failing
    #[error("Residency exhausted [{code}]: {message}\nPage: {page}\nRequested: {requested} bytes\nSuggestion: {suggestion}")]
    ResidencyExhausted {
        code: &'static str,
        message: String,
        page: String,
        requested: usize,
        suggestion: String,
    },

    /// The page id is not registered
    #[error("Unknown page [{code}]: {page}")]
    UnknownPage {
        code: &'static str,
        page: String,
    },

    /// The page is pinned or migrating
    #[error("Page busy [{code}]: {message}\nPage: {page}\nPins: {pins}")]
    PageBusy {
        code: &'static str,
        message: String,
        page: String,
        pins: usize,
    },

    /// A hyperparameter or argument is out of range
    #[error("Invalid parameter [{code}]: {message}\nParameter: {parameter}\nValue: {value}\nValid range: {valid_range}")]
    InvalidParameter {
        code: &'static str,
        message: String,
        parameter: String,
        value: String,
        valid_range: String,
    },

    /// Configuration parsing and validation errors
    #[error("Configuration error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        config_path: Option<PathBuf>,
        field_name: Option<String>,
    },

    /// Optimizer state failed a consistency check
    #[error("State corruption [{code}]: {message}\nContext: {context}")]
    StateCorruption {
        code: &'static str,
        message: String,
        context: String,
    },

    /// File system and I/O errors
    #[error("IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    Io {
        code: &'static str,
        message: String,
        path: Option<PathBuf>,
        suggestion: String,
        #[source]
        source: std::io::Error,
    },

    /// Quantization errors from the state codec
    #[error(transparent)]
    Quant(#[from] QuantError),
}

pub type Result<T> = std::result::Result<T, OptimError>;

impl OptimError {
    /// Create a residency exhausted error for a page
    pub fn residency_exhausted<S: Into<String>>(page: impl ToString, requested: usize, message: S) -> Self {
        Self::ResidencyExhausted {
            code: "PAGING_RESIDENCY_EXHAUSTED",
            message: message.into(),
            page: page.to_string(),
            requested,
            suggestion: "Raise the fast or slow tier capacity, or release unused optimizer state".to_string(),
        }
    }

    /// Create an unknown page error
    pub fn unknown_page(page: impl ToString) -> Self {
        Self::UnknownPage {
            code: "PAGING_UNKNOWN_PAGE",
            page: page.to_string(),
        }
    }

    /// Create a page busy error
    pub fn page_busy<S: Into<String>>(page: impl ToString, pins: usize, message: S) -> Self {
        Self::PageBusy {
            code: "PAGING_PAGE_BUSY",
            message: message.into(),
            page: page.to_string(),
            pins,
        }
    }

    /// Create an invalid parameter error with its valid range
    pub fn invalid_parameter<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        parameter: S2,
        value: S3,
        valid_range: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self::InvalidParameter {
            code,
            message: message.into(),
            parameter: parameter.into(),
            value: value.into(),
            valid_range: valid_range.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: None,
            field_name: None,
        }
    }

    /// Create a state corruption error
    pub fn state_corruption<S1, S2>(code: &'static str, message: S1, context: S2) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::StateCorruption {
            code,
            message: message.into(),
            context: context.into(),
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::ResidencyExhausted { code, .. } => code,
            Self::UnknownPage { code, .. } => code,
            Self::PageBusy { code, .. } => code,
            Self::InvalidParameter { code, .. } => code,
            Self::Configuration { code, .. } => code,
            Self::StateCorruption { code, .. } => code,
            Self::Io { code, .. } => code,
            Self::Quant(err) => err.code(),
        }
    }
}

impl From<std::io::Error> for OptimError {
    fn from(err: std::io::Error) -> Self {
        let (code, suggestion) = match err.kind() {
            std::io::ErrorKind::NotFound => (
                "IO_FILE_NOT_FOUND",
                "Check that the file path is correct and the file exists"
            ),
            std::io::ErrorKind::PermissionDenied => (
                "IO_PERMISSION_DENIED",
                "Check file permissions or run with appropriate privileges"
            ),
            std::io::ErrorKind::UnexpectedEof => (
                "IO_UNEXPECTED_EOF",
                "The data is truncated"
            ),
            _ => (
                "IO_UNKNOWN",
                "Check the file system and try the operation again"
            ),
        };

        Self::Io {
            code,
            message: err.to_string(),
            path: None,
            suggestion: suggestion.to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for OptimError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(
            "CONFIG_PARSE_FAILED",
            err.to_string(),
            "parsing optimizer configuration",
            "Check the TOML syntax and field names",
        )
    }
}

impl From<toml::ser::Error> for OptimError {
    fn from(err: toml::ser::Error) -> Self {
        Self::configuration(
            "CONFIG_SERIALIZE_FAILED",
            err.to_string(),
            "serializing optimizer configuration",
            "Check that every configuration value is representable in TOML",
        )
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        adam::{adam_update_block, PagedAdam, StateHandle, StateSnapshot},
        config::{AdamParams, OptimizerConfig, PagingConfig, PolicyConfig, StateQuantConfig},
        paging::{
            PageDescriptor, PageGuard, PageId, Pageable, PagingManager, PagingStats, Residency,
            policy::{CapacityPolicy, NeverMigrate, PressurePolicy, PressureSnapshot, WatermarkPolicy},
            tier::{HostTier, SlowTier, TierError},
        },
        state::{QuantizedState, StateBuffer, StateMode, StateRecord},
        OptimError, Result,
    };
}

// Re-export key types at the crate root
pub use adam::{PagedAdam, StateHandle};
pub use config::OptimizerConfig;
pub use paging::{PageId, PagingManager};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(OptimError::unknown_page("p").code(), "PAGING_UNKNOWN_PAGE");
        let quant: OptimError = QuantError::invalid_block_size(0, "state").into();
        assert_eq!(quant.code(), "QUANT_INVALID_BLOCK_SIZE");

        let io: OptimError = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(io.code(), "IO_FILE_NOT_FOUND");
    }

    #[test]
    fn test_toml_errors_are_configuration() {
        let err: OptimError = toml::from_str::<OptimizerConfig>("adam = 3").unwrap_err().into();
        assert!(matches!(err, OptimError::Configuration { .. }));
    }
}
