//! Error types for quantization and dequantization

use thiserror::Error;

/// Errors that can occur while quantizing or dequantizing tensors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantError {
    /// Block size is zero
    #[error("Invalid block size [{code}]: {message}\nBlock size: {block_size}\nSuggestion: {suggestion}")]
    InvalidBlockSize {
        /// Error code for programmatic handling
        code: &'static str,
        /// Human-readable error message
        message: String,
        /// The rejected block size
        block_size: usize,
        /// Suggested fix for the error
        suggestion: String,
    },

    /// Codebook variant is unknown or not provisioned for the requested operation
    #[error("Unsupported codebook [{code}]: {message}\nRequested: {requested}\nOperation: {operation}\nSuggestion: {suggestion}")]
    UnsupportedCodebookKind {
        /// Error code for programmatic handling
        code: &'static str,
        /// Human-readable error message
        message: String,
        /// The codebook name that was requested
        requested: String,
        /// The operation that rejected it
        operation: String,
        /// Suggested fix for the error
        suggestion: String,
    },

    /// A block statistic came out non-finite
    #[error("Numeric overflow [{code}]: {message}\nBlock: {block_index}, Value: {value}\nSuggestion: {suggestion}")]
    NumericOverflow {
        /// Error code for programmatic handling
        code: &'static str,
        /// Human-readable error message
        message: String,
        /// Index of the offending block (or scale group)
        block_index: usize,
        /// The non-finite statistic
        value: f32,
        /// Suggested fix for the error
        suggestion: String,
    },

    /// Data length and shape disagree
    #[error("Shape mismatch [{code}]: {message}\nExpected: {expected}\nActual: {actual}\nOperation: {operation}")]
    ShapeMismatch {
        /// Error code for programmatic handling
        code: &'static str,
        /// Human-readable error message
        message: String,
        /// Expected size description
        expected: String,
        /// Actual size description
        actual: String,
        /// The operation that failed
        operation: String,
    },

    /// A quantized artifact is inconsistent with its own shape or the supplied config
    #[error("Corrupt artifact [{code}]: {message}\nField: {field}\nExpected: {expected}\nActual: {actual}")]
    CorruptArtifact {
        /// Error code for programmatic handling
        code: &'static str,
        /// Human-readable error message
        message: String,
        /// Name of the inconsistent field
        field: String,
        /// Expected value description
        expected: String,
        /// Actual value description
        actual: String,
    },

    /// A configuration value is out of range
    #[error("Invalid configuration [{code}]: {message}\nField: {field}\nValue: {value}\nSuggestion: {suggestion}")]
    InvalidConfig {
        /// Error code for programmatic handling
        code: &'static str,
        /// Human-readable error message
        message: String,
        /// Name of the offending field
        field: String,
        /// The rejected value
        value: String,
        /// Suggested fix for the error
        suggestion: String,
    },
}

/// Convenient result type for quantization operations
pub type Result<T> = std::result::Result<T, QuantError>;

impl QuantError {
    /// Create an invalid block size error
    pub fn invalid_block_size<S: Into<String>>(block_size: usize, operation: S) -> Self {
        Self::InvalidBlockSize {
            code: "QUANT_INVALID_BLOCK_SIZE",
            message: format!("block size must be positive for {}", operation.into()),
            block_size,
            suggestion: "Use a block size such as 64, 128 or 256".to_string(),
        }
    }

    /// Create an unsupported codebook error
    pub fn unsupported_codebook<S1, S2, S3>(
        code: &'static str,
        message: S1,
        requested: S2,
        operation: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::UnsupportedCodebookKind {
            code,
            message: message.into(),
            requested: requested.into(),
            operation: operation.into(),
            suggestion: "Use one of: nf4, fp4, dynamic8".to_string(),
        }
    }

    /// Create a numeric overflow error for a block whose statistic is not finite
    pub fn numeric_overflow<S: Into<String>>(block_index: usize, value: f32, what: S) -> Self {
        Self::NumericOverflow {
            code: "QUANT_NON_FINITE_SCALE",
            message: format!("{} is not finite", what.into()),
            block_index,
            value,
            suggestion: "Check the input for NaN or infinite values before quantizing".to_string(),
        }
    }

    /// Create a shape mismatch error
    pub fn shape_mismatch<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        expected: S2,
        actual: S3,
        operation: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self::ShapeMismatch {
            code,
            message: message.into(),
            expected: expected.into(),
            actual: actual.into(),
            operation: operation.into(),
        }
    }

    /// Create a corrupt artifact error
    pub fn corrupt_artifact<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        field: S2,
        expected: S3,
        actual: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self::CorruptArtifact {
            code,
            message: message.into(),
            field: field.into(),
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S1, S2, S3, S4>(
        code: &'static str,
        message: S1,
        field: S2,
        value: S3,
        suggestion: S4,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
    {
        Self::InvalidConfig {
            code,
            message: message.into(),
            field: field.into(),
            value: value.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidBlockSize { code, .. } => code,
            Self::UnsupportedCodebookKind { code, .. } => code,
            Self::NumericOverflow { code, .. } => code,
            Self::ShapeMismatch { code, .. } => code,
            Self::CorruptArtifact { code, .. } => code,
            Self::InvalidConfig { code, .. } => code,
        }
    }

    /// Check if this error stems from bad numeric input rather than bad parameters
    pub fn is_numeric_error(&self) -> bool {
        matches!(self, Self::NumericOverflow { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(QuantError::invalid_block_size(0, "quantize").code(), "QUANT_INVALID_BLOCK_SIZE");
        let err = QuantError::numeric_overflow(3, f32::NAN, "absmax of block 3");
        assert_eq!(err.code(), "QUANT_NON_FINITE_SCALE");
        assert!(err.is_numeric_error());
    }

    #[test]
    fn test_error_display_carries_context() {
        let err = QuantError::unsupported_codebook(
            "CODEBOOK_UNKNOWN",
            "unknown codebook name",
            "nf3",
            "parse",
        );
        let text = err.to_string();
        assert!(text.contains("nf3"));
        assert!(text.contains("CODEBOOK_UNKNOWN"));
    }
}
