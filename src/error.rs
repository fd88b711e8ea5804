//! Unified error handling for astflow
//!
//! All fatal conditions surface through a single error type with a
//! human-readable message; per-line parse anomalies are recovered locally
//! by the parser and never reach this type.

use std::error::Error as StdError;
use std::fmt;
use std::path::PathBuf;

/// Unified error type for astflow operations
#[derive(Debug, Clone, PartialEq)]
pub enum AstflowError {
    /// Log or CDR path does not exist
    InputNotFound { path: PathBuf },

    /// Binary search found no timestamped data in the requested direction
    EmptyWindow { direction: &'static str, bound: String },

    /// The computed byte span is negative (misordered window bounds)
    NegativeSpan,

    /// Selected data would exceed the configured share of system memory
    MemoryRefusal { required: u64, limit_pct: u32 },

    /// Incompatible configuration options
    InvalidArgument { message: String },

    /// Underlying I/O failure, carried as text so the error stays cloneable
    Io { message: String },
}

impl fmt::Display for AstflowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AstflowError::InputNotFound { path } => {
                write!(f, "No such file: {}", path.display())
            }
            AstflowError::EmptyWindow { direction, bound } => {
                write!(f, "No data {} {}", direction, bound)
            }
            AstflowError::NegativeSpan => {
                write!(f, "Negative number of bytes is specified")
            }
            AstflowError::MemoryRefusal { required, limit_pct } => {
                write!(
                    f,
                    "Refusing to analyse: too much data ({} bytes), more than {}% of system memory",
                    required, limit_pct
                )
            }
            AstflowError::InvalidArgument { message } => {
                write!(f, "Invalid argument: {}", message)
            }
            AstflowError::Io { message } => {
                write!(f, "I/O error: {}", message)
            }
        }
    }
}

impl StdError for AstflowError {}

impl From<std::io::Error> for AstflowError {
    fn from(err: std::io::Error) -> Self {
        AstflowError::Io {
            message: err.to_string(),
        }
    }
}

impl AstflowError {
    /// Create an input-not-found error for a missing path
    pub fn input_not_found(path: impl Into<PathBuf>) -> Self {
        AstflowError::InputNotFound { path: path.into() }
    }

    /// Create an empty-window error for a search direction and bound
    pub fn empty_window(direction: &'static str, bound: impl Into<String>) -> Self {
        AstflowError::EmptyWindow {
            direction,
            bound: bound.into(),
        }
    }

    /// Create an invalid-argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        AstflowError::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether retrying with a different window could succeed
    pub fn is_window_error(&self) -> bool {
        matches!(
            self,
            AstflowError::EmptyWindow { .. }
                | AstflowError::NegativeSpan
                | AstflowError::MemoryRefusal { .. }
        )
    }
}

/// Result type for astflow operations
pub type AstflowResult<T> = Result<T, AstflowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = AstflowError::input_not_found("/tmp/missing.log");
        assert!(err.to_string().contains("No such file"));

        let err = AstflowError::empty_window("after", "2024-01-01 10:00:00");
        assert!(err.to_string().contains("No data after"));

        let err = AstflowError::MemoryRefusal {
            required: 1 << 30,
            limit_pct: 5,
        };
        assert!(err.to_string().contains("5%"));
    }

    #[test]
    fn test_window_error_classification() {
        assert!(AstflowError::NegativeSpan.is_window_error());
        assert!(!AstflowError::input_not_found("x").is_window_error());
    }
}
