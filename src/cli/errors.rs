//! CLI-specific error types
//!
//! Every CLI error ends the process with exit code 1.

use std::fmt;
use std::io;

use crate::fm::RebuildError;
use crate::ra::RaError;

/// CLI error codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliErrorCode {
    /// Configuration file missing, malformed or rejected
    ConfigError,
    /// File or stdout I/O failed
    IoError,
    /// A node report could not be parsed or does not fit the others
    InvalidReport,
    /// Rebuild hit an invariant violation
    RebuildFailed,
}

impl CliErrorCode {
    /// Get the error code string
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigError => "FABRIC_CLI_CONFIG_ERROR",
            Self::IoError => "FABRIC_CLI_IO_ERROR",
            Self::InvalidReport => "FABRIC_CLI_INVALID_REPORT",
            Self::RebuildFailed => "FABRIC_CLI_REBUILD_FAILED",
        }
    }
}

/// CLI error
#[derive(Debug)]
pub struct CliError {
    code: CliErrorCode,
    message: String,
}

impl CliError {
    pub fn new(code: CliErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::ConfigError, msg)
    }

    pub fn io_error(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::IoError, msg)
    }

    pub fn invalid_report(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::InvalidReport, msg)
    }

    pub fn rebuild_failed(msg: impl Into<String>) -> Self {
        Self::new(CliErrorCode::RebuildFailed, msg)
    }

    /// Get the error code
    pub fn code(&self) -> &CliErrorCode {
        &self.code
    }

    /// Get the error code string
    pub fn code_str(&self) -> &'static str {
        self.code.code()
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.code(), self.message)
    }
}

impl std::error::Error for CliError {}

impl From<io::Error> for CliError {
    fn from(e: io::Error) -> Self {
        Self::io_error(e.to_string())
    }
}

impl From<serde_json::Error> for CliError {
    fn from(e: serde_json::Error) -> Self {
        Self::io_error(format!("JSON error: {}", e))
    }
}

impl From<RaError> for CliError {
    fn from(e: RaError) -> Self {
        Self::config_error(e.to_string())
    }
}

impl From<RebuildError> for CliError {
    fn from(e: RebuildError) -> Self {
        match e {
            RebuildError::AmbiguousPrimary { .. } => Self::rebuild_failed(e.to_string()),
            RebuildError::InconsistentReport(_) | RebuildError::UnknownService(_) => {
                Self::invalid_report(e.to_string())
            }
        }
    }
}

/// CLI result type
pub type CliResult<T> = Result<T, CliError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_code() {
        let err = CliError::config_error("missing field");
        assert_eq!(err.to_string(), "FABRIC_CLI_CONFIG_ERROR: missing field");
    }

    #[test]
    fn test_ambiguous_primary_maps_to_rebuild_failed() {
        let err: CliError = RebuildError::AmbiguousPrimary {
            failover_unit: uuid::Uuid::nil(),
            first: 1,
            second: 2,
        }
        .into();
        assert_eq!(err.code(), &CliErrorCode::RebuildFailed);
    }
}
