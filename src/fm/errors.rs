//! # Rebuild Errors

use thiserror::Error;
use uuid::Uuid;

/// Result type for rebuild operations
pub type RebuildResult<T> = Result<T, RebuildError>;

/// Rebuild errors
///
/// "Not generated" is not an error: `generate` returns `Ok(None)` when no
/// configuration can be established from the reports.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RebuildError {
    #[error("Ambiguous primary for {failover_unit}: nodes {first} and {second} both reported as primary at the same epoch")]
    AmbiguousPrimary {
        failover_unit: Uuid,
        first: u64,
        second: u64,
    },

    #[error("Inconsistent report: {0}")]
    InconsistentReport(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),
}

impl RebuildError {
    /// Two primaries at one epoch means the reconfiguration protocol was
    /// broken somewhere; nothing sensible can be rebuilt from it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RebuildError::AmbiguousPrimary { .. })
    }

    /// Stable code for CLI output
    pub fn code(&self) -> &'static str {
        match self {
            RebuildError::AmbiguousPrimary { .. } => "FABRIC_REBUILD_AMBIGUOUS_PRIMARY",
            RebuildError::InconsistentReport(_) => "FABRIC_REBUILD_INCONSISTENT_REPORT",
            RebuildError::UnknownService(_) => "FABRIC_REBUILD_UNKNOWN_SERVICE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ambiguous_primary_is_fatal() {
        let err = RebuildError::AmbiguousPrimary {
            failover_unit: Uuid::nil(),
            first: 1,
            second: 2,
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("nodes 1 and 2"));
    }

    #[test]
    fn test_codes() {
        assert!(!RebuildError::UnknownService("svc".into()).is_fatal());
        assert_eq!(
            RebuildError::InconsistentReport("x".into()).code(),
            "FABRIC_REBUILD_INCONSISTENT_REPORT"
        );
    }
}
