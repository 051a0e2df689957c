//! Reconfiguration agent error types
//!
//! Stale input is not an error: it is dropped and logged. Errors here are
//! either caller mistakes (wrong state, malformed message) or invariant
//! violations, which are fatal for the failover unit.

use std::fmt;

#[derive(Debug, Clone)]
pub struct RaError {
    pub kind: RaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaErrorKind {
    /// Operation not allowed in the failover unit's current state
    InvalidState,

    /// Message is internally inconsistent
    InvalidMessage,

    /// Failover unit is closed
    Closed,

    /// A replica the operation names is not in the store
    ReplicaNotFound,

    /// Internal consistency check failed
    InvariantViolation,

    /// Configuration rejected by validation
    Configuration,
}

impl RaError {
    pub fn new(kind: RaErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new(RaErrorKind::InvalidState, message)
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::new(RaErrorKind::InvalidMessage, message)
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self::new(RaErrorKind::Closed, message)
    }

    pub fn replica_not_found(message: impl Into<String>) -> Self {
        Self::new(RaErrorKind::ReplicaNotFound, message)
    }

    pub fn invariant_violation(message: impl Into<String>) -> Self {
        Self::new(RaErrorKind::InvariantViolation, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(RaErrorKind::Configuration, message)
    }

    /// Fatal errors mean the failover unit state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self.kind, RaErrorKind::InvariantViolation)
    }
}

impl fmt::Display for RaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RaError({:?}): {}", self.kind, self.message)
    }
}

impl std::error::Error for RaError {}

pub type RaResult<T> = Result<T, RaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(RaError::invariant_violation("two primaries").is_fatal());
    }

    #[test]
    fn test_non_fatal_errors() {
        assert!(!RaError::invalid_state("test").is_fatal());
        assert!(!RaError::closed("test").is_fatal());
        assert!(!RaError::replica_not_found("test").is_fatal());
        assert!(!RaError::configuration("test").is_fatal());
    }

    #[test]
    fn test_display() {
        let err = RaError::invalid_message("no primary");
        assert_eq!(err.to_string(), "RaError(InvalidMessage): no primary");
    }
}
