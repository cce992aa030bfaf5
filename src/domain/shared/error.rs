//! Domain errors

use crate::domain::capability::{BindingFailure, Intent};
use crate::domain::leg::LegState;
use crate::domain::shared::value_objects::LegId;
use thiserror::Error;

/// Domain result type
pub type Result<T> = std::result::Result<T, DomainError>;

#[derive(Error, Debug, Clone)]
pub enum DomainError {
    /// No capability binding succeeded for a required intent
    #[error("No capability binding succeeded for {intent}: {}", summarize(.failures))]
    CapabilityExhausted {
        intent: Intent,
        failures: Vec<BindingFailure>,
    },

    /// Rejected before any state was mutated
    #[error("Precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("Timed out waiting for leg {leg} to reach {expected} after {waited_ms}ms")]
    TimeoutWaitingForState {
        leg: LegId,
        expected: LegState,
        waited_ms: u64,
    },

    /// Secondary teardown failed after the primary outcome was already decided
    #[error("Partial cleanup failure on leg {leg}: {reason}")]
    PartialCleanupFailure { leg: LegId, reason: String },

    #[error("Leg {0} disconnected")]
    LegDisconnected(LegId),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Entity not found: {0}")]
    NotFound(String),

    #[error("Entity already exists: {0}")]
    AlreadyExists(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// Errors that trigger the "leave the caller reachable" rollback
    pub fn is_capability_failure(&self) -> bool {
        matches!(
            self,
            DomainError::CapabilityExhausted { .. }
                | DomainError::TimeoutWaitingForState { .. }
                | DomainError::LegDisconnected(_)
        )
    }

    /// Binding failures carried by this error, if any
    pub fn binding_failures(&self) -> &[BindingFailure] {
        match self {
            DomainError::CapabilityExhausted { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn summarize(failures: &[BindingFailure]) -> String {
    if failures.is_empty() {
        return "no supported binding".to_string();
    }

    failures
        .iter()
        .map(|f| format!("{} ({})", f.binding, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::capability::CapabilityBinding;

    #[test]
    fn test_capability_failure_classification() {
        let exhausted = DomainError::CapabilityExhausted {
            intent: Intent::Transfer,
            failures: vec![],
        };
        assert!(exhausted.is_capability_failure());
        assert!(exhausted.to_string().contains("no supported binding"));

        let timeout = DomainError::TimeoutWaitingForState {
            leg: LegId::from("sim-1"),
            expected: LegState::Connected,
            waited_ms: 100,
        };
        assert!(timeout.is_capability_failure());

        assert!(!DomainError::PreconditionViolation("x".to_string()).is_capability_failure());
        assert!(!DomainError::Cancelled.is_capability_failure());
    }

    #[test]
    fn test_exhausted_message_lists_bindings() {
        let err = DomainError::CapabilityExhausted {
            intent: Intent::Hold,
            failures: vec![BindingFailure::new(
                CapabilityBinding::EndpointHold,
                "rejected".to_string(),
            )],
        };
        let message = err.to_string();
        assert!(message.contains("endpoint_hold"));
        assert!(message.contains("rejected"));
        assert_eq!(err.binding_failures().len(), 1);
    }
}
