//! Lifecycle and session error types.

use thiserror::Error;
use vmfleet_core::{ErrorCode, VmStatus};
use vmfleet_state::StateError;

use crate::backend::BackendError;

/// Errors returned by lifecycle and session operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("VM not found: {0}")]
    VmNotFound(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid transition for VM {vm_id}: {from} -> {to}")]
    InvalidTransition {
        vm_id: String,
        from: VmStatus,
        to: VmStatus,
    },

    #[error("VM {vm_id} is {status}; expected {expected}")]
    InvalidStatus {
        vm_id: String,
        status: VmStatus,
        expected: &'static str,
    },

    #[error("VM {vm_id} is at capacity ({current}/{max} sessions)")]
    AtCapacity { vm_id: String, current: u32, max: u32 },

    #[error("session {session_id} is not assigned to VM {vm_id}")]
    SessionNotOnVm { session_id: String, vm_id: String },

    #[error("session {session_id} is already assigned to VM {vm_id}")]
    SessionAlreadyAssigned { session_id: String, vm_id: String },

    #[error("compute backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}

pub type LifecycleResult<T> = Result<T, LifecycleError>;

/// Coarse error taxonomy used when reporting failures to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input. Never retried.
    Validation,
    NotFound,
    /// VM or fleet out of session slots; the caller owns backoff.
    Capacity,
    /// Retried internally with backoff.
    TransientInfra,
    /// VM left in `ERROR` for an operator.
    Terminal,
    Internal,
}

impl ErrorClass {
    /// Class of a VM error code.
    pub fn for_code(code: &ErrorCode) -> Self {
        if code.is_retryable() {
            ErrorClass::TransientInfra
        } else {
            ErrorClass::Terminal
        }
    }
}

impl LifecycleError {
    /// Which class of failure this is, for callers deciding whether to retry.
    pub fn kind(&self) -> ErrorClass {
        match self {
            LifecycleError::Validation(_)
            | LifecycleError::InvalidTransition { .. }
            | LifecycleError::InvalidStatus { .. }
            | LifecycleError::SessionNotOnVm { .. }
            | LifecycleError::SessionAlreadyAssigned { .. } => ErrorClass::Validation,
            LifecycleError::TemplateNotFound(_)
            | LifecycleError::VmNotFound(_)
            | LifecycleError::SessionNotFound(_) => ErrorClass::NotFound,
            LifecycleError::AtCapacity { .. } => ErrorClass::Capacity,
            LifecycleError::Backend(_) => ErrorClass::TransientInfra,
            LifecycleError::State(_) => ErrorClass::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_classified() {
        let err = LifecycleError::AtCapacity { vm_id: "vm-1".into(), current: 2, max: 2 };
        assert_eq!(err.kind(), ErrorClass::Capacity);
        assert_eq!(err.to_string(), "VM vm-1 is at capacity (2/2 sessions)");
    }

    #[test]
    fn code_classes() {
        assert_eq!(ErrorClass::for_code(&ErrorCode::NetworkError), ErrorClass::TransientInfra);
        assert_eq!(ErrorClass::for_code(&ErrorCode::HeartbeatUnhealthy), ErrorClass::Terminal);
        assert_eq!(LifecycleError::VmNotFound("x".into()).kind(), ErrorClass::NotFound);
    }
}
