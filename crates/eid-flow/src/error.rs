//! Flow orchestration errors

use eid_core::{AdapterError, CallbackError, SecretError, SecretKind};
use thiserror::Error;

use crate::retry::AttemptError;

/// Result type for flow operations
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors raised by the flow state machines and the coordinator
#[derive(Debug, Error)]
pub enum FlowError {
    /// The event is not valid in the current state
    #[error("Illegal transition: {event} in state {state}")]
    IllegalTransition { state: String, event: String },

    /// New PIN and confirmation differ; the state is unchanged
    #[error("PIN confirmation does not match the new PIN")]
    PinConfirmationFailed,

    /// Malformed digit string
    #[error("Invalid secret: {0}")]
    InvalidSecret(#[from] SecretError),

    /// The card reported an impossible attempt count
    #[error("Attempt counter violation: {0}")]
    Attempts(#[from] AttemptError),

    /// A secret the transition needs was never entered
    #[error("Missing {0}")]
    MissingSecret(SecretKind),

    /// CAN sub-flow event while no sub-flow is running
    #[error("No CAN sub-flow active")]
    CanFlowNotActive,

    /// Pending request misuse
    #[error("Pending request: {0}")]
    Callback(#[from] CallbackError),

    /// Adapter command failed
    #[error("Adapter: {0}")]
    Adapter(#[from] AdapterError),

    /// The coordinator task is gone
    #[error("Flow coordinator closed")]
    CoordinatorClosed,

    /// Waiting for a state timed out
    #[error("Timed out waiting for {0}")]
    Timeout(String),
}

impl FlowError {
    pub(crate) fn illegal(state: impl std::fmt::Debug, event: impl Into<String>) -> Self {
        FlowError::IllegalTransition {
            state: format!("{:?}", state),
            event: event.into(),
        }
    }

    /// Whether this is the documented soft failure that leaves the state as is
    pub fn is_soft(&self) -> bool {
        matches!(self, FlowError::PinConfirmationFailed)
    }
}
