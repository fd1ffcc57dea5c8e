//! Error taxonomy for card interactions

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Errors reported by the card-access SDK for a running task
///
/// This is the closed set of failures the flow orchestration knows how to
/// map onto terminal states. None of them is retried automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CardError {
    /// Unexpected failure inside the SDK, not actionable by retry
    #[error("Card framework error: {message}")]
    FrameworkError { message: String },

    /// The server sent malformed attribute data (identification only)
    #[error("Unexpected attribute in server request: {message}")]
    UnexpectedAttribute { message: String },

    /// The PUK is required; terminal for this flow
    #[error("Card blocked")]
    CardBlocked,

    /// The eID function of the card is switched off
    #[error("Card deactivated")]
    CardDeactivated,

    /// The server rejected the process
    #[error("Process failed")]
    ProcessFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect: Option<Url>,
    },

    /// The new PIN and its confirmation differ (local, user-correctable)
    #[error("PIN confirmation failed")]
    PinConfirmationFailed,
}

impl CardError {
    /// Whether the user can recover from this error inside the same flow
    pub fn is_user_correctable(&self) -> bool {
        matches!(self, CardError::PinConfirmationFailed)
    }
}

/// Errors returned by adapter commands themselves
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// Another task is still running on this adapter
    #[error("Adapter busy: {0}")]
    Busy(String),

    /// The task could not be started
    #[error("Task start failed: {0}")]
    StartFailed(String),

    /// The adapter is not available (no NFC, SDK not initialised)
    #[error("Adapter unavailable: {0}")]
    Unavailable(String),
}
