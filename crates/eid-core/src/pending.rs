//! Pending requests: the SDK's input callbacks as a consume-once channel
//!
//! When the card needs a secret, the adapter emits an event together with a
//! [`PendingRequest`]. Resolving the request moves it, so it can be answered at
//! most once. The consumer keeps the request in a [`PendingCallback`] slot,
//! which holds at most one outstanding request at a time.

use std::fmt;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::secret::Secret;

/// What a pending request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Pin,
    ChangedPin,
    Can,
    Puk,
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RequestKind::Pin => "PIN",
            RequestKind::ChangedPin => "changed PIN",
            RequestKind::Can => "CAN",
            RequestKind::Puk => "PUK",
        };
        f.write_str(s)
    }
}

/// CAN together with the secrets the card needs in the same step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanInput {
    pub can: Secret,
    /// The PIN (transport or personal) to try once the CAN is accepted
    pub pin: Secret,
    /// The new PIN, for PIN change only
    pub new_pin: Option<Secret>,
}

/// Current PIN together with the new one, answering a PIN change request
///
/// The card asks for both again after rejecting the current PIN, so a
/// re-entered PIN always travels with the new PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedPinInput {
    /// Transport or personal PIN currently set on the card
    pub pin: Secret,
    pub new_pin: Secret,
}

/// Value handed back to the card
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CardInput {
    Pin(Secret),
    ChangedPin(ChangedPinInput),
    Can(CanInput),
    Puk(Secret),
}

impl CardInput {
    pub fn kind(&self) -> RequestKind {
        match self {
            CardInput::Pin(_) => RequestKind::Pin,
            CardInput::ChangedPin(_) => RequestKind::ChangedPin,
            CardInput::Can(_) => RequestKind::Can,
            CardInput::Puk(_) => RequestKind::Puk,
        }
    }
}

/// Misuse of a pending request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallbackError {
    /// Nothing is outstanding (never requested, or already consumed)
    #[error("No pending request")]
    NoPendingRequest,

    /// The outstanding request asks for something else
    #[error("Pending request expects {expected}, got {actual}")]
    KindMismatch {
        expected: RequestKind,
        actual: RequestKind,
    },

    /// The task that issued the request is gone
    #[error("Pending {0} request was rejected, task no longer running")]
    Rejected(RequestKind),
}

/// A single request for input, answered at most once
pub struct PendingRequest {
    kind: RequestKind,
    reply: oneshot::Sender<CardInput>,
}

impl PendingRequest {
    /// Create a request and the receiver the adapter awaits the answer on
    pub fn channel(kind: RequestKind) -> (Self, oneshot::Receiver<CardInput>) {
        let (reply, rx) = oneshot::channel();
        (Self { kind, reply }, rx)
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    /// Whether the issuing task has stopped waiting for an answer
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }

    /// Answer the request, consuming it
    pub fn resolve(self, input: CardInput) -> Result<(), CallbackError> {
        if input.kind() != self.kind {
            return Err(CallbackError::KindMismatch {
                expected: self.kind,
                actual: input.kind(),
            });
        }
        let kind = self.kind;
        self.reply
            .send(input)
            .map_err(|_| CallbackError::Rejected(kind))
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("kind", &self.kind)
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}

/// Slot holding the single outstanding pending request
#[derive(Debug, Default)]
pub struct PendingCallback {
    slot: Option<PendingRequest>,
}

impl PendingCallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new request, dropping (and thereby rejecting) any previous one
    ///
    /// Returns the kind of the replaced request, if there was one.
    pub fn store(&mut self, request: PendingRequest) -> Option<RequestKind> {
        let replaced = self.slot.replace(request).map(|old| old.kind());
        if let Some(kind) = replaced {
            warn!(%kind, "Replaced an unanswered pending request");
        }
        replaced
    }

    /// Kind of the outstanding request
    pub fn kind(&self) -> Option<RequestKind> {
        self.slot.as_ref().map(PendingRequest::kind)
    }

    pub fn is_outstanding(&self) -> bool {
        self.slot.is_some()
    }

    /// Drop the outstanding request without answering it
    ///
    /// Returns whether something was discarded. Calling this twice is fine.
    pub fn discard(&mut self) -> bool {
        match self.slot.take() {
            Some(request) => {
                debug!(kind = %request.kind(), "Discarded pending request");
                true
            }
            None => false,
        }
    }

    pub fn provide_pin(&mut self, pin: Secret) -> Result<(), CallbackError> {
        self.resolve(CardInput::Pin(pin))
    }

    pub fn provide_changed_pin(&mut self, input: ChangedPinInput) -> Result<(), CallbackError> {
        self.resolve(CardInput::ChangedPin(input))
    }

    pub fn provide_can(&mut self, input: CanInput) -> Result<(), CallbackError> {
        self.resolve(CardInput::Can(input))
    }

    pub fn provide_puk(&mut self, puk: Secret) -> Result<(), CallbackError> {
        self.resolve(CardInput::Puk(puk))
    }

    /// Answer the outstanding request
    ///
    /// A kind mismatch leaves the request in place; any other outcome
    /// consumes it.
    pub fn resolve(&mut self, input: CardInput) -> Result<(), CallbackError> {
        let expected = self.kind().ok_or(CallbackError::NoPendingRequest)?;
        if expected != input.kind() {
            return Err(CallbackError::KindMismatch {
                expected,
                actual: input.kind(),
            });
        }
        let request = self.slot.take().ok_or(CallbackError::NoPendingRequest)?;
        debug!(kind = %expected, "Resolving pending request");
        request.resolve(input)
    }
}
