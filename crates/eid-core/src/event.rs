//! Card interaction events emitted by a card session adapter

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::CardError;
use crate::pending::PendingRequest;

/// Task executed by the adapter against the card
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum TaskKind {
    /// Online identification against the given tc-token URL
    Identify { tc_token_url: Url },
    /// Change the card PIN (transport PIN or personal PIN to a new personal PIN)
    ChangePin,
}

/// Event vocabulary of the card-access SDK
///
/// Events of a single task arrive strictly in the order the SDK emits them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CardEvent {
    ProcessStarted,
    CardInsertionRequested,
    CardRecognized,
    CardRemoved,
    CardInteractionComplete,
    /// PIN requested; `attempts` is `None` on a first, untroubled attempt
    PinRequested {
        #[serde(skip_serializing_if = "Option::is_none")]
        attempts: Option<u8>,
    },
    /// New PIN requested (PIN change)
    NewPinRequested {
        #[serde(skip_serializing_if = "Option::is_none")]
        attempts: Option<u8>,
    },
    /// CAN required, the PIN is suspended
    CanRequested,
    /// PUK required, the PIN is blocked
    PukRequested,
    ProcessCompletedWithoutResult,
    ProcessCompletedWithRedirect { url: Url },
    CardBlocked,
    CardDeactivated,
    Error { error: CardError },
}

impl CardEvent {
    /// Events that only report progress and never require a decision
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            CardEvent::ProcessStarted
                | CardEvent::CardRecognized
                | CardEvent::CardRemoved
                | CardEvent::CardInteractionComplete
        )
    }

    /// Events that carry a pending request in an [`AdapterEvent`]
    pub fn expects_input(&self) -> bool {
        matches!(
            self,
            CardEvent::PinRequested { .. }
                | CardEvent::NewPinRequested { .. }
                | CardEvent::CanRequested
                | CardEvent::PukRequested
        )
    }

    /// Short name used in logs and transition errors
    pub fn name(&self) -> &'static str {
        match self {
            CardEvent::ProcessStarted => "ProcessStarted",
            CardEvent::CardInsertionRequested => "CardInsertionRequested",
            CardEvent::CardRecognized => "CardRecognized",
            CardEvent::CardRemoved => "CardRemoved",
            CardEvent::CardInteractionComplete => "CardInteractionComplete",
            CardEvent::PinRequested { .. } => "PinRequested",
            CardEvent::NewPinRequested { .. } => "NewPinRequested",
            CardEvent::CanRequested => "CanRequested",
            CardEvent::PukRequested => "PukRequested",
            CardEvent::ProcessCompletedWithoutResult => "ProcessCompletedWithoutResult",
            CardEvent::ProcessCompletedWithRedirect { .. } => "ProcessCompletedWithRedirect",
            CardEvent::CardBlocked => "CardBlocked",
            CardEvent::CardDeactivated => "CardDeactivated",
            CardEvent::Error { .. } => "Error",
        }
    }
}

/// An event as delivered by the adapter, with the pending request if the
/// event asks for input
#[derive(Debug)]
pub struct AdapterEvent {
    pub event: CardEvent,
    pub request: Option<PendingRequest>,
}

impl AdapterEvent {
    /// Event without a pending request
    pub fn notify(event: CardEvent) -> Self {
        Self {
            event,
            request: None,
        }
    }

    /// Event that hands a pending request to the consumer
    pub fn request(event: CardEvent, request: PendingRequest) -> Self {
        Self {
            event,
            request: Some(request),
        }
    }

    pub fn into_parts(self) -> (CardEvent, Option<PendingRequest>) {
        (self.event, self.request)
    }
}

impl From<CardEvent> for AdapterEvent {
    fn from(event: CardEvent) -> Self {
        Self::notify(event)
    }
}
