//! Flow states, input events and side effects
//!
//! The flow state is a single tagged union. The UI renders from it; the
//! state machine maps `(state, event)` to a new state plus a list of
//! [`Effect`]s that the coordinator carries out.

use std::fmt;

use eid_core::{CardError, CardEvent, ChangedPinInput, Secret, TaskKind};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::can_flow::{CanFlowOutcome, CanFlowParams};

/// Use case a flow implements
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FlowKind {
    /// Identity check against a service
    Identify { tc_token_url: Url },
    /// Change the transport or personal PIN to a new personal PIN
    ChangePin,
}

impl FlowKind {
    /// Adapter task that carries out this flow on the card
    pub fn task(&self) -> TaskKind {
        match self {
            FlowKind::Identify { tc_token_url } => TaskKind::Identify {
                tc_token_url: tc_token_url.clone(),
            },
            FlowKind::ChangePin => TaskKind::ChangePin,
        }
    }

    pub fn is_change_pin(&self) -> bool {
        matches!(self, FlowKind::ChangePin)
    }
}

impl fmt::Display for FlowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowKind::Identify { .. } => f.write_str("identify"),
            FlowKind::ChangePin => f.write_str("change_pin"),
        }
    }
}

/// State of the main flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FlowState {
    /// No session; initial state and target of `Invalidate`
    Invalid,
    OldTransportOrPersonalPinInput,
    /// The card rejected the old secret
    OldSecretRetry { attempts_remaining: u8 },
    NewPinIntro,
    NewPinInput,
    NewPinConfirmation,
    WaitingForFirstCardAttachment,
    WaitingForCardReAttachment,
    /// The card asked for the old secret, which has been handed over
    FrameworkReadyForSecretInput,
    /// The card asked for the new PIN, which has been handed over
    FrameworkReadyForNewPinInput,
    /// Main flow suspended while the CAN sub-flow runs
    CanRequested { short_flow: bool },
    CardDeactivated,
    CardBlocked,
    CanBlocked,
    ProcessFailed {
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect: Option<Url>,
    },
    UnknownError { error: CardError },
    Finished {
        #[serde(skip_serializing_if = "Option::is_none")]
        redirect: Option<Url>,
    },
    Cancelled,
}

impl FlowState {
    /// States in which the session no longer exists
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowState::Invalid | FlowState::Finished { .. } | FlowState::Cancelled
        )
    }

    /// Dedicated failure states; the UI shows an explanatory screen
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            FlowState::CardDeactivated
                | FlowState::CardBlocked
                | FlowState::CanBlocked
                | FlowState::ProcessFailed { .. }
                | FlowState::UnknownError { .. }
        )
    }

    /// States in which an adapter task is running and may emit events
    pub fn is_card_session(&self) -> bool {
        matches!(
            self,
            FlowState::WaitingForFirstCardAttachment
                | FlowState::WaitingForCardReAttachment
                | FlowState::FrameworkReadyForSecretInput
                | FlowState::FrameworkReadyForNewPinInput
                | FlowState::OldSecretRetry { .. }
                | FlowState::CanRequested { .. }
        )
    }

    /// Scan screens the user can go back from
    pub fn is_scan_screen(&self) -> bool {
        matches!(
            self,
            FlowState::WaitingForFirstCardAttachment | FlowState::WaitingForCardReAttachment
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            FlowState::Invalid => "Invalid",
            FlowState::OldTransportOrPersonalPinInput => "OldTransportOrPersonalPinInput",
            FlowState::OldSecretRetry { .. } => "OldSecretRetry",
            FlowState::NewPinIntro => "NewPinIntro",
            FlowState::NewPinInput => "NewPinInput",
            FlowState::NewPinConfirmation => "NewPinConfirmation",
            FlowState::WaitingForFirstCardAttachment => "WaitingForFirstCardAttachment",
            FlowState::WaitingForCardReAttachment => "WaitingForCardReAttachment",
            FlowState::FrameworkReadyForSecretInput => "FrameworkReadyForSecretInput",
            FlowState::FrameworkReadyForNewPinInput => "FrameworkReadyForNewPinInput",
            FlowState::CanRequested { .. } => "CanRequested",
            FlowState::CardDeactivated => "CardDeactivated",
            FlowState::CardBlocked => "CardBlocked",
            FlowState::CanBlocked => "CanBlocked",
            FlowState::ProcessFailed { .. } => "ProcessFailed",
            FlowState::UnknownError { .. } => "UnknownError",
            FlowState::Finished { .. } => "Finished",
            FlowState::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowState::OldSecretRetry { attempts_remaining } => {
                write!(f, "OldSecretRetry({})", attempts_remaining)
            }
            FlowState::CanRequested { short_flow } => {
                write!(f, "CanRequested(short_flow={})", short_flow)
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Input produced by the UI layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    StartFlow {
        identification_pending: bool,
        has_transport_pin: bool,
    },
    EnterOldSecret(Secret),
    ConfirmNewPinIntro,
    EnterNewPin(Secret),
    ConfirmNewPin(Secret),
    RetryNewPinConfirmation,
    Back,
    Cancel,
    Finish,
    Invalidate,
}

impl UiEvent {
    pub fn name(&self) -> &'static str {
        match self {
            UiEvent::StartFlow { .. } => "StartFlow",
            UiEvent::EnterOldSecret(_) => "EnterOldSecret",
            UiEvent::ConfirmNewPinIntro => "ConfirmNewPinIntro",
            UiEvent::EnterNewPin(_) => "EnterNewPin",
            UiEvent::ConfirmNewPin(_) => "ConfirmNewPin",
            UiEvent::RetryNewPinConfirmation => "RetryNewPinConfirmation",
            UiEvent::Back => "Back",
            UiEvent::Cancel => "Cancel",
            UiEvent::Finish => "Finish",
            UiEvent::Invalidate => "Invalidate",
        }
    }
}

/// Everything the main state machine consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Ui(UiEvent),
    Card(CardEvent),
    /// The CAN sub-flow finished and hands control back
    CanFlowFinished(CanFlowOutcome),
}

impl FlowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            FlowEvent::Ui(event) => event.name(),
            FlowEvent::Card(event) => event.name(),
            FlowEvent::CanFlowFinished(_) => "CanFlowFinished",
        }
    }
}

/// Navigation the UI layer should perform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "navigate", rename_all = "snake_case")]
pub enum NavigationRequest {
    /// Back pressed on the first screen, leave the flow
    PopToRoot,
    /// Close the flow
    Dismiss,
    /// PIN change done, continue with the queued identification
    StartIdentification,
    /// Open the redirect the process finished with
    OpenRedirect { url: Url },
}

/// Side effect requested by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartTask(TaskKind),
    ProvidePin(Secret),
    ProvideChangedPin(ChangedPinInput),
    CancelTask,
    DiscardCallback,
    StartCanFlow(CanFlowParams),
    StopCanFlow,
    Navigate(NavigationRequest),
}

/// Result of a successful `handle` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: FlowState,
    pub to: FlowState,
    pub effects: Vec<Effect>,
    /// Back was pressed on the first screen
    pub backed_down: bool,
}

impl Transition {
    pub fn is_state_change(&self) -> bool {
        self.from != self.to
    }
}
