//! CAN sub-flow
//!
//! Runs while the main flow sits in `CanRequested`. It collects the CAN and,
//! when the PIN failed before the suspension, the old secret again. The
//! result goes to the card as a single [`CanInput`] through the pending CAN
//! request. Once the card moves on, the sub-flow finishes and hands control
//! back to the main flow with a [`CanFlowOutcome`].

use std::fmt;

use eid_core::{CanInput, CardEvent, Secret, SecretKind};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CanConfig;
use crate::error::{FlowError, FlowResult};
use crate::retry::{CanDecision, CanMachine};

/// Parameters handed over by the main flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFlowParams {
    pub change_pin: bool,
    pub identification_pending: bool,
    pub old_secret_kind: SecretKind,
    pub old_secret: Secret,
    /// PIN change only
    pub new_pin: Option<Secret>,
    /// Intro already shown in this session
    pub short_flow: bool,
    /// The old secret failed before the suspension and must be entered again
    pub reenter_old_secret: bool,
}

/// Screen of the CAN sub-flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "can_state", rename_all = "snake_case")]
pub enum CanFlowState {
    Intro,
    CanInput,
    CanIncorrect { attempts_remaining: u8 },
    OldSecretInput,
    WaitingForCard,
    Finished,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanFlowEvent {
    ConfirmIntro,
    EnterCan(Secret),
    EnterOldSecret(Secret),
    Back,
    Cancel,
    /// User opts out and starts over, e.g. forgot the PIN
    Skip,
}

impl CanFlowEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CanFlowEvent::ConfirmIntro => "ConfirmIntro",
            CanFlowEvent::EnterCan(_) => "EnterCan",
            CanFlowEvent::EnterOldSecret(_) => "EnterOldSecret",
            CanFlowEvent::Back => "Back",
            CanFlowEvent::Cancel => "Cancel",
            CanFlowEvent::Skip => "Skip",
        }
    }
}

/// Result handed back to the main flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanFlowOutcome {
    /// The card accepted the CAN
    Success { old_secret: Secret },
    Cancelled,
    Skipped,
    /// The card kept rejecting the CAN
    Exhausted,
    /// The card session ended while the sub-flow was active
    Interrupted,
}

impl fmt::Display for CanFlowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CanFlowOutcome::Success { .. } => "success",
            CanFlowOutcome::Cancelled => "cancelled",
            CanFlowOutcome::Skipped => "skipped",
            CanFlowOutcome::Exhausted => "exhausted",
            CanFlowOutcome::Interrupted => "interrupted",
        };
        f.write_str(s)
    }
}

/// What the coordinator has to do after a sub-flow step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanFlowStep {
    Continue,
    /// Resolve the pending CAN request with this input
    Resolve(CanInput),
    /// Hand control back; `replay` goes to the main flow afterwards
    Finished {
        outcome: CanFlowOutcome,
        replay: Option<CardEvent>,
    },
}

/// One active CAN sub-flow
#[derive(Debug, Clone)]
pub struct CanSubFlow {
    params: CanFlowParams,
    state: CanFlowState,
    attempts: CanMachine,
    can: Option<Secret>,
    old_secret_reentered: bool,
    validate_secrets: bool,
}

impl CanSubFlow {
    /// Start on the CAN request that suspended the main flow
    pub fn new(params: CanFlowParams, config: &CanConfig, validate_secrets: bool) -> Self {
        let mut attempts = CanMachine::new(config.max_attempts);
        attempts.on_requested();
        let state = if params.short_flow {
            CanFlowState::CanInput
        } else {
            CanFlowState::Intro
        };
        info!(short_flow = params.short_flow, "CAN sub-flow started");
        Self {
            params,
            state,
            attempts,
            can: None,
            old_secret_reentered: false,
            validate_secrets,
        }
    }

    pub fn state(&self) -> CanFlowState {
        self.state
    }

    pub fn params(&self) -> &CanFlowParams {
        &self.params
    }

    pub fn is_finished(&self) -> bool {
        self.state == CanFlowState::Finished
    }

    /// UI input
    pub fn handle(&mut self, event: CanFlowEvent) -> FlowResult<CanFlowStep> {
        if self.is_finished() {
            return Err(FlowError::CanFlowNotActive);
        }
        let name = event.name();

        let step = match (event, self.state) {
            (CanFlowEvent::ConfirmIntro, CanFlowState::Intro) => {
                self.state = CanFlowState::CanInput;
                CanFlowStep::Continue
            }
            (
                CanFlowEvent::EnterCan(can),
                CanFlowState::CanInput | CanFlowState::CanIncorrect { .. },
            ) => {
                if self.validate_secrets {
                    SecretKind::Can.validate(&can)?;
                }
                if self.params.reenter_old_secret && !self.old_secret_reentered {
                    self.can = Some(can);
                    self.state = CanFlowState::OldSecretInput;
                    CanFlowStep::Continue
                } else {
                    self.submit(can)
                }
            }
            (CanFlowEvent::EnterOldSecret(secret), CanFlowState::OldSecretInput) => {
                if self.validate_secrets {
                    self.params.old_secret_kind.validate(&secret)?;
                }
                let can = self
                    .can
                    .take()
                    .ok_or(FlowError::MissingSecret(SecretKind::Can))?;
                self.params.old_secret = secret;
                self.old_secret_reentered = true;
                self.submit(can)
            }
            (CanFlowEvent::Back, CanFlowState::OldSecretInput) => {
                self.can = None;
                self.state = CanFlowState::CanInput;
                CanFlowStep::Continue
            }
            (CanFlowEvent::Back, CanFlowState::CanInput) if !self.params.short_flow => {
                self.state = CanFlowState::Intro;
                CanFlowStep::Continue
            }
            (CanFlowEvent::Cancel, _) => self.finish(CanFlowOutcome::Cancelled, None),
            (CanFlowEvent::Skip, state) if state != CanFlowState::WaitingForCard => {
                self.finish(CanFlowOutcome::Skipped, None)
            }
            (_, state) => return Err(FlowError::illegal(state, name)),
        };
        Ok(step)
    }

    /// Card event received while the main flow is suspended
    pub fn on_card_event(&mut self, event: CardEvent) -> FlowResult<CanFlowStep> {
        if self.is_finished() {
            return Err(FlowError::CanFlowNotActive);
        }
        if event.is_informational() {
            return Ok(CanFlowStep::Continue);
        }

        let waiting = self.state == CanFlowState::WaitingForCard;
        match event {
            CardEvent::CanRequested if waiting => match self.attempts.on_requested() {
                CanDecision::Exhausted => Ok(self.finish(CanFlowOutcome::Exhausted, None)),
                CanDecision::Retry { attempts_remaining } => {
                    info!(attempts_remaining, "CAN rejected");
                    self.state = CanFlowState::CanIncorrect { attempts_remaining };
                    Ok(CanFlowStep::Continue)
                }
                CanDecision::Enter => {
                    self.state = CanFlowState::CanInput;
                    Ok(CanFlowStep::Continue)
                }
            },
            // Card pulled after a rejected CAN, the next request decides
            CardEvent::CardInsertionRequested if waiting => Ok(CanFlowStep::Continue),
            event if ends_session(&event) => {
                Ok(self.finish(CanFlowOutcome::Interrupted, Some(event)))
            }
            event if waiting && accepts_can(&event) => {
                let outcome = CanFlowOutcome::Success {
                    old_secret: self.params.old_secret.clone(),
                };
                Ok(self.finish(outcome, Some(event)))
            }
            event @ (CardEvent::ProcessCompletedWithoutResult
            | CardEvent::ProcessCompletedWithRedirect { .. }) => {
                Ok(self.finish(CanFlowOutcome::Interrupted, Some(event)))
            }
            event => {
                warn!(state = ?self.state, event = event.name(), "Card event ignored by CAN sub-flow");
                Ok(CanFlowStep::Continue)
            }
        }
    }

    /// Stop without an outcome; the main flow is already leaving
    pub fn stop(&mut self) {
        if !self.is_finished() {
            debug!(state = ?self.state, "CAN sub-flow stopped");
            self.state = CanFlowState::Finished;
            self.can = None;
        }
    }

    fn submit(&mut self, can: Secret) -> CanFlowStep {
        self.state = CanFlowState::WaitingForCard;
        CanFlowStep::Resolve(CanInput {
            can,
            pin: self.params.old_secret.clone(),
            new_pin: self.params.new_pin.clone(),
        })
    }

    fn finish(&mut self, outcome: CanFlowOutcome, replay: Option<CardEvent>) -> CanFlowStep {
        info!(%outcome, "CAN sub-flow finished");
        self.state = CanFlowState::Finished;
        self.can = None;
        CanFlowStep::Finished { outcome, replay }
    }
}

/// Failures that end the card session, with or without a CAN in flight
fn ends_session(event: &CardEvent) -> bool {
    matches!(
        event,
        CardEvent::PukRequested
            | CardEvent::CardBlocked
            | CardEvent::CardDeactivated
            | CardEvent::Error { .. }
    )
}

/// Events showing the card got past the CAN
fn accepts_can(event: &CardEvent) -> bool {
    matches!(
        event,
        CardEvent::PinRequested { .. }
            | CardEvent::NewPinRequested { .. }
            | CardEvent::ProcessCompletedWithoutResult
            | CardEvent::ProcessCompletedWithRedirect { .. }
    )
}
