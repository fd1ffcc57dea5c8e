//! Flow state machine
//!
//! Pure transition logic shared by the identification and PIN change flows.
//! `handle` never performs I/O: it updates the state and the session and
//! returns the [`Effect`]s the coordinator must carry out.
//!
//! ```text
//!  Invalid ──StartFlow──▶ OldTransportOrPersonalPinInput
//!                               │ EnterOldSecret
//!              ┌────────────────┴───────────────┐
//!       (change PIN)                       (identify)
//!              ▼                                 │
//!         NewPinIntro ─▶ NewPinInput ─▶ NewPinConfirmation
//!                                                │ ConfirmNewPin (match)
//!                                                ▼
//!                            WaitingForFirstCardAttachment ◀───────┘
//!                                                │ card events
//!           ┌──────────────┬─────────────────────┼───────────────┬──────────────┐
//!           ▼              ▼                     ▼               ▼              ▼
//!   FrameworkReady*  OldSecretRetry(n)    CanRequested      Finished     failure states
//!                          │ EnterOldSecret      │ sub-flow result
//!                          ▼                     ▼
//!                 WaitingForCardReAttachment ◀───┘
//! ```

use eid_core::{CardError, CardEvent, ChangedPinInput, RequestKind, Secret, SecretKind};
use tracing::{debug, info, warn};
use url::Url;

use crate::can_flow::{CanFlowOutcome, CanFlowParams};
use crate::config::{CanExhaustion, FlowConfig};
use crate::error::{FlowError, FlowResult};
use crate::retry::{PinDecision, PinMachine, PinState, PukMachine};
use crate::state::{Effect, FlowEvent, FlowKind, FlowState, NavigationRequest, Transition, UiEvent};

/// Per-flow data, alive between `StartFlow` and a terminal state
#[derive(Debug, Clone)]
pub struct Session {
    flow_kind: FlowKind,
    identification_pending: bool,
    old_secret_kind: SecretKind,
    old_secret: Option<Secret>,
    new_pin: Option<Secret>,
    confirmation_failed: bool,
    pin: PinMachine,
    puk: PukMachine,
    /// Input screens to return to on `Back`
    history: Vec<FlowState>,
    card_insertions: u32,
    card_recognized: bool,
    can_intro_shown: bool,
    /// Request that put the flow into `OldSecretRetry`
    retry_source: RequestKind,
}

impl Session {
    fn new(
        flow_kind: FlowKind,
        identification_pending: bool,
        old_secret_kind: SecretKind,
        max_pin_attempts: u8,
    ) -> Self {
        Self {
            flow_kind,
            identification_pending,
            old_secret_kind,
            old_secret: None,
            new_pin: None,
            confirmation_failed: false,
            pin: PinMachine::new(max_pin_attempts),
            puk: PukMachine::new(),
            history: Vec::new(),
            card_insertions: 0,
            card_recognized: false,
            can_intro_shown: false,
            retry_source: RequestKind::Pin,
        }
    }

    pub fn flow_kind(&self) -> &FlowKind {
        &self.flow_kind
    }

    pub fn identification_pending(&self) -> bool {
        self.identification_pending
    }

    pub fn old_secret_kind(&self) -> SecretKind {
        self.old_secret_kind
    }

    pub fn confirmation_failed(&self) -> bool {
        self.confirmation_failed
    }

    pub fn attempts_remaining(&self) -> Option<u8> {
        self.pin.attempts_remaining()
    }

    pub fn pin(&self) -> &PinMachine {
        &self.pin
    }

    pub fn puk_requested(&self) -> bool {
        self.puk.was_requested()
    }

    pub fn card_recognized(&self) -> bool {
        self.card_recognized
    }

    pub fn card_insertions(&self) -> u32 {
        self.card_insertions
    }

    fn reset_scan(&mut self) {
        self.card_insertions = 0;
        self.card_recognized = false;
    }

    /// Back to the first input screen, keeping what the card reported
    fn restart(&mut self) {
        self.old_secret = None;
        self.new_pin = None;
        self.confirmation_failed = false;
        self.history.clear();
        self.reset_scan();
    }

    fn old_secret(&self) -> FlowResult<Secret> {
        self.old_secret
            .clone()
            .ok_or(FlowError::MissingSecret(self.old_secret_kind))
    }

    fn new_pin(&self) -> FlowResult<Secret> {
        self.new_pin
            .clone()
            .ok_or(FlowError::MissingSecret(SecretKind::PersonalPin))
    }
}

/// The main flow state machine
#[derive(Debug, Clone)]
pub struct FlowStateMachine {
    kind: FlowKind,
    config: FlowConfig,
    state: FlowState,
    session: Option<Session>,
}

impl FlowStateMachine {
    pub fn new(kind: FlowKind, config: FlowConfig) -> Self {
        Self {
            kind,
            config,
            state: FlowState::Invalid,
            session: None,
        }
    }

    pub fn kind(&self) -> &FlowKind {
        &self.kind
    }

    pub fn state(&self) -> &FlowState {
        &self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Apply one event
    ///
    /// On error the state and session are left as they were, apart from the
    /// confirmation-failed flag set by `PinConfirmationFailed`.
    pub fn handle(&mut self, event: FlowEvent) -> FlowResult<Transition> {
        let name = event.name();
        let result = match event {
            FlowEvent::Ui(event) => self.handle_ui(event),
            FlowEvent::Card(event) => self.handle_card(event),
            FlowEvent::CanFlowFinished(outcome) => self.handle_can_outcome(outcome),
        };

        match &result {
            Ok(transition) if transition.is_state_change() => {
                debug!(from = %transition.from, to = %transition.to, event = name, "Flow transition");
            }
            Ok(_) => {}
            Err(FlowError::PinConfirmationFailed) => {
                info!("New PIN confirmation mismatch");
            }
            Err(e) => {
                warn!(state = %self.state, event = name, error = %e, "Flow event rejected");
            }
        }
        result
    }

    // =========================================================================
    // UI events
    // =========================================================================

    fn handle_ui(&mut self, event: UiEvent) -> FlowResult<Transition> {
        match event {
            UiEvent::StartFlow {
                identification_pending,
                has_transport_pin,
            } => self.start_flow(identification_pending, has_transport_pin),
            UiEvent::EnterOldSecret(secret) => self.enter_old_secret(secret),
            UiEvent::ConfirmNewPinIntro => self.confirm_new_pin_intro(),
            UiEvent::EnterNewPin(secret) => self.enter_new_pin(secret),
            UiEvent::ConfirmNewPin(secret) => self.confirm_new_pin(secret),
            UiEvent::RetryNewPinConfirmation => self.retry_new_pin_confirmation(),
            UiEvent::Back => self.back(),
            UiEvent::Cancel => Ok(self.cancel()),
            UiEvent::Finish => self.finish(),
            UiEvent::Invalidate => Ok(self.invalidate()),
        }
    }

    fn start_flow(
        &mut self,
        identification_pending: bool,
        has_transport_pin: bool,
    ) -> FlowResult<Transition> {
        if !self.state.is_terminal() {
            return Err(FlowError::illegal(&self.state, "StartFlow"));
        }

        let old_secret_kind = match (&self.kind, has_transport_pin) {
            (FlowKind::ChangePin, true) => SecretKind::TransportPin,
            (FlowKind::Identify { .. }, true) => {
                warn!("Identification needs the personal PIN, ignoring transport PIN flag");
                SecretKind::PersonalPin
            }
            (_, false) => SecretKind::PersonalPin,
        };

        info!(
            kind = %self.kind,
            identification_pending,
            old_secret = %old_secret_kind,
            "Flow started"
        );
        self.session = Some(Session::new(
            self.kind.clone(),
            identification_pending,
            old_secret_kind,
            self.config.max_pin_attempts,
        ));
        Ok(self.go(FlowState::OldTransportOrPersonalPinInput, vec![]))
    }

    fn enter_old_secret(&mut self, secret: Secret) -> FlowResult<Transition> {
        let change_pin = self.kind.is_change_pin();
        let task = self.kind.task();
        let validate = self.config.validate_secrets;

        match self.state {
            FlowState::OldTransportOrPersonalPinInput => {
                let session = self.session_mut("EnterOldSecret")?;
                if validate {
                    session.old_secret_kind.validate(&secret)?;
                }
                session.old_secret = Some(secret);
                session.history.push(FlowState::OldTransportOrPersonalPinInput);

                if change_pin {
                    Ok(self.go(FlowState::NewPinIntro, vec![]))
                } else {
                    Ok(self.go(
                        FlowState::WaitingForFirstCardAttachment,
                        vec![Effect::StartTask(task)],
                    ))
                }
            }
            FlowState::OldSecretRetry { .. } => {
                let session = self.session_mut("EnterOldSecret")?;
                if validate {
                    session.old_secret_kind.validate(&secret)?;
                }
                let effect = match session.retry_source {
                    RequestKind::ChangedPin => Effect::ProvideChangedPin(ChangedPinInput {
                        pin: secret.clone(),
                        new_pin: session.new_pin()?,
                    }),
                    _ => Effect::ProvidePin(secret.clone()),
                };
                session.old_secret = Some(secret);
                Ok(self.go(FlowState::WaitingForCardReAttachment, vec![effect]))
            }
            _ => Err(FlowError::illegal(&self.state, "EnterOldSecret")),
        }
    }

    fn confirm_new_pin_intro(&mut self) -> FlowResult<Transition> {
        if self.state != FlowState::NewPinIntro {
            return Err(FlowError::illegal(&self.state, "ConfirmNewPinIntro"));
        }
        self.session_mut("ConfirmNewPinIntro")?
            .history
            .push(FlowState::NewPinIntro);
        Ok(self.go(FlowState::NewPinInput, vec![]))
    }

    fn enter_new_pin(&mut self, secret: Secret) -> FlowResult<Transition> {
        if self.state != FlowState::NewPinInput {
            return Err(FlowError::illegal(&self.state, "EnterNewPin"));
        }
        let validate = self.config.validate_secrets;
        let session = self.session_mut("EnterNewPin")?;
        if validate {
            SecretKind::PersonalPin.validate(&secret)?;
        }
        session.new_pin = Some(secret);
        session.confirmation_failed = false;
        session.history.push(FlowState::NewPinInput);
        Ok(self.go(FlowState::NewPinConfirmation, vec![]))
    }

    fn confirm_new_pin(&mut self, confirmation: Secret) -> FlowResult<Transition> {
        if self.state != FlowState::NewPinConfirmation {
            return Err(FlowError::illegal(&self.state, "ConfirmNewPin"));
        }
        let session = self.session_mut("ConfirmNewPin")?;
        if session.new_pin.as_ref() != Some(&confirmation) {
            session.confirmation_failed = true;
            return Err(FlowError::PinConfirmationFailed);
        }
        session.confirmation_failed = false;
        let task = self.kind.task();
        Ok(self.go(
            FlowState::WaitingForFirstCardAttachment,
            vec![Effect::StartTask(task)],
        ))
    }

    fn retry_new_pin_confirmation(&mut self) -> FlowResult<Transition> {
        let failed = self
            .session
            .as_ref()
            .is_some_and(|session| session.confirmation_failed);
        if self.state != FlowState::NewPinConfirmation || !failed {
            return Err(FlowError::illegal(&self.state, "RetryNewPinConfirmation"));
        }
        let session = self.session_mut("RetryNewPinConfirmation")?;
        session.new_pin = None;
        session.confirmation_failed = false;
        session.history.pop();
        Ok(self.go(FlowState::NewPinInput, vec![]))
    }

    fn back(&mut self) -> FlowResult<Transition> {
        let input_screen = matches!(
            self.state,
            FlowState::OldTransportOrPersonalPinInput
                | FlowState::NewPinIntro
                | FlowState::NewPinInput
                | FlowState::NewPinConfirmation
        );
        let leaving_scan = self.state.is_scan_screen();
        if !input_screen && !leaving_scan {
            return Err(FlowError::illegal(&self.state, "Back"));
        }

        let session = self.session_mut("Back")?;
        let mut effects = Vec::new();
        if leaving_scan {
            effects.push(Effect::CancelTask);
            effects.push(Effect::DiscardCallback);
            session.reset_scan();
        }

        match session.history.pop() {
            None => {
                effects.push(Effect::Navigate(NavigationRequest::PopToRoot));
                let mut transition = self.go(FlowState::Invalid, effects);
                transition.backed_down = true;
                Ok(transition)
            }
            Some(FlowState::NewPinInput) => {
                session.new_pin = None;
                session.confirmation_failed = false;
                Ok(self.go(FlowState::NewPinInput, effects))
            }
            Some(previous) => Ok(self.go(previous, effects)),
        }
    }

    fn cancel(&mut self) -> Transition {
        if self.state.is_terminal() {
            return self.stay();
        }
        let mut effects = Vec::new();
        if self.state.is_card_session() {
            effects.push(Effect::CancelTask);
        }
        effects.push(Effect::DiscardCallback);
        if matches!(self.state, FlowState::CanRequested { .. }) {
            effects.push(Effect::StopCanFlow);
        }
        effects.push(Effect::Navigate(NavigationRequest::Dismiss));
        self.go(FlowState::Cancelled, effects)
    }

    fn finish(&mut self) -> FlowResult<Transition> {
        match &self.state {
            FlowState::Finished { .. } => Ok(self.stay()),
            state if state.is_failure() => {
                let navigation = match state {
                    FlowState::ProcessFailed {
                        redirect: Some(url),
                    } => NavigationRequest::OpenRedirect { url: url.clone() },
                    _ => NavigationRequest::Dismiss,
                };
                Ok(self.go(
                    FlowState::Finished { redirect: None },
                    vec![Effect::DiscardCallback, Effect::Navigate(navigation)],
                ))
            }
            state => Err(FlowError::illegal(state, "Finish")),
        }
    }

    fn invalidate(&mut self) -> Transition {
        let mut effects = Vec::new();
        if self.session.is_some() || self.state.is_card_session() {
            effects.push(Effect::CancelTask);
            effects.push(Effect::DiscardCallback);
        }
        if matches!(self.state, FlowState::CanRequested { .. }) {
            effects.push(Effect::StopCanFlow);
        }
        self.go(FlowState::Invalid, effects)
    }

    // =========================================================================
    // Card events
    // =========================================================================

    fn handle_card(&mut self, event: CardEvent) -> FlowResult<Transition> {
        if matches!(self.state, FlowState::CanRequested { .. }) {
            // Suspended: the CAN sub-flow owns the card events
            return Err(FlowError::illegal(&self.state, event.name()));
        }
        if self.state.is_terminal() || self.state.is_failure() {
            if event.is_informational() {
                return Ok(self.stay());
            }
            return Err(FlowError::illegal(&self.state, event.name()));
        }
        if !self.state.is_card_session() {
            return Err(FlowError::illegal(&self.state, event.name()));
        }

        let awaiting_user = matches!(self.state, FlowState::OldSecretRetry { .. });
        let change_pin = self.kind.is_change_pin();

        match event {
            CardEvent::ProcessStarted
            | CardEvent::CardRemoved
            | CardEvent::CardInteractionComplete => Ok(self.stay()),
            CardEvent::CardRecognized => {
                self.session_mut("CardRecognized")?.card_recognized = true;
                Ok(self.stay())
            }
            CardEvent::CardInsertionRequested if !awaiting_user => {
                let session = self.session_mut("CardInsertionRequested")?;
                session.card_insertions += 1;
                let first = session.card_insertions == 1 && !session.pin.has_failed();
                if first {
                    Ok(self.go(FlowState::WaitingForFirstCardAttachment, vec![]))
                } else {
                    Ok(self.go(FlowState::WaitingForCardReAttachment, vec![]))
                }
            }
            CardEvent::PinRequested { attempts } if !awaiting_user => {
                self.on_pin_request(attempts, RequestKind::Pin)
            }
            CardEvent::NewPinRequested { attempts } if !awaiting_user && change_pin => {
                match attempts {
                    None => {
                        let session = self.session_mut("NewPinRequested")?;
                        session.pin.on_request(None)?;
                        let input = ChangedPinInput {
                            pin: session.old_secret()?,
                            new_pin: session.new_pin()?,
                        };
                        Ok(self.go(
                            FlowState::FrameworkReadyForNewPinInput,
                            vec![Effect::ProvideChangedPin(input)],
                        ))
                    }
                    Some(_) => self.on_pin_request(attempts, RequestKind::ChangedPin),
                }
            }
            CardEvent::CanRequested if !awaiting_user => {
                let pin = self.session_mut("CanRequested")?.pin.state();
                self.enter_can(matches!(pin, PinState::Retry { .. }))
            }
            CardEvent::PukRequested => {
                let session = self.session_mut("PukRequested")?;
                session.puk.on_requested();
                session.pin.on_blocked();
                Ok(self.go(FlowState::CardBlocked, card_session_ended()))
            }
            CardEvent::CardBlocked => {
                self.session_mut("CardBlocked")?.pin.on_blocked();
                Ok(self.go(FlowState::CardBlocked, card_session_ended()))
            }
            CardEvent::CardDeactivated => {
                Ok(self.go(FlowState::CardDeactivated, card_session_ended()))
            }
            CardEvent::Error { error } => {
                let to = error_state(error);
                Ok(self.go(to, card_session_ended()))
            }
            CardEvent::ProcessCompletedWithoutResult if !awaiting_user => Ok(self.complete(None)),
            CardEvent::ProcessCompletedWithRedirect { url } if !awaiting_user => {
                Ok(self.complete(Some(url)))
            }
            other => Err(FlowError::illegal(&self.state, other.name())),
        }
    }

    fn on_pin_request(
        &mut self,
        attempts: Option<u8>,
        source: RequestKind,
    ) -> FlowResult<Transition> {
        let session = self.session_mut("PinRequested")?;
        // A count right after a hand-over means the card rejected that PIN
        let handed_over = matches!(
            session.pin.state(),
            PinState::Requested | PinState::Retry { .. }
        );
        match session.pin.on_request(attempts)? {
            PinDecision::FirstAttempt => {
                let old_secret = session.old_secret()?;
                Ok(self.go(
                    FlowState::FrameworkReadyForSecretInput,
                    vec![Effect::ProvidePin(old_secret)],
                ))
            }
            PinDecision::Retry(attempts_remaining) => {
                session.retry_source = source;
                Ok(self.go(FlowState::OldSecretRetry { attempts_remaining }, vec![]))
            }
            PinDecision::CanRequired => self.enter_can(handed_over),
        }
    }

    /// Suspend the main flow; `reenter_old_secret` when the card just
    /// rejected the old secret
    fn enter_can(&mut self, reenter_old_secret: bool) -> FlowResult<Transition> {
        let change_pin = self.kind.is_change_pin();
        let session = self.session_mut("CanRequested")?;

        session.pin.on_can_requested();
        let short_flow = session.can_intro_shown;
        session.can_intro_shown = true;

        let params = CanFlowParams {
            change_pin,
            identification_pending: session.identification_pending,
            old_secret_kind: session.old_secret_kind,
            old_secret: session.old_secret()?,
            new_pin: session.new_pin.clone(),
            short_flow,
            reenter_old_secret,
        };
        info!(short_flow, reenter_old_secret, "PIN suspended, CAN required");
        Ok(self.go(
            FlowState::CanRequested { short_flow },
            vec![Effect::StartCanFlow(params)],
        ))
    }

    fn complete(&mut self, redirect: Option<Url>) -> Transition {
        let identification_pending = self
            .session
            .as_ref()
            .is_some_and(|session| session.identification_pending);
        let navigation = match &redirect {
            _ if self.kind.is_change_pin() && identification_pending => {
                NavigationRequest::StartIdentification
            }
            Some(url) => NavigationRequest::OpenRedirect { url: url.clone() },
            None => NavigationRequest::Dismiss,
        };
        self.go(
            FlowState::Finished { redirect },
            vec![Effect::DiscardCallback, Effect::Navigate(navigation)],
        )
    }

    // =========================================================================
    // CAN sub-flow results
    // =========================================================================

    fn handle_can_outcome(&mut self, outcome: CanFlowOutcome) -> FlowResult<Transition> {
        if !matches!(self.state, FlowState::CanRequested { .. }) {
            return Err(FlowError::illegal(&self.state, "CanFlowFinished"));
        }
        let on_exhausted = self.config.can.on_exhausted;

        match outcome {
            CanFlowOutcome::Success { old_secret } => {
                self.session_mut("CanFlowFinished")?.old_secret = Some(old_secret);
                Ok(self.go(FlowState::WaitingForCardReAttachment, vec![]))
            }
            CanFlowOutcome::Interrupted => {
                Ok(self.go(FlowState::WaitingForCardReAttachment, vec![]))
            }
            CanFlowOutcome::Cancelled => Ok(self.go(
                FlowState::Cancelled,
                vec![
                    Effect::CancelTask,
                    Effect::DiscardCallback,
                    Effect::Navigate(NavigationRequest::Dismiss),
                ],
            )),
            CanFlowOutcome::Skipped => {
                self.session_mut("CanFlowFinished")?.restart();
                Ok(self.go(
                    FlowState::OldTransportOrPersonalPinInput,
                    vec![Effect::CancelTask, Effect::DiscardCallback],
                ))
            }
            CanFlowOutcome::Exhausted => {
                let to = match on_exhausted {
                    CanExhaustion::CanBlocked => FlowState::CanBlocked,
                    CanExhaustion::CardBlocked => FlowState::CardBlocked,
                };
                Ok(self.go(to, vec![Effect::CancelTask, Effect::DiscardCallback]))
            }
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn session_mut(&mut self, event: &str) -> FlowResult<&mut Session> {
        match self.session.as_mut() {
            Some(session) => Ok(session),
            None => Err(FlowError::illegal(&self.state, event)),
        }
    }

    fn go(&mut self, to: FlowState, effects: Vec<Effect>) -> Transition {
        let from = std::mem::replace(&mut self.state, to.clone());
        if to.is_terminal() {
            self.session = None;
        }
        Transition {
            from,
            to,
            effects,
            backed_down: false,
        }
    }

    fn stay(&self) -> Transition {
        Transition {
            from: self.state.clone(),
            to: self.state.clone(),
            effects: Vec::new(),
            backed_down: false,
        }
    }
}

/// Effects when the card ends the session with a failure
fn card_session_ended() -> Vec<Effect> {
    vec![Effect::CancelTask, Effect::DiscardCallback]
}

/// Map an SDK error onto its terminal state
fn error_state(error: CardError) -> FlowState {
    match error {
        CardError::CardBlocked => FlowState::CardBlocked,
        CardError::CardDeactivated => FlowState::CardDeactivated,
        CardError::ProcessFailed { redirect } => FlowState::ProcessFailed { redirect },
        error => FlowState::UnknownError { error },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn change_pin_machine() -> FlowStateMachine {
        FlowStateMachine::new(FlowKind::ChangePin, FlowConfig::default())
    }

    fn identify_machine() -> FlowStateMachine {
        let url = Url::parse("https://service.example/tc-token").unwrap();
        FlowStateMachine::new(FlowKind::Identify { tc_token_url: url }, FlowConfig::default())
    }

    fn ui(machine: &mut FlowStateMachine, event: UiEvent) -> FlowResult<Transition> {
        machine.handle(FlowEvent::Ui(event))
    }

    fn card(machine: &mut FlowStateMachine, event: CardEvent) -> FlowResult<Transition> {
        machine.handle(FlowEvent::Card(event))
    }

    fn start(machine: &mut FlowStateMachine, has_transport_pin: bool) {
        ui(
            machine,
            UiEvent::StartFlow {
                identification_pending: false,
                has_transport_pin,
            },
        )
        .unwrap();
    }

    /// Start PIN change and get to NewPinConfirmation
    fn to_confirmation(machine: &mut FlowStateMachine) {
        start(machine, true);
        ui(machine, UiEvent::EnterOldSecret("12345".into())).unwrap();
        ui(machine, UiEvent::ConfirmNewPinIntro).unwrap();
        ui(machine, UiEvent::EnterNewPin("123456".into())).unwrap();
        assert_eq!(machine.state(), &FlowState::NewPinConfirmation);
    }

    /// PIN change up to the running card session
    fn to_scan(machine: &mut FlowStateMachine) {
        to_confirmation(machine);
        ui(machine, UiEvent::ConfirmNewPin("123456".into())).unwrap();
    }

    #[test]
    fn test_start_flow_from_invalid() {
        let mut machine = change_pin_machine();
        assert_eq!(machine.state(), &FlowState::Invalid);
        start(&mut machine, true);
        assert_eq!(machine.state(), &FlowState::OldTransportOrPersonalPinInput);
        let session = machine.session().unwrap();
        assert_eq!(session.old_secret_kind(), SecretKind::TransportPin);
        assert!(!session.identification_pending());
    }

    #[test]
    fn test_start_flow_twice_is_illegal() {
        let mut machine = change_pin_machine();
        start(&mut machine, false);
        let err = ui(
            &mut machine,
            UiEvent::StartFlow {
                identification_pending: false,
                has_transport_pin: false,
            },
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::IllegalTransition { .. }));
    }

    #[test]
    fn test_confirmation_mismatch_keeps_state_and_makes_no_call() {
        let mut machine = change_pin_machine();
        to_confirmation(&mut machine);

        let err = ui(&mut machine, UiEvent::ConfirmNewPin("654321".into())).unwrap_err();
        assert!(matches!(err, FlowError::PinConfirmationFailed));
        assert!(err.is_soft());
        assert_eq!(machine.state(), &FlowState::NewPinConfirmation);
        assert!(machine.session().unwrap().confirmation_failed());

        // Still failing until the user retries
        let err = ui(&mut machine, UiEvent::ConfirmNewPin("111111".into())).unwrap_err();
        assert!(matches!(err, FlowError::PinConfirmationFailed));

        let transition = ui(&mut machine, UiEvent::RetryNewPinConfirmation).unwrap();
        assert_eq!(transition.to, FlowState::NewPinInput);
        assert!(transition.effects.is_empty());
        assert!(!machine.session().unwrap().confirmation_failed());
    }

    #[test]
    fn test_confirmation_match_starts_change_pin_task_once() {
        let mut machine = change_pin_machine();
        to_confirmation(&mut machine);

        let transition = ui(&mut machine, UiEvent::ConfirmNewPin("123456".into())).unwrap();
        assert_eq!(transition.to, FlowState::WaitingForFirstCardAttachment);
        let starts = transition
            .effects
            .iter()
            .filter(|effect| matches!(effect, Effect::StartTask(eid_core::TaskKind::ChangePin)))
            .count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_retry_confirmation_without_failure_is_illegal() {
        let mut machine = change_pin_machine();
        to_confirmation(&mut machine);
        assert!(ui(&mut machine, UiEvent::RetryNewPinConfirmation).is_err());
    }

    #[test]
    fn test_confirm_outside_confirmation_is_illegal() {
        let mut machine = change_pin_machine();
        start(&mut machine, true);
        let err = ui(&mut machine, UiEvent::ConfirmNewPin("123456".into())).unwrap_err();
        assert!(matches!(err, FlowError::IllegalTransition { .. }));
        assert_eq!(machine.state(), &FlowState::OldTransportOrPersonalPinInput);
    }

    #[test]
    fn test_invalid_secret_is_rejected_without_state_change() {
        let mut machine = change_pin_machine();
        start(&mut machine, true);
        let err = ui(&mut machine, UiEvent::EnterOldSecret("123456".into())).unwrap_err();
        assert!(matches!(err, FlowError::InvalidSecret(_)));
        assert_eq!(machine.state(), &FlowState::OldTransportOrPersonalPinInput);
    }

    #[test]
    fn test_identify_scans_directly() {
        let mut machine = identify_machine();
        start(&mut machine, false);
        let transition = ui(&mut machine, UiEvent::EnterOldSecret("123456".into())).unwrap();
        assert_eq!(transition.to, FlowState::WaitingForFirstCardAttachment);
        assert!(matches!(
            transition.effects.as_slice(),
            [Effect::StartTask(eid_core::TaskKind::Identify { .. })]
        ));
    }

    #[test]
    fn test_first_pin_request_hands_over_old_secret() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);

        card(&mut machine, CardEvent::CardInsertionRequested).unwrap();
        assert_eq!(machine.state(), &FlowState::WaitingForFirstCardAttachment);

        let transition = card(&mut machine, CardEvent::PinRequested { attempts: None }).unwrap();
        assert_eq!(transition.to, FlowState::FrameworkReadyForSecretInput);
        assert_eq!(transition.effects, vec![Effect::ProvidePin("12345".into())]);

        let transition = card(&mut machine, CardEvent::NewPinRequested { attempts: None }).unwrap();
        assert_eq!(transition.to, FlowState::FrameworkReadyForNewPinInput);
        assert_eq!(
            transition.effects,
            vec![Effect::ProvideChangedPin(ChangedPinInput {
                pin: "12345".into(),
                new_pin: "123456".into(),
            })]
        );
    }

    #[test]
    fn test_changed_pin_retry_sends_reentered_pin() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);

        card(&mut machine, CardEvent::NewPinRequested { attempts: None }).unwrap();
        let transition = card(&mut machine, CardEvent::NewPinRequested { attempts: Some(2) }).unwrap();
        assert_eq!(
            transition.to,
            FlowState::OldSecretRetry {
                attempts_remaining: 2
            }
        );

        let transition = ui(&mut machine, UiEvent::EnterOldSecret("54321".into())).unwrap();
        assert_eq!(transition.to, FlowState::WaitingForCardReAttachment);
        assert_eq!(
            transition.effects,
            vec![Effect::ProvideChangedPin(ChangedPinInput {
                pin: "54321".into(),
                new_pin: "123456".into(),
            })]
        );

        // No attempts left: the CAN sub-flow asks for the rejected PIN again
        let transition = card(&mut machine, CardEvent::NewPinRequested { attempts: Some(0) }).unwrap();
        assert_eq!(transition.to, FlowState::CanRequested { short_flow: false });
        match transition.effects.as_slice() {
            [Effect::StartCanFlow(params)] => {
                assert!(params.reenter_old_secret);
                assert_eq!(params.old_secret, Secret::new("54321"));
                assert_eq!(params.new_pin, Some(Secret::new("123456")));
            }
            other => panic!("Expected StartCanFlow, got {:?}", other),
        }
    }

    #[test]
    fn test_retry_then_can_scenario() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);

        card(&mut machine, CardEvent::PinRequested { attempts: None }).unwrap();
        card(&mut machine, CardEvent::PinRequested { attempts: Some(2) }).unwrap();
        assert_eq!(
            machine.state(),
            &FlowState::OldSecretRetry {
                attempts_remaining: 2
            }
        );

        let transition = ui(&mut machine, UiEvent::EnterOldSecret("54321".into())).unwrap();
        assert_eq!(transition.to, FlowState::WaitingForCardReAttachment);
        assert_eq!(transition.effects, vec![Effect::ProvidePin("54321".into())]);

        card(&mut machine, CardEvent::CardInsertionRequested).unwrap();
        assert_eq!(machine.state(), &FlowState::WaitingForCardReAttachment);

        let transition = card(&mut machine, CardEvent::PinRequested { attempts: Some(0) }).unwrap();
        assert_eq!(transition.to, FlowState::CanRequested { short_flow: false });
        match transition.effects.as_slice() {
            [Effect::StartCanFlow(params)] => {
                assert!(params.change_pin);
                assert!(params.reenter_old_secret);
                assert_eq!(params.old_secret, Secret::new("54321"));
                assert_eq!(params.new_pin, Some(Secret::new("123456")));
            }
            other => panic!("Expected StartCanFlow, got {:?}", other),
        }
    }

    #[test]
    fn test_attempt_counter_never_increases() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);
        card(&mut machine, CardEvent::PinRequested { attempts: Some(1) }).unwrap();
        ui(&mut machine, UiEvent::EnterOldSecret("54321".into())).unwrap();

        let err = card(&mut machine, CardEvent::PinRequested { attempts: Some(2) }).unwrap_err();
        assert!(matches!(err, FlowError::Attempts(_)));
        assert_eq!(machine.state(), &FlowState::WaitingForCardReAttachment);
        assert_eq!(machine.session().unwrap().attempts_remaining(), Some(1));
    }

    #[test]
    fn test_card_events_while_can_flow_active_are_rejected() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);
        card(&mut machine, CardEvent::CanRequested).unwrap();

        let err = card(&mut machine, CardEvent::PinRequested { attempts: None }).unwrap_err();
        assert!(matches!(err, FlowError::IllegalTransition { .. }));
        assert_eq!(machine.state(), &FlowState::CanRequested { short_flow: false });
    }

    #[test]
    fn test_can_outcomes() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);
        card(&mut machine, CardEvent::CanRequested).unwrap();
        let transition = machine
            .handle(FlowEvent::CanFlowFinished(CanFlowOutcome::Success {
                old_secret: "12345".into(),
            }))
            .unwrap();
        assert_eq!(transition.to, FlowState::WaitingForCardReAttachment);

        // Second CAN request within the session skips the intro
        let transition = card(&mut machine, CardEvent::CanRequested).unwrap();
        assert_eq!(transition.to, FlowState::CanRequested { short_flow: true });
        match transition.effects.as_slice() {
            [Effect::StartCanFlow(params)] => assert!(!params.reenter_old_secret),
            other => panic!("Expected StartCanFlow, got {:?}", other),
        }

        let transition = machine
            .handle(FlowEvent::CanFlowFinished(CanFlowOutcome::Skipped))
            .unwrap();
        assert_eq!(transition.to, FlowState::OldTransportOrPersonalPinInput);
        assert_eq!(
            transition.effects,
            vec![Effect::CancelTask, Effect::DiscardCallback]
        );
    }

    #[test]
    fn test_can_exhaustion_policy() {
        let mut config = FlowConfig::default();
        config.can.on_exhausted = CanExhaustion::CardBlocked;
        let mut machine = FlowStateMachine::new(FlowKind::ChangePin, config);
        to_scan(&mut machine);
        card(&mut machine, CardEvent::CanRequested).unwrap();
        let transition = machine
            .handle(FlowEvent::CanFlowFinished(CanFlowOutcome::Exhausted))
            .unwrap();
        assert_eq!(transition.to, FlowState::CardBlocked);

        let mut machine = change_pin_machine();
        to_scan(&mut machine);
        card(&mut machine, CardEvent::CanRequested).unwrap();
        let transition = machine
            .handle(FlowEvent::CanFlowFinished(CanFlowOutcome::Exhausted))
            .unwrap();
        assert_eq!(transition.to, FlowState::CanBlocked);
    }

    #[test]
    fn test_error_mapping() {
        let cases = vec![
            (CardEvent::CardBlocked, FlowState::CardBlocked),
            (CardEvent::PukRequested, FlowState::CardBlocked),
            (CardEvent::CardDeactivated, FlowState::CardDeactivated),
            (
                CardEvent::Error {
                    error: CardError::ProcessFailed { redirect: None },
                },
                FlowState::ProcessFailed { redirect: None },
            ),
            (
                CardEvent::Error {
                    error: CardError::FrameworkError {
                        message: "nfc".to_string(),
                    },
                },
                FlowState::UnknownError {
                    error: CardError::FrameworkError {
                        message: "nfc".to_string(),
                    },
                },
            ),
        ];
        for (event, expected) in cases {
            let mut machine = change_pin_machine();
            to_scan(&mut machine);
            let transition = card(&mut machine, event).unwrap();
            assert_eq!(transition.to, expected);
            assert_eq!(
                transition.effects,
                vec![Effect::CancelTask, Effect::DiscardCallback]
            );
        }
    }

    #[test]
    fn test_completion_with_pending_identification() {
        let mut machine = change_pin_machine();
        ui(
            &mut machine,
            UiEvent::StartFlow {
                identification_pending: true,
                has_transport_pin: true,
            },
        )
        .unwrap();
        ui(&mut machine, UiEvent::EnterOldSecret("12345".into())).unwrap();
        ui(&mut machine, UiEvent::ConfirmNewPinIntro).unwrap();
        ui(&mut machine, UiEvent::EnterNewPin("123456".into())).unwrap();
        ui(&mut machine, UiEvent::ConfirmNewPin("123456".into())).unwrap();

        let transition = card(&mut machine, CardEvent::ProcessCompletedWithoutResult).unwrap();
        assert_eq!(transition.to, FlowState::Finished { redirect: None });
        assert!(transition
            .effects
            .contains(&Effect::Navigate(NavigationRequest::StartIdentification)));
        assert!(machine.session().is_none());

        // Late informational events after the end are tolerated
        assert!(card(&mut machine, CardEvent::CardRemoved).is_ok());
    }

    #[test]
    fn test_back_navigation() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);

        // Scan screen back to new PIN input, cancelling the card session
        let transition = ui(&mut machine, UiEvent::Back).unwrap();
        assert_eq!(transition.to, FlowState::NewPinInput);
        assert_eq!(
            transition.effects,
            vec![Effect::CancelTask, Effect::DiscardCallback]
        );
        assert_eq!(machine.session().unwrap().card_insertions(), 0);

        assert_eq!(ui(&mut machine, UiEvent::Back).unwrap().to, FlowState::NewPinIntro);
        assert_eq!(
            ui(&mut machine, UiEvent::Back).unwrap().to,
            FlowState::OldTransportOrPersonalPinInput
        );

        let transition = ui(&mut machine, UiEvent::Back).unwrap();
        assert!(transition.backed_down);
        assert_eq!(transition.to, FlowState::Invalid);
        assert_eq!(
            transition.effects,
            vec![Effect::Navigate(NavigationRequest::PopToRoot)]
        );
    }

    #[test]
    fn test_back_from_retry_is_illegal() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);
        card(&mut machine, CardEvent::PinRequested { attempts: Some(2) }).unwrap();
        assert!(ui(&mut machine, UiEvent::Back).is_err());
    }

    #[test]
    fn test_can_request_after_suspension_keeps_old_secret() {
        let mut machine = change_pin_machine();
        to_scan(&mut machine);

        // Suspended from the start: the entered PIN was never tried
        let transition = card(&mut machine, CardEvent::CanRequested).unwrap();
        match transition.effects.as_slice() {
            [Effect::StartCanFlow(params)] => assert!(!params.reenter_old_secret),
            other => panic!("Expected StartCanFlow, got {:?}", other),
        }

        // Rejected after a retry: the CAN sub-flow asks for it again
        let mut machine = change_pin_machine();
        to_scan(&mut machine);
        card(&mut machine, CardEvent::PinRequested { attempts: Some(2) }).unwrap();
        ui(&mut machine, UiEvent::EnterOldSecret("54321".into())).unwrap();
        let transition = card(&mut machine, CardEvent::CanRequested).unwrap();
        match transition.effects.as_slice() {
            [Effect::StartCanFlow(params)] => assert!(params.reenter_old_secret),
            other => panic!("Expected StartCanFlow, got {:?}", other),
        }
    }

    #[test]
    fn test_invalidate_from_every_state() {
        let setups: Vec<fn(&mut FlowStateMachine)> = vec![
            |m| start(m, true),
            |m| {
                start(m, true);
                ui(m, UiEvent::EnterOldSecret("12345".into())).unwrap();
            },
            |m| {
                start(m, true);
                ui(m, UiEvent::EnterOldSecret("12345".into())).unwrap();
                ui(m, UiEvent::ConfirmNewPinIntro).unwrap();
            },
            to_confirmation,
            to_scan,
            |m| {
                to_scan(m);
                card(m, CardEvent::PinRequested { attempts: Some(2) }).unwrap();
                ui(m, UiEvent::EnterOldSecret("54321".into())).unwrap();
            },
            |m| {
                to_scan(m);
                card(m, CardEvent::PinRequested { attempts: None }).unwrap();
            },
            |m| {
                to_scan(m);
                card(m, CardEvent::NewPinRequested { attempts: None }).unwrap();
            },
            |m| {
                to_scan(m);
                card(m, CardEvent::PinRequested { attempts: Some(2) }).unwrap();
            },
            |m| {
                to_scan(m);
                card(m, CardEvent::CanRequested).unwrap();
            },
            |m| {
                to_scan(m);
                card(m, CardEvent::CardBlocked).unwrap();
            },
            |m| {
                to_scan(m);
                card(m, CardEvent::CardDeactivated).unwrap();
            },
            |m| {
                to_scan(m);
                let error = CardError::ProcessFailed { redirect: None };
                card(m, CardEvent::Error { error }).unwrap();
            },
            |m| {
                to_scan(m);
                let error = CardError::FrameworkError {
                    message: "nfc".to_string(),
                };
                card(m, CardEvent::Error { error }).unwrap();
            },
            |m| {
                to_scan(m);
                card(m, CardEvent::CanRequested).unwrap();
                m.handle(FlowEvent::CanFlowFinished(CanFlowOutcome::Exhausted))
                    .unwrap();
            },
        ];

        let mut seen = Vec::new();
        for setup in setups {
            let mut machine = change_pin_machine();
            setup(&mut machine);
            let from = machine.state().clone();
            assert!(!from.is_terminal(), "{} is terminal", from);

            let transition = ui(&mut machine, UiEvent::Invalidate).unwrap();
            assert_eq!(transition.to, FlowState::Invalid, "from {}", from);
            assert!(transition.effects.contains(&Effect::CancelTask), "from {}", from);
            assert!(
                transition.effects.contains(&Effect::DiscardCallback),
                "from {}",
                from
            );
            assert_eq!(
                transition.effects.contains(&Effect::StopCanFlow),
                matches!(from, FlowState::CanRequested { .. })
            );
            assert!(machine.session().is_none());
            seen.push(from);
        }
        assert!(seen.contains(&FlowState::WaitingForCardReAttachment));
        assert!(seen.contains(&FlowState::FrameworkReadyForNewPinInput));
        assert!(seen.contains(&FlowState::CanBlocked));

        // Idempotent, and the counter starts fresh in the next session
        let mut machine = change_pin_machine();
        to_scan(&mut machine);
        card(&mut machine, CardEvent::PinRequested { attempts: Some(1) }).unwrap();
        ui(&mut machine, UiEvent::Invalidate).unwrap();
        let transition = ui(&mut machine, UiEvent::Invalidate).unwrap();
        assert!(transition.effects.is_empty());
        start(&mut machine, true);
        assert_eq!(machine.session().unwrap().attempts_remaining(), None);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut machine = identify_machine();
        start(&mut machine, false);
        ui(&mut machine, UiEvent::EnterOldSecret("123456".into())).unwrap();

        let transition = ui(&mut machine, UiEvent::Cancel).unwrap();
        assert_eq!(transition.to, FlowState::Cancelled);
        assert!(transition.effects.contains(&Effect::CancelTask));

        let transition = ui(&mut machine, UiEvent::Cancel).unwrap();
        assert!(!transition.is_state_change());
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_finish_from_failure_state() {
        let mut machine = identify_machine();
        start(&mut machine, false);
        ui(&mut machine, UiEvent::EnterOldSecret("123456".into())).unwrap();
        let redirect = Url::parse("https://service.example/failed").unwrap();
        card(
            &mut machine,
            CardEvent::Error {
                error: CardError::ProcessFailed {
                    redirect: Some(redirect.clone()),
                },
            },
        )
        .unwrap();

        let transition = ui(&mut machine, UiEvent::Finish).unwrap();
        assert_eq!(transition.to, FlowState::Finished { redirect: None });
        assert!(transition
            .effects
            .contains(&Effect::Navigate(NavigationRequest::OpenRedirect { url: redirect })));
    }

    #[test]
    fn test_new_pin_request_in_identify_is_illegal() {
        let mut machine = identify_machine();
        start(&mut machine, false);
        ui(&mut machine, UiEvent::EnterOldSecret("123456".into())).unwrap();
        assert!(card(&mut machine, CardEvent::NewPinRequested { attempts: None }).is_err());
    }
}
