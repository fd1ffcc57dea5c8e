//! Scripted user for a flow
//!
//! [`Autopilot`] plays the UI: it looks at every published snapshot and
//! decides which input a user would give next, taking secrets from a
//! [`Script`]. [`run_flow`] wires it to a coordinator and records a
//! transcript.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use eid_core::CardSessionAdapter;
use eid_flow::{
    CanFlowState, FlowCoordinator, FlowError, FlowHandle, FlowKind, FlowNotification,
    FlowSnapshot, FlowState, NavigationRequest,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::config::MergedConfig;
use crate::output::{OutputContext, TranscriptRow};

/// Secrets and flags a scripted user brings to a flow
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub identification_pending: bool,
    pub has_transport_pin: bool,
    /// First transport or personal PIN entry
    pub old_secret: String,
    /// Further PIN entries, used in order whenever the card asks again
    pub retry_pins: VecDeque<String>,
    pub new_pin: Option<String>,
    /// Defaults to the new PIN
    pub confirmation: Option<String>,
    /// CAN entries, used in order
    pub cans: VecDeque<String>,
}

/// Input the autopilot gives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    EnterOldSecret(String),
    ConfirmNewPinIntro,
    EnterNewPin(String),
    ConfirmNewPin(String),
    RetryNewPinConfirmation,
    ConfirmCanIntro,
    EnterCan(String),
    ReenterOldSecret(String),
    CancelCan,
    Cancel,
    Finish,
}

impl Action {
    async fn apply(&self, handle: &FlowHandle) -> Result<FlowSnapshot, FlowError> {
        match self {
            Action::EnterOldSecret(secret) => handle.enter_old_secret(secret.as_str()).await,
            Action::ConfirmNewPinIntro => handle.confirm_new_pin_intro().await,
            Action::EnterNewPin(pin) => handle.enter_new_pin(pin.as_str()).await,
            Action::ConfirmNewPin(pin) => handle.confirm_new_pin(pin.as_str()).await,
            Action::RetryNewPinConfirmation => handle.retry_new_pin_confirmation().await,
            Action::ConfirmCanIntro => handle.confirm_can_intro().await,
            Action::EnterCan(can) => handle.enter_can(can.as_str()).await,
            Action::ReenterOldSecret(secret) => handle.reenter_old_secret(secret.as_str()).await,
            Action::CancelCan => handle.cancel_can().await,
            Action::Cancel => handle.cancel().await,
            Action::Finish => handle.finish().await,
        }
    }
}

// Secrets are never printed, only their length
impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::EnterOldSecret(s) => write!(f, "enter old PIN ({} digits)", s.len()),
            Action::ConfirmNewPinIntro => f.write_str("confirm new PIN intro"),
            Action::EnterNewPin(s) => write!(f, "enter new PIN ({} digits)", s.len()),
            Action::ConfirmNewPin(s) => write!(f, "confirm new PIN ({} digits)", s.len()),
            Action::RetryNewPinConfirmation => f.write_str("retry new PIN"),
            Action::ConfirmCanIntro => f.write_str("confirm CAN intro"),
            Action::EnterCan(s) => write!(f, "enter CAN ({} digits)", s.len()),
            Action::ReenterOldSecret(s) => write!(f, "re-enter PIN ({} digits)", s.len()),
            Action::CancelCan => f.write_str("cancel CAN entry"),
            Action::Cancel => f.write_str("cancel"),
            Action::Finish => f.write_str("finish"),
        }
    }
}

type View = (FlowState, Option<CanFlowState>, bool);

/// Decides the next user input from a snapshot
#[derive(Debug)]
pub struct Autopilot {
    script: Script,
    current_old: String,
    last_view: Option<View>,
}

impl Autopilot {
    pub fn new(script: Script) -> Self {
        Self {
            current_old: script.old_secret.clone(),
            script,
            last_view: None,
        }
    }

    /// Next input for `snapshot`, or `None` to wait for the card
    ///
    /// A snapshot that only differs from the previous one in fields the
    /// user cannot see gets no second answer.
    pub fn next_action(&mut self, snapshot: &FlowSnapshot) -> Option<Action> {
        let view = (
            snapshot.state.clone(),
            snapshot.can_flow,
            snapshot.confirmation_failed,
        );
        if self.last_view.as_ref() == Some(&view) {
            return None;
        }
        self.last_view = Some(view);

        if snapshot.state.is_failure() {
            return Some(Action::Finish);
        }

        match &snapshot.state {
            FlowState::OldTransportOrPersonalPinInput => {
                Some(Action::EnterOldSecret(self.current_old.clone()))
            }
            FlowState::OldSecretRetry { .. } => match self.script.retry_pins.pop_front() {
                Some(pin) => {
                    self.current_old = pin.clone();
                    Some(Action::EnterOldSecret(pin))
                }
                None => Some(Action::Cancel),
            },
            FlowState::NewPinIntro => Some(Action::ConfirmNewPinIntro),
            FlowState::NewPinInput => match &self.script.new_pin {
                Some(pin) => Some(Action::EnterNewPin(pin.clone())),
                None => Some(Action::Cancel),
            },
            FlowState::NewPinConfirmation if snapshot.confirmation_failed => {
                // Second round confirms with the new PIN itself
                self.script.confirmation = None;
                Some(Action::RetryNewPinConfirmation)
            }
            FlowState::NewPinConfirmation => {
                match self.script.confirmation.clone().or_else(|| self.script.new_pin.clone()) {
                    Some(pin) => Some(Action::ConfirmNewPin(pin)),
                    None => Some(Action::Cancel),
                }
            }
            FlowState::CanRequested { .. } => self.can_action(snapshot.can_flow),
            _ => None,
        }
    }

    fn can_action(&mut self, can_flow: Option<CanFlowState>) -> Option<Action> {
        match can_flow? {
            CanFlowState::Intro => Some(Action::ConfirmCanIntro),
            CanFlowState::CanInput | CanFlowState::CanIncorrect { .. } => {
                match self.script.cans.pop_front() {
                    Some(can) => Some(Action::EnterCan(can)),
                    None => Some(Action::CancelCan),
                }
            }
            CanFlowState::OldSecretInput => {
                if let Some(pin) = self.script.retry_pins.pop_front() {
                    self.current_old = pin;
                }
                Some(Action::ReenterOldSecret(self.current_old.clone()))
            }
            CanFlowState::WaitingForCard | CanFlowState::Finished => None,
        }
    }
}

/// What a driven flow ended with
#[derive(Debug)]
pub struct FlowReport {
    /// First failure state, or the terminal state when none occurred
    pub outcome: FlowState,
    pub navigation: Vec<NavigationRequest>,
    pub transcript: Vec<TranscriptRow>,
}

impl FlowReport {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, FlowState::Finished { .. })
    }
}

/// Drive one flow to its end against `adapter`
pub async fn run_flow(
    adapter: Arc<dyn CardSessionAdapter>,
    kind: FlowKind,
    script: Script,
    config: &MergedConfig,
    ctx: &OutputContext,
) -> Result<FlowReport> {
    let handle = FlowCoordinator::spawn(adapter, kind, config.flow.clone());
    let mut notifications = handle.subscribe();
    let started = Instant::now();
    let mut report = FlowReport {
        outcome: FlowState::Invalid,
        navigation: Vec::new(),
        transcript: Vec::new(),
    };

    handle
        .start(script.identification_pending, script.has_transport_pin)
        .await
        .context("Failed to start flow")?;

    let mut autopilot = Autopilot::new(script);
    let driven = tokio::time::timeout(
        config.timeout,
        drive(&handle, &mut notifications, &mut autopilot, started, ctx, &mut report),
    )
    .await;

    match driven {
        Ok(result) => result?,
        Err(_) => {
            let _ = handle.cancel().await;
            bail!("Flow did not finish within {:?}", config.timeout);
        }
    }

    // Navigation requested together with the final state
    while let Ok(notification) = notifications.try_recv() {
        ctx.notification(started.elapsed(), &notification);
        if let FlowNotification::Navigation { request } = notification {
            report.navigation.push(request);
        }
    }
    Ok(report)
}

async fn drive(
    handle: &FlowHandle,
    notifications: &mut tokio::sync::broadcast::Receiver<FlowNotification>,
    autopilot: &mut Autopilot,
    started: Instant,
    ctx: &OutputContext,
    report: &mut FlowReport,
) -> Result<()> {
    let mut failure = None;

    loop {
        let notification = match notifications.recv().await {
            Ok(notification) => notification,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed flow notifications");
                FlowNotification::StateChanged {
                    snapshot: handle.snapshot().await?,
                }
            }
            Err(RecvError::Closed) => bail!("Flow coordinator stopped unexpectedly"),
        };
        let elapsed = started.elapsed();
        ctx.notification(elapsed, &notification);

        let snapshot = match notification {
            FlowNotification::StateChanged { snapshot } => snapshot,
            FlowNotification::Navigation { request } => {
                report.navigation.push(request);
                continue;
            }
            _ => continue,
        };

        if snapshot.state.is_failure() && failure.is_none() {
            failure = Some(snapshot.state.clone());
        }
        if snapshot.state.is_terminal() {
            report
                .transcript
                .push(TranscriptRow::new(report.transcript.len() + 1, elapsed, &snapshot, None));
            report.outcome = failure.unwrap_or(snapshot.state);
            return Ok(());
        }

        let action = autopilot.next_action(&snapshot);
        let input = action.as_ref().map(ToString::to_string);
        report.transcript.push(TranscriptRow::new(
            report.transcript.len() + 1,
            elapsed,
            &snapshot,
            input.as_deref(),
        ));

        if let Some(action) = action {
            ctx.action(started.elapsed(), &action.to_string());
            match action.apply(handle).await {
                Ok(_) => {}
                Err(e) if e.is_soft() => debug!(error = %e, "Input rejected, flow unchanged"),
                Err(FlowError::CoordinatorClosed) => bail!("Flow coordinator stopped unexpectedly"),
                Err(e) => ctx.warn(&format!("{} failed: {}", action, e)),
            }
        }
    }
}
