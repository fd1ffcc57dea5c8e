//! Flow coordinator
//!
//! Owns one [`FlowStateMachine`] and the card session adapter it drives. All
//! input is serialized through a single command queue: UI events arrive from
//! [`FlowHandle`]s, adapter events are forwarded into the same queue by a
//! per-task forwarder. The coordinator carries out the effects the state
//! machine returns and publishes every change as a [`FlowNotification`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use eid_core::{
    AdapterEvent, CardError, CardEvent, CardInput, CardSessionAdapter, PendingCallback,
    RequestKind, Secret, TaskKind,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::can_flow::{CanFlowEvent, CanFlowState, CanFlowStep, CanSubFlow};
use crate::config::FlowConfig;
use crate::error::{FlowError, FlowResult};
use crate::machine::FlowStateMachine;
use crate::state::{Effect, FlowEvent, FlowKind, FlowState, NavigationRequest, Transition, UiEvent};

/// Point-in-time view of a flow, safe to render or serialize
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub session_id: Uuid,
    pub kind: FlowKind,
    pub state: FlowState,
    pub attempts_remaining: Option<u8>,
    pub confirmation_failed: bool,
    pub can_flow: Option<CanFlowState>,
    pub pending_request: Option<RequestKind>,
    pub task_running: bool,
    pub updated_at: DateTime<Utc>,
}

impl FlowSnapshot {
    /// Equal apart from the timestamp
    pub fn same_view(&self, other: &FlowSnapshot) -> bool {
        self.session_id == other.session_id
            && self.kind == other.kind
            && self.state == other.state
            && self.attempts_remaining == other.attempts_remaining
            && self.confirmation_failed == other.confirmation_failed
            && self.can_flow == other.can_flow
            && self.pending_request == other.pending_request
            && self.task_running == other.task_running
    }
}

/// Published on the coordinator's broadcast channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notification", rename_all = "snake_case")]
pub enum FlowNotification {
    StateChanged { snapshot: FlowSnapshot },
    /// New PIN and confirmation differ
    ConfirmationFailed,
    Navigation { request: NavigationRequest },
    /// Card event not applied to the main flow
    EventIgnored { event: String, reason: String },
    IllegalTransition { state: String, event: String },
    /// Input rejected for another reason, e.g. a malformed secret
    Rejected { event: String, message: String },
    CallbackFailed { message: String },
}

enum Command {
    Ui {
        event: UiEvent,
        reply: oneshot::Sender<FlowResult<FlowSnapshot>>,
    },
    Can {
        event: CanFlowEvent,
        reply: oneshot::Sender<FlowResult<FlowSnapshot>>,
    },
    Snapshot {
        reply: oneshot::Sender<FlowSnapshot>,
    },
    Card {
        generation: u64,
        event: AdapterEvent,
    },
    TaskEnded {
        generation: u64,
    },
}

/// Actor serializing all flow input
pub struct FlowCoordinator {
    session_id: Uuid,
    adapter: Arc<dyn CardSessionAdapter>,
    config: FlowConfig,
    machine: FlowStateMachine,
    can_flow: Option<CanSubFlow>,
    pending: PendingCallback,
    /// Incremented on every task start and cancel
    generation: u64,
    forwarder: Option<JoinHandle<()>>,
    commands: mpsc::WeakSender<Command>,
    notifications: broadcast::Sender<FlowNotification>,
    last_published: Option<FlowSnapshot>,
}

impl FlowCoordinator {
    /// Spawn a coordinator on the current runtime
    ///
    /// The coordinator stops, invalidating any active session, once every
    /// handle has been dropped.
    pub fn spawn(
        adapter: Arc<dyn CardSessionAdapter>,
        kind: FlowKind,
        config: FlowConfig,
    ) -> FlowHandle {
        let session_id = Uuid::new_v4();
        let (commands_tx, commands_rx) = mpsc::channel(config.command_buffer.max(1));
        let (notifications, _) = broadcast::channel(config.notification_buffer.max(1));

        let span = info_span!("flow", %session_id, %kind);
        let coordinator = Self {
            session_id,
            adapter,
            machine: FlowStateMachine::new(kind, config.clone()),
            config,
            can_flow: None,
            pending: PendingCallback::new(),
            generation: 0,
            forwarder: None,
            commands: commands_tx.downgrade(),
            notifications: notifications.clone(),
            last_published: None,
        };
        tokio::spawn(coordinator.run(commands_rx).instrument(span));

        FlowHandle {
            session_id,
            commands: commands_tx,
            notifications,
        }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("Flow coordinator started");
        while let Some(command) = commands.recv().await {
            self.handle_command(command).await;
            self.publish_if_changed();
        }

        if !self.machine.state().is_terminal() {
            info!("All flow handles dropped, invalidating session");
        }
        // Invalidate is accepted in every state
        let _ = self
            .dispatch(FlowEvent::Ui(UiEvent::Invalidate))
            .await;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        debug!("Flow coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Ui { event, reply } => {
                let result = self.dispatch(FlowEvent::Ui(event)).await;
                let _ = reply.send(result.map(|_| self.snapshot()));
            }
            Command::Can { event, reply } => {
                let result = self.handle_can_event(event).await;
                let _ = reply.send(result.map(|_| self.snapshot()));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Card { generation, event } => {
                self.handle_card_event(generation, event).await;
            }
            Command::TaskEnded { generation } => {
                if generation == self.generation {
                    debug!(generation, "Adapter task ended");
                    self.forwarder = None;
                }
            }
        }
    }

    // =========================================================================
    // Event routing
    // =========================================================================

    /// Run an event and every follow-up event it causes, in order
    ///
    /// Returns the result of the first event; follow-ups are reported through
    /// notifications only.
    async fn dispatch(&mut self, event: FlowEvent) -> FlowResult<()> {
        self.dispatch_all(vec![event]).await
    }

    async fn dispatch_all(&mut self, events: Vec<FlowEvent>) -> FlowResult<()> {
        let mut queue: VecDeque<FlowEvent> = events.into();
        let mut result = Ok(());
        let mut first = true;

        while let Some(event) = queue.pop_front() {
            let name = event.name();
            match self.machine.handle(event) {
                Ok(transition) => {
                    let follow_up = self.execute(transition).await;
                    queue.extend(follow_up);
                }
                Err(e) => {
                    self.report(&e, name);
                    if first {
                        result = Err(e);
                    }
                }
            }
            first = false;
        }
        result
    }

    async fn handle_card_event(&mut self, generation: u64, event: AdapterEvent) {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                event = event.event.name(),
                "Dropped event from a cancelled task"
            );
            return;
        }

        let (event, request) = event.into_parts();

        let Some(can_flow) = self.can_flow.as_mut() else {
            if let Some(request) = request {
                self.pending.store(request);
            }
            let _ = self.dispatch(FlowEvent::Card(event)).await;
            return;
        };

        let name = event.name();
        let waiting = can_flow.state() == CanFlowState::WaitingForCard;
        let consumed = match event {
            CardEvent::CanRequested => true,
            CardEvent::CardInsertionRequested => waiting,
            _ => event.is_informational(),
        };
        let step = can_flow.on_card_event(event);
        let ignored = matches!(step, Ok(CanFlowStep::Continue)) && !consumed;

        // An ignored event must not take over the CAN request
        match request {
            Some(request) if ignored => {
                debug!(kind = %request.kind(), "Dropped pending request of an ignored event");
            }
            Some(request) => {
                self.pending.store(request);
            }
            None => {}
        }

        match step {
            Ok(CanFlowStep::Continue) if ignored => {
                debug!(event = name, "Card event ignored while CAN sub-flow is active");
                self.publish(FlowNotification::EventIgnored {
                    event: name.to_string(),
                    reason: "CAN sub-flow active".to_string(),
                });
            }
            Ok(step) => {
                let _ = self.apply_can_step(step).await;
            }
            Err(e) => self.report(&e, name),
        }
    }

    async fn handle_can_event(&mut self, event: CanFlowEvent) -> FlowResult<()> {
        let name = event.name();
        let step = match self.can_flow.as_mut() {
            Some(can_flow) => can_flow.handle(event),
            None => Err(FlowError::CanFlowNotActive),
        };
        match step {
            Ok(step) => self.apply_can_step(step).await,
            Err(e) => {
                self.report(&e, name);
                Err(e)
            }
        }
    }

    async fn apply_can_step(&mut self, step: CanFlowStep) -> FlowResult<()> {
        match step {
            CanFlowStep::Continue => Ok(()),
            CanFlowStep::Resolve(input) => {
                self.provide(CardInput::Can(input));
                Ok(())
            }
            CanFlowStep::Finished { outcome, replay } => {
                self.can_flow = None;
                let mut events = vec![FlowEvent::CanFlowFinished(outcome)];
                if let Some(event) = replay {
                    events.push(FlowEvent::Card(event));
                }
                self.dispatch_all(events).await
            }
        }
    }

    // =========================================================================
    // Effects
    // =========================================================================

    /// Carry out a transition's effects; returns follow-up events
    async fn execute(&mut self, transition: Transition) -> Vec<FlowEvent> {
        let Transition {
            from, to, effects, ..
        } = transition;
        let mut follow_up = Vec::new();
        let mut navigation = Vec::new();

        for effect in effects {
            match effect {
                Effect::StartTask(task) => {
                    if let Err(e) = self.start_task(&task).await {
                        warn!(error = %e, "Failed to start adapter task");
                        follow_up.push(FlowEvent::Card(CardEvent::Error {
                            error: CardError::FrameworkError {
                                message: e.to_string(),
                            },
                        }));
                    }
                }
                Effect::ProvidePin(pin) => self.provide(CardInput::Pin(pin)),
                Effect::ProvideChangedPin(input) => self.provide(CardInput::ChangedPin(input)),
                Effect::CancelTask => self.cancel_task().await,
                Effect::DiscardCallback => {
                    self.pending.discard();
                }
                Effect::StartCanFlow(params) => {
                    if self.can_flow.is_some() {
                        warn!("CAN sub-flow already active, ignoring start");
                    } else {
                        self.can_flow = Some(CanSubFlow::new(
                            params,
                            &self.config.can,
                            self.config.validate_secrets,
                        ));
                    }
                }
                Effect::StopCanFlow => {
                    if let Some(mut can_flow) = self.can_flow.take() {
                        can_flow.stop();
                    }
                }
                Effect::Navigate(request) => navigation.push(request),
            }
        }

        if from != to {
            let snapshot = self.snapshot();
            self.last_published = Some(snapshot.clone());
            self.publish(FlowNotification::StateChanged { snapshot });
        }
        for request in navigation {
            info!(?request, "Navigation requested");
            self.publish(FlowNotification::Navigation { request });
        }
        follow_up
    }

    async fn start_task(&mut self, task: &TaskKind) -> FlowResult<()> {
        if self.forwarder.is_some() {
            self.cancel_task().await;
        }
        self.generation += 1;
        let generation = self.generation;

        let mut events = self.adapter.start(task).await?;
        info!(generation, ?task, "Adapter task started");

        let commands = self.commands.clone();
        let forwarder = async move {
            while let Some(event) = events.recv().await {
                let Some(commands) = commands.upgrade() else {
                    return;
                };
                if commands
                    .send(Command::Card { generation, event })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::TaskEnded { generation }).await;
            }
        };
        self.forwarder = Some(tokio::spawn(forwarder.in_current_span()));
        Ok(())
    }

    async fn cancel_task(&mut self) {
        self.generation += 1;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            debug!("Event forwarder stopped");
        }
        self.adapter.cancel_task().await;
    }

    fn provide(&mut self, input: CardInput) {
        let kind = input.kind();
        if let Err(e) = self.pending.resolve(input) {
            warn!(%kind, error = %e, "Could not answer pending request");
            self.publish(FlowNotification::CallbackFailed {
                message: e.to_string(),
            });
        }
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    fn snapshot(&self) -> FlowSnapshot {
        let session = self.machine.session();
        FlowSnapshot {
            session_id: self.session_id,
            kind: self.machine.kind().clone(),
            state: self.machine.state().clone(),
            attempts_remaining: session.and_then(|session| session.attempts_remaining()),
            confirmation_failed: session.is_some_and(|session| session.confirmation_failed()),
            can_flow: self.can_flow.as_ref().map(CanSubFlow::state),
            pending_request: self.pending.kind(),
            task_running: self.forwarder.is_some(),
            updated_at: Utc::now(),
        }
    }

    fn publish(&self, notification: FlowNotification) {
        // No subscribers is fine
        let _ = self.notifications.send(notification);
    }

    fn publish_if_changed(&mut self) {
        let snapshot = self.snapshot();
        let changed = self
            .last_published
            .as_ref()
            .map_or(true, |last| !last.same_view(&snapshot));
        if changed {
            self.last_published = Some(snapshot.clone());
            self.publish(FlowNotification::StateChanged { snapshot });
        }
    }

    fn report(&self, error: &FlowError, event: &str) {
        let notification = match error {
            FlowError::PinConfirmationFailed => FlowNotification::ConfirmationFailed,
            FlowError::IllegalTransition { state, event } => FlowNotification::IllegalTransition {
                state: state.clone(),
                event: event.clone(),
            },
            other => FlowNotification::Rejected {
                event: event.to_string(),
                message: other.to_string(),
            },
        };
        self.publish(notification);
    }
}

/// Handle to a running [`FlowCoordinator`]
///
/// Cheap to clone. The coordinator stops once every handle is dropped.
#[derive(Clone)]
pub struct FlowHandle {
    session_id: Uuid,
    commands: mpsc::Sender<Command>,
    notifications: broadcast::Sender<FlowNotification>,
}

impl FlowHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlowNotification> {
        self.notifications.subscribe()
    }

    /// Send a UI event and wait until it has been processed
    pub async fn send(&self, event: UiEvent) -> FlowResult<FlowSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Ui { event, reply }).await?;
        rx.await.map_err(|_| FlowError::CoordinatorClosed)?
    }

    /// Send an event to the active CAN sub-flow
    pub async fn can(&self, event: CanFlowEvent) -> FlowResult<FlowSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Can { event, reply }).await?;
        rx.await.map_err(|_| FlowError::CoordinatorClosed)?
    }

    pub async fn snapshot(&self) -> FlowResult<FlowSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Snapshot { reply }).await?;
        rx.await.map_err(|_| FlowError::CoordinatorClosed)
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_for<F>(
        &self,
        description: &str,
        timeout: Duration,
        predicate: F,
    ) -> FlowResult<FlowSnapshot>
    where
        F: Fn(&FlowSnapshot) -> bool,
    {
        let mut notifications = self.subscribe();
        let current = self.snapshot().await?;
        if predicate(&current) {
            return Ok(current);
        }

        let wait = async {
            loop {
                match notifications.recv().await {
                    Ok(FlowNotification::StateChanged { snapshot }) if predicate(&snapshot) => {
                        return Ok(snapshot);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Notification receiver lagged");
                        let snapshot = self.snapshot().await?;
                        if predicate(&snapshot) {
                            return Ok(snapshot);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(FlowError::CoordinatorClosed);
                    }
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| FlowError::Timeout(description.to_string()))?
    }

    /// Wait until the main flow is in a state matching `predicate`
    pub async fn wait_for_state<F>(&self, timeout: Duration, predicate: F) -> FlowResult<FlowSnapshot>
    where
        F: Fn(&FlowState) -> bool,
    {
        self.wait_for("flow state", timeout, |snapshot| predicate(&snapshot.state))
            .await
    }

    // Convenience wrappers

    pub async fn start(
        &self,
        identification_pending: bool,
        has_transport_pin: bool,
    ) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::StartFlow {
            identification_pending,
            has_transport_pin,
        })
        .await
    }

    pub async fn enter_old_secret(&self, secret: impl Into<Secret>) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::EnterOldSecret(secret.into())).await
    }

    pub async fn confirm_new_pin_intro(&self) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::ConfirmNewPinIntro).await
    }

    pub async fn enter_new_pin(&self, pin: impl Into<Secret>) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::EnterNewPin(pin.into())).await
    }

    pub async fn confirm_new_pin(&self, pin: impl Into<Secret>) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::ConfirmNewPin(pin.into())).await
    }

    pub async fn retry_new_pin_confirmation(&self) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::RetryNewPinConfirmation).await
    }

    pub async fn back(&self) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::Back).await
    }

    pub async fn cancel(&self) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::Cancel).await
    }

    pub async fn finish(&self) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::Finish).await
    }

    pub async fn invalidate(&self) -> FlowResult<FlowSnapshot> {
        self.send(UiEvent::Invalidate).await
    }

    pub async fn confirm_can_intro(&self) -> FlowResult<FlowSnapshot> {
        self.can(CanFlowEvent::ConfirmIntro).await
    }

    pub async fn enter_can(&self, can: impl Into<Secret>) -> FlowResult<FlowSnapshot> {
        self.can(CanFlowEvent::EnterCan(can.into())).await
    }

    pub async fn reenter_old_secret(&self, secret: impl Into<Secret>) -> FlowResult<FlowSnapshot> {
        self.can(CanFlowEvent::EnterOldSecret(secret.into())).await
    }

    pub async fn skip_can(&self) -> FlowResult<FlowSnapshot> {
        self.can(CanFlowEvent::Skip).await
    }

    pub async fn cancel_can(&self) -> FlowResult<FlowSnapshot> {
        self.can(CanFlowEvent::Cancel).await
    }

    async fn command(&self, command: Command) -> FlowResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FlowError::CoordinatorClosed)
    }
}

impl std::fmt::Debug for FlowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowHandle")
            .field("session_id", &self.session_id)
            .finish()
    }
}
