//! Simulated card session adapter
//!
//! Each task runs on its own tokio task and talks to the consumer only through
//! the event channel returned by `identify`/`change_pin`. Card state (PIN,
//! retry counter) lives behind a mutex and survives across tasks, so a flow
//! that is cancelled and restarted sees the counter where the card left it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eid_core::{
    event_channel, AdapterError, AdapterEvent, CardError, CardEvent, CardInput,
    CardSessionAdapter, EventReceiver, EventSender, PendingRequest, RequestKind, Secret,
    SecretKind, TaskKind,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::profile::{CardProfile, ServerOutcome, MAX_PIN_ATTEMPTS};

/// Mutable card state
#[derive(Debug)]
struct CardState {
    pin: Secret,
    transport_pin_active: bool,
    can: Secret,
    puk: Secret,
    retry_counter: u8,
    /// CAN accepted in the running task, one more PIN attempt allowed
    can_verified: bool,
    deactivated: bool,
}

impl CardState {
    fn from_profile(profile: &CardProfile) -> Self {
        let (pin, transport_pin_active) = match &profile.transport_pin {
            Some(transport_pin) => (Secret::new(transport_pin.as_str()), true),
            None => (Secret::new(profile.pin.as_str()), false),
        };
        Self {
            pin,
            transport_pin_active,
            can: Secret::new(profile.can.as_str()),
            puk: Secret::new(profile.puk.as_str()),
            retry_counter: profile.pin_retry_counter.min(MAX_PIN_ATTEMPTS),
            can_verified: false,
            deactivated: profile.deactivated,
        }
    }

    fn check_pin(&mut self, pin: &Secret) -> bool {
        if *pin == self.pin {
            self.retry_counter = MAX_PIN_ATTEMPTS;
            self.can_verified = false;
            true
        } else {
            self.retry_counter = self.retry_counter.saturating_sub(1);
            false
        }
    }
}

/// Why a task stopped early
#[derive(Debug)]
enum Halt {
    /// The consumer dropped the event receiver
    Disconnected,
    /// The consumer dropped a pending request without answering
    Abandoned(RequestKind),
}

type Step<T> = Result<T, Halt>;

enum PinCheck {
    Verified { new_pin: Option<Secret> },
    Blocked,
    Failed(CardError),
}

/// Simulated eID card
pub struct SimulatedCard {
    profile: CardProfile,
    card: Arc<Mutex<CardState>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedCard {
    pub fn new(profile: CardProfile) -> Self {
        let card = CardState::from_profile(&profile);
        Self {
            profile,
            card: Arc::new(Mutex::new(card)),
            worker: Mutex::new(None),
        }
    }

    pub fn profile(&self) -> &CardProfile {
        &self.profile
    }

    /// Remaining PIN attempts
    pub fn pin_retry_counter(&self) -> u8 {
        self.card.lock().retry_counter
    }

    /// Whether `pin` is the PIN the card currently accepts
    pub fn accepts_pin(&self, pin: &str) -> bool {
        self.card.lock().pin.expose() == pin
    }

    pub fn transport_pin_active(&self) -> bool {
        self.card.lock().transport_pin_active
    }

    pub fn is_task_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| !worker.is_finished())
    }

    fn spawn(&self, task: TaskKind) -> Result<EventReceiver, AdapterError> {
        let mut worker = self.worker.lock();
        if worker.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return Err(AdapterError::Busy(
                "A task is already running on the simulated card".to_string(),
            ));
        }

        let (events, receiver) = event_channel(self.profile.event_buffer.max(1));
        let runner = TaskRunner {
            card: self.card.clone(),
            events,
            latency: Duration::from_millis(self.profile.latency_ms),
            require_reinsertion: self.profile.require_reinsertion,
            server: self.profile.server.clone(),
        };
        info!(?task, "Simulated card task started");
        *worker = Some(tokio::spawn(runner.run(task)));
        Ok(receiver)
    }
}

impl Default for SimulatedCard {
    fn default() -> Self {
        Self::new(CardProfile::default())
    }
}

#[async_trait]
impl CardSessionAdapter for SimulatedCard {
    async fn identify(&self, tc_token_url: &Url) -> Result<EventReceiver, AdapterError> {
        self.spawn(TaskKind::Identify {
            tc_token_url: tc_token_url.clone(),
        })
    }

    async fn change_pin(&self) -> Result<EventReceiver, AdapterError> {
        self.spawn(TaskKind::ChangePin)
    }

    async fn cancel_task(&self) {
        if let Some(worker) = self.worker.lock().take() {
            if !worker.is_finished() {
                debug!("Simulated card task cancelled");
            }
            worker.abort();
        }
    }
}

/// One running task
struct TaskRunner {
    card: Arc<Mutex<CardState>>,
    events: EventSender,
    latency: Duration,
    require_reinsertion: bool,
    server: ServerOutcome,
}

impl TaskRunner {
    async fn run(self, task: TaskKind) {
        match self.execute(&task).await {
            Ok(()) => debug!("Simulated card task finished"),
            Err(Halt::Disconnected) => debug!("Event receiver dropped, task stopped"),
            Err(Halt::Abandoned(kind)) => {
                debug!(%kind, "Pending request discarded, task stopped")
            }
        }
    }

    async fn execute(&self, task: &TaskKind) -> Step<()> {
        self.card.lock().can_verified = false;

        self.emit(CardEvent::ProcessStarted).await?;
        self.emit(CardEvent::CardInsertionRequested).await?;
        self.pause().await;
        self.emit(CardEvent::CardRecognized).await?;

        if self.card.lock().deactivated {
            return self.emit(CardEvent::CardDeactivated).await;
        }

        let change_pin = matches!(task, TaskKind::ChangePin);
        let new_pin = match self.verify_pin(change_pin).await? {
            PinCheck::Verified { new_pin } => new_pin,
            PinCheck::Blocked => return Ok(()),
            PinCheck::Failed(error) => return self.emit(CardEvent::Error { error }).await,
        };

        if change_pin {
            self.complete_change_pin(new_pin).await
        } else {
            self.complete_identify().await
        }
    }

    /// Ask for the PIN until the card accepts it or blocks
    ///
    /// A PIN change asks for the current and the new PIN in one request.
    async fn verify_pin(&self, change_pin: bool) -> Step<PinCheck> {
        loop {
            let (counter, can_verified) = {
                let card = self.card.lock();
                (card.retry_counter, card.can_verified)
            };

            if counter == 0 {
                match self.ask(CardEvent::PukRequested, RequestKind::Puk).await {
                    Ok(CardInput::Puk(puk)) if puk == self.card.lock().puk => {
                        info!("PUK accepted, PIN unblocked");
                        self.card.lock().retry_counter = MAX_PIN_ATTEMPTS;
                        continue;
                    }
                    Ok(_) => {
                        self.emit(CardEvent::CardBlocked).await?;
                        return Ok(PinCheck::Blocked);
                    }
                    Err(Halt::Abandoned(kind)) => {
                        // Receiver may be gone already
                        let _ = self.emit(CardEvent::CardBlocked).await;
                        return Err(Halt::Abandoned(kind));
                    }
                    Err(halt) => return Err(halt),
                }
            }

            let (pin, new_pin) = if counter == 1 && !can_verified {
                match self.ask(CardEvent::CanRequested, RequestKind::Can).await? {
                    CardInput::Can(input) => {
                        let can_matches = {
                            let mut card = self.card.lock();
                            card.can_verified = input.can == card.can;
                            card.can_verified
                        };
                        if !can_matches {
                            debug!("Wrong CAN");
                            self.reinsert().await?;
                            continue;
                        }
                        (input.pin, input.new_pin)
                    }
                    other => return Ok(PinCheck::Failed(unexpected_input(&other))),
                }
            } else {
                let attempts = (counter < MAX_PIN_ATTEMPTS).then_some(counter);
                let (event, kind) = if change_pin {
                    (CardEvent::NewPinRequested { attempts }, RequestKind::ChangedPin)
                } else {
                    (CardEvent::PinRequested { attempts }, RequestKind::Pin)
                };
                match self.ask(event, kind).await? {
                    CardInput::Pin(pin) if !change_pin => (pin, None),
                    CardInput::ChangedPin(input) if change_pin => (input.pin, Some(input.new_pin)),
                    other => return Ok(PinCheck::Failed(unexpected_input(&other))),
                }
            };

            self.pause().await;
            let (accepted, remaining) = {
                let mut card = self.card.lock();
                let accepted = card.check_pin(&pin);
                (accepted, card.retry_counter)
            };
            if accepted {
                return Ok(PinCheck::Verified { new_pin });
            }
            info!(remaining, "Wrong PIN");
            self.reinsert().await?;
        }
    }

    /// Have the card pulled and presented again, if the profile asks for it
    async fn reinsert(&self) -> Step<()> {
        if !self.require_reinsertion {
            return Ok(());
        }
        self.emit(CardEvent::CardRemoved).await?;
        self.emit(CardEvent::CardInsertionRequested).await?;
        self.pause().await;
        self.emit(CardEvent::CardRecognized).await
    }

    async fn complete_change_pin(&self, new_pin: Option<Secret>) -> Step<()> {
        let new_pin = match new_pin {
            Some(new_pin) => new_pin,
            None => match self
                .ask(
                    CardEvent::NewPinRequested { attempts: None },
                    RequestKind::ChangedPin,
                )
                .await?
            {
                CardInput::ChangedPin(input) => input.new_pin,
                other => {
                    let error = unexpected_input(&other);
                    return self.emit(CardEvent::Error { error }).await;
                }
            },
        };

        if let Err(e) = SecretKind::PersonalPin.validate(&new_pin) {
            warn!(error = %e, "New PIN rejected");
            let error = CardError::FrameworkError {
                message: format!("New PIN rejected: {}", e),
            };
            return self.emit(CardEvent::Error { error }).await;
        }

        {
            let mut card = self.card.lock();
            card.pin = new_pin;
            card.transport_pin_active = false;
        }
        info!("PIN changed");
        self.emit(CardEvent::CardInteractionComplete).await?;
        self.emit(CardEvent::ProcessCompletedWithoutResult).await
    }

    async fn complete_identify(&self) -> Step<()> {
        self.emit(CardEvent::CardInteractionComplete).await?;
        self.pause().await;
        let event = match &self.server {
            ServerOutcome::Redirect { url } => {
                CardEvent::ProcessCompletedWithRedirect { url: url.clone() }
            }
            ServerOutcome::NoResult => CardEvent::ProcessCompletedWithoutResult,
            ServerOutcome::ProcessFailed { redirect } => CardEvent::Error {
                error: CardError::ProcessFailed {
                    redirect: redirect.clone(),
                },
            },
            ServerOutcome::UnexpectedAttribute { message } => CardEvent::Error {
                error: CardError::UnexpectedAttribute {
                    message: message.clone(),
                },
            },
        };
        self.emit(event).await
    }

    async fn emit(&self, event: CardEvent) -> Step<()> {
        self.send(AdapterEvent::notify(event)).await
    }

    /// Emit an event carrying a pending request and wait for the answer
    async fn ask(&self, event: CardEvent, kind: RequestKind) -> Step<CardInput> {
        let (request, reply) = PendingRequest::channel(kind);
        self.send(AdapterEvent::request(event, request)).await?;
        reply.await.map_err(|_| Halt::Abandoned(kind))
    }

    async fn send(&self, event: AdapterEvent) -> Step<()> {
        debug!(event = event.event.name(), "Card event");
        self.events
            .send(event)
            .await
            .map_err(|_| Halt::Disconnected)
    }

    async fn pause(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

fn unexpected_input(input: &CardInput) -> CardError {
    CardError::FrameworkError {
        message: format!("Unexpected {} input", input.kind()),
    }
}
