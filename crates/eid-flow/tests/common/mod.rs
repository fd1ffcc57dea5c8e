//! Shared test helpers

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eid_core::{
    event_channel, AdapterError, AdapterEvent, CardEvent, CardInput, CardSessionAdapter,
    EventReceiver, EventSender, PendingRequest, RequestKind,
};
use eid_flow::{FlowHandle, FlowNotification, FlowSnapshot, FlowState};
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use url::Url;

pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Adapter call recorded by [`ScriptedAdapter`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Identify(Url),
    ChangePin,
    Cancel,
}

/// Adapter whose events are pushed by the test
#[derive(Default)]
pub struct ScriptedAdapter {
    sender: Mutex<Option<EventSender>>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedAdapter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Sender of the most recently started task
    pub fn sender(&self) -> EventSender {
        self.sender
            .lock()
            .clone()
            .expect("no task started on the scripted adapter")
    }

    pub async fn emit(&self, event: CardEvent) {
        self.sender()
            .send(AdapterEvent::notify(event))
            .await
            .expect("coordinator stopped listening");
    }

    /// Emit an event carrying a pending request
    pub async fn request(
        &self,
        event: CardEvent,
        kind: RequestKind,
    ) -> oneshot::Receiver<CardInput> {
        let (request, reply) = PendingRequest::channel(kind);
        self.sender()
            .send(AdapterEvent::request(event, request))
            .await
            .expect("coordinator stopped listening");
        reply
    }

    fn start(&self, call: Call) -> EventReceiver {
        let (sender, receiver) = event_channel(16);
        *self.sender.lock() = Some(sender);
        self.calls.lock().push(call);
        receiver
    }
}

#[async_trait]
impl CardSessionAdapter for ScriptedAdapter {
    async fn identify(&self, tc_token_url: &Url) -> Result<EventReceiver, AdapterError> {
        Ok(self.start(Call::Identify(tc_token_url.clone())))
    }

    async fn change_pin(&self) -> Result<EventReceiver, AdapterError> {
        Ok(self.start(Call::ChangePin))
    }

    async fn cancel_task(&self) {
        self.calls.lock().push(Call::Cancel);
    }
}

/// Adapter that cannot start tasks
pub struct UnavailableAdapter;

#[async_trait]
impl CardSessionAdapter for UnavailableAdapter {
    async fn identify(&self, _tc_token_url: &Url) -> Result<EventReceiver, AdapterError> {
        Err(AdapterError::Unavailable("no NFC".to_string()))
    }

    async fn change_pin(&self) -> Result<EventReceiver, AdapterError> {
        Err(AdapterError::Unavailable("no NFC".to_string()))
    }

    async fn cancel_task(&self) {}
}

pub fn tc_token_url() -> Url {
    Url::parse("https://service.example/tc-token").unwrap()
}

pub async fn wait_state<F>(handle: &FlowHandle, predicate: F) -> FlowSnapshot
where
    F: Fn(&FlowState) -> bool,
{
    handle
        .wait_for_state(TIMEOUT, predicate)
        .await
        .expect("flow did not reach the expected state")
}

pub async fn wait_can_flow<F>(handle: &FlowHandle, predicate: F) -> FlowSnapshot
where
    F: Fn(&FlowSnapshot) -> bool,
{
    handle
        .wait_for("CAN sub-flow state", TIMEOUT, predicate)
        .await
        .expect("CAN sub-flow did not reach the expected state")
}

/// Everything published so far, without waiting
pub fn drain(notifications: &mut broadcast::Receiver<FlowNotification>) -> Vec<FlowNotification> {
    let mut drained = Vec::new();
    while let Ok(notification) = notifications.try_recv() {
        drained.push(notification);
    }
    drained
}
