//! CardSessionAdapter trait - the boundary to the card-access SDK

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use crate::error::AdapterError;
use crate::event::{AdapterEvent, TaskKind};

/// Receiving end of a task's event stream
pub type EventReceiver = mpsc::Receiver<AdapterEvent>;

/// Sending end of a task's event stream, held by the adapter's worker
pub type EventSender = mpsc::Sender<AdapterEvent>;

/// Create the channel an adapter task emits its events on
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity)
}

/// Interface to the card-access SDK
///
/// An adapter executes one task at a time against the physical card. Starting
/// a task returns the task's event stream; the stream ends when the task ends.
/// Events asking for input carry a [`PendingRequest`](crate::PendingRequest)
/// that the consumer answers through a [`PendingCallback`](crate::PendingCallback).
///
/// The NFC and cryptographic work runs on the adapter's own worker. The
/// consumer must never be called back from that context; everything it sees
/// arrives through the returned receiver.
#[async_trait]
pub trait CardSessionAdapter: Send + Sync {
    /// Start an online identification against `tc_token_url`
    async fn identify(&self, tc_token_url: &Url) -> Result<EventReceiver, AdapterError>;

    /// Start a PIN change
    async fn change_pin(&self) -> Result<EventReceiver, AdapterError>;

    /// Cancel the running task, if any
    ///
    /// Must be idempotent; cancelling with no task running is not an error.
    async fn cancel_task(&self);

    /// Start the given task
    async fn start(&self, task: &TaskKind) -> Result<EventReceiver, AdapterError> {
        match task {
            TaskKind::Identify { tc_token_url } => self.identify(tc_token_url).await,
            TaskKind::ChangePin => self.change_pin().await,
        }
    }
}
