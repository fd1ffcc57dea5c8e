//! eid-core - Core traits and types for eID PIN/CAN flows
//!
//! This crate provides the vocabulary shared between the flow orchestration
//! (`eid-flow`) and card session adapters (a real card-access SDK binding or
//! the `eid-sim` simulator): card events, secrets, the error taxonomy, the
//! pending-request channel, and the [`CardSessionAdapter`] trait.

pub mod adapter;
pub mod error;
pub mod event;
pub mod pending;
pub mod secret;

pub use adapter::{event_channel, CardSessionAdapter, EventReceiver, EventSender};
pub use error::{AdapterError, CardError};
pub use event::{AdapterEvent, CardEvent, TaskKind};
pub use pending::{
    CallbackError, CanInput, CardInput, ChangedPinInput, PendingCallback, PendingRequest,
    RequestKind,
};
pub use secret::{Secret, SecretError, SecretKind};
