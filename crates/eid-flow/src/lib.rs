//! eid-flow - PIN/CAN entry orchestration for eID flows
//!
//! Drives the identification and PIN change use cases against a
//! [`CardSessionAdapter`](eid_core::CardSessionAdapter):
//!
//! - [`retry`]: attempt bookkeeping for PIN, CAN and PUK
//! - [`machine`]: the main flow state machine, pure and synchronous
//! - [`can_flow`]: the nested CAN sub-flow
//! - [`coordinator`]: the actor that serializes UI and card events and
//!   performs the side effects
//!
//! ```ignore
//! let handle = FlowCoordinator::spawn(adapter, FlowKind::ChangePin, FlowConfig::default());
//! handle.start(false, true).await?;
//! handle.enter_old_secret("12345").await?;
//! handle.confirm_new_pin_intro().await?;
//! handle.enter_new_pin("123456").await?;
//! handle.confirm_new_pin("123456").await?;
//! ```

pub mod can_flow;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod machine;
pub mod retry;
pub mod state;

pub use can_flow::{CanFlowEvent, CanFlowOutcome, CanFlowParams, CanFlowState, CanFlowStep, CanSubFlow};
pub use config::{CanConfig, CanExhaustion, FlowConfig};
pub use coordinator::{FlowCoordinator, FlowHandle, FlowNotification, FlowSnapshot};
pub use error::{FlowError, FlowResult};
pub use machine::{FlowStateMachine, Session};
pub use state::{Effect, FlowEvent, FlowKind, FlowState, NavigationRequest, Transition, UiEvent};
