//! PIN retry machine

use serde::Serialize;
use tracing::debug;

use super::{AttemptCounter, AttemptError};

/// Where the PIN stands from the card's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "pin", rename_all = "snake_case")]
pub enum PinState {
    /// No request seen yet
    Idle,
    /// First request, no failure reported
    Requested,
    /// The card reported a failed attempt
    Retry { attempts_remaining: u8 },
    /// CAN required before the PIN may be tried again
    Suspended,
    /// PUK required
    Blocked,
}

/// What the flow has to do with a PIN request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinDecision {
    /// Hand over the PIN the user already entered
    FirstAttempt,
    /// Ask the user again, showing the remaining attempts
    Retry(u8),
    /// Switch to the CAN sub-flow
    CanRequired,
}

#[derive(Debug, Clone)]
pub struct PinMachine {
    counter: AttemptCounter,
    state: PinState,
}

impl PinMachine {
    pub fn new(max_attempts: u8) -> Self {
        Self {
            counter: AttemptCounter::new(max_attempts),
            state: PinState::Idle,
        }
    }

    pub fn state(&self) -> PinState {
        self.state
    }

    pub fn attempts_remaining(&self) -> Option<u8> {
        self.counter.remaining()
    }

    /// Whether the card has rejected the PIN at least once in this session
    pub fn has_failed(&self) -> bool {
        matches!(
            self.state,
            PinState::Retry { .. } | PinState::Suspended | PinState::Blocked
        ) || self
            .counter
            .remaining()
            .is_some_and(|remaining| remaining < self.counter.max())
    }

    /// The card asks for the PIN, with the attempt count it reported
    pub fn on_request(&mut self, attempts: Option<u8>) -> Result<PinDecision, AttemptError> {
        let Some(reported) = attempts else {
            self.state = PinState::Requested;
            return Ok(PinDecision::FirstAttempt);
        };

        let remaining = self.counter.observe(reported)?;
        debug!(remaining, "PIN attempt count reported");
        if remaining == 0 {
            self.state = PinState::Suspended;
            Ok(PinDecision::CanRequired)
        } else {
            self.state = PinState::Retry {
                attempts_remaining: remaining,
            };
            Ok(PinDecision::Retry(remaining))
        }
    }

    /// The card asks for the CAN directly
    pub fn on_can_requested(&mut self) -> PinDecision {
        self.state = PinState::Suspended;
        PinDecision::CanRequired
    }

    /// The card reports the PIN blocked
    pub fn on_blocked(&mut self) {
        self.state = PinState::Blocked;
    }
}
