//! Retry and attempt bookkeeping for PIN, CAN and PUK
//!
//! Each secret type gets its own small machine. The PIN machine only follows
//! the attempt counts the card reports; none of the machines decrements a
//! counter on its own initiative.

mod can;
mod pin;
mod puk;

pub use can::{CanDecision, CanMachine};
pub use pin::{PinDecision, PinMachine, PinState};
pub use puk::{PukDecision, PukMachine};

use thiserror::Error;

/// Invalid attempt count reported by the card
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error("Reported {reported} attempts, more than the maximum of {max}")]
    OutOfRange { reported: u8, max: u8 },

    #[error("Attempt counter increased from {previous} to {reported} within one session")]
    Increased { previous: u8, reported: u8 },
}

/// Remaining attempts as last reported by the card
///
/// The counter is non-increasing within a session. It only moves when the
/// card reports a value and only goes back up through [`reset`](Self::reset).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptCounter {
    max: u8,
    remaining: Option<u8>,
}

impl AttemptCounter {
    pub fn new(max: u8) -> Self {
        Self {
            max,
            remaining: None,
        }
    }

    pub fn max(&self) -> u8 {
        self.max
    }

    /// Last reported value, `None` while the card has not reported any
    pub fn remaining(&self) -> Option<u8> {
        self.remaining
    }

    /// Record a count reported by the card
    pub fn observe(&mut self, reported: u8) -> Result<u8, AttemptError> {
        if reported > self.max {
            return Err(AttemptError::OutOfRange {
                reported,
                max: self.max,
            });
        }
        if let Some(previous) = self.remaining {
            if reported > previous {
                return Err(AttemptError::Increased { previous, reported });
            }
        }
        self.remaining = Some(reported);
        Ok(reported)
    }

    pub fn reset(&mut self) {
        self.remaining = None;
    }
}
