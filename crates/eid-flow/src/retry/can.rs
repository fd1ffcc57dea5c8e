//! CAN re-entry machine
//!
//! The card does not report a CAN attempt count. Within one CAN sub-flow
//! every repeated CAN request means the previous CAN was wrong; the number of
//! re-entries is bounded by configuration.

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanDecision {
    /// First CAN request of the sub-flow
    Enter,
    /// Previous CAN rejected, ask again
    Retry { attempts_remaining: u8 },
    /// No re-entries left
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct CanMachine {
    max_attempts: u8,
    requests: u8,
}

impl CanMachine {
    pub fn new(max_attempts: u8) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            requests: 0,
        }
    }

    /// CAN entries left before the sub-flow gives up
    pub fn attempts_remaining(&self) -> u8 {
        self.max_attempts.saturating_sub(self.requests.saturating_sub(1))
    }

    /// The card asks for the CAN
    pub fn on_requested(&mut self) -> CanDecision {
        self.requests = self.requests.saturating_add(1);
        if self.requests == 1 {
            return CanDecision::Enter;
        }
        let failed = self.requests - 1;
        debug!(failed, max = self.max_attempts, "CAN rejected by card");
        if failed >= self.max_attempts {
            CanDecision::Exhausted
        } else {
            CanDecision::Retry {
                attempts_remaining: self.max_attempts - failed,
            }
        }
    }
}
