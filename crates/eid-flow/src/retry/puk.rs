//! PUK machine
//!
//! PUK entry is not offered by these flows. A PUK request ends the flow as
//! card blocked; the machine only records that the card got there.

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PukDecision {
    /// The flow ends, the user has to unblock the card elsewhere
    CardBlocked,
}

#[derive(Debug, Clone, Default)]
pub struct PukMachine {
    requests: u32,
}

impl PukMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_requested(&mut self) -> PukDecision {
        self.requests += 1;
        info!(requests = self.requests, "PUK requested, PIN is blocked");
        PukDecision::CardBlocked
    }

    pub fn was_requested(&self) -> bool {
        self.requests > 0
    }
}
