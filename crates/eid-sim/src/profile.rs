//! Card profile
//!
//! Data-driven description of a simulated card, loaded from TOML:
//!
//! ```toml
//! pin = "123456"
//! can = "654321"
//! pin_retry_counter = 1
//! require_reinsertion = true
//!
//! [server]
//! outcome = "redirect"
//! url = "https://service.example/done"
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SimResult;

/// Complete simulated card configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardProfile {
    /// Personal PIN
    #[serde(default = "default_pin")]
    pub pin: String,

    /// Transport PIN; when set the card has not been personalized yet and
    /// this is the PIN it accepts
    #[serde(default)]
    pub transport_pin: Option<String>,

    #[serde(default = "default_can")]
    pub can: String,

    #[serde(default = "default_puk")]
    pub puk: String,

    /// Remaining PIN attempts
    #[serde(default = "default_retry_counter")]
    pub pin_retry_counter: u8,

    /// eID function switched off
    #[serde(default)]
    pub deactivated: bool,

    /// Remove and re-insert the card after a wrong PIN
    #[serde(default)]
    pub require_reinsertion: bool,

    /// Delay before each card reaction
    #[serde(default)]
    pub latency_ms: u64,

    /// Event channel capacity per task
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,

    /// How the eService answers a successful identification
    #[serde(default)]
    pub server: ServerOutcome,
}

fn default_pin() -> String {
    "123456".to_string()
}

fn default_can() -> String {
    "654321".to_string()
}

fn default_puk() -> String {
    "1234567890".to_string()
}

fn default_retry_counter() -> u8 {
    MAX_PIN_ATTEMPTS
}

fn default_event_buffer() -> usize {
    16
}

/// Retry counter of a fresh card
pub const MAX_PIN_ATTEMPTS: u8 = 3;

impl Default for CardProfile {
    fn default() -> Self {
        Self {
            pin: default_pin(),
            transport_pin: None,
            can: default_can(),
            puk: default_puk(),
            pin_retry_counter: default_retry_counter(),
            deactivated: false,
            require_reinsertion: false,
            latency_ms: 0,
            event_buffer: default_event_buffer(),
            server: ServerOutcome::default(),
        }
    }
}

impl CardProfile {
    /// Load a profile from a TOML file
    pub fn load(path: impl AsRef<Path>) -> SimResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> SimResult<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Card still carrying its transport PIN
    pub fn with_transport_pin(mut self, transport_pin: impl Into<String>) -> Self {
        self.transport_pin = Some(transport_pin.into());
        self
    }

    pub fn with_retry_counter(mut self, counter: u8) -> Self {
        self.pin_retry_counter = counter.min(MAX_PIN_ATTEMPTS);
        self
    }

    pub fn with_server(mut self, server: ServerOutcome) -> Self {
        self.server = server;
        self
    }
}

/// Result of the server side of an identification
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ServerOutcome {
    /// Completed, the user is sent to `url`
    Redirect { url: Url },
    /// Completed without anything to show
    #[default]
    NoResult,
    /// The server rejected the process
    ProcessFailed {
        #[serde(default)]
        redirect: Option<Url>,
    },
    /// The server asked for attributes the card cannot provide
    UnexpectedAttribute { message: String },
}
