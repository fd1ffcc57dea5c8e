//! Flow configuration
//!
//! Loaded from the `[flow]` table of a TOML file or built in code. Every
//! field has a default, so an empty table is a valid configuration.

use serde::{Deserialize, Serialize};

/// Configuration for a flow coordinator and its state machines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// PIN retry counter of a fresh card
    #[serde(default = "default_max_pin_attempts")]
    pub max_pin_attempts: u8,
    /// Reject malformed PIN/CAN digit strings before they reach the card
    #[serde(default = "default_true")]
    pub validate_secrets: bool,
    /// Capacity of the coordinator's command queue
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,
    /// Capacity of the notification broadcast channel
    #[serde(default = "default_notification_buffer")]
    pub notification_buffer: usize,
    /// CAN sub-flow settings
    #[serde(default)]
    pub can: CanConfig,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_pin_attempts: default_max_pin_attempts(),
            validate_secrets: default_true(),
            command_buffer: default_command_buffer(),
            notification_buffer: default_notification_buffer(),
            can: CanConfig::default(),
        }
    }
}

impl FlowConfig {
    /// Parse a configuration from TOML
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

fn default_max_pin_attempts() -> u8 {
    3
}

fn default_true() -> bool {
    true
}

fn default_command_buffer() -> usize {
    32
}

fn default_notification_buffer() -> usize {
    64
}

/// CAN sub-flow configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanConfig {
    /// How often the card may ask for the CAN within one sub-flow
    #[serde(default = "default_can_attempts")]
    pub max_attempts: u8,
    /// Terminal state once `max_attempts` is exceeded
    #[serde(default)]
    pub on_exhausted: CanExhaustion,
}

impl Default for CanConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_can_attempts(),
            on_exhausted: CanExhaustion::default(),
        }
    }
}

fn default_can_attempts() -> u8 {
    3
}

/// Where a flow ends when the CAN entry is exhausted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanExhaustion {
    /// Dedicated `CanBlocked` terminal state
    #[default]
    CanBlocked,
    /// Report the card as blocked
    CardBlocked,
}
