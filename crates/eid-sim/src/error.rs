//! Simulator errors

use thiserror::Error;

pub type SimResult<T> = Result<T, SimError>;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("Failed to read card profile: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid card profile: {0}")]
    Parse(#[from] toml::de::Error),
}
