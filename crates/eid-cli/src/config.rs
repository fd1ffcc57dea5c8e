//! Configuration file handling for eid-cli

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use eid_flow::FlowConfig;
use serde::{Deserialize, Serialize};

/// Configuration for the CLI tool
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Default output format
    pub output: Option<String>,
    /// Disable colored output
    pub no_color: Option<bool>,
    /// Card profile used when `--card` is not given
    pub card: Option<PathBuf>,
    /// How long a flow may run before it is abandoned
    pub timeout_secs: Option<u64>,
    /// Coordinator settings
    #[serde(default)]
    pub flow: FlowConfig,
}

impl Config {
    /// Load configuration from the default config file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Get the default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("eid-cli");

        Ok(config_dir.join("config.toml"))
    }

    /// Merge CLI arguments over config file values
    pub fn merge_with_args(
        &self,
        card: Option<&Path>,
        timeout_secs: Option<u64>,
        no_color: bool,
    ) -> MergedConfig {
        MergedConfig {
            card: card.map(Path::to_path_buf).or_else(|| self.card.clone()),
            timeout: Duration::from_secs(timeout_secs.or(self.timeout_secs).unwrap_or(30)),
            no_color: no_color || self.no_color.unwrap_or(false),
            flow: self.flow.clone(),
        }
    }
}

/// Fully resolved configuration after merging CLI args
#[derive(Debug, Clone)]
pub struct MergedConfig {
    pub card: Option<PathBuf>,
    pub timeout: Duration,
    pub no_color: bool,
    pub flow: FlowConfig,
}
