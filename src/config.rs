//! Sync engine configuration
//!
//! Loaded from YAML. Every field has a default, so an empty document is a
//! valid configuration.

use crate::graph::Position;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Quiet period after the last drag event before a node's position is saved
    pub position_quiet_ms: u64,
    /// Minimum interval between cursor publishes
    pub cursor_throttle_ms: u64,
    /// Safety bound for parent-chain walks and nested aggregation
    pub max_chain_depth: usize,
    /// Solution levels listed in the flattened list view
    pub display_depth: usize,
    /// Offset of a new child from its parent when no position is given
    pub child_offset: Position,
    /// Horizontal gap between outcomes when a new one is placed
    pub outcome_spacing: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            position_quiet_ms: 500,
            cursor_throttle_ms: 30,
            max_chain_depth: 64,
            display_depth: 2,
            child_offset: Position::new(50.0, 200.0),
            outcome_spacing: 400.0,
        }
    }
}

impl SyncConfig {
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> ConfigResult<Self> {
        let config: SyncConfig = if text.trim().is_empty() {
            SyncConfig::default()
        } else {
            serde_yaml::from_str(text)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.position_quiet_ms == 0 {
            return Err(ConfigError::Invalid("position_quiet_ms must be positive".into()));
        }
        if self.max_chain_depth == 0 {
            return Err(ConfigError::Invalid("max_chain_depth must be positive".into()));
        }
        if self.display_depth == 0 {
            return Err(ConfigError::Invalid("display_depth must be positive".into()));
        }
        if !self.outcome_spacing.is_finite() || self.outcome_spacing <= 0.0 {
            return Err(ConfigError::Invalid("outcome_spacing must be positive".into()));
        }
        Ok(())
    }

    pub fn position_quiet(&self) -> Duration {
        Duration::from_millis(self.position_quiet_ms)
    }

    pub fn cursor_throttle(&self) -> Duration {
        Duration::from_millis(self.cursor_throttle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        assert_eq!(SyncConfig::from_yaml_str("").unwrap(), SyncConfig::default());
    }

    #[test]
    fn partial_document_overrides_fields() {
        let config = SyncConfig::from_yaml_str(
            "position_quiet_ms: 250\nchild_offset:\n  x: 0\n  y: 120\n",
        )
        .unwrap();
        assert_eq!(config.position_quiet(), Duration::from_millis(250));
        assert_eq!(config.child_offset, Position::new(0.0, 120.0));
        assert_eq!(config.cursor_throttle_ms, 30);
    }

    #[test]
    fn zero_depth_is_invalid() {
        let err = SyncConfig::from_yaml_str("max_chain_depth: 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ostsync.yaml");
        std::fs::write(&path, "display_depth: 3\n").unwrap();
        assert_eq!(SyncConfig::load(&path).unwrap().display_depth, 3);
    }
}
