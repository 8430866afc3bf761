//! Engine configuration, authored in RON.
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Scheduler tuning for autonomous replies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TalkControlSettings {
    /// Most dispatches a single flush pass may perform.
    pub flush_limit: usize,
    /// Queued events beyond this drop the oldest.
    pub max_queue: usize,
    /// Reply length cap when neither the reply nor the story sets one.
    pub default_max_chars: Option<usize>,
    /// Fixed seed for reply selection. Entropy when unset.
    pub seed: Option<u64>,
}

impl Default for TalkControlSettings {
    fn default() -> Self {
        Self {
            flush_limit: 10,
            max_queue: 64,
            default_max_chars: None,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub talk_control: TalkControlSettings,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn load_from_ron(path: &Path) -> Result<EngineConfig, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse_ron(&contents)
    }

    pub fn parse_ron(input: &str) -> Result<EngineConfig, ConfigError> {
        let config: EngineConfig = ron::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.talk_control.flush_limit == 0 {
            return Err(ConfigError::Invalid(
                "talk_control.flush_limit must be at least 1".to_string(),
            ));
        }
        if self.talk_control.max_queue == 0 {
            return Err(ConfigError::Invalid(
                "talk_control.max_queue must be at least 1".to_string(),
            ));
        }
        if self.talk_control.default_max_chars == Some(0) {
            return Err(ConfigError::Invalid(
                "talk_control.default_max_chars must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
