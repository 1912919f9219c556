//! Engine configuration
//!
//! Supports both YAML and TOML configuration files.
//!
//! # Example YAML configuration:
//! ```yaml
//! # Lock shards for partitioned statements and tables
//! shards: 32
//!
//! # What an insert does when its primary key already exists: reject | ignore
//! duplicate_key_policy: reject
//!
//! # Nesting limit for events emitted by merge actions within one submission
//! max_cascade_depth: 8
//!
//! logging:
//!   level: info
//!   format: text
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of lock shards per partitioned statement and per table
    pub shards: usize,

    /// Outcome of inserting a row whose primary key already exists
    pub duplicate_key_policy: DuplicateKeyPolicy,

    /// Events emitted by `insert into` merge actions are processed within the
    /// same submission up to this nesting depth
    pub max_cascade_depth: usize,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shards: 16,
            duplicate_key_policy: DuplicateKeyPolicy::default(),
            max_cascade_depth: 8,
            logging: LoggingConfig::default(),
        }
    }
}

/// Duplicate primary key handling for table inserts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateKeyPolicy {
    /// Leave the existing row in place and report a `MergeConflict`
    #[default]
    Reject,
    /// Leave the existing row in place without reporting
    Ignore,
}

impl fmt::Display for DuplicateKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicateKeyPolicy::Reject => write!(f, "reject"),
            DuplicateKeyPolicy::Ignore => write!(f, "ignore"),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive (e.g. `info,vigil_runtime=debug`)
    pub level: String,

    /// Log format (text, json)
    pub format: String,

    /// Colored output for text logs
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            ansi: true,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        let config = match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml_str(&content)?,
            "toml" => Self::from_toml_str(&content)?,
            _ => Self::from_yaml_str(&content).or_else(|_| Self::from_toml_str(&content))?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.shards == 0 || self.shards > 4096 {
            return Err(ConfigError::Invalid(format!(
                "shards must be between 1 and 4096, got {}",
                self.shards
            )));
        }
        match self.logging.format.as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "unknown log format '{}', expected text or json",
                other
            ))),
        }
    }

    pub fn with_duplicate_key_policy(mut self, policy: DuplicateKeyPolicy) -> Self {
        self.duplicate_key_policy = policy;
        self
    }

    pub fn with_shards(mut self, shards: usize) -> Self {
        self.shards = shards;
        self
    }
}

/// Install the global `tracing` subscriber described by `config`.
///
/// `RUST_LOG`, when set, takes precedence over `config.level`.
pub fn init_logging(config: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::try_new(directives),
        _ => EnvFilter::try_new(&config.level),
    }
    .map_err(|e| ConfigError::ParseError(e.to_string()))?;

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_ansi(config.ansi);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| ConfigError::Logging(e.to_string()))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    IoError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to install log subscriber: {0}")]
    Logging(String),
}
