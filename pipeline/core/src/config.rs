//! TOML Configuration File Support
//!
//! Centralized configuration loading for the pipeline, supporting a TOML
//! file at `~/.config/app-pipeline/pipeline.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables (`PIPELINE_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [queue]
//! idle_ping_interval_ms = 10000
//! max_execution_time_secs = 1200
//!
//! [worker]
//! max_workers = 64
//!
//! [tts]
//! max_buffer_chars = 300
//! drain_timeout_ms = 30000
//! audio_channel_capacity = 64
//! max_sentence_batch = 7
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::ListenConfig;
use crate::tts::TtsConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Queue section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueToml {
    /// Idle time before a keepalive ping, in milliseconds
    pub idle_ping_interval_ms: Option<u64>,

    /// Maximum run time before the task is stopped, in seconds
    pub max_execution_time_secs: Option<u64>,
}

/// Worker section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerToml {
    /// Maximum concurrently running workers
    pub max_workers: Option<usize>,
}

/// TTS section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsToml {
    /// Flush buffered text once it reaches this many characters
    pub max_buffer_chars: Option<usize>,

    /// How long to wait for trailing audio, in milliseconds
    pub drain_timeout_ms: Option<u64>,

    /// Capacity of the audio chunk channel
    pub audio_channel_capacity: Option<usize>,

    /// Largest number of sentences per synthesis call
    pub max_sentence_batch: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineToml {
    /// Queue configuration section
    pub queue: QueueToml,

    /// Worker configuration section
    pub worker: WorkerToml,

    /// TTS configuration section
    pub tts: TtsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Centralized configuration for the pipeline
///
/// Use [`load_config`] to load configuration with proper priority handling.
#[derive(Clone, Debug)]
pub struct PipelineConfigFile {
    /// Queue listener timing
    pub listen: ListenConfig,

    /// Maximum concurrently running workers
    pub max_workers: usize,

    /// TTS publisher tuning
    pub tts: TtsConfig,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for PipelineConfigFile {
    fn default() -> Self {
        Self {
            listen: ListenConfig::default(),
            max_workers: 64,
            tts: TtsConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl PipelineConfigFile {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Reject values the pipeline cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero = |name: &str| {
            Err(ConfigError::ValidationError(format!(
                "{name} must be greater than zero"
            )))
        };

        if self.listen.idle_ping_interval.is_zero() {
            return zero("queue.idle_ping_interval_ms");
        }
        if self.listen.max_execution_time.is_zero() {
            return zero("queue.max_execution_time_secs");
        }
        if self.max_workers == 0 {
            return zero("worker.max_workers");
        }
        if self.tts.max_buffer_chars == 0 {
            return zero("tts.max_buffer_chars");
        }
        if self.tts.drain_timeout.is_zero() {
            return zero("tts.drain_timeout_ms");
        }
        if self.tts.audio_channel_capacity == 0 {
            return zero("tts.audio_channel_capacity");
        }
        if self.tts.max_sentence_batch == 0 {
            return zero("tts.max_sentence_batch");
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/app-pipeline/pipeline.toml` or
/// `~/.config/app-pipeline/pipeline.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("app-pipeline").join("pipeline.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the merged values fail validation. A missing config file is not an error.
pub fn load_config() -> Result<PipelineConfigFile, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or if the merged values fail validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<PipelineConfigFile, ConfigError> {
    let mut config = PipelineConfigFile::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: PipelineToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

fn apply_toml_config(config: &mut PipelineConfigFile, toml: &PipelineToml) {
    if let Some(ms) = toml.queue.idle_ping_interval_ms {
        config.listen.idle_ping_interval = Duration::from_millis(ms);
    }
    if let Some(secs) = toml.queue.max_execution_time_secs {
        config.listen.max_execution_time = Duration::from_secs(secs);
    }

    if let Some(max) = toml.worker.max_workers {
        config.max_workers = max;
    }

    if let Some(chars) = toml.tts.max_buffer_chars {
        config.tts.max_buffer_chars = chars;
    }
    if let Some(ms) = toml.tts.drain_timeout_ms {
        config.tts.drain_timeout = Duration::from_millis(ms);
    }
    if let Some(capacity) = toml.tts.audio_channel_capacity {
        config.tts.audio_channel_capacity = capacity;
    }
    if let Some(batch) = toml.tts.max_sentence_batch {
        config.tts.max_sentence_batch = batch;
    }
}

fn apply_env_config(config: &mut PipelineConfigFile) {
    if let Ok(value) = std::env::var("PIPELINE_IDLE_PING_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.listen.idle_ping_interval = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(value) = std::env::var("PIPELINE_MAX_EXECUTION_SECS") {
        if let Ok(secs) = value.parse::<u64>() {
            config.listen.max_execution_time = Duration::from_secs(secs);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(value) = std::env::var("PIPELINE_MAX_WORKERS") {
        if let Ok(n) = value.parse::<usize>() {
            config.max_workers = n;
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(value) = std::env::var("PIPELINE_TTS_DRAIN_TIMEOUT_MS") {
        if let Ok(ms) = value.parse::<u64>() {
            config.tts.drain_timeout = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Ok(value) = std::env::var("PIPELINE_TTS_MAX_BUFFER_CHARS") {
        if let Ok(chars) = value.parse::<usize>() {
            config.tts.max_buffer_chars = chars;
            config.source = ConfigSource::Env;
        }
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Idle ping interval override (milliseconds)
    pub idle_ping_interval_ms: Option<u64>,

    /// Max execution time override (seconds)
    pub max_execution_time_secs: Option<u64>,

    /// Worker limit override
    pub max_workers: Option<usize>,

    /// TTS drain timeout override (milliseconds)
    pub tts_drain_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set idle ping interval override
    #[must_use]
    pub fn with_idle_ping_interval_ms(mut self, ms: u64) -> Self {
        self.idle_ping_interval_ms = Some(ms);
        self
    }

    /// Set max execution time override
    #[must_use]
    pub fn with_max_execution_time_secs(mut self, secs: u64) -> Self {
        self.max_execution_time_secs = Some(secs);
        self
    }

    /// Set worker limit override
    #[must_use]
    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = Some(max);
        self
    }

    /// Set TTS drain timeout override
    #[must_use]
    pub fn with_tts_drain_timeout_ms(mut self, ms: u64) -> Self {
        self.tts_drain_timeout_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut PipelineConfigFile) {
        if self.idle_ping_interval_ms.is_some()
            || self.max_execution_time_secs.is_some()
            || self.max_workers.is_some()
            || self.tts_drain_timeout_ms.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(ms) = self.idle_ping_interval_ms {
            config.listen.idle_ping_interval = Duration::from_millis(ms);
        }
        if let Some(secs) = self.max_execution_time_secs {
            config.listen.max_execution_time = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_workers {
            config.max_workers = max;
        }
        if let Some(ms) = self.tts_drain_timeout_ms {
            config.tts.drain_timeout = Duration::from_millis(ms);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
