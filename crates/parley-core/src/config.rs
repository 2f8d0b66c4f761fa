//! Configuration system for Parley.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
use crate::session::{CompressionConfig, DEFAULT_TITLE_MAX_CHARS};

/// Main configuration struct for Parley.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage backend settings
    pub storage: StorageConfig,
    /// Write-behind persistence settings
    pub persistence: PersistenceConfig,
    /// Compaction settings
    pub compaction: CompactionSettings,
    /// Session defaults
    pub sessions: SessionSettings,
}

/// Which storage backend holds session documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// One JSON file per session
    #[default]
    Json,
    /// One SQLite row per session
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind
    pub backend: StorageBackendKind,
    /// Data directory (defaults to the platform data dir)
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolved data directory.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Config::data_dir)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// How long the flush loop waits for a dirty signal before checking for retries
    pub save_delay_ms: u64,
    /// Extra ids drained after the first dirty signal of a flush pass
    pub batch_size: usize,
    /// Upper bound for the shutdown drain
    pub shutdown_timeout_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_delay_ms: 1_000,
            batch_size: 32,
            shutdown_timeout_ms: 10_000,
        }
    }
}

impl PersistenceConfig {
    pub fn save_delay(&self) -> Duration {
        Duration::from_millis(self.save_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    /// Upper bound for a single summarizer call
    pub summarizer_timeout_secs: u64,
    /// Average characters per token (for estimation)
    pub chars_per_token: f32,
    /// Compression settings given to new sessions
    pub defaults: CompressionConfig,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            summarizer_timeout_secs: 120,
            chars_per_token: 4.0,
            defaults: CompressionConfig::default(),
        }
    }
}

impl CompactionSettings {
    pub fn summarizer_timeout(&self) -> Duration {
        Duration::from_secs(self.summarizer_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Maximum characters of a derived title
    pub title_max_chars: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            title_max_chars: DEFAULT_TITLE_MAX_CHARS,
        }
    }
}

/// Validation result with multiple issues.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    /// List of validation issues
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Create a new empty validation result.
    pub fn new() -> Self {
        Self { issues: Vec::new() }
    }

    /// Check if validation passed (no errors).
    pub fn is_ok(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }

    /// Get only error-level issues.
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    /// Get only warning-level issues.
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Warning)
            .collect()
    }

    /// Add an error.
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Error,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning.
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.issues.push(ValidationIssue {
            severity: IssueSeverity::Warning,
            field: field.into(),
            message: message.into(),
        });
    }

    /// Turn errors into [`Error::Validation`]. Warnings are logged.
    pub fn into_result(self) -> Result<(), Error> {
        for warning in self.warnings() {
            tracing::warn!(field = %warning.field, "{}", warning.message);
        }

        if self.is_ok() {
            return Ok(());
        }

        let errors: Vec<String> = self
            .errors()
            .iter()
            .map(|e| format!("{}: {}", e.field, e.message))
            .collect();
        Err(Error::Validation(errors.join("; ")))
    }
}

/// A single validation issue.
#[derive(Debug, Clone)]
pub struct ValidationIssue {
    /// Severity of the issue
    pub severity: IssueSeverity,
    /// Field path (e.g., "persistence.batch_size")
    pub field: String,
    /// Human-readable message
    pub message: String,
}

/// Severity level for validation issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueSeverity {
    /// Warnings don't prevent loading
    Warning,
    /// Errors prevent loading
    Error,
}

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self, figment::Error> {
        Self::figment().extract()
    }

    /// The layered configuration sources, lowest priority first.
    pub fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            // User config
            .merge(Toml::file(Self::config_dir().join("config.toml")))
            // Project config
            .merge(Toml::file(".parley/config.toml"))
            // Project local config (gitignored)
            .merge(Toml::file(".parley/config.local.toml"))
            // Environment variables, e.g. PARLEY_PERSISTENCE__BATCH_SIZE
            .merge(Env::prefixed("PARLEY_").split("__"))
    }

    /// Load and validate configuration.
    pub fn load_validated() -> Result<Self, Error> {
        let config = Self::load().map_err(|e| Error::Config(e.to_string()))?;
        let result = config.validate();

        if !result.is_ok() {
            let errors: Vec<String> = result
                .errors()
                .iter()
                .map(|e| format!("{}: {}", e.field, e.message))
                .collect();
            return Err(Error::Config(format!(
                "Configuration validation failed:\n  {}",
                errors.join("\n  ")
            )));
        }

        for warning in result.warnings() {
            tracing::warn!("Config warning - {}: {}", warning.field, warning.message);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::new();

        if self.persistence.batch_size == 0 {
            result.add_error("persistence.batch_size", "batch_size must be greater than 0");
        }

        if self.persistence.save_delay_ms == 0 {
            result.add_error(
                "persistence.save_delay_ms",
                "save_delay_ms must be greater than 0",
            );
        }

        if self.persistence.save_delay_ms > 60_000 {
            result.add_warning(
                "persistence.save_delay_ms",
                "save_delay_ms is over a minute; retries of failed saves will be slow",
            );
        }

        if self.persistence.shutdown_timeout_ms == 0 {
            result.add_error(
                "persistence.shutdown_timeout_ms",
                "shutdown_timeout_ms must be greater than 0",
            );
        }

        self.compaction
            .defaults
            .validate_into("compaction.defaults.", &mut result);

        if self.compaction.summarizer_timeout_secs == 0 {
            result.add_error(
                "compaction.summarizer_timeout_secs",
                "summarizer_timeout_secs must be greater than 0",
            );
        }

        let chars_per_token = self.compaction.chars_per_token;
        if chars_per_token.is_nan() || chars_per_token <= 0.0 {
            result.add_error(
                "compaction.chars_per_token",
                "chars_per_token must be positive",
            );
        }

        if self.sessions.title_max_chars == 0 {
            result.add_error("sessions.title_max_chars", "title_max_chars must be greater than 0");
        }

        result
    }

    /// Render the configuration as TOML.
    pub fn to_toml_string(&self) -> Result<String, Error> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Get the configuration directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|p| p.join("parley"))
            .unwrap_or_else(|| PathBuf::from("~/.config/parley"))
    }

    /// Get the data directory (for sessions).
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|p| p.join("parley"))
            .unwrap_or_else(|| PathBuf::from("~/.local/share/parley"))
    }
}
