//! Collector Configuration
//!
//! Configuration for registries, the process lifecycle hook and logging.
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `REFGC_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `REFGC_TEARDOWN_ON_EXIT` | Reclaim every enrolled registry when the teardown guard drops | true |
//! | `REFGC_REPORT_OUTSTANDING` | Warn about registries still holding entries at teardown | true |
//! | `REFGC_DUMP_LIMIT` | Maximum number of entries listed by `Registry::dump` | 64 |
//! | `REFGC_SHOW_VALUES` | Include pointed-to values in dumps ("true"/"false") | true |
//! | `REFGC_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//!
//! `GcConfig::from_env` ignores values that do not parse; `GcConfig::try_from_env`
//! reports them as errors.
//!
//! # Example
//!
//! ```rust
//! use refgc::config::{GcConfig, LogLevel};
//!
//! let config = GcConfig::builder()
//!     .dump_limit(16)
//!     .log_level(LogLevel::Debug)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.diagnostics.dump_limit, 16);
//! ```

use std::env;

use thiserror::Error;

/// Log level for collector logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors (default).
    #[default]
    Warn,
    /// Informational messages.
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages, one per refcount change.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation, usable as a filter directive.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Process lifecycle configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Reclaim every enrolled registry when the teardown guard drops.
    /// Default: true.
    pub teardown_on_exit: bool,

    /// Log a warning for every registry that still holds entries at teardown.
    /// Default: true.
    pub report_outstanding: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            teardown_on_exit: true,
            report_outstanding: true,
        }
    }
}

/// Diagnostic dump configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    /// Maximum number of entries listed by a dump.
    /// Default: 64.
    pub dump_limit: usize,

    /// Include the pointed-to value of each entry.
    /// Default: true.
    pub show_values: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            dump_limit: 64,
            show_values: true,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogConfig {
    /// Log level used when `RUST_LOG` is not set.
    /// Default: Warn.
    pub level: LogLevel,
}

/// Complete collector configuration.
///
/// Use `GcConfig::default()` for sensible defaults, or
/// `GcConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcConfig {
    /// Process lifecycle configuration.
    pub lifecycle: LifecycleConfig,

    /// Diagnostic dump configuration.
    pub diagnostics: DiagnosticsConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl GcConfig {
    /// Create a new builder for GcConfig.
    pub fn builder() -> GcConfigBuilder {
        GcConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or unparsable keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("REFGC_TEARDOWN_ON_EXIT") {
            config.lifecycle.teardown_on_exit = val;
        }

        if let Some(val) = parse_env_bool("REFGC_REPORT_OUTSTANDING") {
            config.lifecycle.report_outstanding = val;
        }

        if let Some(val) = parse_env_usize("REFGC_DUMP_LIMIT") {
            if val > 0 {
                config.diagnostics.dump_limit = val;
            }
        }

        if let Some(val) = parse_env_bool("REFGC_SHOW_VALUES") {
            config.diagnostics.show_values = val;
        }

        if let Ok(val) = env::var("REFGC_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Load configuration from environment variables, rejecting bad values.
    ///
    /// Unset variables keep their defaults. A set variable that does not parse
    /// is an [`ConfigError::EnvParseError`], and the result is validated.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_lookup(|name| env::var(name).ok())
    }

    fn try_from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(val) = lookup("REFGC_TEARDOWN_ON_EXIT") {
            config.lifecycle.teardown_on_exit = require_bool("REFGC_TEARDOWN_ON_EXIT", &val)?;
        }

        if let Some(val) = lookup("REFGC_REPORT_OUTSTANDING") {
            config.lifecycle.report_outstanding = require_bool("REFGC_REPORT_OUTSTANDING", &val)?;
        }

        if let Some(val) = lookup("REFGC_DUMP_LIMIT") {
            config.diagnostics.dump_limit =
                val.trim().parse().map_err(|_| ConfigError::EnvParseError {
                    var: "REFGC_DUMP_LIMIT".into(),
                    message: format!("expected a number, got '{}'", val),
                })?;
        }

        if let Some(val) = lookup("REFGC_SHOW_VALUES") {
            config.diagnostics.show_values = require_bool("REFGC_SHOW_VALUES", &val)?;
        }

        if let Some(val) = lookup("REFGC_LOG_LEVEL") {
            config.log.level = LogLevel::from_str(&val).ok_or_else(|| ConfigError::EnvParseError {
                var: "REFGC_LOG_LEVEL".into(),
                message: format!("unknown log level '{}'", val),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.diagnostics.dump_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "diagnostics.dump_limit".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

/// Builder for GcConfig.
#[derive(Debug, Clone, Default)]
pub struct GcConfigBuilder {
    config: GcConfig,
}

impl GcConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable reclamation when the teardown guard drops.
    pub fn teardown_on_exit(mut self, enabled: bool) -> Self {
        self.config.lifecycle.teardown_on_exit = enabled;
        self
    }

    /// Enable or disable outstanding-entry warnings at teardown.
    pub fn report_outstanding(mut self, enabled: bool) -> Self {
        self.config.lifecycle.report_outstanding = enabled;
        self
    }

    /// Set the maximum number of entries listed by a dump.
    pub fn dump_limit(mut self, limit: usize) -> Self {
        self.config.diagnostics.dump_limit = limit;
        self
    }

    /// Include or omit values in dumps.
    pub fn show_values(mut self, enabled: bool) -> Self {
        self.config.diagnostics.show_values = enabled;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<GcConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> GcConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn require_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::EnvParseError {
        var: var.into(),
        message: format!("expected a boolean, got '{}'", value),
    })
}
