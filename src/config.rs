//! Agent configuration: TOML file, `MMV_` environment overrides, validation.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::metrics::validate_name;
use crate::scanner::AgentOptions;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Scan settings
    #[serde(default)]
    pub agent: ScanConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AgentConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound { path: path.to_path_buf() });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("MMV_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::parse(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(figment::providers::Serialized::defaults(Self::default()))
            .merge(Env::prefixed("MMV_").split("__"))
            .extract()
            .map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.domain > MAX_DOMAIN {
            return Err(ConfigError::invalid(
                "agent.domain",
                format!("Domain must not exceed {}", MAX_DOMAIN),
            ));
        }

        if self.agent.prefix.contains('.') || validate_name(&self.agent.prefix).is_err() {
            return Err(ConfigError::invalid(
                "agent.prefix",
                "Prefix must be one name component: a letter followed by letters, digits or '_'",
            ));
        }

        if self.agent.stats_dir.as_os_str().is_empty() {
            return Err(ConfigError::invalid("agent.stats_dir", "Stats directory must not be empty"));
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty" | "compact") {
            return Err(ConfigError::invalid(
                "logging.format",
                format!("Unknown log format '{}'", self.logging.format),
            ));
        }

        Ok(())
    }

    /// Create a default config file
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }

    pub fn options(&self) -> AgentOptions {
        AgentOptions {
            stats_dir: self.agent.stats_dir.clone(),
            prefix: self.agent.prefix.as_str().into(),
            domain: self.agent.domain,
        }
    }
}

// ----------------------------------------------------------------------------
// 5.2 Scan Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Directory holding client export files
    #[serde(default = "default_stats_dir")]
    pub stats_dir: PathBuf,

    /// First component of every exported name
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Performance domain of this agent
    #[serde(default = "default_domain")]
    pub domain: u32,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            stats_dir: default_stats_dir(),
            prefix: default_prefix(),
            domain: default_domain(),
        }
    }
}

fn default_stats_dir() -> PathBuf {
    PathBuf::from(DEFAULT_STATS_DIR)
}

fn default_prefix() -> String {
    DEFAULT_PREFIX.into()
}

fn default_domain() -> u32 {
    DEFAULT_DOMAIN
}

// ----------------------------------------------------------------------------
// 5.3 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

fn default_true() -> bool {
    true
}
