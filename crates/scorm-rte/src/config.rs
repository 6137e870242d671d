//! Configuration for the SCORM run-time host.
//!
//! Settings are read from `scorm.json` in the working directory. Every field
//! has a default, so a missing file yields a usable configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RteError};
use crate::transport::parse_base_url;

/// The default config file name.
const CONFIG_FILE_NAME: &str = "scorm.json";

/// Default directory holding extracted packages.
fn default_packages_dir() -> String {
    "packages".to_string()
}

/// Default directory for the local resume cache.
fn default_cache_dir() -> String {
    ".scorm/cache".to_string()
}

/// Default initialization watchdog timeout in seconds.
const fn default_init_timeout() -> u64 {
    10
}

/// Default capacity of the session event channel.
const fn default_event_capacity() -> usize {
    100
}

/// Default attempt service request timeout in seconds.
const fn default_transport_timeout() -> u64 {
    15
}

/// Main configuration for the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Directory containing one extracted package per subdirectory.
    #[serde(default = "default_packages_dir")]
    pub packages_dir: String,

    /// Directory for resume cache files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Seconds to wait for content to call Initialize before warning.
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,

    /// Buffered session events per WebSocket subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Attempt service settings.
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            packages_dir: default_packages_dir(),
            cache_dir: default_cache_dir(),
            init_timeout_secs: default_init_timeout(),
            event_capacity: default_event_capacity(),
            transport: TransportConfig::default(),
        }
    }
}

impl Config {
    /// Loads configuration from the current working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if `scorm.json` exists but is invalid.
    pub fn load() -> Result<Self> {
        let current_dir = std::env::current_dir().map_err(|e| {
            RteError::config_parse(
                "<current directory>",
                format!("cannot determine current directory: {e}"),
            )
        })?;
        Self::load_from_dir(&current_dir)
    }

    /// Loads `scorm.json` from `dir`, or defaults if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but is invalid.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        Self::load_from_file(&dir.join(CONFIG_FILE_NAME))
    }

    /// Loads configuration from a specific file path.
    ///
    /// If the file does not exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns `RteError::ConfigParseError` if the file cannot be read or holds
    /// invalid JSON, and `RteError::ConfigValidationError` if a value is out
    /// of range.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => {
                return Err(RteError::config_parse(
                    path,
                    format!("failed to read file: {e}"),
                ));
            }
        };

        let config: Self = serde_json::from_str(&contents)
            .map_err(|e| RteError::config_parse(path, e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `RteError::ConfigValidationError` if any check fails.
    pub fn validate(&self) -> Result<()> {
        if self.packages_dir.trim().is_empty() {
            return Err(RteError::config_validation(
                "packagesDir must not be empty",
                "Point packagesDir at the directory holding extracted packages",
            ));
        }

        if self.cache_dir.trim().is_empty() {
            return Err(RteError::config_validation(
                "cacheDir must not be empty",
                "Set cacheDir in your scorm.json (default is '.scorm/cache')",
            ));
        }

        if self.init_timeout_secs == 0 {
            return Err(RteError::config_validation(
                "initTimeoutSecs must be greater than 0",
                "Set initTimeoutSecs to at least 1 second in your scorm.json",
            ));
        }

        if self.event_capacity == 0 {
            return Err(RteError::config_validation(
                "eventCapacity must be greater than 0",
                "Set eventCapacity to at least 1 in your scorm.json",
            ));
        }

        if self.transport.timeout_secs == 0 {
            return Err(RteError::config_validation(
                "transport.timeoutSecs must be greater than 0",
                "Set transport.timeoutSecs to at least 1 second in your scorm.json",
            ));
        }

        if self.transport.kind == TransportKind::Http {
            let base_url = self.transport.base_url.as_deref().unwrap_or("").trim();
            if base_url.is_empty() {
                return Err(RteError::config_validation(
                    "transport.baseUrl is required when transport.kind is 'http'",
                    "Set transport.baseUrl to the attempt service URL, or use kind 'memory'",
                ));
            }
            if let Err(e) = parse_base_url(base_url) {
                return Err(RteError::config_validation(
                    format!("transport.baseUrl: {e}"),
                    "Use a URL such as 'https://lms.example.com/api'",
                ));
            }
        }

        Ok(())
    }

    /// Initialization watchdog timeout.
    #[must_use]
    pub const fn init_timeout(&self) -> Duration {
        Duration::from_secs(self.init_timeout_secs)
    }
}

/// Which attempt service implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process attempt store (default).
    #[default]
    Memory,
    /// Remote attempt service over HTTP.
    Http,
}

impl TransportKind {
    /// Parses a string into a `TransportKind`, case-insensitively.
    fn from_str_case_insensitive(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for TransportKind {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_str_case_insensitive(&s).ok_or_else(|| {
            serde::de::Error::custom(format!(
                "invalid transport kind '{s}': expected one of 'memory', 'http'"
            ))
        })
    }
}

impl Serialize for TransportKind {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let s = match self {
            Self::Memory => "memory",
            Self::Http => "http",
        };
        serializer.serialize_str(s)
    }
}

/// Attempt service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    /// Implementation to use.
    #[serde(default)]
    pub kind: TransportKind,

    /// Base URL of the attempt service (HTTP only).
    #[serde(default)]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_transport_timeout")]
    pub timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::default(),
            base_url: None,
            timeout_secs: default_transport_timeout(),
        }
    }
}
