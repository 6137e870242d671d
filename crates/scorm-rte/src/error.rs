//! Error types for the SCORM run-time host.
//!
//! Content-facing API calls never return these; they surface only from
//! configuration loading, session start and the explicit learner actions
//! (save and exit, finish), where the host can show them and offer a retry.

use std::path::PathBuf;

use scorm_package::PackageError;

use crate::transport::TransportError;

/// A specialized `Result` type for run-time host operations.
pub type Result<T> = std::result::Result<T, RteError>;

/// Errors that can occur while hosting a SCORM session.
#[derive(Debug, thiserror::Error)]
pub enum RteError {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Invalid JSON syntax in the configuration file.
    #[error("Invalid JSON in config file '{path}': {message}\n\nSuggestion: Validate your scorm.json with a JSON linter")]
    ConfigParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Description of the parse error.
        message: String,
    },

    /// Configuration validation failed.
    #[error("Invalid configuration: {message}\n\nSuggestion: {suggestion}")]
    ConfigValidationError {
        /// Description of the validation failure.
        message: String,
        /// Actionable suggestion for the user.
        suggestion: String,
    },

    // ========================================================================
    // Launch Errors
    // ========================================================================
    /// The package cannot be launched.
    #[error("{0}")]
    PackageInvalid(#[from] PackageError),

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// The session was detached and no longer accepts calls.
    #[error("The course session has been closed\n\nSuggestion: Relaunch the course to continue")]
    SessionDetached,

    /// No session is attached to the registry.
    #[error("No course session is active\n\nSuggestion: Launch a course first")]
    NoActiveSession,

    /// Saving progress on exit failed.
    #[error("Your progress could not be saved: {message}\n\nSuggestion: Check your connection and try again")]
    SaveFailed {
        /// Description of the failure.
        message: String,
    },

    /// Finishing the attempt failed; the attempt is still in progress.
    #[error("The course could not be marked as finished: {message}\n\nSuggestion: Your progress is kept; try finishing again")]
    FinishFailed {
        /// Description of the failure.
        message: String,
    },

    /// The attempt service refused to finish the attempt.
    #[error("The course could not be marked as finished: {message}")]
    FinishRejected {
        /// Message returned by the attempt service.
        message: String,
    },

    // ========================================================================
    // Local Cache Errors
    // ========================================================================
    /// A resume cache file holds malformed JSON.
    #[error("Corrupted resume cache '{path}': {message}\n\nSuggestion: Remove the cache file; progress will be restored from the server")]
    CacheCorrupted {
        /// Path to the cache file.
        path: PathBuf,
        /// Description of the corruption.
        message: String,
    },

    // ========================================================================
    // Transport / General Errors
    // ========================================================================
    /// The attempt service could not be reached or answered badly.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// General I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RteError {
    /// Creates a new `ConfigParseError`.
    #[must_use]
    pub fn config_parse(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ConfigParseError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a new `ConfigValidationError`.
    #[must_use]
    pub fn config_validation(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::ConfigValidationError {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Creates a new `SaveFailed` error.
    #[must_use]
    pub fn save_failed(message: impl std::fmt::Display) -> Self {
        Self::SaveFailed {
            message: message.to_string(),
        }
    }

    /// Creates a new `FinishFailed` error.
    #[must_use]
    pub fn finish_failed(message: impl std::fmt::Display) -> Self {
        Self::FinishFailed {
            message: message.to_string(),
        }
    }

    /// Creates a new `CacheCorrupted` error.
    #[must_use]
    pub fn cache_corrupted(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::CacheCorrupted {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Returns `true` if the failed action can be retried by the learner.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::SaveFailed { .. } | Self::FinishFailed { .. } => true,
            Self::Transport(err) => err.is_transient(),
            _ => false,
        }
    }
}
