//! The attempt service contract.
//!
//! [`SessionTransport`] is everything the run-time needs from the remote
//! attempt-tracking service: look up the latest attempt, start one, save
//! resume data, commit CMI results and finish. The service owns the progress
//! derivation; [`ProgressDeriver`] is the same rule set for in-process use.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cmi::{CmiSnapshot, CompletionStatus, Standard, SuccessStatus};

pub mod http;
pub mod memory;

pub use http::{parse_base_url, HttpTransport};
pub use memory::{MemoryTransport, TransportCall, TransportOp};

/// Errors returned by a [`SessionTransport`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The service could not be reached.
    #[error("Attempt service unreachable: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("Attempt service returned {status}: {message}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body or reason phrase.
        message: String,
    },

    /// The referenced attempt does not exist.
    #[error("Attempt '{0}' not found")]
    AttemptNotFound(String),

    /// The response body could not be understood.
    #[error("Invalid response from attempt service: {0}")]
    InvalidResponse(String),

    /// The request did not complete in time.
    #[error("Attempt service request timed out")]
    Timeout,

    /// The configured base URL cannot address the service.
    #[error("Invalid attempt service URL '{url}': {reason}")]
    InvalidBaseUrl {
        /// URL as configured.
        url: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl TransportError {
    /// Returns `true` if repeating the request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::AttemptNotFound(_) | Self::InvalidResponse(_) | Self::InvalidBaseUrl { .. } => false,
        }
    }
}

/// Lifecycle status of an attempt on the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    /// Created but never committed to.
    #[default]
    NotStarted,
    /// Has committed data and is not finished.
    InProgress,
    /// Finished.
    Completed,
}

/// An attempt as stored by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    /// Attempt identifier.
    pub attempt_id: String,
    /// Lifecycle status.
    pub status: AttemptStatus,
    /// Last saved bookmark.
    #[serde(default)]
    pub last_location: String,
    /// Last saved suspend data.
    #[serde(default)]
    pub suspend_data: String,
    /// Last known progress, 0 to 100.
    #[serde(default)]
    pub progress_pct: f64,
    /// When the attempt was last written.
    pub updated_at: DateTime<Utc>,
}

impl AttemptRecord {
    /// Creates a fresh `NOT_STARTED` record.
    #[must_use]
    pub fn new(attempt_id: impl Into<String>) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            status: AttemptStatus::NotStarted,
            last_location: String::new(),
            suspend_data: String::new(),
            progress_pct: 0.0,
            updated_at: Utc::now(),
        }
    }

    /// Returns `true` if the record carries a bookmark or suspend data.
    #[must_use]
    pub fn has_resume_data(&self) -> bool {
        !self.last_location.is_empty() || !self.suspend_data.is_empty()
    }
}

/// Result of `start_attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedAttempt {
    /// New attempt identifier.
    pub attempt_id: String,
    /// Initial status (normally `NOT_STARTED`).
    pub status: AttemptStatus,
}

/// Resume data persisted by `save_attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveRequest {
    /// Attempt to update.
    pub attempt_id: String,
    /// Bookmark.
    pub location: String,
    /// Suspend data.
    pub suspend_data: String,
    /// Progress, 0 to 100.
    pub progress_pct: f64,
}

/// Result of `save_attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedAttempt {
    /// Attempt identifier.
    pub attempt_id: String,
    /// Status after the save.
    pub status: AttemptStatus,
    /// When the save was stored.
    pub updated_at: DateTime<Utc>,
}

/// Why a commit was sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitReason {
    /// Content called Commit or a critical status changed.
    #[default]
    Commit,
    /// Final commit at Terminate/Finish.
    Finish,
}

impl CommitReason {
    /// Combines two coalesced requests; `finish` wins.
    #[must_use]
    pub const fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::Finish, _) | (_, Self::Finish) => Self::Finish,
            _ => Self::Commit,
        }
    }
}

impl std::fmt::Display for CommitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commit => write!(f, "commit"),
            Self::Finish => write!(f, "finish"),
        }
    }
}

/// Payload of `commit_result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRequest {
    /// Learner identifier.
    pub learner_id: String,
    /// Course identifier.
    pub course_id: String,
    /// Attempt identifier.
    pub attempt_id: String,
    /// Shape of `scorm_data`.
    pub standard: Standard,
    /// Why the commit was sent.
    pub reason: CommitReason,
    /// Edition-specific CMI subset.
    pub scorm_data: BTreeMap<String, String>,
}

/// Authoritative progress computed by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedProgress {
    /// Progress, 0 to 100.
    pub progress_percent: f64,
    /// Content reported a pass.
    pub passed: bool,
    /// Content reported completion.
    pub completed: bool,
}

/// Result of `commit_result`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitResult {
    /// Derived status fields.
    pub derived_fields: DerivedProgress,
}

/// Payload of `finish_attempt`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishRequest {
    /// Attempt to finish.
    pub attempt_id: String,
    /// Course identifier.
    pub course_id: String,
    /// Learner identifier.
    pub learner_id: String,
    /// Final CMI snapshot.
    pub snapshot: CmiSnapshot,
    /// Mark the attempt completed.
    pub complete: bool,
    /// Final progress, 0 to 100.
    pub progress: f64,
}

/// Result of `finish_attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishResult {
    /// The service accepted the finish.
    pub ok: bool,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// The remote attempt-tracking service.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Latest attempt for the course, or `None` if the learner has none.
    async fn latest_attempt(&self, course_id: &str) -> Result<Option<AttemptRecord>, TransportError>;

    /// Creates a new attempt.
    async fn start_attempt(&self, course_id: &str) -> Result<StartedAttempt, TransportError>;

    /// Persists resume data.
    async fn save_attempt(&self, request: SaveRequest) -> Result<SavedAttempt, TransportError>;

    /// Stores a CMI commit and returns the derived progress.
    async fn commit_result(&self, request: CommitRequest) -> Result<CommitResult, TransportError>;

    /// Finishes an attempt. Finishing an already-completed attempt succeeds
    /// without side effects.
    async fn finish_attempt(&self, request: FinishRequest) -> Result<FinishResult, TransportError>;
}

/// Derives progress from a committed CMI subset.
pub trait ProgressDeriver: Send + Sync {
    /// Computes the derived fields for one commit.
    fn derive(&self, standard: Standard, scorm_data: &BTreeMap<String, String>) -> DerivedProgress;
}

/// The stock derivation rules.
///
/// - 1.2: `completed`, `passed` and `failed` lesson statuses count as
///   completed at 100%; only `passed` counts as passed.
/// - 2004: completed when `completion_status` is `completed` or
///   `progress_measure >= 1`; passed when `success_status` is `passed`;
///   otherwise progress is `progress_measure * 100`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardProgressDeriver;

impl ProgressDeriver for StandardProgressDeriver {
    fn derive(&self, standard: Standard, scorm_data: &BTreeMap<String, String>) -> DerivedProgress {
        let value = |key: &str| scorm_data.get(key).map(String::as_str);

        match standard {
            Standard::Scorm12 => {
                let status = value("cmi.core.lesson_status").and_then(CompletionStatus::parse);
                let completed = matches!(
                    status,
                    Some(CompletionStatus::Completed | CompletionStatus::Passed | CompletionStatus::Failed)
                );
                DerivedProgress {
                    progress_percent: if completed { 100.0 } else { 0.0 },
                    passed: status == Some(CompletionStatus::Passed),
                    completed,
                }
            }
            Standard::Scorm2004 => {
                let measure = value("cmi.progress_measure")
                    .and_then(|v| v.trim().parse::<f64>().ok())
                    .map(|m| m.clamp(0.0, 1.0));
                let completed = value("cmi.completion_status").and_then(CompletionStatus::parse)
                    == Some(CompletionStatus::Completed)
                    || measure.is_some_and(|m| m >= 1.0);
                let passed = value("cmi.success_status").and_then(SuccessStatus::parse)
                    == Some(SuccessStatus::Passed);
                let progress_percent = if completed {
                    100.0
                } else {
                    (measure.unwrap_or(0.0) * 100.0).round()
                };
                DerivedProgress {
                    progress_percent,
                    passed,
                    completed,
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_commit_reason_merge() {
        assert_eq!(CommitReason::Commit.merge(CommitReason::Commit), CommitReason::Commit);
        assert_eq!(CommitReason::Commit.merge(CommitReason::Finish), CommitReason::Finish);
        assert_eq!(CommitReason::Finish.merge(CommitReason::Commit), CommitReason::Finish);
    }

    #[test]
    fn test_transport_error_is_transient() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Network("reset".to_string()).is_transient());
        assert!(TransportError::Status {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!TransportError::Status {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!TransportError::AttemptNotFound("a".to_string()).is_transient());
    }

    #[test]
    fn test_attempt_status_wire_format() {
        assert_eq!(
            serde_json::to_string(&AttemptStatus::InProgress).unwrap(),
            r#""IN_PROGRESS""#
        );
        let record: AttemptRecord = serde_json::from_str(
            r#"{"attemptId":"a1","status":"NOT_STARTED","updatedAt":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(record.status, AttemptStatus::NotStarted);
        assert!(!record.has_resume_data());
    }

    #[test]
    fn test_commit_request_wire_format() {
        let request = CommitRequest {
            learner_id: "u1".to_string(),
            course_id: "c1".to_string(),
            attempt_id: "a1".to_string(),
            standard: Standard::Scorm2004,
            reason: CommitReason::Finish,
            scorm_data: data(&[("cmi.location", "p1")]),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["standard"], "2004");
        assert_eq!(json["reason"], "finish");
        assert_eq!(json["scormData"]["cmi.location"], "p1");
    }

    #[test]
    fn test_derive_scorm12() {
        let deriver = StandardProgressDeriver;
        let passed = deriver.derive(Standard::Scorm12, &data(&[("cmi.core.lesson_status", "passed")]));
        assert!(passed.passed);
        assert!(passed.completed);
        assert!((passed.progress_percent - 100.0).abs() < f64::EPSILON);

        let failed = deriver.derive(Standard::Scorm12, &data(&[("cmi.core.lesson_status", "failed")]));
        assert!(!failed.passed);
        assert!(failed.completed);

        let incomplete =
            deriver.derive(Standard::Scorm12, &data(&[("cmi.core.lesson_status", "incomplete")]));
        assert_eq!(incomplete, DerivedProgress::default());
    }

    #[test]
    fn test_derive_scorm2004() {
        let deriver = StandardProgressDeriver;
        let partial = deriver.derive(
            Standard::Scorm2004,
            &data(&[("cmi.completion_status", "incomplete"), ("cmi.progress_measure", "0.42")]),
        );
        assert!(!partial.completed);
        assert!((partial.progress_percent - 42.0).abs() < f64::EPSILON);

        let by_measure = deriver.derive(Standard::Scorm2004, &data(&[("cmi.progress_measure", "1.0")]));
        assert!(by_measure.completed);
        assert!((by_measure.progress_percent - 100.0).abs() < f64::EPSILON);

        let passed = deriver.derive(
            Standard::Scorm2004,
            &data(&[("cmi.success_status", "passed"), ("cmi.completion_status", "completed")]),
        );
        assert!(passed.passed);
        assert!(passed.completed);
    }
}
