//! The CMI data model.
//!
//! One [`CmiModel`] holds every SCORM 1.2 and SCORM 2004 element the adapter
//! supports for a single attempt. Keys are parsed into the fixed [`CmiKey`]
//! set; anything else lands in a pass-through bucket that is readable and
//! writable but never committed.

use std::collections::BTreeMap;

use chrono::Duration;
use scorm_package::ScormVersion;
use serde::{Deserialize, Serialize};

// ============================================================================
// Standard, statuses, entry mode
// ============================================================================

/// SCORM edition of a session or commit payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Standard {
    /// SCORM 1.2.
    #[default]
    #[serde(rename = "1.2")]
    Scorm12,
    /// SCORM 2004.
    #[serde(rename = "2004")]
    Scorm2004,
}

impl From<ScormVersion> for Standard {
    fn from(version: ScormVersion) -> Self {
        match version {
            ScormVersion::Scorm12 => Self::Scorm12,
            ScormVersion::Scorm2004 => Self::Scorm2004,
        }
    }
}

impl std::fmt::Display for Standard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scorm12 => write!(f, "1.2"),
            Self::Scorm2004 => write!(f, "2004"),
        }
    }
}

/// Lesson status (1.2) / completion status (2004) vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionStatus {
    /// `not attempted`
    NotAttempted,
    /// `incomplete`
    Incomplete,
    /// `completed`
    Completed,
    /// `passed` (1.2 only)
    Passed,
    /// `failed` (1.2 only)
    Failed,
    /// `browsed` (1.2 only)
    Browsed,
    /// `unknown` (2004 only)
    Unknown,
}

impl CompletionStatus {
    /// Parses a status value, accepting both `not attempted` and `not_attempted`.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "not attempted" | "not_attempted" => Some(Self::NotAttempted),
            "incomplete" => Some(Self::Incomplete),
            "completed" => Some(Self::Completed),
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "browsed" => Some(Self::Browsed),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// Success status vocabulary (2004).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuccessStatus {
    /// `passed`
    Passed,
    /// `failed`
    Failed,
    /// `unknown`
    Unknown,
}

impl SuccessStatus {
    /// Parses a success status value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "passed" => Some(Self::Passed),
            "failed" => Some(Self::Failed),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

/// How the attempt was entered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryMode {
    /// First launch of the attempt.
    #[default]
    #[serde(rename = "ab-initio")]
    AbInitio,
    /// Re-launch with hydrated bookmark or suspend data.
    #[serde(rename = "resume")]
    Resume,
}

impl EntryMode {
    /// The CMI vocabulary value.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AbInitio => "ab-initio",
            Self::Resume => "resume",
        }
    }
}

impl std::fmt::Display for EntryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CmiKey
// ============================================================================

/// The recognized CMI element names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CmiKey {
    /// `cmi.core._children`
    CoreChildren,
    /// `cmi.core.student_id`
    CoreStudentId,
    /// `cmi.core.student_name`
    CoreStudentName,
    /// `cmi.core.lesson_location`
    CoreLessonLocation,
    /// `cmi.core.credit`
    CoreCredit,
    /// `cmi.core.lesson_status`
    CoreLessonStatus,
    /// `cmi.core.entry`
    CoreEntry,
    /// `cmi.core.score.raw`
    CoreScoreRaw,
    /// `cmi.core.score.min`
    CoreScoreMin,
    /// `cmi.core.score.max`
    CoreScoreMax,
    /// `cmi.core.total_time`
    CoreTotalTime,
    /// `cmi.core.lesson_mode`
    CoreLessonMode,
    /// `cmi.core.exit`
    CoreExit,
    /// `cmi.core.session_time`
    CoreSessionTime,
    /// `cmi.launch_data`
    LaunchData,
    /// `cmi.comments`
    Comments,
    /// `cmi.suspend_data` (both editions)
    SuspendData,
    /// `cmi._version`
    Version,
    /// `cmi.learner_id`
    LearnerId,
    /// `cmi.learner_name`
    LearnerName,
    /// `cmi.location`
    Location,
    /// `cmi.credit`
    Credit,
    /// `cmi.mode`
    Mode,
    /// `cmi.entry`
    Entry,
    /// `cmi.exit`
    Exit,
    /// `cmi.completion_status`
    CompletionStatus,
    /// `cmi.success_status`
    SuccessStatus,
    /// `cmi.score.raw`
    ScoreRaw,
    /// `cmi.score.min`
    ScoreMin,
    /// `cmi.score.max`
    ScoreMax,
    /// `cmi.score.scaled`
    ScoreScaled,
    /// `cmi.progress_measure`
    ProgressMeasure,
    /// `cmi.session_time`
    SessionTime,
    /// `cmi.total_time`
    TotalTime,
    /// Any other key; stored in memory only.
    Other(String),
}

const KNOWN_KEYS: &[(&str, CmiKey)] = &[
    ("cmi.core._children", CmiKey::CoreChildren),
    ("cmi.core.student_id", CmiKey::CoreStudentId),
    ("cmi.core.student_name", CmiKey::CoreStudentName),
    ("cmi.core.lesson_location", CmiKey::CoreLessonLocation),
    ("cmi.core.credit", CmiKey::CoreCredit),
    ("cmi.core.lesson_status", CmiKey::CoreLessonStatus),
    ("cmi.core.entry", CmiKey::CoreEntry),
    ("cmi.core.score.raw", CmiKey::CoreScoreRaw),
    ("cmi.core.score.min", CmiKey::CoreScoreMin),
    ("cmi.core.score.max", CmiKey::CoreScoreMax),
    ("cmi.core.total_time", CmiKey::CoreTotalTime),
    ("cmi.core.lesson_mode", CmiKey::CoreLessonMode),
    ("cmi.core.exit", CmiKey::CoreExit),
    ("cmi.core.session_time", CmiKey::CoreSessionTime),
    ("cmi.launch_data", CmiKey::LaunchData),
    ("cmi.comments", CmiKey::Comments),
    ("cmi.suspend_data", CmiKey::SuspendData),
    ("cmi._version", CmiKey::Version),
    ("cmi.learner_id", CmiKey::LearnerId),
    ("cmi.learner_name", CmiKey::LearnerName),
    ("cmi.location", CmiKey::Location),
    ("cmi.credit", CmiKey::Credit),
    ("cmi.mode", CmiKey::Mode),
    ("cmi.entry", CmiKey::Entry),
    ("cmi.exit", CmiKey::Exit),
    ("cmi.completion_status", CmiKey::CompletionStatus),
    ("cmi.success_status", CmiKey::SuccessStatus),
    ("cmi.score.raw", CmiKey::ScoreRaw),
    ("cmi.score.min", CmiKey::ScoreMin),
    ("cmi.score.max", CmiKey::ScoreMax),
    ("cmi.score.scaled", CmiKey::ScoreScaled),
    ("cmi.progress_measure", CmiKey::ProgressMeasure),
    ("cmi.session_time", CmiKey::SessionTime),
    ("cmi.total_time", CmiKey::TotalTime),
];

impl CmiKey {
    /// Parses an element name. Unrecognized names become [`CmiKey::Other`].
    #[must_use]
    pub fn parse(key: &str) -> Self {
        KNOWN_KEYS
            .iter()
            .find(|(name, _)| *name == key)
            .map_or_else(|| Self::Other(key.to_string()), |(_, k)| k.clone())
    }

    /// The element name as content spells it.
    #[must_use]
    pub fn as_str(&self) -> &str {
        if let Self::Other(key) = self {
            return key;
        }
        KNOWN_KEYS
            .iter()
            .find(|(_, k)| k == self)
            .map_or("", |(name, _)| name)
    }

    /// Returns `true` for keys outside the fixed set.
    #[must_use]
    pub const fn is_unrecognized(&self) -> bool {
        matches!(self, Self::Other(_))
    }

    /// Returns `true` for elements content may not write.
    #[must_use]
    pub const fn is_read_only(&self) -> bool {
        matches!(
            self,
            Self::CoreChildren
                | Self::CoreStudentId
                | Self::CoreStudentName
                | Self::CoreCredit
                | Self::CoreEntry
                | Self::CoreTotalTime
                | Self::CoreLessonMode
                | Self::LaunchData
                | Self::Version
                | Self::LearnerId
                | Self::LearnerName
                | Self::Credit
                | Self::Mode
                | Self::Entry
                | Self::TotalTime
        )
    }
}

impl std::fmt::Display for CmiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CmiModel
// ============================================================================

/// Outcome of a write against the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value was stored.
    Stored,
    /// The element is read-only; nothing changed.
    ReadOnly,
}

/// Learner identity supplied by the host before launch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Learner {
    /// Learner identifier.
    pub id: String,
    /// Display name, `Last, First` by SCORM convention.
    pub name: String,
}

impl Learner {
    /// Creates a learner.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Committable view of the model at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmiSnapshot {
    /// Payload shape used for `data`.
    pub standard: Standard,
    /// Bookmark.
    pub location: String,
    /// Suspend data.
    pub suspend_data: String,
    /// Edition-specific subset of CMI elements.
    pub data: BTreeMap<String, String>,
}

/// Session-time fields saved before a host-initiated terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTimeMark {
    core: Option<String>,
    iso: Option<String>,
    computed: bool,
}

/// In-memory CMI state for one attempt.
#[derive(Debug, Clone)]
pub struct CmiModel {
    standard: Standard,
    learner: Learner,
    entry: EntryMode,
    lesson_status: Option<String>,
    completion_status: Option<String>,
    success_status: Option<String>,
    score_raw: Option<String>,
    score_min: Option<String>,
    score_max: Option<String>,
    score_scaled: Option<String>,
    location: String,
    suspend_data: String,
    progress_measure: Option<String>,
    core_session_time: Option<String>,
    session_time: Option<String>,
    exit: Option<String>,
    comments: Option<String>,
    launch_data: String,
    uses_2004_status: bool,
    session_time_computed: bool,
    unrecognized: BTreeMap<String, String>,
}

impl CmiModel {
    /// Creates a fresh (`ab-initio`) model.
    #[must_use]
    pub fn new(standard: Standard, learner: Learner) -> Self {
        Self {
            standard,
            learner,
            entry: EntryMode::AbInitio,
            lesson_status: None,
            completion_status: None,
            success_status: None,
            score_raw: None,
            score_min: None,
            score_max: None,
            score_scaled: None,
            location: String::new(),
            suspend_data: String::new(),
            progress_measure: None,
            core_session_time: None,
            session_time: None,
            exit: None,
            comments: None,
            launch_data: String::new(),
            uses_2004_status: false,
            session_time_computed: false,
            unrecognized: BTreeMap::new(),
        }
    }

    /// Hydrates bookmark and suspend data before Initialize.
    ///
    /// The entry mode becomes `resume` exactly when either value is non-empty.
    #[must_use]
    pub fn with_resume(mut self, location: &str, suspend_data: &str) -> Self {
        self.location = location.to_string();
        self.suspend_data = suspend_data.to_string();
        self.entry = if location.is_empty() && suspend_data.is_empty() {
            EntryMode::AbInitio
        } else {
            EntryMode::Resume
        };
        self
    }

    /// Sets `cmi.launch_data` from the manifest.
    #[must_use]
    pub fn with_launch_data(mut self, launch_data: impl Into<String>) -> Self {
        self.launch_data = launch_data.into();
        self
    }

    /// Edition the session was launched with.
    #[must_use]
    pub const fn standard(&self) -> Standard {
        self.standard
    }

    /// Entry mode fixed at hydration.
    #[must_use]
    pub const fn entry(&self) -> EntryMode {
        self.entry
    }

    /// Current bookmark.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Current suspend data.
    #[must_use]
    pub fn suspend_data(&self) -> &str {
        &self.suspend_data
    }

    /// Edition used to shape commit payloads.
    ///
    /// Once `cmi.completion_status`, `cmi.success_status` or
    /// `cmi.progress_measure` has been written the session stays on the 2004
    /// shape.
    #[must_use]
    pub const fn detected_standard(&self) -> Standard {
        if self.uses_2004_status {
            Standard::Scorm2004
        } else {
            Standard::Scorm12
        }
    }

    /// Parsed `cmi.core.lesson_status`, if set.
    #[must_use]
    pub fn lesson_status(&self) -> Option<CompletionStatus> {
        self.lesson_status.as_deref().and_then(CompletionStatus::parse)
    }

    /// Parsed `cmi.completion_status`, if set.
    #[must_use]
    pub fn completion_status(&self) -> Option<CompletionStatus> {
        self.completion_status
            .as_deref()
            .and_then(CompletionStatus::parse)
    }

    /// Parsed `cmi.success_status`, if set.
    #[must_use]
    pub fn success_status(&self) -> Option<SuccessStatus> {
        self.success_status.as_deref().and_then(SuccessStatus::parse)
    }

    /// Parsed `cmi.progress_measure`, if set and numeric.
    #[must_use]
    pub fn progress_measure(&self) -> Option<f64> {
        self.progress_measure
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok())
    }

    /// Returns `true` once the adapter has computed the session time.
    #[must_use]
    pub const fn session_time_computed(&self) -> bool {
        self.session_time_computed
    }

    /// Reads an element. Unset elements read as their default or `""`.
    #[must_use]
    pub fn get(&self, key: &CmiKey) -> String {
        let opt = |value: &Option<String>, default: &str| {
            value.clone().unwrap_or_else(|| default.to_string())
        };
        match key {
            CmiKey::CoreChildren => "student_id,student_name,lesson_location,credit,lesson_status,entry,score,total_time,lesson_mode,exit,session_time".to_string(),
            CmiKey::CoreStudentId | CmiKey::LearnerId => self.learner.id.clone(),
            CmiKey::CoreStudentName | CmiKey::LearnerName => self.learner.name.clone(),
            CmiKey::CoreLessonLocation | CmiKey::Location => self.location.clone(),
            CmiKey::CoreCredit | CmiKey::Credit => "credit".to_string(),
            CmiKey::CoreLessonStatus => opt(&self.lesson_status, "not attempted"),
            CmiKey::CoreEntry | CmiKey::Entry => self.entry.as_str().to_string(),
            CmiKey::CoreScoreRaw | CmiKey::ScoreRaw => opt(&self.score_raw, ""),
            CmiKey::CoreScoreMin | CmiKey::ScoreMin => opt(&self.score_min, ""),
            CmiKey::CoreScoreMax | CmiKey::ScoreMax => opt(&self.score_max, ""),
            CmiKey::CoreTotalTime => "0000:00:00".to_string(),
            CmiKey::TotalTime => "PT0S".to_string(),
            CmiKey::CoreLessonMode | CmiKey::Mode => "normal".to_string(),
            CmiKey::CoreExit | CmiKey::Exit => opt(&self.exit, ""),
            CmiKey::CoreSessionTime => opt(&self.core_session_time, ""),
            CmiKey::SessionTime => opt(&self.session_time, ""),
            CmiKey::LaunchData => self.launch_data.clone(),
            CmiKey::Comments => opt(&self.comments, ""),
            CmiKey::SuspendData => self.suspend_data.clone(),
            CmiKey::Version => "1.0".to_string(),
            CmiKey::CompletionStatus => opt(&self.completion_status, "unknown"),
            CmiKey::SuccessStatus => opt(&self.success_status, "unknown"),
            CmiKey::ScoreScaled => opt(&self.score_scaled, ""),
            CmiKey::ProgressMeasure => opt(&self.progress_measure, ""),
            CmiKey::Other(name) => self.unrecognized.get(name).cloned().unwrap_or_default(),
        }
    }

    /// Writes an element.
    ///
    /// Values are stored verbatim so that the next read returns exactly what
    /// content wrote.
    pub fn set(&mut self, key: &CmiKey, value: &str) -> WriteOutcome {
        if key.is_read_only() {
            return WriteOutcome::ReadOnly;
        }
        let value = value.to_string();
        match key {
            CmiKey::CoreLessonLocation | CmiKey::Location => self.location = value,
            CmiKey::CoreLessonStatus => self.lesson_status = Some(value),
            CmiKey::CoreScoreRaw | CmiKey::ScoreRaw => self.score_raw = Some(value),
            CmiKey::CoreScoreMin | CmiKey::ScoreMin => self.score_min = Some(value),
            CmiKey::CoreScoreMax | CmiKey::ScoreMax => self.score_max = Some(value),
            CmiKey::CoreExit | CmiKey::Exit => self.exit = Some(value),
            CmiKey::CoreSessionTime => self.core_session_time = Some(value),
            CmiKey::SessionTime => self.session_time = Some(value),
            CmiKey::Comments => self.comments = Some(value),
            CmiKey::SuspendData => self.suspend_data = value,
            CmiKey::CompletionStatus => {
                self.completion_status = Some(value);
                self.uses_2004_status = true;
            }
            CmiKey::SuccessStatus => {
                self.success_status = Some(value);
                self.uses_2004_status = true;
            }
            CmiKey::ScoreScaled => self.score_scaled = Some(value),
            CmiKey::ProgressMeasure => {
                self.progress_measure = Some(value);
                self.uses_2004_status = true;
            }
            CmiKey::Other(name) => {
                self.unrecognized.insert(name.clone(), value);
            }
            CmiKey::CoreChildren
            | CmiKey::CoreStudentId
            | CmiKey::CoreStudentName
            | CmiKey::CoreCredit
            | CmiKey::CoreEntry
            | CmiKey::CoreTotalTime
            | CmiKey::CoreLessonMode
            | CmiKey::LaunchData
            | CmiKey::Version
            | CmiKey::LearnerId
            | CmiKey::LearnerName
            | CmiKey::Credit
            | CmiKey::Mode
            | CmiKey::Entry
            | CmiKey::TotalTime => return WriteOutcome::ReadOnly,
        }
        WriteOutcome::Stored
    }

    /// Records the session duration in both editions' formats.
    ///
    /// Only the first call has an effect; returns `false` afterwards.
    pub fn finalize_session_time(&mut self, elapsed: Duration) -> bool {
        if self.session_time_computed {
            return false;
        }
        self.core_session_time = Some(format_cmi_timespan(elapsed));
        self.session_time = Some(format_iso8601_duration(elapsed));
        self.session_time_computed = true;
        true
    }

    /// Captures the session-time fields so a terminate can be undone.
    #[must_use]
    pub fn session_time_mark(&self) -> SessionTimeMark {
        SessionTimeMark {
            core: self.core_session_time.clone(),
            iso: self.session_time.clone(),
            computed: self.session_time_computed,
        }
    }

    /// Puts back the session-time fields captured by [`Self::session_time_mark`].
    pub fn restore_session_time(&mut self, mark: SessionTimeMark) {
        self.core_session_time = mark.core;
        self.session_time = mark.iso;
        self.session_time_computed = mark.computed;
    }

    /// Scaled score as supplied, or derived from raw/min/max.
    ///
    /// Derivation uses `(raw - min) / (max - min)` (min defaults to 0) and is
    /// clamped to `[-1, 1]`.
    #[must_use]
    pub fn effective_score_scaled(&self) -> Option<String> {
        if let Some(scaled) = self.score_scaled.as_deref().filter(|s| !s.trim().is_empty()) {
            return Some(scaled.to_string());
        }
        let parse = |v: &Option<String>| v.as_deref().and_then(|s| s.trim().parse::<f64>().ok());
        let raw = parse(&self.score_raw)?;
        let max = parse(&self.score_max)?;
        let min = parse(&self.score_min).unwrap_or(0.0);
        if max <= min {
            return None;
        }
        let scaled = ((raw - min) / (max - min)).clamp(-1.0, 1.0);
        Some(format_number(scaled))
    }

    /// Builds the committable snapshot using the detected payload shape.
    #[must_use]
    pub fn snapshot(&self) -> CmiSnapshot {
        let standard = self.detected_standard();
        let mut data = BTreeMap::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                data.insert(key.to_string(), value);
            }
        };

        match standard {
            Standard::Scorm12 => {
                put("cmi.core.lesson_status", Some(self.get(&CmiKey::CoreLessonStatus)));
                put("cmi.core.lesson_location", Some(self.location.clone()));
                put("cmi.core.score.raw", self.score_raw.clone());
                put("cmi.core.score.min", self.score_min.clone());
                put("cmi.core.score.max", self.score_max.clone());
                put("cmi.core.session_time", self.core_session_time.clone());
                put("cmi.core.exit", self.exit.clone());
                put("cmi.suspend_data", Some(self.suspend_data.clone()));
            }
            Standard::Scorm2004 => {
                put("cmi.completion_status", Some(self.get(&CmiKey::CompletionStatus)));
                put("cmi.success_status", Some(self.get(&CmiKey::SuccessStatus)));
                put("cmi.location", Some(self.location.clone()));
                put("cmi.score.raw", self.score_raw.clone());
                put("cmi.score.min", self.score_min.clone());
                put("cmi.score.max", self.score_max.clone());
                put("cmi.score.scaled", self.effective_score_scaled());
                put("cmi.progress_measure", self.progress_measure.clone());
                put("cmi.session_time", self.session_time.clone());
                put("cmi.exit", self.exit.clone());
                put("cmi.suspend_data", Some(self.suspend_data.clone()));
            }
        }

        CmiSnapshot {
            standard,
            location: self.location.clone(),
            suspend_data: self.suspend_data.clone(),
            data,
        }
    }
}

// ============================================================================
// Duration formatting
// ============================================================================

/// Formats a duration as a SCORM 1.2 `CMITimespan` (`HH:MM:SS`).
#[must_use]
pub fn format_cmi_timespan(elapsed: Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Formats a duration as an ISO-8601 duration (`PT1H2M3S`).
#[must_use]
pub fn format_iso8601_duration(elapsed: Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    if total == 0 {
        return "PT0S".to_string();
    }
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut out = String::from("PT");
    if hours > 0 {
        out.push_str(&format!("{hours}H"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}M"));
    }
    if seconds > 0 {
        out.push_str(&format!("{seconds}S"));
    }
    out
}

fn format_number(value: f64) -> String {
    let rounded = (value * 10_000.0).round() / 10_000.0;
    let text = format!("{rounded:.4}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text == "-0" {
        "0".to_string()
    } else {
        text.to_string()
    }
}
