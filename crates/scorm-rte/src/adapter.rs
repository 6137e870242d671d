//! The SCORM run-time adapter.
//!
//! [`RteAdapter`] is the object content talks to. It owns the session's
//! [`CmiModel`], enforces the `Uninitialized -> Initialized -> Terminated`
//! lifecycle and turns `Commit`/`Terminate` calls into requests on the
//! session's [`CommitQueue`]. Every content-facing call is synchronous and
//! infallible: protocol violations are recorded as [`Diagnostic`]s and
//! logged, never reported back to content.
//!
//! The SCORM 1.2 (`LMS*`) and SCORM 2004 surfaces are thin views over the
//! same adapter, see [`Scorm12Api`] and [`Scorm2004Api`]. Both return the
//! SCORM string values (`"true"`, `"false"`, `"0"`); internally everything is
//! typed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cmi::{
    CmiKey, CmiModel, CmiSnapshot, CompletionStatus, SessionTimeMark, SuccessStatus, WriteOutcome,
};
use crate::commit::CommitQueue;
use crate::events::{EventBroadcaster, SessionEvent};
use crate::transport::CommitReason;
use crate::watchdog::InitWatchdog;

/// Most recent diagnostics kept per session.
pub const MAX_DIAGNOSTICS: usize = 256;

const TRUE: &str = "true";
const FALSE: &str = "false";
const NO_ERROR: &str = "0";

// ============================================================================
// Lifecycle and diagnostics
// ============================================================================

/// Adapter lifecycle. Content only moves it forward; a failed host finish
/// puts back the state it replaced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Content has not called Initialize yet.
    #[default]
    Uninitialized,
    /// Between Initialize and Terminate.
    Initialized,
    /// After Terminate/LMSFinish.
    Terminated,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uninitialized => write!(f, "uninitialized"),
            Self::Initialized => write!(f, "initialized"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// What went wrong in a recorded content call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    /// A call arrived in the wrong lifecycle state.
    OrderingViolation,
    /// A key outside the supported set was read or written.
    UnknownKey,
    /// Content tried to write a read-only key.
    ReadOnlyKey,
    /// The method name is not part of either API.
    UnknownMethod,
    /// A call arrived after the session was detached.
    Detached,
    /// Content did not call Initialize before the watchdog fired.
    InitTimeout,
}

/// One recorded protocol irregularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostic {
    /// Category.
    pub kind: DiagnosticKind,
    /// API method as content called it.
    pub method: String,
    /// Element name, for data calls.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Lifecycle at the time of the call.
    pub lifecycle: Lifecycle,
    /// When it happened.
    pub at: DateTime<Utc>,
}

// ============================================================================
// Shared state
// ============================================================================

#[derive(Debug)]
struct AdapterState {
    model: CmiModel,
    lifecycle: Lifecycle,
    initialized_at: Option<DateTime<Utc>>,
    detached: bool,
    diagnostics: VecDeque<Diagnostic>,
}

impl AdapterState {
    /// Computes the session time and moves to `Terminated`.
    ///
    /// Returns the session length in whole seconds.
    fn close(&mut self) -> i64 {
        let elapsed = self
            .initialized_at
            .map_or_else(chrono::Duration::zero, |started| Utc::now() - started);
        self.model.finalize_session_time(elapsed);
        self.lifecycle = Lifecycle::Terminated;
        elapsed.num_seconds().max(0)
    }

    fn record(&mut self, kind: DiagnosticKind, method: &str, key: Option<&str>) {
        if self.diagnostics.len() == MAX_DIAGNOSTICS {
            self.diagnostics.pop_front();
        }
        self.diagnostics.push_back(Diagnostic {
            kind,
            method: method.to_string(),
            key: key.map(str::to_string),
            lifecycle: self.lifecycle,
            at: Utc::now(),
        });
    }
}

/// A terminate the host performed while finishing, kept until the finish
/// either succeeds or is rolled back.
#[derive(Debug)]
pub(crate) struct HostTermination {
    previous: Lifecycle,
    session_time: SessionTimeMark,
    session_seconds: i64,
}

/// Shared handle to the adapter's model and lifecycle.
///
/// The commit executor holds one of these to snapshot the model when a
/// queued commit actually runs.
#[derive(Debug, Clone)]
pub struct AdapterHandle {
    state: Arc<Mutex<AdapterState>>,
}

impl AdapterHandle {
    /// Wraps a hydrated model.
    #[must_use]
    pub fn new(model: CmiModel) -> Self {
        Self {
            state: Arc::new(Mutex::new(AdapterState {
                model,
                lifecycle: Lifecycle::Uninitialized,
                initialized_at: None,
                detached: false,
                diagnostics: VecDeque::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Commit payload for the current model.
    #[must_use]
    pub fn snapshot(&self) -> CmiSnapshot {
        self.lock().model.snapshot()
    }

    /// Runs `f` against the model.
    pub fn read<R>(&self, f: impl FnOnce(&CmiModel) -> R) -> R {
        f(&self.lock().model)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.lock().lifecycle
    }

    /// Returns `true` once the adapter has been detached.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.lock().detached
    }

    /// Recorded diagnostics, oldest first.
    #[must_use]
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.lock().diagnostics.iter().cloned().collect()
    }
}

// ============================================================================
// Critical-status policy
// ============================================================================

/// Returns `true` if writing `value` to `key` must be committed immediately.
#[must_use]
pub fn is_critical_write(key: &CmiKey, value: &str) -> bool {
    match key {
        CmiKey::CoreLessonStatus => matches!(
            CompletionStatus::parse(value),
            Some(CompletionStatus::Completed | CompletionStatus::Passed | CompletionStatus::Failed)
        ),
        CmiKey::CompletionStatus => CompletionStatus::parse(value) == Some(CompletionStatus::Completed),
        CmiKey::SuccessStatus => matches!(
            SuccessStatus::parse(value),
            Some(SuccessStatus::Passed | SuccessStatus::Failed)
        ),
        CmiKey::ProgressMeasure => value.trim().parse::<f64>().is_ok_and(|m| m >= 1.0),
        _ => false,
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Session-scoped SCORM run-time adapter.
#[derive(Debug)]
pub struct RteAdapter {
    handle: AdapterHandle,
    commits: CommitQueue,
    watchdog: InitWatchdog,
    events: EventBroadcaster,
    attempt_id: String,
}

impl RteAdapter {
    /// Creates an adapter over `handle` that commits through `commits`.
    #[must_use]
    pub fn new(
        handle: AdapterHandle,
        commits: CommitQueue,
        events: EventBroadcaster,
        attempt_id: impl Into<String>,
    ) -> Self {
        Self {
            handle,
            commits,
            watchdog: InitWatchdog::new(),
            events,
            attempt_id: attempt_id.into(),
        }
    }

    /// The shared model handle.
    #[must_use]
    pub const fn handle(&self) -> &AdapterHandle {
        &self.handle
    }

    /// Attempt this adapter commits to.
    #[must_use]
    pub fn attempt_id(&self) -> &str {
        &self.attempt_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.handle.lifecycle()
    }

    /// Returns `true` once [`detach`](Self::detach) has run.
    #[must_use]
    pub fn is_detached(&self) -> bool {
        self.handle.is_detached()
    }

    /// Number of commit requests issued so far.
    #[must_use]
    pub fn commits_requested(&self) -> u64 {
        self.commits.requested()
    }

    /// Number of commits actually run after coalescing.
    #[must_use]
    pub fn commits_executed(&self) -> u64 {
        self.commits.executed()
    }

    /// Enqueues a commit on behalf of the host.
    pub(crate) fn request_commit(&self, reason: CommitReason) -> Option<u64> {
        self.commits.request(reason)
    }

    /// Waits for every commit requested so far.
    pub async fn flush(&self) {
        self.commits.flush().await;
    }

    /// Returns `true` while the initialization watchdog is pending.
    #[must_use]
    pub fn watchdog_armed(&self) -> bool {
        self.watchdog.is_armed()
    }

    /// Starts the initialization watchdog.
    ///
    /// If content has not called Initialize when it fires, a warning and an
    /// `init_timeout` event are emitted. The session keeps running.
    pub fn arm_watchdog(&self, timeout: Duration) {
        let handle = self.handle.clone();
        let events = self.events.clone();
        let attempt_id = self.attempt_id.clone();
        self.watchdog.arm(timeout, move || {
            {
                let mut state = handle.lock();
                if state.detached || state.lifecycle != Lifecycle::Uninitialized {
                    return;
                }
                state.record(DiagnosticKind::InitTimeout, "Initialize", None);
            }
            warn!(
                %attempt_id,
                timeout_secs = timeout.as_secs(),
                "Content did not call Initialize in time"
            );
            events.send(SessionEvent::init_timeout(attempt_id, timeout));
        });
    }

    /// Detaches the adapter from content. Every later call fails.
    ///
    /// Returns `true` the first time.
    pub fn detach(&self) -> bool {
        self.watchdog.cancel();
        let mut state = self.handle.lock();
        if state.detached {
            return false;
        }
        state.detached = true;
        info!(attempt_id = %self.attempt_id, lifecycle = %state.lifecycle, "Adapter detached");
        true
    }

    /// Checks the detached flag, recording a diagnostic if set.
    fn reject_if_detached(&self, method: &str, key: Option<&str>) -> bool {
        let mut state = self.handle.lock();
        if state.detached {
            state.record(DiagnosticKind::Detached, method, key);
            debug!(method, "Call on detached adapter");
            return true;
        }
        false
    }

    // ------------------------------------------------------------------------
    // Lifecycle calls
    // ------------------------------------------------------------------------

    /// `Initialize("")` / `LMSInitialize("")`.
    pub fn initialize(&self) -> bool {
        self.initialize_as("Initialize")
    }

    fn initialize_as(&self, method: &str) -> bool {
        if self.reject_if_detached(method, None) {
            return false;
        }
        let (standard, entry) = {
            let mut state = self.handle.lock();
            match state.lifecycle {
                Lifecycle::Initialized => return true,
                Lifecycle::Terminated => {
                    state.record(DiagnosticKind::OrderingViolation, method, None);
                    warn!(method, "Initialize called after Terminate");
                    return false;
                }
                Lifecycle::Uninitialized => {}
            }
            state.lifecycle = Lifecycle::Initialized;
            state.initialized_at = Some(Utc::now());
            (state.model.standard(), state.model.entry())
        };

        self.watchdog.cancel();
        info!(attempt_id = %self.attempt_id, method, %standard, %entry, "Content initialized");
        self.events
            .send(SessionEvent::session_initialized(&self.attempt_id, standard, entry));
        true
    }

    /// `Terminate("")` / `LMSFinish("")`.
    ///
    /// Computes the session time, enqueues the final commit and moves to
    /// `Terminated`. Repeated calls succeed without further effect.
    pub fn terminate(&self) -> bool {
        self.terminate_as("Terminate")
    }

    fn terminate_as(&self, method: &str) -> bool {
        if self.reject_if_detached(method, None) {
            return false;
        }
        let session_seconds = {
            let mut state = self.handle.lock();
            match state.lifecycle {
                Lifecycle::Terminated => return true,
                Lifecycle::Uninitialized => {
                    state.record(DiagnosticKind::OrderingViolation, method, None);
                    warn!(method, "Terminate called before Initialize");
                    return false;
                }
                Lifecycle::Initialized => {}
            }
            state.close()
        };

        self.commits.request(CommitReason::Finish);
        info!(attempt_id = %self.attempt_id, method, session_seconds, "Content terminated");
        self.events
            .send(SessionEvent::session_terminated(&self.attempt_id, session_seconds));
        true
    }

    /// Terminates on behalf of the host, also from `Uninitialized`.
    ///
    /// Returns `None` if content already terminated or the adapter is
    /// detached. The terminated event waits for [`Self::confirm_termination`].
    pub(crate) fn terminate_for_host(&self) -> Option<HostTermination> {
        let termination = {
            let mut state = self.handle.lock();
            if state.detached || state.lifecycle == Lifecycle::Terminated {
                return None;
            }
            let previous = state.lifecycle;
            let session_time = state.model.session_time_mark();
            let session_seconds = state.close();
            HostTermination {
                previous,
                session_time,
                session_seconds,
            }
        };

        self.commits.request(CommitReason::Finish);
        debug!(attempt_id = %self.attempt_id, previous = %termination.previous, "Host terminated content");
        Some(termination)
    }

    /// Announces a host terminate once the finish went through.
    pub(crate) fn confirm_termination(&self, termination: &HostTermination) {
        info!(
            attempt_id = %self.attempt_id,
            method = "host finish",
            session_seconds = termination.session_seconds,
            "Content terminated"
        );
        self.events.send(SessionEvent::session_terminated(
            &self.attempt_id,
            termination.session_seconds,
        ));
    }

    /// Undoes a host terminate after a failed finish.
    ///
    /// Content gets back its earlier lifecycle, and the next terminate
    /// computes the session time again.
    pub(crate) fn reopen(&self, termination: HostTermination) {
        let mut state = self.handle.lock();
        if state.detached || state.lifecycle != Lifecycle::Terminated {
            return;
        }
        state.lifecycle = termination.previous;
        state.model.restore_session_time(termination.session_time);
        info!(attempt_id = %self.attempt_id, lifecycle = %state.lifecycle, "Host terminate undone");
    }

    // ------------------------------------------------------------------------
    // Data calls
    // ------------------------------------------------------------------------

    /// `GetValue(key)` / `LMSGetValue(key)`. Never fails; unset keys read `""`.
    pub fn get_value(&self, key: &str) -> String {
        self.get_value_as("GetValue", key)
    }

    fn get_value_as(&self, method: &str, key: &str) -> String {
        let mut state = self.handle.lock();
        if state.detached {
            state.record(DiagnosticKind::Detached, method, Some(key));
            return String::new();
        }
        let parsed = CmiKey::parse(key);
        if parsed.is_unrecognized() {
            state.record(DiagnosticKind::UnknownKey, method, Some(key));
            debug!(method, key, "Read of unrecognized key");
        }
        if state.lifecycle != Lifecycle::Initialized {
            state.record(DiagnosticKind::OrderingViolation, method, Some(key));
            warn!(method, key, lifecycle = %state.lifecycle, "GetValue outside an initialized session");
        }
        state.model.get(&parsed)
    }

    /// `SetValue(key, value)` / `LMSSetValue(key, value)`.
    ///
    /// Writes before Initialize are applied; writes after Terminate and to
    /// read-only keys are refused. A write that reports a final status or
    /// full progress enqueues a commit before this call returns.
    pub fn set_value(&self, key: &str, value: &str) -> bool {
        self.set_value_as("SetValue", key, value)
    }

    fn set_value_as(&self, method: &str, key: &str, value: &str) -> bool {
        let parsed = CmiKey::parse(key);
        {
            let mut state = self.handle.lock();
            if state.detached {
                state.record(DiagnosticKind::Detached, method, Some(key));
                return false;
            }
            match state.lifecycle {
                Lifecycle::Terminated => {
                    state.record(DiagnosticKind::OrderingViolation, method, Some(key));
                    warn!(method, key, "SetValue after Terminate refused");
                    return false;
                }
                Lifecycle::Uninitialized => {
                    state.record(DiagnosticKind::OrderingViolation, method, Some(key));
                    warn!(method, key, "SetValue before Initialize applied");
                }
                Lifecycle::Initialized => {}
            }
            if parsed.is_unrecognized() {
                state.record(DiagnosticKind::UnknownKey, method, Some(key));
                debug!(method, key, "Storing unrecognized key in memory only");
            }
            if state.model.set(&parsed, value) == WriteOutcome::ReadOnly {
                state.record(DiagnosticKind::ReadOnlyKey, method, Some(key));
                warn!(method, key, "Write to read-only key refused");
                return false;
            }
        }

        if is_critical_write(&parsed, value) {
            debug!(key, value, "Critical status change; committing");
            self.commits.request(CommitReason::Commit);
        }
        true
    }

    /// `Commit("")` / `LMSCommit("")`.
    pub fn commit(&self) -> bool {
        self.commit_as("Commit")
    }

    fn commit_as(&self, method: &str) -> bool {
        {
            let mut state = self.handle.lock();
            if state.detached {
                state.record(DiagnosticKind::Detached, method, None);
                return false;
            }
            if state.lifecycle != Lifecycle::Initialized {
                state.record(DiagnosticKind::OrderingViolation, method, None);
                warn!(method, lifecycle = %state.lifecycle, "Commit outside an initialized session");
                return false;
            }
        }
        self.commits.request(CommitReason::Commit).is_some()
    }

    // ------------------------------------------------------------------------
    // Error calls
    // ------------------------------------------------------------------------

    /// `GetLastError()`: always the no-error code.
    #[must_use]
    pub fn last_error(&self) -> String {
        if self.is_detached() {
            return String::new();
        }
        NO_ERROR.to_string()
    }

    /// `GetErrorString(code)`: always empty.
    #[must_use]
    pub fn error_string(&self, _code: &str) -> String {
        String::new()
    }

    /// `GetDiagnostic(code)`: always empty.
    #[must_use]
    pub fn diagnostic(&self, _code: &str) -> String {
        String::new()
    }

    // ------------------------------------------------------------------------
    // Surfaces
    // ------------------------------------------------------------------------

    /// The SCORM 1.2 `API` object.
    #[must_use]
    pub const fn scorm12(&self) -> Scorm12Api<'_> {
        Scorm12Api { adapter: self }
    }

    /// The SCORM 2004 `API_1484_11` object.
    #[must_use]
    pub const fn scorm2004(&self) -> Scorm2004Api<'_> {
        Scorm2004Api { adapter: self }
    }

    /// Invokes an API method by its exact name.
    ///
    /// Unknown names return `"false"` and are recorded.
    pub fn dispatch(&self, method: &str, args: &[String]) -> String {
        let arg = |i: usize| args.get(i).map_or("", String::as_str);
        let api12 = self.scorm12();
        let api2004 = self.scorm2004();
        match method {
            "LMSInitialize" => api12.lms_initialize(arg(0)),
            "LMSGetValue" => api12.lms_get_value(arg(0)),
            "LMSSetValue" => api12.lms_set_value(arg(0), arg(1)),
            "LMSCommit" => api12.lms_commit(arg(0)),
            "LMSFinish" => api12.lms_finish(arg(0)),
            "LMSGetLastError" => api12.lms_get_last_error(),
            "LMSGetErrorString" => api12.lms_get_error_string(arg(0)),
            "LMSGetDiagnostic" => api12.lms_get_diagnostic(arg(0)),
            "Initialize" => api2004.initialize(arg(0)),
            "GetValue" => api2004.get_value(arg(0)),
            "SetValue" => api2004.set_value(arg(0), arg(1)),
            "Commit" => api2004.commit(arg(0)),
            "Terminate" => api2004.terminate(arg(0)),
            "GetLastError" => api2004.get_last_error(),
            "GetErrorString" => api2004.get_error_string(arg(0)),
            "GetDiagnostic" => api2004.get_diagnostic(arg(0)),
            _ => {
                self.handle
                    .lock()
                    .record(DiagnosticKind::UnknownMethod, method, None);
                warn!(method, "Unknown SCORM API method");
                FALSE.to_string()
            }
        }
    }
}

impl Drop for RteAdapter {
    fn drop(&mut self) {
        self.watchdog.cancel();
    }
}

const fn bool_str(value: bool) -> &'static str {
    if value {
        TRUE
    } else {
        FALSE
    }
}

// ============================================================================
// API surfaces
// ============================================================================

/// SCORM 1.2 API surface (`window.API`).
#[derive(Debug, Clone, Copy)]
pub struct Scorm12Api<'a> {
    adapter: &'a RteAdapter,
}

impl Scorm12Api<'_> {
    /// `LMSInitialize("")`
    #[must_use]
    pub fn lms_initialize(&self, _param: &str) -> String {
        bool_str(self.adapter.initialize_as("LMSInitialize")).to_string()
    }

    /// `LMSGetValue(element)`
    #[must_use]
    pub fn lms_get_value(&self, element: &str) -> String {
        self.adapter.get_value_as("LMSGetValue", element)
    }

    /// `LMSSetValue(element, value)`
    #[must_use]
    pub fn lms_set_value(&self, element: &str, value: &str) -> String {
        bool_str(self.adapter.set_value_as("LMSSetValue", element, value)).to_string()
    }

    /// `LMSCommit("")`
    #[must_use]
    pub fn lms_commit(&self, _param: &str) -> String {
        bool_str(self.adapter.commit_as("LMSCommit")).to_string()
    }

    /// `LMSFinish("")`
    #[must_use]
    pub fn lms_finish(&self, _param: &str) -> String {
        bool_str(self.adapter.terminate_as("LMSFinish")).to_string()
    }

    /// `LMSGetLastError()`
    #[must_use]
    pub fn lms_get_last_error(&self) -> String {
        self.adapter.last_error()
    }

    /// `LMSGetErrorString(code)`
    #[must_use]
    pub fn lms_get_error_string(&self, code: &str) -> String {
        self.adapter.error_string(code)
    }

    /// `LMSGetDiagnostic(code)`
    #[must_use]
    pub fn lms_get_diagnostic(&self, code: &str) -> String {
        self.adapter.diagnostic(code)
    }
}

/// SCORM 2004 API surface (`window.API_1484_11`).
#[derive(Debug, Clone, Copy)]
pub struct Scorm2004Api<'a> {
    adapter: &'a RteAdapter,
}

impl Scorm2004Api<'_> {
    /// `Initialize("")`
    #[must_use]
    pub fn initialize(&self, _param: &str) -> String {
        bool_str(self.adapter.initialize_as("Initialize")).to_string()
    }

    /// `GetValue(element)`
    #[must_use]
    pub fn get_value(&self, element: &str) -> String {
        self.adapter.get_value_as("GetValue", element)
    }

    /// `SetValue(element, value)`
    #[must_use]
    pub fn set_value(&self, element: &str, value: &str) -> String {
        bool_str(self.adapter.set_value_as("SetValue", element, value)).to_string()
    }

    /// `Commit("")`
    #[must_use]
    pub fn commit(&self, _param: &str) -> String {
        bool_str(self.adapter.commit_as("Commit")).to_string()
    }

    /// `Terminate("")`
    #[must_use]
    pub fn terminate(&self, _param: &str) -> String {
        bool_str(self.adapter.terminate_as("Terminate")).to_string()
    }

    /// `GetLastError()`
    #[must_use]
    pub fn get_last_error(&self) -> String {
        self.adapter.last_error()
    }

    /// `GetErrorString(code)`
    #[must_use]
    pub fn get_error_string(&self, code: &str) -> String {
        self.adapter.error_string(code)
    }

    /// `GetDiagnostic(code)`
    #[must_use]
    pub fn get_diagnostic(&self, code: &str) -> String {
        self.adapter.diagnostic(code)
    }
}
