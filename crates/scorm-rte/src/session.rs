//! One learner session of one package.
//!
//! [`RteSession::start`] runs resume coordination, hydrates the CMI model and
//! wires the adapter to a commit worker that talks to the attempt service.
//! The host-side exit flows (save and exit, exit without saving, finish) live
//! here as well; they are the only places where transport failures reach the
//! user.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scorm_package::ResolvedLaunch;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapter::{AdapterHandle, Lifecycle, RteAdapter};
use crate::cmi::{CmiModel, EntryMode, Learner, Standard};
use crate::commit::{CommitExecutor, CommitQueue};
use crate::error::{Result, RteError};
use crate::events::{EventBroadcaster, SessionEvent};
use crate::resume::{AttemptOrigin, CacheEntry, ResumeCache, ResumeCoordinator, ResumePlan, ResumeSource};
use crate::transport::{
    CommitReason, CommitRequest, DerivedProgress, FinishRequest, FinishResult, SaveRequest, SavedAttempt,
    SessionTransport,
};

/// Progress reported to the attempt service when the learner finishes.
const FINISHED_PROGRESS: f64 = 100.0;

/// Remote and local stores a session talks to.
#[derive(Clone)]
pub struct SessionServices {
    /// Attempt service.
    pub transport: Arc<dyn SessionTransport>,
    /// Local resume cache.
    pub cache: Arc<dyn ResumeCache>,
}

impl std::fmt::Debug for SessionServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionServices").finish_non_exhaustive()
    }
}

/// Everything needed to start a session.
#[derive(Debug, Clone)]
pub struct SessionLaunch {
    /// Course the attempt belongs to.
    pub course_id: String,
    /// The learner.
    pub learner: Learner,
    /// Validated package entry point.
    pub launch: ResolvedLaunch,
    /// How long content may take to call Initialize.
    pub init_timeout: Duration,
}

/// How the session ended, as far as the host is concerned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Still attached to content.
    #[default]
    Active,
    /// Resume data was saved and the session detached.
    Saved,
    /// Exited before anything was committed; the attempt stays not started.
    ResetToNotStarted,
    /// Exited without an explicit save; committed data is kept.
    KeptInProgress,
    /// The attempt service accepted the finish.
    Finished,
    /// Detached by the host without an exit flow.
    Detached,
}

/// Observable state of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStatus {
    /// Course identifier.
    pub course_id: String,
    /// Attempt the session commits to.
    pub attempt_id: String,
    /// How the attempt id was obtained.
    pub attempt_origin: AttemptOrigin,
    /// Learner identifier.
    pub learner_id: String,
    /// Package identifier.
    pub package_id: String,
    /// URL the content frame loads.
    pub launch_url: String,
    /// Package title, if the manifest has one.
    pub title: Option<String>,
    /// Edition the session was launched with.
    pub standard: Standard,
    /// Payload shape commits currently use.
    pub detected_standard: Standard,
    /// Adapter lifecycle.
    pub lifecycle: Lifecycle,
    /// Entry mode reported to content.
    pub entry: EntryMode,
    /// Where resume data came from.
    pub resume_source: ResumeSource,
    /// Progress, 0 to 100, as last derived by the attempt service.
    pub progress_percent: f64,
    /// Content reported a pass.
    pub passed: bool,
    /// Content reported completion.
    pub completed: bool,
    /// Commit requests issued by the adapter.
    pub commits_requested: u64,
    /// Commits sent to the attempt service.
    pub commits_dispatched: u64,
    /// Commits the attempt service did not accept.
    pub commits_failed: u64,
    /// Message of the most recent commit failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_commit_error: Option<String>,
    /// Host-side outcome.
    pub outcome: SessionOutcome,
}

// ============================================================================
// Commit executor
// ============================================================================

#[derive(Debug, Default)]
struct Tracking {
    progress: DerivedProgress,
    dispatched: u64,
    failed: u64,
    last_error: Option<String>,
}

type SharedTracking = Arc<Mutex<Tracking>>;

fn lock(tracking: &Mutex<Tracking>) -> MutexGuard<'_, Tracking> {
    tracking.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sends adapter snapshots to the attempt service.
struct SessionCommitter {
    handle: AdapterHandle,
    transport: Arc<dyn SessionTransport>,
    cache: Arc<dyn ResumeCache>,
    events: EventBroadcaster,
    course_id: String,
    learner_id: String,
    attempt_id: String,
    tracking: SharedTracking,
}

#[async_trait]
impl CommitExecutor for SessionCommitter {
    async fn execute(&self, reason: CommitReason) {
        let snapshot = self.handle.snapshot();
        lock(&self.tracking).dispatched += 1;

        let request = CommitRequest {
            learner_id: self.learner_id.clone(),
            course_id: self.course_id.clone(),
            attempt_id: self.attempt_id.clone(),
            standard: snapshot.standard,
            reason,
            scorm_data: snapshot.data,
        };

        let progress_pct = match self.transport.commit_result(request).await {
            Ok(result) => {
                let derived = result.derived_fields;
                debug!(
                    attempt_id = %self.attempt_id,
                    %reason,
                    progress = derived.progress_percent,
                    "Commit accepted"
                );
                lock(&self.tracking).progress = derived;
                self.events
                    .send(SessionEvent::progress_updated(&self.attempt_id, reason, derived));
                derived.progress_percent
            }
            Err(e) => {
                warn!(attempt_id = %self.attempt_id, %reason, error = %e, "Commit failed; keeping local copy");
                let progress = {
                    let mut tracking = lock(&self.tracking);
                    tracking.failed += 1;
                    tracking.last_error = Some(e.to_string());
                    tracking.progress.progress_percent
                };
                self.events
                    .send(SessionEvent::commit_failed(&self.attempt_id, reason, e.to_string()));
                progress
            }
        };

        let entry = CacheEntry {
            attempt_id: self.attempt_id.clone(),
            last_location: snapshot.location,
            suspend_data: snapshot.suspend_data,
            progress_pct,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.cache.store(&self.course_id, &entry).await {
            warn!(course_id = %self.course_id, error = %e, "Could not update resume cache");
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// A running session.
pub struct RteSession {
    course_id: String,
    learner: Learner,
    launch: ResolvedLaunch,
    plan: ResumePlan,
    standard: Standard,
    adapter: RteAdapter,
    transport: Arc<dyn SessionTransport>,
    cache: Arc<dyn ResumeCache>,
    events: EventBroadcaster,
    tracking: SharedTracking,
    outcome: Mutex<SessionOutcome>,
    host_flow: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for RteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RteSession")
            .field("course_id", &self.course_id)
            .field("attempt_id", &self.plan.attempt_id)
            .field("lifecycle", &self.adapter.lifecycle())
            .finish_non_exhaustive()
    }
}

impl RteSession {
    /// Prepares the attempt and returns a session ready for content.
    ///
    /// Never fails: resume coordination falls back to local data and a
    /// locally generated attempt id.
    pub async fn start(launch: SessionLaunch, services: &SessionServices, events: EventBroadcaster) -> Self {
        let SessionLaunch {
            course_id,
            learner,
            launch,
            init_timeout,
        } = launch;

        let coordinator = ResumeCoordinator::new(Arc::clone(&services.transport), Arc::clone(&services.cache));
        let plan = coordinator.prepare(&course_id).await;

        let standard = Standard::from(launch.version);
        let model = CmiModel::new(standard, learner.clone())
            .with_resume(&plan.location, &plan.suspend_data)
            .with_launch_data(launch.launch_data.clone().unwrap_or_default());
        let handle = AdapterHandle::new(model);

        let tracking = Arc::new(Mutex::new(Tracking {
            progress: DerivedProgress {
                progress_percent: plan.progress_pct,
                ..DerivedProgress::default()
            },
            ..Tracking::default()
        }));

        let committer = SessionCommitter {
            handle: handle.clone(),
            transport: Arc::clone(&services.transport),
            cache: Arc::clone(&services.cache),
            events: events.clone(),
            course_id: course_id.clone(),
            learner_id: learner.id.clone(),
            attempt_id: plan.attempt_id.clone(),
            tracking: Arc::clone(&tracking),
        };
        // The worker stops on its own once the adapter drops the queue.
        let (queue, _worker) = CommitQueue::spawn(Arc::new(committer));

        let adapter = RteAdapter::new(handle, queue, events.clone(), plan.attempt_id.clone());
        adapter.arm_watchdog(init_timeout);

        info!(
            %course_id,
            attempt_id = %plan.attempt_id,
            package_id = %launch.package_id,
            %standard,
            entry = %plan.entry(),
            "Session started"
        );

        Self {
            course_id,
            learner,
            launch,
            plan,
            standard,
            adapter,
            transport: Arc::clone(&services.transport),
            cache: Arc::clone(&services.cache),
            events,
            tracking,
            outcome: Mutex::new(SessionOutcome::Active),
            host_flow: tokio::sync::Mutex::new(()),
        }
    }

    /// The adapter content talks to.
    #[must_use]
    pub const fn adapter(&self) -> &RteAdapter {
        &self.adapter
    }

    /// Course identifier.
    #[must_use]
    pub fn course_id(&self) -> &str {
        &self.course_id
    }

    /// Attempt the session commits to.
    #[must_use]
    pub fn attempt_id(&self) -> &str {
        &self.plan.attempt_id
    }

    /// The resume decision the session started with.
    #[must_use]
    pub const fn plan(&self) -> &ResumePlan {
        &self.plan
    }

    /// The resolved package entry point.
    #[must_use]
    pub const fn launch(&self) -> &ResolvedLaunch {
        &self.launch
    }

    /// Host-side outcome so far.
    #[must_use]
    pub fn outcome(&self) -> SessionOutcome {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_outcome(&self, outcome: SessionOutcome) {
        *self.outcome.lock().unwrap_or_else(PoisonError::into_inner) = outcome;
    }

    /// Invokes a SCORM API method by name.
    pub fn call(&self, method: &str, args: &[String]) -> String {
        self.adapter.dispatch(method, args)
    }

    /// Current observable state.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let (detected_standard, entry) = self
            .adapter
            .handle()
            .read(|model| (model.detected_standard(), model.entry()));
        let tracking = lock(&self.tracking);
        SessionStatus {
            course_id: self.course_id.clone(),
            attempt_id: self.plan.attempt_id.clone(),
            attempt_origin: self.plan.attempt_origin,
            learner_id: self.learner.id.clone(),
            package_id: self.launch.package_id.clone(),
            launch_url: self.launch.launch_url(),
            title: self.launch.title.clone(),
            standard: self.standard,
            detected_standard,
            lifecycle: self.adapter.lifecycle(),
            entry,
            resume_source: self.plan.source,
            progress_percent: tracking.progress.progress_percent,
            passed: tracking.progress.passed,
            completed: tracking.progress.completed,
            commits_requested: self.adapter.commits_requested(),
            commits_dispatched: tracking.dispatched,
            commits_failed: tracking.failed,
            last_commit_error: tracking.last_error.clone(),
            outcome: self.outcome(),
        }
    }

    // ------------------------------------------------------------------------
    // Host flows
    // ------------------------------------------------------------------------

    /// Commits, saves resume data and detaches.
    ///
    /// On failure the session stays attached so the learner can retry.
    pub async fn save_and_exit(&self) -> Result<SavedAttempt> {
        let _flow = self.host_flow.lock().await;
        if self.adapter.is_detached() {
            return Err(RteError::SessionDetached);
        }

        if self.adapter.lifecycle() == Lifecycle::Initialized {
            self.adapter.request_commit(CommitReason::Commit);
        }
        self.adapter.flush().await;

        let snapshot = self.adapter.handle().snapshot();
        let progress_pct = lock(&self.tracking).progress.progress_percent;
        let request = SaveRequest {
            attempt_id: self.plan.attempt_id.clone(),
            location: snapshot.location.clone(),
            suspend_data: snapshot.suspend_data.clone(),
            progress_pct,
        };

        let saved = self.transport.save_attempt(request).await.map_err(|e| {
            warn!(attempt_id = %self.plan.attempt_id, error = %e, "Save and exit failed");
            RteError::save_failed(e)
        })?;

        let entry = CacheEntry {
            attempt_id: self.plan.attempt_id.clone(),
            last_location: snapshot.location,
            suspend_data: snapshot.suspend_data,
            progress_pct,
            timestamp: saved.updated_at,
        };
        if let Err(e) = self.cache.store(&self.course_id, &entry).await {
            warn!(course_id = %self.course_id, error = %e, "Could not update resume cache");
        }

        info!(attempt_id = %self.plan.attempt_id, "Progress saved");
        self.set_outcome(SessionOutcome::Saved);
        self.detach_adapter();
        Ok(saved)
    }

    /// Exits without an explicit save.
    ///
    /// If nothing was ever committed the exit makes no server call, drops
    /// the cache entry and reports the attempt as reset. Otherwise queued
    /// commits are awaited and the attempt stays in progress.
    pub async fn exit_without_saving(&self) -> Result<SessionOutcome> {
        let _flow = self.host_flow.lock().await;
        if self.adapter.is_detached() {
            return Err(RteError::SessionDetached);
        }

        let committed = self.adapter.commits_requested() > 0;
        self.detach_adapter();

        let outcome = if committed {
            self.adapter.flush().await;
            info!(attempt_id = %self.plan.attempt_id, "Exited; committed progress kept");
            SessionOutcome::KeptInProgress
        } else {
            if let Err(e) = self.cache.clear(&self.course_id).await {
                warn!(course_id = %self.course_id, error = %e, "Could not clear resume cache");
            }
            info!(attempt_id = %self.plan.attempt_id, "Exited before any commit; attempt reset");
            SessionOutcome::ResetToNotStarted
        };
        self.set_outcome(outcome);
        Ok(outcome)
    }

    /// Terminates content, sends the final commit and finishes the attempt.
    ///
    /// Finishing twice makes no second call. A rejected or failed finish
    /// leaves the attempt in progress, the cache in place and the adapter in
    /// the lifecycle it had before, so content keeps working and the learner
    /// can retry.
    pub async fn finish(&self) -> Result<FinishResult> {
        let _flow = self.host_flow.lock().await;
        if self.outcome() == SessionOutcome::Finished {
            debug!(attempt_id = %self.plan.attempt_id, "Attempt already finished");
            return Ok(FinishResult {
                ok: true,
                message: Some("Attempt already finished".to_string()),
            });
        }
        if self.adapter.is_detached() {
            return Err(RteError::SessionDetached);
        }

        let termination = self.adapter.terminate_for_host();
        self.adapter.flush().await;

        let request = FinishRequest {
            attempt_id: self.plan.attempt_id.clone(),
            course_id: self.course_id.clone(),
            learner_id: self.learner.id.clone(),
            snapshot: self.adapter.handle().snapshot(),
            complete: true,
            progress: FINISHED_PROGRESS,
        };

        let failure = match self.transport.finish_attempt(request).await {
            Ok(result) if result.ok => {
                if let Some(termination) = &termination {
                    self.adapter.confirm_termination(termination);
                }
                return self.complete_finish(result).await;
            }
            Ok(result) => {
                let message = result
                    .message
                    .unwrap_or_else(|| "the attempt service refused the request".to_string());
                warn!(attempt_id = %self.plan.attempt_id, %message, "Finish rejected");
                RteError::FinishRejected { message }
            }
            Err(e) => {
                warn!(attempt_id = %self.plan.attempt_id, error = %e, "Finish failed");
                RteError::finish_failed(e)
            }
        };

        if let Some(termination) = termination {
            self.adapter.reopen(termination);
        }
        Err(failure)
    }

    async fn complete_finish(&self, result: FinishResult) -> Result<FinishResult> {
        if let Err(e) = self.cache.clear(&self.course_id).await {
            warn!(course_id = %self.course_id, error = %e, "Could not clear resume cache");
        }
        info!(attempt_id = %self.plan.attempt_id, "Attempt finished");
        self.set_outcome(SessionOutcome::Finished);
        self.events
            .send(SessionEvent::attempt_finished(&self.plan.attempt_id, result.message.clone()));
        self.detach_adapter();
        Ok(result)
    }

    /// Detaches the session from content without an exit flow.
    ///
    /// Returns `true` the first time.
    pub fn detach(&self) -> bool {
        let detached = self.detach_adapter();
        if detached && self.outcome() == SessionOutcome::Active {
            self.set_outcome(SessionOutcome::Detached);
        }
        detached
    }

    fn detach_adapter(&self) -> bool {
        if !self.adapter.detach() {
            return false;
        }
        self.events
            .send(SessionEvent::session_detached(&self.plan.attempt_id));
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use scorm_package::ScormVersion;

    use super::*;
    use crate::resume::MemoryResumeCache;
    use crate::transport::{AttemptRecord, AttemptStatus, MemoryTransport, TransportCall, TransportOp};

    struct Fixture {
        transport: MemoryTransport,
        cache: Arc<MemoryResumeCache>,
        events: EventBroadcaster,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                transport: MemoryTransport::new(),
                cache: Arc::new(MemoryResumeCache::new()),
                events: EventBroadcaster::default(),
            }
        }

        fn services(&self) -> SessionServices {
            SessionServices {
                transport: Arc::new(self.transport.clone()),
                cache: self.cache.clone(),
            }
        }

        async fn start(&self, version: ScormVersion) -> RteSession {
            let launch = SessionLaunch {
                course_id: "course-1".to_string(),
                learner: Learner::new("u1", "Doe, Jane"),
                launch: ResolvedLaunch {
                    package_id: "pkg".to_string(),
                    package_root: PathBuf::from("/tmp/pkg"),
                    launch_path: "index.html".to_string(),
                    launch_query: None,
                    title: Some("Safety Basics".to_string()),
                    launch_data: Some("mode=review".to_string()),
                    version,
                },
                init_timeout: Duration::from_secs(10),
            };
            RteSession::start(launch, &self.services(), self.events.clone()).await
        }
    }

    fn s(value: &str) -> String {
        value.to_string()
    }

    #[tokio::test]
    async fn test_start_creates_fresh_attempt() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;

        let status = session.status();
        assert_eq!(status.attempt_id, "attempt-1");
        assert_eq!(status.attempt_origin, AttemptOrigin::Started);
        assert_eq!(status.entry, EntryMode::AbInitio);
        assert_eq!(status.lifecycle, Lifecycle::Uninitialized);
        assert_eq!(status.launch_url, "/packages/pkg/index.html");
        assert_eq!(status.outcome, SessionOutcome::Active);
        assert!(session.adapter().watchdog_armed());
    }

    #[tokio::test]
    async fn test_remote_resume_beats_cache() {
        let fx = Fixture::new();
        let mut record = AttemptRecord::new("a-remote");
        record.status = AttemptStatus::InProgress;
        record.last_location = s("p5");
        fx.transport.seed_attempt("course-1", record);
        fx.cache
            .store(
                "course-1",
                &CacheEntry {
                    attempt_id: s("a-remote"),
                    last_location: s("p2"),
                    suspend_data: String::new(),
                    progress_pct: 10.0,
                    timestamp: Utc::now(),
                },
            )
            .await
            .unwrap();

        let session = fx.start(ScormVersion::Scorm12).await;
        assert_eq!(session.call("LMSInitialize", &[s("")]), "true");
        assert_eq!(session.call("LMSGetValue", &[s("cmi.core.lesson_location")]), "p5");
        assert_eq!(session.call("LMSGetValue", &[s("cmi.core.entry")]), "resume");
        assert_eq!(session.status().resume_source, ResumeSource::Remote);
    }

    #[tokio::test]
    async fn test_manifest_launch_data_is_readable() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm2004).await;
        session.call("Initialize", &[s("")]);
        assert_eq!(session.call("GetValue", &[s("cmi.launch_data")]), "mode=review");
        assert_eq!(session.call("SetValue", &[s("cmi.launch_data"), s("x")]), "false");
        assert_eq!(session.call("GetValue", &[s("cmi.launch_data")]), "mode=review");
    }

    #[tokio::test]
    async fn test_progress_measure_updates_observable_progress() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm2004).await;
        let mut events = fx.events.subscribe();

        session.call("Initialize", &[s("")]);
        assert_eq!(session.call("SetValue", &[s("cmi.progress_measure"), s("1.0")]), "true");
        assert_eq!(session.adapter().commits_requested(), 1);
        session.adapter().flush().await;

        let status = session.status();
        assert!((status.progress_percent - 100.0).abs() < f64::EPSILON);
        assert!(status.completed);
        assert_eq!(status.commits_dispatched, 1);

        let commits = fx.transport.commits();
        assert_eq!(commits.len(), 1);
        assert_eq!(commits[0].reason, CommitReason::Commit);
        assert_eq!(commits[0].standard, Standard::Scorm2004);

        let mut names = Vec::new();
        while let Ok(event) = events.try_recv() {
            names.push(event.event_name());
        }
        assert!(names.contains(&"progress_updated"));
    }

    #[tokio::test]
    async fn test_failed_commit_is_cached_and_counted() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;
        fx.transport.fail_next(TransportOp::CommitResult, 1);

        session.call("LMSInitialize", &[s("")]);
        session.call("LMSSetValue", &[s("cmi.core.lesson_location"), s("p3")]);
        assert_eq!(session.call("LMSCommit", &[s("")]), "true");
        session.adapter().flush().await;

        let status = session.status();
        assert_eq!(status.commits_failed, 1);
        assert!(status.last_commit_error.is_some());
        let cached = fx.cache.get("course-1").unwrap();
        assert_eq!(cached.last_location, "p3");
        assert_eq!(cached.attempt_id, status.attempt_id);
    }

    #[tokio::test]
    async fn test_slow_commits_coalesce_and_reads_stay_current() {
        let fx = Fixture::new();
        fx.transport
            .set_latency(TransportOp::CommitResult, Duration::from_millis(150));
        let session = fx.start(ScormVersion::Scorm12).await;
        let location = |value: &str| {
            session.call("LMSSetValue", &[s("cmi.core.lesson_location"), s(value)]);
        };

        session.call("LMSInitialize", &[s("")]);
        location("p1");
        session.call("LMSCommit", &[s("")]);
        // Let the worker take its snapshot and block in the transport.
        tokio::time::sleep(Duration::from_millis(30)).await;

        location("p2");
        assert_eq!(session.call("LMSGetValue", &[s("cmi.core.lesson_location")]), "p2");
        session.call("LMSCommit", &[s("")]);
        location("p3");
        session.call("LMSCommit", &[s("")]);
        assert_eq!(session.adapter().commits_requested(), 3);
        session.adapter().flush().await;

        let locations: Vec<_> = fx
            .transport
            .commits()
            .iter()
            .map(|c| c.scorm_data.get("cmi.core.lesson_location").cloned().unwrap_or_default())
            .collect();
        assert_eq!(locations, vec![s("p1"), s("p3")]);
    }

    #[tokio::test]
    async fn test_terminate_sends_one_finish_commit() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;

        session.call("LMSInitialize", &[s("")]);
        assert_eq!(session.call("LMSFinish", &[s("")]), "true");
        assert_eq!(session.call("LMSFinish", &[s("")]), "true");
        session.adapter().flush().await;

        let reasons: Vec<_> = fx.transport.commits().iter().map(|c| c.reason).collect();
        assert_eq!(reasons, vec![CommitReason::Finish]);
    }

    #[tokio::test]
    async fn test_save_and_exit_saves_then_detaches() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;
        session.call("LMSInitialize", &[s("")]);
        session.call("LMSSetValue", &[s("cmi.suspend_data"), s("state")]);

        let saved = session.save_and_exit().await.unwrap();
        assert_eq!(saved.status, AttemptStatus::InProgress);
        assert_eq!(session.outcome(), SessionOutcome::Saved);
        assert!(session.adapter().is_detached());
        assert_eq!(session.call("LMSGetValue", &[s("cmi.suspend_data")]), "");

        let calls = fx.transport.calls();
        let save_index = calls.iter().position(|c| c.op() == TransportOp::SaveAttempt).unwrap();
        let commit_index = calls.iter().position(|c| c.op() == TransportOp::CommitResult).unwrap();
        assert!(commit_index < save_index);
        if let TransportCall::SaveAttempt(request) = &calls[save_index] {
            assert_eq!(request.suspend_data, "state");
        }
    }

    #[tokio::test]
    async fn test_save_failure_keeps_session_attached() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;
        session.call("LMSInitialize", &[s("")]);
        fx.transport.fail_next(TransportOp::SaveAttempt, 1);

        let err = session.save_and_exit().await.unwrap_err();
        assert!(matches!(err, RteError::SaveFailed { .. }));
        assert!(err.is_transient());
        assert_eq!(session.outcome(), SessionOutcome::Active);
        assert!(!session.adapter().is_detached());

        session.save_and_exit().await.unwrap();
        assert_eq!(session.outcome(), SessionOutcome::Saved);
    }

    #[tokio::test]
    async fn test_exit_without_commit_resets_without_server_call() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;
        session.call("LMSInitialize", &[s("")]);
        session.call("LMSSetValue", &[s("cmi.core.lesson_location"), s("p1")]);
        let calls_before = fx.transport.calls().len();

        let outcome = session.exit_without_saving().await.unwrap();
        assert_eq!(outcome, SessionOutcome::ResetToNotStarted);
        assert_eq!(fx.transport.calls().len(), calls_before);
        assert!(fx.cache.get("course-1").is_none());
        assert!(session.adapter().is_detached());
    }

    #[tokio::test]
    async fn test_exit_after_commit_keeps_progress() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;
        session.call("LMSInitialize", &[s("")]);
        session.call("LMSSetValue", &[s("cmi.core.lesson_location"), s("p4")]);
        session.call("LMSCommit", &[s("")]);

        let outcome = session.exit_without_saving().await.unwrap();
        assert_eq!(outcome, SessionOutcome::KeptInProgress);
        assert_eq!(fx.transport.call_count(TransportOp::CommitResult), 1);
        assert_eq!(fx.cache.get("course-1").unwrap().last_location, "p4");
    }

    #[tokio::test]
    async fn test_finish_is_idempotent() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;
        session.call("LMSInitialize", &[s("")]);
        session.call("LMSSetValue", &[s("cmi.core.lesson_status"), s("passed")]);

        let first = session.finish().await.unwrap();
        assert!(first.ok);
        assert_eq!(session.outcome(), SessionOutcome::Finished);
        assert_eq!(session.status().lifecycle, Lifecycle::Terminated);

        let second = session.finish().await.unwrap();
        assert!(second.ok);
        assert_eq!(fx.transport.call_count(TransportOp::FinishAttempt), 1);
        assert_eq!(fx.transport.completions(), 1);
        assert!(fx.cache.get("course-1").is_none());
    }

    #[tokio::test]
    async fn test_failed_finish_leaves_attempt_in_progress() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm12).await;
        session.call("LMSInitialize", &[s("")]);
        session.call("LMSSetValue", &[s("cmi.core.lesson_location"), s("p9")]);
        fx.transport.fail_next(TransportOp::FinishAttempt, 1);

        let err = session.finish().await.unwrap_err();
        assert!(matches!(err, RteError::FinishFailed { .. }));
        assert_eq!(session.outcome(), SessionOutcome::Active);
        assert_eq!(fx.cache.get("course-1").unwrap().last_location, "p9");
        let attempt = fx.transport.attempt(session.attempt_id()).unwrap();
        assert_eq!(attempt.status, AttemptStatus::InProgress);

        // Content keeps running as if the finish never happened.
        assert_eq!(session.status().lifecycle, Lifecycle::Initialized);
        assert!(!session.adapter().handle().read(CmiModel::session_time_computed));
        assert_eq!(
            session.call("LMSSetValue", &[s("cmi.core.lesson_location"), s("p10")]),
            "true"
        );
        assert_eq!(session.call("LMSCommit", &[s("")]), "true");
        session.adapter().flush().await;

        session.finish().await.unwrap();
        assert_eq!(session.outcome(), SessionOutcome::Finished);
        assert_eq!(session.status().lifecycle, Lifecycle::Terminated);
        let reasons: Vec<_> = fx.transport.commits().iter().map(|c| c.reason).collect();
        assert_eq!(
            reasons,
            vec![CommitReason::Finish, CommitReason::Commit, CommitReason::Finish]
        );
        let attempt = fx.transport.attempt(session.attempt_id()).unwrap();
        assert_eq!(attempt.last_location, "p10");
        assert_eq!(attempt.status, AttemptStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_finish_after_content_terminate_stays_terminated() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm2004).await;
        let mut events = fx.events.subscribe();
        session.call("Initialize", &[s("")]);
        session.call("Terminate", &[s("")]);
        fx.transport.fail_next(TransportOp::FinishAttempt, 1);

        assert!(session.finish().await.is_err());
        assert_eq!(session.status().lifecycle, Lifecycle::Terminated);
        assert_eq!(session.call("SetValue", &[s("cmi.location"), s("p2")]), "false");

        session.finish().await.unwrap();
        assert_eq!(fx.transport.commits().len(), 1);

        let mut terminated = 0;
        while let Ok(event) = events.try_recv() {
            if event.event_name() == "session_terminated" {
                terminated += 1;
            }
        }
        assert_eq!(terminated, 1);
    }

    #[tokio::test]
    async fn test_detach_fails_later_calls() {
        let fx = Fixture::new();
        let session = fx.start(ScormVersion::Scorm2004).await;
        session.call("Initialize", &[s("")]);

        assert!(session.detach());
        assert!(!session.detach());
        assert_eq!(session.outcome(), SessionOutcome::Detached);
        assert_eq!(session.call("Commit", &[s("")]), "false");
        assert!(matches!(
            session.save_and_exit().await.unwrap_err(),
            RteError::SessionDetached
        ));
    }
}
