//! In-process attempt store.
//!
//! Used when no remote service is configured and throughout the tests. It
//! records recent calls and can inject failures or latency per operation.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{
    AttemptRecord, AttemptStatus, CommitReason, CommitRequest, CommitResult, FinishRequest,
    FinishResult, ProgressDeriver, SaveRequest, SavedAttempt, SessionTransport, StandardProgressDeriver,
    StartedAttempt, TransportError,
};

/// Calls kept in the log; older entries are dropped first.
pub const MAX_RECORDED_CALLS: usize = 512;

/// Transport operations, for fault injection and call inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportOp {
    /// `latest_attempt`
    LatestAttempt,
    /// `start_attempt`
    StartAttempt,
    /// `save_attempt`
    SaveAttempt,
    /// `commit_result`
    CommitResult,
    /// `finish_attempt`
    FinishAttempt,
}

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCall {
    /// `latest_attempt(course_id)`
    LatestAttempt {
        /// Course looked up.
        course_id: String,
    },
    /// `start_attempt(course_id)`
    StartAttempt {
        /// Course started.
        course_id: String,
    },
    /// `save_attempt`
    SaveAttempt(SaveRequest),
    /// `commit_result`
    CommitResult(CommitRequest),
    /// `finish_attempt`
    FinishAttempt(FinishRequest),
}

impl TransportCall {
    /// The operation this call belongs to.
    #[must_use]
    pub const fn op(&self) -> TransportOp {
        match self {
            Self::LatestAttempt { .. } => TransportOp::LatestAttempt,
            Self::StartAttempt { .. } => TransportOp::StartAttempt,
            Self::SaveAttempt(_) => TransportOp::SaveAttempt,
            Self::CommitResult(_) => TransportOp::CommitResult,
            Self::FinishAttempt(_) => TransportOp::FinishAttempt,
        }
    }
}

#[derive(Debug, Default)]
struct Store {
    /// Attempts per course, oldest first.
    attempts: HashMap<String, Vec<AttemptRecord>>,
    calls: VecDeque<TransportCall>,
    /// Per-operation totals, unaffected by the log cap.
    call_counts: HashMap<TransportOp, usize>,
    failures: HashMap<TransportOp, usize>,
    latency: HashMap<TransportOp, Duration>,
    completions: usize,
    next_id: u64,
}

impl Store {
    fn record(&mut self, call: TransportCall) {
        *self.call_counts.entry(call.op()).or_default() += 1;
        if self.calls.len() == MAX_RECORDED_CALLS {
            self.calls.pop_front();
        }
        self.calls.push_back(call);
    }

    fn find_mut(&mut self, attempt_id: &str) -> Option<&mut AttemptRecord> {
        self.attempts
            .values_mut()
            .flat_map(|list| list.iter_mut())
            .find(|record| record.attempt_id == attempt_id)
    }

    /// Returns the attempt, adopting unknown (locally generated) ids.
    fn find_or_adopt(&mut self, course_id: &str, attempt_id: &str) -> &mut AttemptRecord {
        let course = self
            .attempts
            .iter()
            .find(|(_, list)| list.iter().any(|r| r.attempt_id == attempt_id))
            .map_or_else(|| course_id.to_string(), |(course, _)| course.clone());
        let list = self.attempts.entry(course).or_default();
        let index = if let Some(index) = list.iter().position(|r| r.attempt_id == attempt_id) {
            index
        } else {
            list.push(AttemptRecord::new(attempt_id));
            list.len() - 1
        };
        &mut list[index]
    }

    fn take_failure(&mut self, op: TransportOp) -> bool {
        match self.failures.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// [`SessionTransport`] backed by process memory.
#[derive(Clone)]
pub struct MemoryTransport {
    store: Arc<Mutex<Store>>,
    deriver: Arc<dyn ProgressDeriver>,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport").finish_non_exhaustive()
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    /// Creates an empty store using [`StandardProgressDeriver`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_deriver(Arc::new(StandardProgressDeriver))
    }

    /// Creates an empty store with a custom progress derivation.
    #[must_use]
    pub fn with_deriver(deriver: Arc<dyn ProgressDeriver>) -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            deriver,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn enter(&self, op: TransportOp, call: TransportCall) -> Result<(), TransportError> {
        let delay = self.lock().latency.get(&op).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut store = self.lock();
        store.record(call);
        if store.take_failure(op) {
            debug!(?op, "Injected transport failure");
            return Err(TransportError::Network(format!("injected failure for {op:?}")));
        }
        Ok(())
    }

    /// Stores an attempt as the latest one for `course_id`.
    pub fn seed_attempt(&self, course_id: &str, record: AttemptRecord) {
        self.lock()
            .attempts
            .entry(course_id.to_string())
            .or_default()
            .push(record);
    }

    /// Makes the next `count` calls of `op` fail with a network error.
    pub fn fail_next(&self, op: TransportOp, count: usize) {
        self.lock().failures.insert(op, count);
    }

    /// Delays every call of `op` by `delay` before it is handled.
    pub fn set_latency(&self, op: TransportOp, delay: Duration) {
        self.lock().latency.insert(op, delay);
    }

    /// The most recent calls (at most [`MAX_RECORDED_CALLS`]), oldest first.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        self.lock().calls.iter().cloned().collect()
    }

    /// Number of calls received for `op` since creation.
    #[must_use]
    pub fn call_count(&self, op: TransportOp) -> usize {
        self.lock().call_counts.get(&op).copied().unwrap_or_default()
    }

    /// Commit payloads still in the call log, oldest first.
    #[must_use]
    pub fn commits(&self) -> Vec<CommitRequest> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                TransportCall::CommitResult(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    /// Current state of an attempt.
    #[must_use]
    pub fn attempt(&self, attempt_id: &str) -> Option<AttemptRecord> {
        self.lock().find_mut(attempt_id).map(|record| record.clone())
    }

    /// How many attempts transitioned to `COMPLETED` through `finish_attempt`.
    #[must_use]
    pub fn completions(&self) -> usize {
        self.lock().completions
    }
}

#[async_trait]
impl SessionTransport for MemoryTransport {
    async fn latest_attempt(&self, course_id: &str) -> Result<Option<AttemptRecord>, TransportError> {
        self.enter(
            TransportOp::LatestAttempt,
            TransportCall::LatestAttempt {
                course_id: course_id.to_string(),
            },
        )
        .await?;
        Ok(self
            .lock()
            .attempts
            .get(course_id)
            .and_then(|list| list.last().cloned()))
    }

    async fn start_attempt(&self, course_id: &str) -> Result<StartedAttempt, TransportError> {
        self.enter(
            TransportOp::StartAttempt,
            TransportCall::StartAttempt {
                course_id: course_id.to_string(),
            },
        )
        .await?;
        let mut store = self.lock();
        store.next_id += 1;
        let attempt_id = format!("attempt-{}", store.next_id);
        store
            .attempts
            .entry(course_id.to_string())
            .or_default()
            .push(AttemptRecord::new(attempt_id.clone()));
        Ok(StartedAttempt {
            attempt_id,
            status: AttemptStatus::NotStarted,
        })
    }

    async fn save_attempt(&self, request: SaveRequest) -> Result<SavedAttempt, TransportError> {
        self.enter(TransportOp::SaveAttempt, TransportCall::SaveAttempt(request.clone()))
            .await?;
        let mut store = self.lock();
        let record = store
            .find_mut(&request.attempt_id)
            .ok_or_else(|| TransportError::AttemptNotFound(request.attempt_id.clone()))?;
        record.last_location = request.location;
        record.suspend_data = request.suspend_data;
        record.progress_pct = request.progress_pct;
        if record.status == AttemptStatus::NotStarted {
            record.status = AttemptStatus::InProgress;
        }
        record.updated_at = Utc::now();
        Ok(SavedAttempt {
            attempt_id: record.attempt_id.clone(),
            status: record.status,
            updated_at: record.updated_at,
        })
    }

    async fn commit_result(&self, request: CommitRequest) -> Result<CommitResult, TransportError> {
        self.enter(TransportOp::CommitResult, TransportCall::CommitResult(request.clone()))
            .await?;
        let derived = self.deriver.derive(request.standard, &request.scorm_data);

        let mut store = self.lock();
        let record = store.find_or_adopt(&request.course_id, &request.attempt_id);
        if record.status != AttemptStatus::Completed {
            record.status = AttemptStatus::InProgress;
            record.progress_pct = derived.progress_percent;
            for key in ["cmi.core.lesson_location", "cmi.location"] {
                if let Some(location) = request.scorm_data.get(key) {
                    record.last_location.clone_from(location);
                }
            }
            if let Some(suspend) = request.scorm_data.get("cmi.suspend_data") {
                record.suspend_data.clone_from(suspend);
            }
            record.updated_at = Utc::now();
        }
        if request.reason == CommitReason::Finish {
            debug!(attempt_id = %request.attempt_id, "Received final commit");
        }
        Ok(CommitResult {
            derived_fields: derived,
        })
    }

    async fn finish_attempt(&self, request: FinishRequest) -> Result<FinishResult, TransportError> {
        self.enter(TransportOp::FinishAttempt, TransportCall::FinishAttempt(request.clone()))
            .await?;
        let mut store = self.lock();
        let record = store.find_or_adopt(&request.course_id, &request.attempt_id);

        if record.status == AttemptStatus::Completed {
            return Ok(FinishResult {
                ok: true,
                message: Some("Attempt already completed".to_string()),
            });
        }

        record.last_location.clone_from(&request.snapshot.location);
        record.suspend_data.clone_from(&request.snapshot.suspend_data);
        record.progress_pct = request.progress;
        record.updated_at = Utc::now();
        if request.complete {
            record.status = AttemptStatus::Completed;
            store.completions += 1;
        } else {
            record.status = AttemptStatus::InProgress;
        }
        Ok(FinishResult {
            ok: true,
            message: None,
        })
    }
}
