//! Resume coordination.
//!
//! Before content starts, [`ResumeCoordinator::prepare`] decides which
//! attempt the session belongs to and which bookmark and suspend data to
//! hydrate. Remote in-progress data always wins; the local cache covers
//! network failures and commits the service never acknowledged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cmi::EntryMode;
use crate::error::{Result, RteError};
use crate::transport::{AttemptRecord, AttemptStatus, SessionTransport};

// ============================================================================
// Local cache
// ============================================================================

/// Resume data kept on the learner's machine, keyed by course.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    /// Attempt the data belongs to.
    pub attempt_id: String,
    /// Bookmark.
    #[serde(default)]
    pub last_location: String,
    /// Suspend data.
    #[serde(default)]
    pub suspend_data: String,
    /// Last derived progress, 0 to 100.
    #[serde(default)]
    pub progress_pct: f64,
    /// When the entry was written.
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// Returns `true` if the entry carries a bookmark or suspend data.
    #[must_use]
    pub fn has_resume_data(&self) -> bool {
        !self.last_location.is_empty() || !self.suspend_data.is_empty()
    }
}

/// Per-course local fallback store.
#[async_trait]
pub trait ResumeCache: Send + Sync {
    /// Reads the entry for `course_id`.
    async fn load(&self, course_id: &str) -> Result<Option<CacheEntry>>;

    /// Replaces the entry for `course_id`.
    async fn store(&self, course_id: &str, entry: &CacheEntry) -> Result<()>;

    /// Removes the entry for `course_id`. Removing a missing entry succeeds.
    async fn clear(&self, course_id: &str) -> Result<()>;
}

/// [`ResumeCache`] storing one JSON file per course.
#[derive(Debug, Clone)]
pub struct FileResumeCache {
    dir: PathBuf,
}

impl FileResumeCache {
    /// Creates a cache rooted at `dir`. The directory is created on first write.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File used for `course_id`.
    #[must_use]
    pub fn path_for(&self, course_id: &str) -> PathBuf {
        let name: String = course_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl ResumeCache for FileResumeCache {
    async fn load(&self, course_id: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(course_id);
        let contents = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|e| RteError::cache_corrupted(path, e.to_string()))
    }

    async fn store(&self, course_id: &str, entry: &CacheEntry) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(course_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!(course_id, path = %path.display(), "Wrote resume cache");
        Ok(())
    }

    async fn clear(&self, course_id: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(course_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// [`ResumeCache`] held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryResumeCache {
    entries: Arc<Mutex<HashMap<String, CacheEntry>>>,
}

impl MemoryResumeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads an entry without going through the async trait.
    #[must_use]
    pub fn get(&self, course_id: &str) -> Option<CacheEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(course_id)
            .cloned()
    }
}

#[async_trait]
impl ResumeCache for MemoryResumeCache {
    async fn load(&self, course_id: &str) -> Result<Option<CacheEntry>> {
        Ok(self.get(course_id))
    }

    async fn store(&self, course_id: &str, entry: &CacheEntry) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(course_id.to_string(), entry.clone());
        Ok(())
    }

    async fn clear(&self, course_id: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(course_id);
        Ok(())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Where the hydrated resume data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeSource {
    /// The service's in-progress attempt.
    Remote,
    /// The local fallback cache.
    LocalCache,
    /// Nothing to resume.
    Fresh,
}

/// How the attempt id was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOrigin {
    /// Reused from the service's latest attempt.
    Remote,
    /// Reused from the local cache.
    Cache,
    /// Created by `start_attempt`.
    Started,
    /// Generated locally because the service was unavailable.
    Generated,
}

/// Outcome of resume coordination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumePlan {
    /// Attempt the session commits to.
    pub attempt_id: String,
    /// How `attempt_id` was obtained.
    pub attempt_origin: AttemptOrigin,
    /// Where the resume data came from.
    pub source: ResumeSource,
    /// Bookmark to hydrate.
    pub location: String,
    /// Suspend data to hydrate.
    pub suspend_data: String,
    /// Last known progress, 0 to 100.
    pub progress_pct: f64,
}

impl ResumePlan {
    /// Entry mode the hydrated model will report.
    #[must_use]
    pub fn entry(&self) -> EntryMode {
        if self.location.is_empty() && self.suspend_data.is_empty() {
            EntryMode::AbInitio
        } else {
            EntryMode::Resume
        }
    }
}

/// Chooses the attempt and resume data for a new session.
#[derive(Clone)]
pub struct ResumeCoordinator {
    transport: Arc<dyn SessionTransport>,
    cache: Arc<dyn ResumeCache>,
}

impl std::fmt::Debug for ResumeCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResumeCoordinator").finish_non_exhaustive()
    }
}

impl ResumeCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new(transport: Arc<dyn SessionTransport>, cache: Arc<dyn ResumeCache>) -> Self {
        Self { transport, cache }
    }

    /// Builds the resume plan for `course_id`.
    ///
    /// Never fails: lookup and start failures fall back to the cache and to a
    /// locally generated attempt id.
    pub async fn prepare(&self, course_id: &str) -> ResumePlan {
        let remote = match self.transport.latest_attempt(course_id).await {
            Ok(remote) => remote,
            Err(e) => {
                warn!(course_id, error = %e, "Attempt lookup failed; falling back to local cache");
                return self.from_cache_or_fresh(course_id, None).await;
            }
        };

        match remote {
            Some(record) if record.status == AttemptStatus::InProgress && record.has_resume_data() => {
                info!(course_id, attempt_id = %record.attempt_id, "Resuming from remote attempt");
                ResumePlan {
                    attempt_id: record.attempt_id,
                    attempt_origin: AttemptOrigin::Remote,
                    source: ResumeSource::Remote,
                    location: record.last_location,
                    suspend_data: record.suspend_data,
                    progress_pct: record.progress_pct,
                }
            }
            Some(record) if record.status == AttemptStatus::InProgress => {
                self.from_cache_or_fresh(course_id, Some(record)).await
            }
            Some(record) if record.status == AttemptStatus::NotStarted => {
                debug!(course_id, attempt_id = %record.attempt_id, "Reusing not-started attempt");
                fresh(record.attempt_id, AttemptOrigin::Remote)
            }
            Some(record) => {
                debug!(course_id, attempt_id = %record.attempt_id, "Latest attempt is completed");
                let (attempt_id, origin) = self.start_or_generate(course_id).await;
                fresh(attempt_id, origin)
            }
            None => self.from_cache_or_fresh(course_id, None).await,
        }
    }

    /// Consults the cache. `in_progress` is a remote attempt without resume
    /// data; its id is kept and the cache only applies if it matches.
    async fn from_cache_or_fresh(&self, course_id: &str, in_progress: Option<AttemptRecord>) -> ResumePlan {
        let cached = match self.cache.load(course_id).await {
            Ok(cached) => cached,
            Err(e) => {
                warn!(course_id, error = %e, "Ignoring unreadable resume cache");
                None
            }
        };

        match (in_progress, cached) {
            (Some(record), Some(entry)) if entry.attempt_id == record.attempt_id => {
                info!(course_id, attempt_id = %entry.attempt_id, "Resuming from local cache");
                from_entry(entry, AttemptOrigin::Remote)
            }
            (Some(record), _) => fresh(record.attempt_id, AttemptOrigin::Remote),
            (None, Some(entry)) => {
                info!(course_id, attempt_id = %entry.attempt_id, "Resuming from local cache");
                from_entry(entry, AttemptOrigin::Cache)
            }
            (None, None) => {
                let (attempt_id, origin) = self.start_or_generate(course_id).await;
                fresh(attempt_id, origin)
            }
        }
    }

    async fn start_or_generate(&self, course_id: &str) -> (String, AttemptOrigin) {
        match self.transport.start_attempt(course_id).await {
            Ok(started) => {
                info!(course_id, attempt_id = %started.attempt_id, "Started new attempt");
                (started.attempt_id, AttemptOrigin::Started)
            }
            Err(e) => {
                let attempt_id = generate_attempt_id(course_id);
                warn!(course_id, %attempt_id, error = %e, "Could not start attempt; using local id");
                (attempt_id, AttemptOrigin::Generated)
            }
        }
    }
}

fn fresh(attempt_id: String, attempt_origin: AttemptOrigin) -> ResumePlan {
    ResumePlan {
        attempt_id,
        attempt_origin,
        source: ResumeSource::Fresh,
        location: String::new(),
        suspend_data: String::new(),
        progress_pct: 0.0,
    }
}

fn from_entry(entry: CacheEntry, attempt_origin: AttemptOrigin) -> ResumePlan {
    let source = if entry.has_resume_data() {
        ResumeSource::LocalCache
    } else {
        ResumeSource::Fresh
    };
    ResumePlan {
        attempt_id: entry.attempt_id,
        attempt_origin,
        source,
        location: entry.last_location,
        suspend_data: entry.suspend_data,
        progress_pct: entry.progress_pct,
    }
}

/// Local attempt id used when the service cannot create one.
#[must_use]
pub fn generate_attempt_id(course_id: &str) -> String {
    format!("local-{course_id}-{}", Utc::now().timestamp_millis())
}
