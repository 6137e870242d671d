//! SCORM Run-Time Environment
//!
//! Hosts SCORM 1.2 and SCORM 2004 content: the run-time adapter and CMI data
//! model, commit and resume against an attempt service, and the HTTP/WebSocket
//! boundary the host page talks to.

pub mod adapter;
pub mod api;
pub mod cmi;
pub mod commit;
pub mod config;
pub mod error;
pub mod events;
pub mod registry;
pub mod resume;
pub mod session;
pub mod transport;
pub mod watchdog;

pub use adapter::{
    is_critical_write, AdapterHandle, Diagnostic, DiagnosticKind, Lifecycle, RteAdapter, Scorm12Api,
    Scorm2004Api, MAX_DIAGNOSTICS,
};
pub use api::{
    create_router, AppState, ErrorResponse, HostFlowResponse, RteCallRequest, RteCallResponse,
    StartSessionRequest,
};
pub use cmi::{
    format_cmi_timespan, format_iso8601_duration, CmiKey, CmiModel, CmiSnapshot, CompletionStatus, EntryMode,
    Learner, SessionTimeMark, Standard, SuccessStatus, WriteOutcome,
};
pub use commit::{CommitExecutor, CommitQueue};
pub use config::{Config, TransportConfig, TransportKind};
pub use error::{Result, RteError};
pub use events::{EventBroadcaster, SessionEvent};
pub use registry::SessionRegistry;
pub use resume::{
    generate_attempt_id, AttemptOrigin, CacheEntry, FileResumeCache, MemoryResumeCache, ResumeCache,
    ResumeCoordinator, ResumePlan, ResumeSource,
};
pub use session::{RteSession, SessionLaunch, SessionOutcome, SessionServices, SessionStatus};
pub use transport::{
    AttemptRecord, AttemptStatus, CommitReason, CommitRequest, CommitResult, DerivedProgress, FinishRequest,
    FinishResult, HttpTransport, MemoryTransport, ProgressDeriver, SaveRequest, SavedAttempt, SessionTransport,
    StandardProgressDeriver, StartedAttempt, TransportCall, TransportError, TransportOp,
};
pub use watchdog::InitWatchdog;
