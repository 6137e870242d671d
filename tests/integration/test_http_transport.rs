//! Integration tests for the HTTP attempt service client.
//!
//! A small axum service backed by `MemoryTransport` stands in for the
//! remote attempt service, so the wire format is exercised in both
//! directions.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use scorm_package::{ResolvedLaunch, ScormVersion};
use scorm_rte::{
    AttemptRecord, AttemptStatus, CommitReason, CommitRequest, EventBroadcaster, FinishRequest, HttpTransport,
    Learner, MemoryResumeCache, MemoryTransport, ResumeSource, RteSession, SaveRequest, SessionLaunch,
    SessionServices, SessionTransport, Standard, TransportError, TransportOp,
};

// ============================================================================
// Fake attempt service
// ============================================================================

fn error_response(e: &TransportError) -> Response {
    let status = match e {
        TransportError::AttemptNotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, e.to_string()).into_response()
}

async fn latest(State(store): State<MemoryTransport>, Path(course): Path<String>) -> Response {
    match store.latest_attempt(&course).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => error_response(&e),
    }
}

async fn start(State(store): State<MemoryTransport>, Path(course): Path<String>) -> Response {
    match store.start_attempt(&course).await {
        Ok(started) => Json(started).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn save(
    State(store): State<MemoryTransport>,
    Path(_attempt): Path<String>,
    Json(request): Json<SaveRequest>,
) -> Response {
    match store.save_attempt(request).await {
        Ok(saved) => Json(saved).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn commit(State(store): State<MemoryTransport>, Json(request): Json<CommitRequest>) -> Response {
    match store.commit_result(request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(&e),
    }
}

async fn finish(State(store): State<MemoryTransport>, Json(request): Json<FinishRequest>) -> Response {
    match store.finish_attempt(request).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => error_response(&e),
    }
}

fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

/// Spawns the fake service and returns its base URL.
async fn spawn_service(store: MemoryTransport) -> String {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");

    let router = Router::new()
        .route("/api/courses/:course/attempts/latest", get(latest))
        .route("/api/courses/:course/attempts", post(start))
        .route("/api/attempts/:attempt/save", post(save))
        .route("/api/results/commit", post(commit))
        .route("/api/attempts/finish", post(finish))
        .with_state(store);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    format!("http://{addr}/api")
}

fn client(base_url: &str) -> HttpTransport {
    HttpTransport::new(base_url, Duration::from_secs(5)).expect("client")
}

// ============================================================================
// Client tests
// ============================================================================

#[tokio::test]
async fn test_latest_attempt_not_found_is_none() {
    let base = spawn_service(MemoryTransport::new()).await;
    let transport = client(&base);

    let latest = transport.latest_attempt("course 1").await.expect("lookup");
    assert!(latest.is_none());
}

#[tokio::test]
async fn test_attempt_round_trip_over_http() {
    let store = MemoryTransport::new();
    let base = spawn_service(store.clone()).await;
    let transport = client(&base);

    let started = transport.start_attempt("c1").await.expect("start");
    assert_eq!(started.status, AttemptStatus::NotStarted);

    let latest = transport.latest_attempt("c1").await.expect("lookup").expect("record");
    assert_eq!(latest.attempt_id, started.attempt_id);

    let saved = transport
        .save_attempt(SaveRequest {
            attempt_id: started.attempt_id.clone(),
            location: "p3".to_string(),
            suspend_data: "s".to_string(),
            progress_pct: 30.0,
        })
        .await
        .expect("save");
    assert_eq!(saved.status, AttemptStatus::InProgress);

    let record = store.attempt(&started.attempt_id).expect("stored");
    assert_eq!(record.last_location, "p3");
    assert_eq!(record.suspend_data, "s");
}

#[tokio::test]
async fn test_commit_returns_derived_fields() {
    let base = spawn_service(MemoryTransport::new()).await;
    let transport = client(&base);

    let mut scorm_data = std::collections::BTreeMap::new();
    scorm_data.insert("cmi.core.lesson_status".to_string(), "passed".to_string());
    let result = transport
        .commit_result(CommitRequest {
            learner_id: "u1".to_string(),
            course_id: "c1".to_string(),
            attempt_id: "a1".to_string(),
            standard: Standard::Scorm12,
            reason: CommitReason::Commit,
            scorm_data,
        })
        .await
        .expect("commit");

    assert!(result.derived_fields.passed);
    assert!(result.derived_fields.completed);
    assert!((result.derived_fields.progress_percent - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_save_unknown_attempt_is_not_found() {
    let base = spawn_service(MemoryTransport::new()).await;
    let transport = client(&base);

    let err = transport
        .save_attempt(SaveRequest {
            attempt_id: "missing".to_string(),
            location: String::new(),
            suspend_data: String::new(),
            progress_pct: 0.0,
        })
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::AttemptNotFound("missing".to_string()));
    assert!(!err.is_transient());
}

#[tokio::test]
async fn test_service_failure_is_transient_status() {
    let store = MemoryTransport::new();
    let base = spawn_service(store.clone()).await;
    let transport = client(&base);
    store.fail_next(TransportOp::StartAttempt, 1);

    let err = transport.start_attempt("c1").await.unwrap_err();
    assert!(matches!(err, TransportError::Status { status: 503, .. }));
    assert!(err.is_transient());

    transport.start_attempt("c1").await.expect("second start succeeds");
}

// ============================================================================
// Session over HTTP
// ============================================================================

fn launch(course_id: &str) -> SessionLaunch {
    SessionLaunch {
        course_id: course_id.to_string(),
        learner: Learner::new("u1", "Doe, Jane"),
        launch: ResolvedLaunch {
            package_id: "pkg".to_string(),
            package_root: PathBuf::from("/tmp/pkg"),
            launch_path: "index.html".to_string(),
            launch_query: None,
            title: None,
            launch_data: None,
            version: ScormVersion::Scorm12,
        },
        init_timeout: Duration::from_secs(10),
    }
}

#[tokio::test]
async fn test_session_resumes_and_finishes_over_http() {
    let store = MemoryTransport::new();
    let mut record = AttemptRecord::new("a-77");
    record.status = AttemptStatus::InProgress;
    record.last_location = "p5".to_string();
    record.suspend_data = "chapter=2".to_string();
    store.seed_attempt("c1", record);

    let base = spawn_service(store.clone()).await;
    let services = SessionServices {
        transport: Arc::new(client(&base)),
        cache: Arc::new(MemoryResumeCache::new()),
    };
    let session = RteSession::start(launch("c1"), &services, EventBroadcaster::default()).await;

    assert_eq!(session.attempt_id(), "a-77");
    assert_eq!(session.status().resume_source, ResumeSource::Remote);
    assert_eq!(session.call("LMSInitialize", &[String::new()]), "true");
    assert_eq!(
        session.call("LMSGetValue", &["cmi.suspend_data".to_string()]),
        "chapter=2"
    );
    assert_eq!(
        session.call("LMSSetValue", &["cmi.core.lesson_status".to_string(), "completed".to_string()]),
        "true"
    );

    let result = session.finish().await.expect("finish");
    assert!(result.ok);
    assert_eq!(store.completions(), 1);
    assert_eq!(
        store.attempt("a-77").expect("attempt").status,
        AttemptStatus::Completed
    );
    assert!((session.status().progress_percent - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_unreachable_service_falls_back_to_local_attempt() {
    let port = find_available_port();
    let services = SessionServices {
        transport: Arc::new(client(&format!("http://127.0.0.1:{port}"))),
        cache: Arc::new(MemoryResumeCache::new()),
    };

    let session = RteSession::start(launch("c9"), &services, EventBroadcaster::default()).await;
    assert!(session.attempt_id().starts_with("local-c9-"));

    session.call("LMSInitialize", &[String::new()]);
    session.call("LMSSetValue", &["cmi.core.lesson_location".to_string(), "p2".to_string()]);
    session.call("LMSCommit", &[String::new()]);
    session.adapter().flush().await;

    let status = session.status();
    assert_eq!(status.commits_failed, 1);

    let err = session.save_and_exit().await.unwrap_err();
    assert!(err.is_transient());
    assert!(!session.adapter().is_detached());
}
