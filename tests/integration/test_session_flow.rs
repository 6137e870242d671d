//! End-to-end tests of the HTTP embedding boundary.
//!
//! A real server is started on a free port with a packages directory on
//! disk; the tests drive it the way a host page would.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use scorm_rte::{
    create_router, AppState, AttemptRecord, AttemptStatus, CacheEntry, Config, MemoryResumeCache, MemoryTransport,
    ResumeCache, SessionServices, TransportOp,
};
use serde_json::{json, Value};

const MANIFEST_12: &str = r#"<?xml version="1.0"?>
<manifest identifier="m" xmlns:adlcp="http://www.adlnet.org/xsd/adlcp_rootv1p2">
  <metadata><schema>ADL SCORM</schema><schemaversion>1.2</schemaversion></metadata>
  <organizations default="o">
    <organization identifier="o"><title>Ladder Safety</title></organization>
  </organizations>
  <resources>
    <resource identifier="r1" type="webcontent" adlcp:scormtype="sco" href="sco/start.html?lang=en"/>
  </resources>
</manifest>"#;

const MANIFEST_2004: &str = r#"<?xml version="1.0"?>
<manifest identifier="m">
  <metadata><schemaversion>2004 4th Edition</schemaversion></metadata>
  <resources>
    <resource identifier="r1" adlcp:scormType="sco" href="index.html"/>
  </resources>
</manifest>"#;

struct Harness {
    base: String,
    http: reqwest::Client,
    transport: MemoryTransport,
    cache: Arc<MemoryResumeCache>,
    dir: PathBuf,
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

fn write(path: &Path, content: &str) {
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    std::fs::write(path, content).expect("write");
}

/// Creates `course12` (SCORM 1.2, nested in a single top-level folder),
/// `course2004` and `nomanifest` under a fresh packages directory.
fn packages_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("scorm_it_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);

    write(&dir.join("course12/export/imsmanifest.xml"), MANIFEST_12);
    write(&dir.join("course12/export/sco/start.html"), "<html>sco</html>");
    write(&dir.join("course12/export/sco/app.js"), "console.log('sco');");

    write(&dir.join("course2004/imsmanifest.xml"), MANIFEST_2004);
    write(&dir.join("course2004/index.html"), "<html>2004</html>");

    write(&dir.join("nomanifest/index.html"), "<html>plain</html>");
    dir
}

async fn spawn(name: &str, transport: MemoryTransport) -> Harness {
    let dir = packages_dir(name);
    let cache = Arc::new(MemoryResumeCache::new());
    let config = Config {
        packages_dir: dir.display().to_string(),
        init_timeout_secs: 1,
        ..Config::default()
    };
    let state = AppState::new(
        config,
        SessionServices {
            transport: Arc::new(transport.clone()),
            cache: cache.clone(),
        },
    );

    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");
    let router = create_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    Harness {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
        transport,
        cache,
        dir,
    }
}

impl Harness {
    async fn start(&self, package_id: &str, course_id: &str) -> reqwest::Response {
        self.http
            .post(format!("{}/api/session/start", self.base))
            .json(&json!({
                "packageId": package_id,
                "courseId": course_id,
                "learnerId": "u1",
                "learnerName": "Doe, Jane"
            }))
            .send()
            .await
            .expect("start request")
    }

    async fn call(&self, method: &str, args: &[&str]) -> String {
        let response: Value = self
            .http
            .post(format!("{}/api/rte/call", self.base))
            .json(&json!({"method": method, "args": args}))
            .send()
            .await
            .expect("call request")
            .json()
            .await
            .expect("call body");
        response["result"].as_str().expect("result").to_string()
    }

    async fn post(&self, path: &str) -> reqwest::Response {
        self.http
            .post(format!("{}{path}", self.base))
            .send()
            .await
            .expect("request")
    }

    async fn status(&self) -> Value {
        self.http
            .get(format!("{}/api/session/status", self.base))
            .send()
            .await
            .expect("status request")
            .json()
            .await
            .expect("status body")
    }
}

// ============================================================================
// Launch
// ============================================================================

#[tokio::test]
async fn test_launch_nested_package_and_serve_files() {
    let h = spawn("nested", MemoryTransport::new()).await;

    let response = h.start("course12", "c1").await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let status: Value = response.json().await.expect("json");
    assert_eq!(status["launchUrl"], "/packages/course12/export/sco/start.html?lang=en");
    assert_eq!(status["title"], "Ladder Safety");
    assert_eq!(status["standard"], "1.2");

    let page = h
        .http
        .get(format!("{}/packages/course12/export/sco/start.html", h.base))
        .send()
        .await
        .expect("page");
    assert_eq!(page.status(), reqwest::StatusCode::OK);
    assert_eq!(page.text().await.expect("text"), "<html>sco</html>");

    let script = h
        .http
        .get(format!("{}/packages/course12/export/sco/app.js", h.base))
        .send()
        .await
        .expect("script");
    assert_eq!(
        script.headers()["content-type"],
        "text/javascript; charset=utf-8"
    );
}

#[tokio::test]
async fn test_package_without_manifest_is_rejected() {
    let h = spawn("nomanifest", MemoryTransport::new()).await;

    let response = h.start("nomanifest", "c1").await;
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.expect("json");
    assert!(body["error"].as_str().expect("error").contains("imsmanifest.xml"));
}

// ============================================================================
// Content calls
// ============================================================================

#[tokio::test]
async fn test_scorm12_session_lifecycle() {
    let h = spawn("lifecycle12", MemoryTransport::new()).await;
    h.start("course12", "c1").await;

    assert_eq!(h.call("LMSInitialize", &[""]).await, "true");
    assert_eq!(h.call("LMSGetValue", &["cmi.core.student_name"]).await, "Doe, Jane");
    assert_eq!(h.call("LMSGetValue", &["cmi.core.entry"]).await, "ab-initio");
    assert_eq!(h.call("LMSSetValue", &["cmi.core.lesson_location", "p2"]).await, "true");
    assert_eq!(h.call("LMSSetValue", &["cmi.core.student_id", "x"]).await, "false");
    assert_eq!(h.call("LMSSetValue", &["cmi.core.score.raw", "85"]).await, "true");
    assert_eq!(h.call("LMSSetValue", &["cmi.core.lesson_status", "passed"]).await, "true");
    assert_eq!(h.call("LMSFinish", &[""]).await, "true");
    assert_eq!(h.call("LMSFinish", &[""]).await, "true");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = h.status().await;
    assert_eq!(status["lifecycle"], "terminated");
    assert_eq!(status["passed"], true);
    assert_eq!(status["progressPercent"], 100.0);

    let commits = h.transport.commits();
    assert_eq!(
        commits.iter().filter(|c| c.reason == scorm_rte::CommitReason::Finish).count(),
        1
    );
    let last = commits.last().expect("commit");
    assert_eq!(last.scorm_data["cmi.core.score.raw"], "85");
    assert!(last.scorm_data.contains_key("cmi.core.session_time"));
}

#[tokio::test]
async fn test_scorm2004_progress_measure_drives_progress() {
    let h = spawn("progress2004", MemoryTransport::new()).await;
    let status: Value = h.start("course2004", "c2").await.json().await.expect("json");
    assert_eq!(status["standard"], "2004");

    assert_eq!(h.call("Initialize", &[""]).await, "true");
    assert_eq!(h.call("SetValue", &["cmi.progress_measure", "0.5"]).await, "true");
    assert_eq!(h.call("Commit", &[""]).await, "true");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.status().await["progressPercent"], 50.0);

    assert_eq!(h.call("SetValue", &["cmi.progress_measure", "1.0"]).await, "true");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let status = h.status().await;
    assert_eq!(status["progressPercent"], 100.0);
    assert_eq!(status["completed"], true);
    assert_eq!(status["detectedStandard"], "2004");
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_remote_progress_beats_local_cache() {
    let transport = MemoryTransport::new();
    let mut record = AttemptRecord::new("a-remote");
    record.status = AttemptStatus::InProgress;
    record.last_location = "p5".to_string();
    transport.seed_attempt("c1", record);

    let h = spawn("resume", transport).await;
    h.cache
        .store(
            "c1",
            &CacheEntry {
                attempt_id: "a-remote".to_string(),
                last_location: "p2".to_string(),
                suspend_data: String::new(),
                progress_pct: 0.0,
                timestamp: chrono::Utc::now(),
            },
        )
        .await
        .expect("cache");

    h.start("course12", "c1").await;
    h.call("LMSInitialize", &[""]).await;
    assert_eq!(h.call("LMSGetValue", &["cmi.core.lesson_location"]).await, "p5");
    assert_eq!(h.call("LMSGetValue", &["cmi.core.entry"]).await, "resume");

    let status = h.status().await;
    assert_eq!(status["attemptId"], "a-remote");
    assert_eq!(status["resumeSource"], "remote");
}

#[tokio::test]
async fn test_save_exit_then_relaunch_resumes() {
    let h = spawn("relaunch", MemoryTransport::new()).await;

    h.start("course12", "c1").await;
    h.call("LMSInitialize", &[""]).await;
    h.call("LMSSetValue", &["cmi.core.lesson_location", "p8"]).await;
    h.call("LMSSetValue", &["cmi.suspend_data", "quiz=1"]).await;

    let response = h.post("/api/session/save-exit").await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["outcome"], "saved");

    h.start("course12", "c1").await;
    h.call("LMSInitialize", &[""]).await;
    assert_eq!(h.call("LMSGetValue", &["cmi.suspend_data"]).await, "quiz=1");
    assert_eq!(h.call("LMSGetValue", &["cmi.core.lesson_location"]).await, "p8");
    assert_eq!(h.call("LMSGetValue", &["cmi.core.entry"]).await, "resume");
}

// ============================================================================
// Exit flows
// ============================================================================

#[tokio::test]
async fn test_exit_without_commit_makes_no_server_call() {
    let h = spawn("reset", MemoryTransport::new()).await;
    h.start("course12", "c1").await;
    h.call("LMSInitialize", &[""]).await;
    let calls_before = h.transport.calls().len();

    let body: Value = h.post("/api/session/exit").await.json().await.expect("json");
    assert_eq!(body["outcome"], "reset_to_not_started");
    assert_eq!(h.transport.calls().len(), calls_before);
    assert_eq!(h.call("LMSGetValue", &["cmi.core.entry"]).await, "");
}

#[tokio::test]
async fn test_finish_retry_after_failure() {
    let transport = MemoryTransport::new();
    let h = spawn("finish", transport.clone()).await;
    h.start("course12", "c1").await;
    h.call("LMSInitialize", &[""]).await;
    h.call("LMSSetValue", &["cmi.core.lesson_status", "completed"]).await;

    transport.fail_next(TransportOp::FinishAttempt, 1);
    let response = h.post("/api/session/finish").await;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body["retryable"], true);
    let status = h.status().await;
    assert_eq!(status["outcome"], "active");
    assert_eq!(status["lifecycle"], "initialized");
    assert_eq!(h.call("LMSSetValue", &["cmi.core.lesson_location", "p7"]).await, "true");

    let response = h.post("/api/session/finish").await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let response = h.post("/api/session/finish").await;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(transport.completions(), 1);
    assert!(h.cache.get("c1").is_none());
    let commits = transport.commits();
    let last = commits.last().expect("final commit");
    assert_eq!(last.scorm_data.get("cmi.core.lesson_location").map(String::as_str), Some("p7"));
}
