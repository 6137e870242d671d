//! Integration tests for the session event stream on `/ws`.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::SinkExt;
use futures::StreamExt;
use scorm_rte::{
    create_router, AppState, CommitReason, Config, Lifecycle, MemoryResumeCache, MemoryTransport, SessionEvent,
    SessionServices, TransportOp,
};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::Message;

const MANIFEST: &str = r#"<manifest>
  <metadata><schemaversion>1.2</schemaversion></metadata>
  <organizations><organization><title>Forklift Basics</title></organization></organizations>
  <resources><resource adlcp:scormtype="sco" href="index.html"/></resources>
</manifest>"#;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Server {
    base: String,
    ws_url: String,
    http: reqwest::Client,
    transport: MemoryTransport,
    dir: PathBuf,
}

impl Drop for Server {
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

async fn spawn_server(name: &str, init_timeout_secs: u64) -> Server {
    let dir = std::env::temp_dir().join(format!("scorm_ws_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(dir.join("course")).expect("mkdir");
    std::fs::write(dir.join("course/imsmanifest.xml"), MANIFEST).expect("manifest");
    std::fs::write(dir.join("course/index.html"), "<html/>").expect("launch");

    let transport = MemoryTransport::new();
    let config = Config {
        packages_dir: dir.display().to_string(),
        init_timeout_secs,
        ..Config::default()
    };
    let state = AppState::new(
        config,
        SessionServices {
            transport: Arc::new(transport.clone()),
            cache: Arc::new(MemoryResumeCache::new()),
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

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    Server {
        base: format!("http://{addr}"),
        ws_url: format!("ws://{addr}/ws"),
        http: reqwest::Client::new(),
        transport,
        dir,
    }
}

impl Server {
    async fn start(&self) {
        let response = self
            .http
            .post(format!("{}/api/session/start", self.base))
            .json(&json!({
                "packageId": "course",
                "courseId": "c1",
                "learnerId": "u1",
                "learnerName": "Doe, Jane"
            }))
            .send()
            .await
            .expect("start request");
        assert!(response.status().is_success(), "start failed: {}", response.status());
    }

    async fn call(&self, method: &str, args: &[&str]) {
        self.http
            .post(format!("{}/api/rte/call", self.base))
            .json(&json!({"method": method, "args": args}))
            .send()
            .await
            .expect("call request");
    }

    async fn post(&self, path: &str) {
        self.http
            .post(format!("{}{path}", self.base))
            .send()
            .await
            .expect("request");
    }
}

async fn connect_client(url: &str) -> WsClient {
    let (ws_stream, _) = connect_async(url)
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream
}

/// Receives the next event, answering pings along the way.
async fn receive_event(client: &mut WsClient) -> SessionEvent {
    loop {
        let msg = timeout(Duration::from_secs(5), client.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");

        match msg {
            Message::Text(text) => {
                return serde_json::from_str(&text).expect("Failed to parse event");
            }
            Message::Ping(data) => {
                client
                    .send(Message::Pong(data))
                    .await
                    .expect("Failed to send pong");
            }
            Message::Pong(_) => {}
            other => panic!("Expected text message, got: {other:?}"),
        }
    }
}

/// Skips events until one named `name` arrives.
async fn receive_until(client: &mut WsClient, name: &str) -> SessionEvent {
    loop {
        let event = receive_event(client).await;
        if event.event_name() == name {
            return event;
        }
    }
}

// ============================================================================
// Connection
// ============================================================================

#[tokio::test]
async fn test_connected_without_session() {
    let server = spawn_server("idle", 30).await;
    let mut client = connect_client(&server.ws_url).await;

    match receive_event(&mut client).await {
        SessionEvent::Connected(payload) => assert!(payload.status.is_none()),
        other => panic!("Expected connected event, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_connected_carries_active_session_status() {
    let server = spawn_server("active", 30).await;
    server.start().await;

    let mut client = connect_client(&server.ws_url).await;
    match receive_event(&mut client).await {
        SessionEvent::Connected(payload) => {
            let status = payload.status.expect("status");
            assert_eq!(status.course_id, "c1");
            assert_eq!(status.lifecycle, Lifecycle::Uninitialized);
            assert_eq!(status.title.as_deref(), Some("Forklift Basics"));
        }
        other => panic!("Expected connected event, got: {other:?}"),
    }
}

// ============================================================================
// Session events
// ============================================================================

#[tokio::test]
async fn test_session_events_stream_in_order() {
    let server = spawn_server("events", 30).await;
    server.start().await;
    let mut client = connect_client(&server.ws_url).await;
    receive_event(&mut client).await;

    server.call("LMSInitialize", &[""]).await;
    match receive_until(&mut client, "session_initialized").await {
        SessionEvent::SessionInitialized(payload) => {
            assert_eq!(payload.entry, scorm_rte::EntryMode::AbInitio);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    server
        .call("LMSSetValue", &["cmi.core.lesson_status", "completed"])
        .await;
    match receive_until(&mut client, "progress_updated").await {
        SessionEvent::ProgressUpdated(payload) => {
            assert_eq!(payload.reason, CommitReason::Commit);
            assert!(payload.completed);
            assert!((payload.progress_percent - 100.0).abs() < f64::EPSILON);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    server.post("/api/session/exit").await;
    let event = receive_until(&mut client, "session_detached").await;
    assert!(matches!(event, SessionEvent::SessionDetached(_)));
}

#[tokio::test]
async fn test_commit_failure_is_reported() {
    let server = spawn_server("failure", 30).await;
    server.start().await;
    let mut client = connect_client(&server.ws_url).await;
    receive_event(&mut client).await;

    server.transport.fail_next(TransportOp::CommitResult, 1);
    server.call("LMSInitialize", &[""]).await;
    server.call("LMSCommit", &[""]).await;

    match receive_until(&mut client, "commit_failed").await {
        SessionEvent::CommitFailed(payload) => assert!(payload.message.contains("injected")),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_init_timeout_is_reported() {
    let server = spawn_server("timeout", 1).await;
    let mut client = connect_client(&server.ws_url).await;
    receive_event(&mut client).await;

    server.start().await;
    match receive_until(&mut client, "init_timeout").await {
        SessionEvent::InitTimeout(payload) => assert_eq!(payload.timeout_secs, 1),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_multiple_clients_receive_the_same_event() {
    let server = spawn_server("fanout", 30).await;
    server.start().await;

    let mut first = connect_client(&server.ws_url).await;
    let mut second = connect_client(&server.ws_url).await;
    receive_event(&mut first).await;
    receive_event(&mut second).await;

    server.call("LMSInitialize", &[""]).await;
    let a = receive_until(&mut first, "session_initialized").await;
    let b = receive_until(&mut second, "session_initialized").await;
    assert_eq!(a.event_name(), b.event_name());
}
