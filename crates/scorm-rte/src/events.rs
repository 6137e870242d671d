//! Session events and their WebSocket stream.
//!
//! The host page subscribes to `/ws` to follow a session: initialization,
//! derived progress after each commit, commit failures, the initialization
//! watchdog and the exit flows. Every message is a JSON object with `event`
//! and `payload` fields.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::cmi::{EntryMode, Standard};
use crate::session::SessionStatus;
use crate::transport::{CommitReason, DerivedProgress};

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload for the `connected` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectedPayload {
    /// Status of the active session, if any.
    pub status: Option<SessionStatus>,
}

/// Payload for the `session_initialized` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInitializedPayload {
    /// Attempt the session commits to.
    pub attempt_id: String,
    /// Edition the session was launched with.
    pub standard: Standard,
    /// Entry mode reported to content.
    pub entry: EntryMode,
    /// When content called Initialize.
    pub timestamp: DateTime<Utc>,
}

/// Payload for the `progress_updated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdatedPayload {
    /// Attempt the commit belonged to.
    pub attempt_id: String,
    /// Why the commit was sent.
    pub reason: CommitReason,
    /// Progress, 0 to 100.
    pub progress_percent: f64,
    /// Content reported a pass.
    pub passed: bool,
    /// Content reported completion.
    pub completed: bool,
}

/// Payload for the `commit_failed` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitFailedPayload {
    /// Attempt the commit belonged to.
    pub attempt_id: String,
    /// Why the commit was sent.
    pub reason: CommitReason,
    /// Transport error message.
    pub message: String,
}

/// Payload for the `init_timeout` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitTimeoutPayload {
    /// Attempt of the silent session.
    pub attempt_id: String,
    /// How long the watchdog waited.
    pub timeout_secs: u64,
}

/// Payload for the `session_terminated` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTerminatedPayload {
    /// Attempt of the session.
    pub attempt_id: String,
    /// Computed session duration in seconds.
    pub session_seconds: i64,
}

/// Payload for the `attempt_finished` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptFinishedPayload {
    /// Finished attempt.
    pub attempt_id: String,
    /// Optional message from the attempt service.
    pub message: Option<String>,
}

/// Payload for the `session_detached` event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDetachedPayload {
    /// Attempt of the detached session.
    pub attempt_id: String,
}

// ============================================================================
// Event Enum
// ============================================================================

/// Events published while a session runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Sent to a client when it connects.
    Connected(ConnectedPayload),
    /// Content called Initialize.
    SessionInitialized(SessionInitializedPayload),
    /// A commit returned derived progress.
    ProgressUpdated(ProgressUpdatedPayload),
    /// A commit could not be delivered.
    CommitFailed(CommitFailedPayload),
    /// Content did not call Initialize in time.
    InitTimeout(InitTimeoutPayload),
    /// Content called Terminate/LMSFinish.
    SessionTerminated(SessionTerminatedPayload),
    /// The attempt service accepted the finish.
    AttemptFinished(AttemptFinishedPayload),
    /// The session was detached from the host.
    SessionDetached(SessionDetachedPayload),
}

impl SessionEvent {
    /// Creates a `Connected` event.
    #[must_use]
    pub const fn connected(status: Option<SessionStatus>) -> Self {
        Self::Connected(ConnectedPayload { status })
    }

    /// Creates a `SessionInitialized` event stamped now.
    #[must_use]
    pub fn session_initialized(attempt_id: impl Into<String>, standard: Standard, entry: EntryMode) -> Self {
        Self::SessionInitialized(SessionInitializedPayload {
            attempt_id: attempt_id.into(),
            standard,
            entry,
            timestamp: Utc::now(),
        })
    }

    /// Creates a `ProgressUpdated` event.
    #[must_use]
    pub fn progress_updated(attempt_id: impl Into<String>, reason: CommitReason, derived: DerivedProgress) -> Self {
        Self::ProgressUpdated(ProgressUpdatedPayload {
            attempt_id: attempt_id.into(),
            reason,
            progress_percent: derived.progress_percent,
            passed: derived.passed,
            completed: derived.completed,
        })
    }

    /// Creates a `CommitFailed` event.
    #[must_use]
    pub fn commit_failed(attempt_id: impl Into<String>, reason: CommitReason, message: impl Into<String>) -> Self {
        Self::CommitFailed(CommitFailedPayload {
            attempt_id: attempt_id.into(),
            reason,
            message: message.into(),
        })
    }

    /// Creates an `InitTimeout` event.
    #[must_use]
    pub fn init_timeout(attempt_id: impl Into<String>, timeout: Duration) -> Self {
        Self::InitTimeout(InitTimeoutPayload {
            attempt_id: attempt_id.into(),
            timeout_secs: timeout.as_secs(),
        })
    }

    /// Creates a `SessionTerminated` event.
    #[must_use]
    pub fn session_terminated(attempt_id: impl Into<String>, session_seconds: i64) -> Self {
        Self::SessionTerminated(SessionTerminatedPayload {
            attempt_id: attempt_id.into(),
            session_seconds,
        })
    }

    /// Creates an `AttemptFinished` event.
    #[must_use]
    pub fn attempt_finished(attempt_id: impl Into<String>, message: Option<String>) -> Self {
        Self::AttemptFinished(AttemptFinishedPayload {
            attempt_id: attempt_id.into(),
            message,
        })
    }

    /// Creates a `SessionDetached` event.
    #[must_use]
    pub fn session_detached(attempt_id: impl Into<String>) -> Self {
        Self::SessionDetached(SessionDetachedPayload {
            attempt_id: attempt_id.into(),
        })
    }

    /// Returns the event name as sent on the wire.
    #[must_use]
    pub const fn event_name(&self) -> &'static str {
        match self {
            Self::Connected(_) => "connected",
            Self::SessionInitialized(_) => "session_initialized",
            Self::ProgressUpdated(_) => "progress_updated",
            Self::CommitFailed(_) => "commit_failed",
            Self::InitTimeout(_) => "init_timeout",
            Self::SessionTerminated(_) => "session_terminated",
            Self::AttemptFinished(_) => "attempt_finished",
            Self::SessionDetached(_) => "session_detached",
        }
    }
}

// ============================================================================
// Event Broadcaster
// ============================================================================

/// Fans session events out to every connected client.
///
/// Events are not persisted; clients that connect later only see the
/// `connected` snapshot and subsequent events.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBroadcaster {
    /// Creates a broadcaster buffering `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Creates a new subscriber.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publishes an event. Returns how many subscribers will receive it.
    pub fn send(&self, event: SessionEvent) -> usize {
        debug!(event = event.event_name(), "Publishing session event");
        self.sender.send(event).unwrap_or(0)
    }

    /// Number of active subscribers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}

// ============================================================================
// WebSocket Handler
// ============================================================================

/// Seconds between heartbeat pings.
const HEARTBEAT_SECS: u64 = 30;

/// Maximum number of missed pong responses before disconnecting.
const MAX_MISSED_PONGS: u8 = 3;

/// `GET /ws` upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    info!("New WebSocket connection request");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before reading the status so no event falls in between.
    let mut event_receiver = state.broadcaster.subscribe();

    let status = state.registry.active().await.map(|session| session.status());
    let connected_json = match serde_json::to_string(&SessionEvent::connected(status)) {
        Ok(json) => json,
        Err(e) => {
            warn!("Failed to serialize connected event: {}", e);
            return;
        }
    };
    if sender.send(Message::Text(connected_json)).await.is_err() {
        debug!("Client disconnected before receiving connected event");
        return;
    }
    info!("WebSocket client connected");

    let mut heartbeat = interval(Duration::from_secs(HEARTBEAT_SECS));
    heartbeat.tick().await;
    let mut missed_pongs = 0u8;

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => missed_pongs = 0,
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("WebSocket stream ended");
                        break;
                    }
                    Some(Ok(Message::Text(_) | Message::Binary(_))) => {
                        debug!("Ignoring message from client");
                    }
                    Some(Err(e)) => {
                        debug!("WebSocket error: {}", e);
                        break;
                    }
                }
            }

            event = event_receiver.recv() => {
                match event {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(e) => {
                                warn!("Failed to serialize event: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            debug!("Failed to send event, client disconnected");
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Client lagged, missed {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            _ = heartbeat.tick() => {
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                missed_pongs += 1;
                if missed_pongs >= MAX_MISSED_PONGS {
                    info!("Client missed {} pongs, closing connection", MAX_MISSED_PONGS);
                    break;
                }
            }
        }
    }

    info!("WebSocket client disconnected");
}
