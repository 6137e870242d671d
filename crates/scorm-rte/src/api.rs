//! HTTP embedding boundary.
//!
//! The host page loads package files from this server and forwards every
//! call content makes on `window.API` / `window.API_1484_11` to
//! `POST /api/rte/call`. The learner's exit buttons map to the session
//! endpoints.
//!
//! # Endpoints
//!
//! - `POST /api/rte/call` - Invoke a SCORM API method on the active session
//! - `GET /api/session/status` - Observable session status
//! - `POST /api/session/start` - Validate a package and start a session
//! - `POST /api/session/save-exit` - Save resume data and detach
//! - `POST /api/session/exit` - Exit without an explicit save
//! - `POST /api/session/finish` - Finish the attempt
//! - `GET /packages/:package_id/*path` - Package files
//! - `GET /ws` - Session event stream
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use scorm_rte::{create_router, AppState, Config, MemoryResumeCache, MemoryTransport, SessionServices};
//!
//! # async fn example() {
//! let services = SessionServices {
//!     transport: Arc::new(MemoryTransport::new()),
//!     cache: Arc::new(MemoryResumeCache::new()),
//! };
//! let router = create_router(AppState::new(Config::default(), services));
//! let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();
//! axum::serve(listener, router).await.unwrap();
//! # }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use scorm_package::{content_type_for, PackageResolver};
use serde::{Deserialize, Serialize};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

use crate::cmi::Learner;
use crate::config::Config;
use crate::error::RteError;
use crate::events::{ws_handler, EventBroadcaster};
use crate::registry::SessionRegistry;
use crate::session::{SessionLaunch, SessionOutcome, SessionServices, SessionStatus};

// ============================================================================
// Request/Response Types
// ============================================================================

/// Request body for `POST /api/rte/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RteCallRequest {
    /// API method name, e.g. `LMSSetValue` or `GetValue`.
    pub method: String,
    /// Positional string arguments.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Response body for `POST /api/rte/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RteCallResponse {
    /// The SCORM return value.
    pub result: String,
}

/// Request body for `POST /api/session/start`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionRequest {
    /// Package directory name under the packages directory.
    pub package_id: String,
    /// Course the attempt belongs to.
    pub course_id: String,
    /// Learner identifier.
    pub learner_id: String,
    /// Learner display name.
    #[serde(default)]
    pub learner_name: String,
}

/// Response body for the exit and finish endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostFlowResponse {
    /// Outcome after the flow.
    pub outcome: SessionOutcome,
    /// Optional message from the attempt service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Session status after the flow.
    pub status: SessionStatus,
}

/// Error response body returned on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Description of the error.
    pub error: String,
    /// Whether repeating the request may succeed.
    #[serde(default)]
    pub retryable: bool,
}

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for the HTTP server.
#[derive(Debug)]
pub struct AppState {
    /// Host configuration.
    pub config: Config,
    /// The active-session slot.
    pub registry: Arc<SessionRegistry>,
    /// Package lookup under `config.packages_dir`.
    pub resolver: PackageResolver,
    /// Attempt service and resume cache for new sessions.
    pub services: SessionServices,
    /// Session event fan-out.
    pub broadcaster: EventBroadcaster,
}

impl AppState {
    /// Creates state with an empty registry.
    #[must_use]
    pub fn new(config: Config, services: SessionServices) -> Self {
        Self::with_registry(config, services, Arc::new(SessionRegistry::new()))
    }

    /// Creates state around an existing registry.
    #[must_use]
    pub fn with_registry(config: Config, services: SessionServices, registry: Arc<SessionRegistry>) -> Self {
        let resolver = PackageResolver::new(PathBuf::from(&config.packages_dir));
        let broadcaster = EventBroadcaster::new(config.event_capacity);
        Self {
            config,
            registry,
            resolver,
            services,
            broadcaster,
        }
    }
}

// ============================================================================
// API Error Type
// ============================================================================

#[derive(Debug)]
enum ApiError {
    /// No session, or the session is detached.
    Gone(String),
    /// The package cannot be launched.
    InvalidPackage(String),
    /// The request names no valid package.
    BadRequest(String),
    /// The attempt service failed during a host flow.
    Upstream { message: String, retryable: bool },
    /// A package file does not exist or is outside the package.
    NotFound,
    Internal(String),
}

impl From<RteError> for ApiError {
    fn from(e: RteError) -> Self {
        match e {
            RteError::NoActiveSession | RteError::SessionDetached => Self::Gone(e.to_string()),
            RteError::PackageInvalid(ref inner) if inner.is_launch_failure() => Self::InvalidPackage(e.to_string()),
            RteError::PackageInvalid(_) => Self::BadRequest(e.to_string()),
            RteError::SaveFailed { .. } | RteError::FinishFailed { .. } | RteError::FinishRejected { .. } => {
                Self::Upstream {
                    retryable: e.is_transient(),
                    message: e.to_string(),
                }
            }
            _ => Self::Internal(e.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, retryable) = match self {
            Self::Gone(msg) => (StatusCode::GONE, msg, false),
            Self::InvalidPackage(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg, false),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, false),
            Self::Upstream { message, retryable } => (StatusCode::BAD_GATEWAY, message, retryable),
            Self::NotFound => (StatusCode::NOT_FOUND, "Not found".to_string(), false),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg, false),
        };

        let body = Json(ErrorResponse { error, retryable });
        (status, body).into_response()
    }
}

// ============================================================================
// Router Setup
// ============================================================================

/// Creates the HTTP router.
///
/// API routes live under `/api`, package files under `/packages` and the
/// event stream at `/ws`. CORS is permissive so a separately served host
/// page can reach the server.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/rte/call", post(handle_rte_call))
        .route("/session/status", get(handle_status))
        .route("/session/start", post(handle_start))
        .route("/session/save-exit", post(handle_save_exit))
        .route("/session/exit", post(handle_exit))
        .route("/session/finish", post(handle_finish));

    Router::new()
        .nest("/api", api_routes)
        .route("/packages/:package_id/*path", get(handle_package_file))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

// ============================================================================
// Handlers
// ============================================================================

/// Handler for `POST /api/rte/call`.
async fn handle_rte_call(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RteCallRequest>,
) -> Result<Json<RteCallResponse>, ApiError> {
    let result = state.registry.call(&request.method, &request.args).await?;
    debug!(method = %request.method, %result, "API call");
    Ok(Json(RteCallResponse { result }))
}

/// Handler for `GET /api/session/status`.
async fn handle_status(State(state): State<Arc<AppState>>) -> Result<Json<SessionStatus>, ApiError> {
    let session = state.registry.require_active().await?;
    Ok(Json(session.status()))
}

/// Handler for `POST /api/session/start`.
///
/// Validates the package first; an unlaunchable package never creates a
/// session.
async fn handle_start(
    State(state): State<Arc<AppState>>,
    Json(request): Json<StartSessionRequest>,
) -> Result<Json<SessionStatus>, ApiError> {
    info!(package_id = %request.package_id, course_id = %request.course_id, "Session start requested");

    state
        .resolver
        .package_dir(&request.package_id)
        .map_err(|e| ApiError::from(RteError::from(e)))?;
    let validation = state.resolver.resolve(&request.package_id);
    let launch = validation.to_launch().map_err(|e| {
        warn!(package_id = %request.package_id, error = %e, "Package cannot be launched");
        ApiError::from(RteError::from(e))
    })?;

    let session = state
        .registry
        .launch(
            SessionLaunch {
                course_id: request.course_id,
                learner: Learner::new(request.learner_id, request.learner_name),
                launch,
                init_timeout: state.config.init_timeout(),
            },
            &state.services,
            state.broadcaster.clone(),
        )
        .await;
    Ok(Json(session.status()))
}

/// Handler for `POST /api/session/save-exit`.
async fn handle_save_exit(State(state): State<Arc<AppState>>) -> Result<Json<HostFlowResponse>, ApiError> {
    let session = state.registry.require_active().await?;
    session.save_and_exit().await?;
    Ok(Json(HostFlowResponse {
        outcome: session.outcome(),
        message: None,
        status: session.status(),
    }))
}

/// Handler for `POST /api/session/exit`.
async fn handle_exit(State(state): State<Arc<AppState>>) -> Result<Json<HostFlowResponse>, ApiError> {
    let session = state.registry.require_active().await?;
    let outcome = session.exit_without_saving().await?;
    Ok(Json(HostFlowResponse {
        outcome,
        message: None,
        status: session.status(),
    }))
}

/// Handler for `POST /api/session/finish`.
async fn handle_finish(State(state): State<Arc<AppState>>) -> Result<Json<HostFlowResponse>, ApiError> {
    let session = state.registry.require_active().await?;
    let result = session.finish().await?;
    Ok(Json(HostFlowResponse {
        outcome: session.outcome(),
        message: result.message,
        status: session.status(),
    }))
}

/// Handler for `GET /packages/:package_id/*path`.
///
/// Anything that does not resolve to a file inside the package is a 404.
async fn handle_package_file(
    State(state): State<Arc<AppState>>,
    Path((package_id, path)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let file = state
        .resolver
        .files(&package_id)
        .and_then(|files| files.resolve(&path))
        .map_err(|e| {
            debug!(%package_id, %path, error = %e, "Package file not served");
            ApiError::NotFound
        })?;

    let bytes = tokio::fs::read(&file).await.map_err(|e| {
        debug!(file = %file.display(), error = %e, "Package file unreadable");
        ApiError::NotFound
    })?;

    Ok(([(header::CONTENT_TYPE, content_type_for(&file))], bytes).into_response())
}

// ============================================================================
// Tests
// ============================================================================
