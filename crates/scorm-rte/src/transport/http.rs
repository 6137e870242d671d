//! JSON-over-HTTP client for the attempt service.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{
    AttemptRecord, CommitRequest, CommitResult, FinishRequest, FinishResult, SaveRequest,
    SavedAttempt, SessionTransport, StartedAttempt, TransportError,
};

/// [`SessionTransport`] backed by a remote attempt service.
///
/// Endpoints, relative to the base URL:
///
/// | Operation | Request |
/// |---|---|
/// | `latest_attempt` | `GET /courses/{course}/attempts/latest` (404 means none) |
/// | `start_attempt` | `POST /courses/{course}/attempts` |
/// | `save_attempt` | `POST /attempts/{attempt}/save` |
/// | `commit_result` | `POST /results/commit` |
/// | `finish_attempt` | `POST /attempts/finish` |
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    base_url: Url,
}

impl HttpTransport {
    /// Creates a client for `base_url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidBaseUrl` if `base_url` is not an
    /// http(s) URL, or `TransportError::Network` if the HTTP client cannot
    /// be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let base_url = parse_base_url(base_url)?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Network(e.to_string()))?;
        Ok(Self { client, base_url })
    }

    /// The base URL requests are sent to.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Appends `segments` to the base URL, percent-encoding each one.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }
}

/// Parses an attempt service base URL, accepting only http and https.
///
/// # Errors
///
/// Returns `TransportError::InvalidBaseUrl` describing the problem.
pub fn parse_base_url(raw: &str) -> Result<Url, TransportError> {
    let invalid = |reason: String| TransportError::InvalidBaseUrl {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw.trim()).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("scheme '{}' is not http or https", url.scheme())));
    }
    if url.cannot_be_a_base() {
        return Err(invalid("URL cannot carry a path".to_string()));
    }
    Ok(url)
}

fn map_send_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .ok()
        .filter(|body| !body.trim().is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("").to_string());
    Err(TransportError::Status {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let response = check_status(response).await?;
    response
        .json::<T>()
        .await
        .map_err(|e| TransportError::InvalidResponse(e.to_string()))
}

#[async_trait]
impl SessionTransport for HttpTransport {
    async fn latest_attempt(&self, course_id: &str) -> Result<Option<AttemptRecord>, TransportError> {
        let url = self.endpoint(&["courses", course_id, "attempts", "latest"]);
        debug!(%url, "Fetching latest attempt");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        decode(response).await
    }

    async fn start_attempt(&self, course_id: &str) -> Result<StartedAttempt, TransportError> {
        let url = self.endpoint(&["courses", course_id, "attempts"]);
        debug!(%url, "Starting attempt");

        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        decode(response).await
    }

    async fn save_attempt(&self, request: SaveRequest) -> Result<SavedAttempt, TransportError> {
        let url = self.endpoint(&["attempts", request.attempt_id.as_str(), "save"]);
        debug!(%url, attempt_id = %request.attempt_id, "Saving attempt");

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::AttemptNotFound(request.attempt_id));
        }
        decode(response).await
    }

    async fn commit_result(&self, request: CommitRequest) -> Result<CommitResult, TransportError> {
        let url = self.endpoint(&["results", "commit"]);
        debug!(%url, attempt_id = %request.attempt_id, reason = %request.reason, "Committing result");

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        decode(response).await
    }

    async fn finish_attempt(&self, request: FinishRequest) -> Result<FinishResult, TransportError> {
        let url = self.endpoint(&["attempts", "finish"]);
        debug!(%url, attempt_id = %request.attempt_id, "Finishing attempt");

        let response = self
            .client
            .post(url)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_send_error(&e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(TransportError::AttemptNotFound(request.attempt_id));
        }
        decode(response).await
    }
}
