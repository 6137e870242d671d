//! The active-session slot.
//!
//! The host has exactly one content frame, so at most one session is
//! attached at a time. Attaching a new session detaches the previous one
//! before the new one becomes visible.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use crate::error::{Result, RteError};
use crate::events::EventBroadcaster;
use crate::session::{RteSession, SessionLaunch, SessionServices};

/// Holds the currently attached session.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    active: RwLock<Option<Arc<RteSession>>>,
}

impl SessionRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session and attaches it.
    pub async fn launch(
        &self,
        launch: SessionLaunch,
        services: &SessionServices,
        events: EventBroadcaster,
    ) -> Arc<RteSession> {
        // Detach first so the old adapter stops answering before the new
        // attempt is looked up.
        self.detach_active().await;
        let session = Arc::new(RteSession::start(launch, services, events).await);
        self.attach(Arc::clone(&session)).await;
        session
    }

    /// Attaches `session`, detaching any previous one.
    pub async fn attach(&self, session: Arc<RteSession>) {
        let previous = self.active.write().await.replace(session);
        if let Some(previous) = previous {
            if previous.detach() {
                info!(attempt_id = %previous.attempt_id(), "Detached previous session");
            }
        }
    }

    /// The attached session, if any.
    pub async fn active(&self) -> Option<Arc<RteSession>> {
        self.active.read().await.clone()
    }

    /// The attached session, or [`RteError::NoActiveSession`].
    pub async fn require_active(&self) -> Result<Arc<RteSession>> {
        self.active().await.ok_or(RteError::NoActiveSession)
    }

    /// Detaches and removes the attached session.
    ///
    /// Returns the removed session.
    pub async fn detach_active(&self) -> Option<Arc<RteSession>> {
        let session = self.active.write().await.take()?;
        session.detach();
        info!(attempt_id = %session.attempt_id(), "Session detached from registry");
        Some(session)
    }

    /// Routes an API call to the attached session.
    pub async fn call(&self, method: &str, args: &[String]) -> Result<String> {
        let session = self.require_active().await?;
        Ok(session.call(method, args))
    }
}
