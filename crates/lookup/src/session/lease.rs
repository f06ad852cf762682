use super::{EventSubscription, SessionGateway};
use crate::errors::GatewayError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Exclusive use of the session for one correlation cycle.
///
/// Released exactly once: by [`SessionLease::release`] or, failing that, on drop.
pub struct SessionLease {
    gateway: Arc<SessionGateway>,
    guard: Option<OwnedMutexGuard<()>>,
    acquired_at: Instant,
    queued_for: Duration,
}

impl SessionLease {
    pub(super) fn new(
        gateway: Arc<SessionGateway>,
        guard: OwnedMutexGuard<()>,
        queued_for: Duration,
    ) -> Self {
        Self {
            gateway,
            guard: Some(guard),
            acquired_at: Instant::now(),
            queued_for,
        }
    }

    /// (Re)connect if the session dropped; serialized behind this lease
    pub async fn ensure_connected(&self) -> Result<(), GatewayError> {
        self.gateway.connect_locked().await
    }

    /// Subscribe to replies from `contact`. Do this before [`SessionLease::send`].
    pub fn events(&self, contact: &str) -> EventSubscription {
        self.gateway.transport().hub().subscribe(contact)
    }

    pub async fn send(&self, contact: &str, text: &str) -> Result<i64, GatewayError> {
        self.check_connected()?;
        let result = self.gateway.transport().send(contact, text).await;
        self.observe(result)
    }

    pub async fn press_button(
        &self,
        contact: &str,
        message_id: i64,
        label: &str,
    ) -> Result<(), GatewayError> {
        self.check_connected()?;
        let result = self
            .gateway
            .transport()
            .press_button(contact, message_id, label)
            .await;
        self.observe(result)
    }

    /// Record a transport failure that invalidated the session itself
    pub fn session_lost(&self, error: &GatewayError) {
        if error.is_session_fatal() {
            warn!(error = %error, "Messaging session lost");
            self.gateway.mark_disconnected();
        }
    }

    pub fn queued_for(&self) -> Duration {
        self.queued_for
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn check_connected(&self) -> Result<(), GatewayError> {
        let state = self.gateway.state();
        if state.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::NotReady(state.as_str().to_string()))
        }
    }

    fn observe<T>(&self, result: Result<T, GatewayError>) -> Result<T, GatewayError> {
        if let Err(ref e) = result {
            self.session_lost(e);
        }
        result
    }

    fn release_inner(&mut self) {
        if let Some(guard) = self.guard.take() {
            self.gateway.finish_lease();
            debug!(held_ms = self.held_for().as_millis() as u64, "Session lease released");
            drop(guard);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}
