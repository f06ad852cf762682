//! Session gateway: the single authenticated messaging session.
//!
//! The remote bots associate replies with the last command they received,
//! never with a request identifier. The gateway therefore hands out one
//! [`SessionLease`] at a time; a lease covers a whole send-then-collect cycle
//! and is the only way to send or to subscribe to replies.

mod hub;
mod lease;
mod relay;
mod scripted;

pub use hub::{contact_key, EventHub, EventItem, EventSubscription};
pub use lease::SessionLease;
pub use relay::RelayTransport;
pub use scripted::{ScriptStep, ScriptedTransport};

use crate::errors::GatewayError;
use async_trait::async_trait;
use intelforge_common::metrics;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tracing::{info, instrument, warn};

/// A file delivered by the bot
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn is_html(&self) -> bool {
        let name = self.file_name.to_ascii_lowercase();
        self.mime_type.eq_ignore_ascii_case("text/html")
            || name.ends_with(".html")
            || name.ends_with(".htm")
    }
}

impl fmt::Debug for Attachment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attachment")
            .field("file_name", &self.file_name)
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Inbound event from a bot contact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    Text {
        message_id: i64,
        text: String,
        buttons: Vec<String>,
    },
    File {
        message_id: i64,
        attachment: Attachment,
        caption: Option<String>,
    },
    /// A previously sent message was edited in place (bots often rewrite a
    /// "searching..." message into the result)
    Edited {
        message_id: i64,
        text: String,
        buttons: Vec<String>,
    },
    Typing,
}

impl InboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundEvent::Text { .. } => "text",
            InboundEvent::File { .. } => "file",
            InboundEvent::Edited { .. } => "edited",
            InboundEvent::Typing => "typing",
        }
    }

    pub fn message_id(&self) -> Option<i64> {
        match self {
            InboundEvent::Text { message_id, .. }
            | InboundEvent::File { message_id, .. }
            | InboundEvent::Edited { message_id, .. } => Some(*message_id),
            InboundEvent::Typing => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    Disconnected,
    Connecting,
    Ready,
    Busy,
}

impl GatewayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GatewayState::Disconnected => "disconnected",
            GatewayState::Connecting => "connecting",
            GatewayState::Ready => "ready",
            GatewayState::Busy => "busy",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, GatewayState::Ready | GatewayState::Busy)
    }
}

/// Wire-level access to the messaging network
#[async_trait]
pub trait MessengerTransport: Send + Sync + 'static {
    /// Establish the authenticated session
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Send one message, returning its id
    async fn send(&self, contact: &str, text: &str) -> Result<i64, GatewayError>;

    /// Press an inline button under one of the contact's messages
    async fn press_button(
        &self,
        contact: &str,
        message_id: i64,
        label: &str,
    ) -> Result<(), GatewayError>;

    async fn disconnect(&self);

    /// Hub the transport publishes inbound events into
    fn hub(&self) -> &EventHub;

    /// False once the transport lost its session on its own, e.g. its
    /// update loop exited
    fn is_alive(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

/// Injectable singleton owning the session state and the exclusive lock
pub struct SessionGateway {
    transport: Arc<dyn MessengerTransport>,
    state: watch::Sender<GatewayState>,
    lock: Arc<Mutex<()>>,
    holders: AtomicUsize,
    max_holders: AtomicUsize,
    acquired: AtomicU64,
    released: AtomicU64,
}

impl SessionGateway {
    pub fn new(transport: Arc<dyn MessengerTransport>) -> Arc<Self> {
        let (state, _) = watch::channel(GatewayState::Disconnected);
        Arc::new(Self {
            transport,
            state,
            lock: Arc::new(Mutex::new(())),
            holders: AtomicUsize::new(0),
            max_holders: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> GatewayState {
        let state = *self.state.borrow();
        if state.is_connected() && !self.transport.is_alive() {
            warn!(transport = self.transport.name(), "Transport lost its session");
            self.mark_disconnected();
            return GatewayState::Disconnected;
        }
        state
    }

    pub fn watch_state(&self) -> watch::Receiver<GatewayState> {
        self.state.subscribe()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Establish the session. A no-op when already connected.
    ///
    /// Takes the lock like any cycle, so it never races an in-flight lookup.
    pub async fn connect(self: &Arc<Self>) -> Result<(), GatewayError> {
        if self.state().is_connected() {
            return Ok(());
        }
        let lease = self.acquire().await;
        let result = lease.ensure_connected().await;
        lease.release();
        result
    }

    /// Wait (FIFO) for exclusive use of the session
    #[instrument(skip(self))]
    pub async fn acquire(self: &Arc<Self>) -> SessionLease {
        let started = Instant::now();
        let guard = Arc::clone(&self.lock).lock_owned().await;
        let waited = started.elapsed();

        let holders = self.holders.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_holders.fetch_max(holders, Ordering::SeqCst);
        self.acquired.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|s| {
            let was_ready = *s == GatewayState::Ready;
            if was_ready {
                *s = GatewayState::Busy;
            }
            was_ready
        });

        metrics::record_gateway_wait(waited.as_secs_f64());
        metrics::set_gateway_holders(holders);

        SessionLease::new(Arc::clone(self), guard, waited)
    }

    /// Called exactly once per lease, while the lock is still held
    pub(crate) fn finish_lease(&self) {
        let holders = self.holders.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        self.released.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|s| {
            let was_busy = *s == GatewayState::Busy;
            if was_busy {
                *s = GatewayState::Ready;
            }
            was_busy
        });
        metrics::set_gateway_holders(holders);
    }

    /// Connect under a held lease; leaves the state `busy` on success
    pub(crate) async fn connect_locked(&self) -> Result<(), GatewayError> {
        if self.state().is_connected() {
            return Ok(());
        }

        self.state.send_replace(GatewayState::Connecting);
        info!(transport = self.transport.name(), "Connecting messaging session");

        match self.transport.connect().await {
            Ok(()) => {
                self.state.send_replace(GatewayState::Busy);
                metrics::record_gateway_reconnect(true);
                info!("Messaging session ready");
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(GatewayState::Disconnected);
                metrics::record_gateway_reconnect(false);
                warn!(error = %e, "Messaging session connect failed");
                Err(e)
            }
        }
    }

    pub(crate) fn mark_disconnected(&self) {
        self.state.send_replace(GatewayState::Disconnected);
    }

    pub(crate) fn transport(&self) -> &dyn MessengerTransport {
        self.transport.as_ref()
    }

    /// Close the session for shutdown, after any in-flight cycle
    pub async fn disconnect(self: &Arc<Self>) {
        let lease = self.acquire().await;
        self.transport.disconnect().await;
        self.mark_disconnected();
        lease.release();
        info!("Messaging session closed");
    }

    pub fn current_holders(&self) -> usize {
        self.holders.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous holders ever observed
    pub fn max_concurrent_holders(&self) -> usize {
        self.max_holders.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let transport = Arc::new(ScriptedTransport::new());
        let gateway = SessionGateway::new(transport.clone());
        assert_eq!(gateway.state(), GatewayState::Disconnected);

        tokio_test::assert_ok!(gateway.connect().await);
        tokio_test::assert_ok!(gateway.connect().await);

        assert_eq!(gateway.state(), GatewayState::Ready);
        assert_eq!(transport.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_auth_failure_leaves_disconnected() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.fail_next_connect(GatewayError::Auth("session expired".into()));
        let gateway = SessionGateway::new(transport);

        let err = tokio_test::assert_err!(gateway.connect().await);
        assert!(matches!(err, GatewayError::Auth(_)));
        assert_eq!(gateway.state(), GatewayState::Disconnected);
        assert_eq!(gateway.release_count(), 1);
    }

    #[tokio::test]
    async fn test_lease_marks_busy_then_ready() {
        let gateway = SessionGateway::new(Arc::new(ScriptedTransport::new()));
        tokio_test::assert_ok!(gateway.connect().await);

        let lease = gateway.acquire().await;
        assert_eq!(gateway.state(), GatewayState::Busy);
        lease.release();
        assert_eq!(gateway.state(), GatewayState::Ready);
        assert_eq!(gateway.acquire_count(), gateway.release_count());
    }

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let gateway = SessionGateway::new(Arc::new(ScriptedTransport::new()));
        let first = gateway.acquire().await;

        let g = Arc::clone(&gateway);
        let waiter = tokio::spawn(async move {
            let lease = g.acquire().await;
            lease.release();
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert_eq!(gateway.current_holders(), 1);

        drop(first);
        waiter.await.unwrap();
        assert_eq!(gateway.max_concurrent_holders(), 1);
        assert_eq!(gateway.release_count(), 2);
    }
}
