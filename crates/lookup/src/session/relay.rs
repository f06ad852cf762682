//! HTTP transport to the messaging relay sidecar.
//!
//! The relay owns the authenticated user session on the messaging network
//! and exposes it as a small JSON API. Inbound updates are long-polled on a
//! background task and fanned out through the [`EventHub`].

use super::{Attachment, EventHub, InboundEvent, MessengerTransport};
use crate::errors::GatewayError;
use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use intelforge_common::config::SessionConfig;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Pause after a failed poll before trying again
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Serialize)]
struct ConnectRequest<'a> {
    session_name: &'a str,
    api_id: Option<&'a str>,
    api_hash: Option<&'a str>,
    phone: Option<&'a str>,
}

#[derive(Deserialize)]
struct ConnectResponse {
    ready: bool,
    #[serde(default)]
    detail: Option<String>,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    contact: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: i64,
}

#[derive(Serialize)]
struct CallbackRequest<'a> {
    contact: &'a str,
    message_id: i64,
    label: &'a str,
}

#[derive(Deserialize)]
struct UpdatesResponse {
    #[serde(default)]
    updates: Vec<RelayUpdate>,
}

#[derive(Debug, Deserialize)]
struct RelayUpdate {
    update_id: i64,
    contact: String,
    kind: String,
    #[serde(default)]
    message_id: Option<i64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    buttons: Vec<String>,
    #[serde(default)]
    file: Option<RelayFile>,
}

#[derive(Debug, Deserialize)]
struct RelayFile {
    file_id: String,
    file_name: String,
    #[serde(default = "default_mime")]
    mime_type: String,
}

fn default_mime() -> String {
    "application/octet-stream".to_string()
}

/// Map a non-success relay status to a gateway error
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::Auth(body),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => GatewayError::NotReady(body),
        StatusCode::GONE => GatewayError::Closed,
        s if s.is_server_error() => GatewayError::Network(format!("relay {}: {}", s, body)),
        s => GatewayError::Protocol(format!("relay {}: {}", s, body)),
    })
}

/// Cloneable handle used by both the transport and its poll task
#[derive(Clone)]
struct RelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn connect(&self, request: &ConnectRequest<'_>) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(self.url("/v1/session/connect"))
            .json(request)
            .send()
            .await?;
        let result: ConnectResponse = check_status(response).await?.json().await?;

        if result.ready {
            Ok(())
        } else {
            Err(GatewayError::Auth(
                result
                    .detail
                    .unwrap_or_else(|| "session requires interactive verification".to_string()),
            ))
        }
    }

    async fn updates(&self, offset: i64, timeout: Duration) -> Result<Vec<RelayUpdate>, GatewayError> {
        let response = self
            .client
            .get(self.url("/v1/updates"))
            .query(&[("offset", offset), ("timeout", timeout.as_secs() as i64)])
            .timeout(timeout + Duration::from_secs(10))
            .send()
            .await?;
        let result: UpdatesResponse = check_status(response).await?.json().await?;
        Ok(result.updates)
    }

    async fn download(&self, file_id: &str) -> Result<Vec<u8>, GatewayError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/files/{}", file_id)))
            .send()
            .await?;
        let bytes = check_status(response).await?.bytes().await?;
        Ok(bytes.to_vec())
    }

    /// Turn a relay update into an inbound event, fetching file content
    async fn resolve(&self, update: RelayUpdate) -> Result<Option<InboundEvent>, GatewayError> {
        let message_id = update.message_id.unwrap_or(update.update_id);
        let event = match update.kind.as_str() {
            "typing" => InboundEvent::Typing,
            "text" => InboundEvent::Text {
                message_id,
                text: update.text.unwrap_or_default(),
                buttons: update.buttons,
            },
            "edited" => InboundEvent::Edited {
                message_id,
                text: update.text.unwrap_or_default(),
                buttons: update.buttons,
            },
            "file" => {
                let Some(file) = update.file else {
                    return Err(GatewayError::Protocol(format!(
                        "file update {} without file",
                        update.update_id
                    )));
                };
                let bytes = self.download(&file.file_id).await?;
                InboundEvent::File {
                    message_id,
                    attachment: Attachment {
                        file_name: file.file_name,
                        mime_type: file.mime_type,
                        bytes,
                    },
                    caption: update.text,
                }
            }
            other => {
                debug!(kind = other, "Ignoring unsupported relay update");
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

/// Long-poll loop feeding the hub until the session is lost.
///
/// Returning ends the transport's liveness; the gateway reconnects on the
/// next lease.
async fn poll_updates(client: RelayClient, hub: EventHub, timeout: Duration) {
    let mut offset = 0i64;
    info!("Relay update loop started");

    loop {
        let updates = match client.updates(offset, timeout).await {
            Ok(updates) => updates,
            Err(e) if e.is_session_fatal() => {
                error!(error = %e, "Relay session lost, stopping update loop");
                hub.fail_all(e);
                return;
            }
            Err(e) => {
                warn!(error = %e, "Relay poll failed");
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);
            let contact = update.contact.clone();
            match client.resolve(update).await {
                Ok(Some(event)) => {
                    hub.publish(&contact, event);
                }
                Ok(None) => {}
                Err(e) if e.is_session_fatal() => {
                    error!(contact = %contact, error = %e, "Relay session lost while resolving update");
                    hub.fail_all(e);
                    return;
                }
                Err(e) => {
                    warn!(contact = %contact, error = %e, "Failed to resolve relay update");
                    hub.fail_contact(&contact, e);
                }
            }
        }
    }
}

pub struct RelayTransport {
    client: RelayClient,
    config: SessionConfig,
    hub: EventHub,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl RelayTransport {
    pub fn new(config: &SessionConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self {
            client: RelayClient {
                client,
                base_url: config.relay_url.trim_end_matches('/').to_string(),
            },
            config: config.clone(),
            hub: EventHub::new(config.event_capacity),
            poller: Mutex::new(None),
        })
    }

    fn start_poller(&self) {
        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        *poller = Some(tokio::spawn(poll_updates(
            self.client.clone(),
            self.hub.clone(),
            Duration::from_secs(self.config.poll_timeout_secs),
        )));
    }
}

#[async_trait]
impl MessengerTransport for RelayTransport {
    /// Retries transient failures with exponential backoff; auth failures
    /// are returned at once.
    async fn connect(&self) -> Result<(), GatewayError> {
        let request = ConnectRequest {
            session_name: &self.config.session_name,
            api_id: self.config.api_id.as_deref(),
            api_hash: self.config.api_hash.as_deref(),
            phone: self.config.phone.as_deref(),
        };
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(self.config.reconnect_max_elapsed_secs)),
            ..Default::default()
        };

        let request = &request;
        retry(policy, || async move {
            self.client.connect(request).await.map_err(|e| match e {
                GatewayError::Network(_) => {
                    warn!(error = %e, "Relay connect failed, retrying");
                    backoff::Error::transient(e)
                }
                other => backoff::Error::permanent(other),
            })
        })
        .await?;

        self.start_poller();
        Ok(())
    }

    async fn send(&self, contact: &str, text: &str) -> Result<i64, GatewayError> {
        let response = self
            .client
            .client
            .post(self.client.url("/v1/messages"))
            .json(&SendRequest { contact, text })
            .send()
            .await?;
        let result: SendResponse = check_status(response).await?.json().await?;
        Ok(result.message_id)
    }

    async fn press_button(
        &self,
        contact: &str,
        message_id: i64,
        label: &str,
    ) -> Result<(), GatewayError> {
        let response = self
            .client
            .client
            .post(self.client.url("/v1/callbacks"))
            .json(&CallbackRequest {
                contact,
                message_id,
                label,
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(handle) = self
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        let result = self
            .client
            .client
            .post(self.client.url("/v1/session/disconnect"))
            .send()
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Relay disconnect failed");
        }
    }

    fn hub(&self) -> &EventHub {
        &self.hub
    }

    /// Alive while the update loop runs
    fn is_alive(&self) -> bool {
        self.poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        extract::{Path, State},
        http::StatusCode as HttpStatus,
        routing::{get, post},
        Json, Router,
    };
    use crate::session::{GatewayState, SessionGateway};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Clone, Default)]
    struct FakeRelay {
        pending: Arc<AsyncMutex<Vec<Value>>>,
        reject_auth: bool,
        expired: Arc<AtomicBool>,
        connects: Arc<AtomicUsize>,
    }

    async fn connect(State(relay): State<FakeRelay>) -> (HttpStatus, Json<Value>) {
        relay.connects.fetch_add(1, Ordering::SeqCst);
        if relay.reject_auth {
            (HttpStatus::UNAUTHORIZED, Json(json!({"error": "bad hash"})))
        } else {
            (HttpStatus::OK, Json(json!({"ready": true})))
        }
    }

    async fn messages(State(relay): State<FakeRelay>, Json(body): Json<Value>) -> Json<Value> {
        let contact = body["contact"].as_str().unwrap_or_default().to_string();
        let mut pending = relay.pending.lock().await;
        pending.push(json!({"update_id": 1, "contact": contact, "kind": "typing"}));
        pending.push(json!({
            "update_id": 2, "contact": contact, "kind": "text",
            "message_id": 11, "text": "Results:\n1. hit", "buttons": ["Download HTML"]
        }));
        pending.push(json!({
            "update_id": 3, "contact": contact, "kind": "file", "message_id": 12,
            "file": {"file_id": "f1", "file_name": "report.html", "mime_type": "text/html"}
        }));
        Json(json!({"message_id": 10}))
    }

    async fn updates(State(relay): State<FakeRelay>) -> (HttpStatus, Json<Value>) {
        if relay.expired.load(Ordering::SeqCst) {
            return (HttpStatus::UNAUTHORIZED, Json(json!({"error": "session revoked"})));
        }
        let drained: Vec<Value> = relay.pending.lock().await.drain(..).collect();
        if drained.is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        (HttpStatus::OK, Json(json!({ "updates": drained })))
    }

    async fn file(Path(id): Path<String>) -> Result<String, HttpStatus> {
        if id == "gone" {
            return Err(HttpStatus::NOT_FOUND);
        }
        Ok(format!("<html><body>{}</body></html>", id))
    }

    async fn spawn_relay(relay: FakeRelay) -> String {
        let app = Router::new()
            .route("/v1/session/connect", post(connect))
            .route("/v1/messages", post(messages))
            .route("/v1/updates", get(updates))
            .route("/v1/files/{id}", get(file))
            .with_state(relay);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn config(relay_url: String) -> SessionConfig {
        SessionConfig {
            relay_url,
            poll_timeout_secs: 1,
            reconnect_max_elapsed_secs: 1,
            ..SessionConfig::default()
        }
    }

    #[tokio::test]
    async fn test_relay_round_trip() {
        let url = spawn_relay(FakeRelay::default()).await;
        let transport = RelayTransport::new(&config(url)).unwrap();
        transport.connect().await.unwrap();

        let mut sub = transport.hub().subscribe("@lookup_bot");
        let id = transport.send("@lookup_bot", "/email a@b.io").await.unwrap();
        assert_eq!(id, 10);

        let mut kinds = Vec::new();
        while kinds.len() < 3 {
            let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            if let InboundEvent::File { attachment, .. } = &event {
                assert!(attachment.is_html());
                assert_eq!(attachment.bytes, b"<html><body>f1</body></html>");
            }
            kinds.push(event.kind());
        }
        assert_eq!(kinds, vec!["typing", "text", "file"]);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_failed_download_only_fails_its_contact() {
        let relay = FakeRelay::default();
        let url = spawn_relay(relay.clone()).await;
        let transport = RelayTransport::new(&config(url)).unwrap();

        let mut alpha = transport.hub().subscribe("alpha_bot");
        let mut beta = transport.hub().subscribe("beta_bot");
        relay.pending.lock().await.extend([
            json!({
                "update_id": 1, "contact": "alpha_bot", "kind": "file", "message_id": 5,
                "file": {"file_id": "gone", "file_name": "r.html"}
            }),
            json!({
                "update_id": 2, "contact": "beta_bot", "kind": "text",
                "message_id": 6, "text": "No results found"
            }),
        ]);
        transport.connect().await.unwrap();

        let wait = Duration::from_secs(5);
        let failed = tokio::time::timeout(wait, alpha.recv()).await.unwrap().unwrap();
        assert!(matches!(failed, Err(GatewayError::Protocol(_))));

        let delivered = tokio::time::timeout(wait, beta.recv()).await.unwrap().unwrap();
        assert_eq!(delivered.unwrap().kind(), "text");
        assert!(tokio::time::timeout(Duration::from_millis(200), beta.recv())
            .await
            .is_err());
        assert!(transport.is_alive());
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_revoked_session_is_reconnected_on_next_lease() {
        let relay = FakeRelay::default();
        let url = spawn_relay(relay.clone()).await;
        let transport = Arc::new(RelayTransport::new(&config(url)).unwrap());
        let gateway = SessionGateway::new(transport.clone());

        gateway.connect().await.unwrap();
        assert_eq!(gateway.state(), GatewayState::Ready);

        relay.expired.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while gateway.state() != GatewayState::Disconnected {
            assert!(tokio::time::Instant::now() < deadline, "update loop never stopped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        relay.expired.store(false, Ordering::SeqCst);
        let lease = gateway.acquire().await;
        lease.ensure_connected().await.unwrap();
        lease.release();

        assert_eq!(gateway.state(), GatewayState::Ready);
        assert_eq!(relay.connects.load(Ordering::SeqCst), 2);
        assert!(transport.is_alive());
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let relay = FakeRelay {
            reject_auth: true,
            ..Default::default()
        };
        let url = spawn_relay(relay).await;
        let transport = RelayTransport::new(&config(url)).unwrap();

        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(_)));
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_network_error() {
        let transport = RelayTransport::new(&config("http://127.0.0.1:1".into())).unwrap();
        let err = transport.connect().await.unwrap_err();
        assert!(matches!(err, GatewayError::Network(_)));
    }
}
