//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub session: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Liveness check, healthy whenever the server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness check: ledger reachable and messaging session up
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let start = std::time::Instant::now();
    let ledger = state.engine.ledger();

    let database = match ledger.ping().await {
        Ok(()) => CheckResult {
            status: "up".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            detail: Some(ledger.backend().to_string()),
        },
        Err(e) => CheckResult {
            status: "down".to_string(),
            latency_ms: None,
            detail: Some(e.to_string()),
        },
    };

    let gateway = state.engine.gateway();
    let session_state = gateway.state();
    let session = CheckResult {
        status: if session_state.is_connected() { "up" } else { "down" }.to_string(),
        latency_ms: None,
        detail: Some(format!("{} ({})", session_state.as_str(), gateway.transport_name())),
    };

    let all_ready = database.status == "up" && session.status == "up";
    let code = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(ReadyResponse {
            status: if all_ready { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks { database, session },
        }),
    )
}
