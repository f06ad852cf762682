//! IntelForge Lookup API
//!
//! HTTP surface of the lookup engine. Handles:
//! - Lookup submission (async or bounded wait)
//! - History, statistics and artifact retrieval
//! - Rate limiting of submissions
//! - Observability (logging, metrics, request ids)

mod handlers;
mod middleware;

use anyhow::Context;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use intelforge_common::{config::AppConfig, metrics};
use intelforge_lookup::{open_ledger, CorrelationEngine, RelayTransport, SessionGateway};
use metrics_exporter_prometheus::PrometheusBuilder;
use middleware::rate_limit::SubmissionLimiter;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: CorrelationEngine,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = AppConfig::load().context("failed to load configuration")?;
    init_tracing(&config);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.observability.service_name,
        "Starting IntelForge lookup API"
    );

    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(address = %metrics_addr, "Metrics exporter listening");
    }
    metrics::register_metrics();

    let config = Arc::new(config);
    let ledger = open_ledger(&config.database).await?;
    info!(backend = ledger.backend(), "Query ledger ready");

    let transport = RelayTransport::new(&config.session)?;
    let gateway = SessionGateway::new(Arc::new(transport));
    let engine = CorrelationEngine::from_config(&config, gateway.clone(), ledger)?;

    // Lookups reconnect on demand; this only warms the session up
    let warmup = gateway.clone();
    tokio::spawn(async move {
        if let Err(e) = warmup.connect().await {
            warn!(error = %e, "Initial session connect failed, will retry on first lookup");
        }
    });

    let state = AppState {
        config: config.clone(),
        engine,
    };
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid server address")?;
    info!(address = %addr, "Server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let an in-flight cycle finish before closing the session
    if tokio::time::timeout(config.shutdown_timeout(), gateway.disconnect())
        .await
        .is_err()
    {
        warn!("Session still busy at shutdown deadline");
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    if config.observability.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Only submissions engage the bot, so only they are limited
    let mut submit = post(handlers::lookups::submit_lookup);
    if state.config.rate_limit.enabled {
        let limiter = SubmissionLimiter::new(
            state.config.rate_limit.requests_per_second,
            state.config.rate_limit.burst,
        );
        submit = submit.layer(from_fn_with_state(
            limiter,
            middleware::rate_limit::rate_limit_middleware,
        ));
    }

    let api_routes = Router::new()
        // Health endpoints
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))

        // Lookup endpoints
        .route("/lookups", get(handlers::lookups::list_lookups).merge(submit))
        .route("/lookups/stats", get(handlers::lookups::lookup_stats))
        .route("/lookups/classify", post(handlers::lookups::classify))
        .route("/lookups/{id}", get(handlers::lookups::get_lookup))
        .route(
            "/lookups/{id}/artifacts/{kind}",
            get(handlers::lookups::get_artifact),
        )

        // Bot profiles
        .route("/bots", get(handlers::bots::list_bots));

    Router::new()
        .nest("/v1", api_routes)
        .layer(from_fn(middleware::metrics::track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
