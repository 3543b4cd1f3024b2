//! ClinForge API Gateway
//!
//! The HTTP entry point for the drafting workflow.
//! Handles:
//! - Source document parsing (inline or through the ingestion queue)
//! - Section generation, editing, locking and history
//! - Study fact extraction, templates and DOCX export
//! - Observability (logging, metrics, request ids)

mod handlers;
mod middleware;
mod routes;
mod state;

use clinforge_common::{
    config::{AppConfig, ObservabilityConfig},
    metrics,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        e
    })?;
    init_tracing(&config.observability);

    info!("Starting ClinForge API Gateway v{}", clinforge_common::VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .set_buckets_for_metric(
                Matcher::Suffix("request_duration_seconds".to_string()),
                metrics::LATENCY_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Suffix("processing_duration_seconds".to_string()),
                metrics::PROCESSING_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Suffix("llm_duration_seconds".to_string()),
                metrics::PROCESSING_BUCKETS,
            )?
            .install()?;
        info!(%addr, "Prometheus exporter listening");
    } else {
        warn!("Metrics exporter disabled");
    }
    metrics::register_metrics();

    let config = Arc::new(config);
    let state = AppState::from_config(config.clone()).await?;

    // Build the router
    let app = routes::create_router(state);

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &ObservabilityConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.json_logging {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().with_target(true)).init();
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
