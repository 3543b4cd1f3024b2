//! Health check handlers

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: CheckResult,
    pub prompts: CheckResult,
    pub queue: CheckResult,
}

#[derive(Serialize)]
pub struct CheckResult {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn up(detail: Option<String>) -> Self {
        Self {
            status: "up".to_string(),
            latency_ms: None,
            detail,
        }
    }
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: clinforge_common::VERSION.to_string(),
    })
}

/// Readiness probe - the database must answer; the queue is informational
pub async fn ready(State(state): State<AppState>) -> (StatusCode, Json<ReadyResponse>) {
    let start = std::time::Instant::now();

    let database = match state.repo.ping().await {
        Ok(_) => CheckResult {
            status: "up".to_string(),
            latency_ms: Some(start.elapsed().as_millis() as u64),
            detail: None,
        },
        Err(e) => CheckResult {
            status: "down".to_string(),
            latency_ms: None,
            detail: Some(e.to_string()),
        },
    };

    let prompts = CheckResult::up(state.prompts.version().map(|v| format!("version {}", v)));

    let queue = match state.queue {
        Some(ref queue) => CheckResult::up(Some(queue.url().to_string())),
        None => CheckResult {
            status: "disabled".to_string(),
            latency_ms: None,
            detail: None,
        },
    };

    let ready = database.status == "up";
    let status = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    (
        status,
        Json(ReadyResponse {
            status: if ready { "ready" } else { "not_ready" }.to_string(),
            checks: HealthChecks {
                database,
                prompts,
                queue,
            },
        }),
    )
}
