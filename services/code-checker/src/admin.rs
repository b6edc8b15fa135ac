//! Admin API for introspection and control
//!
//! Runs on its own listener when `[admin]` is configured. Never exposes raw
//! credentials: tokens are listed by id and a short preview only.
//!
//! Endpoints:
//! - GET    /health: credential pool status, session status
//! - GET    /metrics: Prometheus text exposition
//! - GET    /status: session, progress, workers, retries, breaker, pool
//! - GET    /pending: pending codes with retry counts
//! - GET    /results?outcome=valid: accumulated results, optionally filtered
//! - POST   /session/{pause,resume,stop}
//! - POST   /breaker/reset: close the circuit breaker
//! - GET    /credentials: per-credential status and summary
//! - POST   /credentials: add a credential `{"token": "..."}`
//! - POST   /credentials/reset-errors: clear error counts, revalidate all
//! - POST   /credentials/test: send each credential against a placeholder code
//! - DELETE /credentials/invalid: evict every invalid credential
//! - DELETE /credentials/{index}: evict one credential by position

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use check_client::CheckClient;
use check_core::Outcome;
use metrics_exporter_prometheus::PrometheusHandle;
use orchestrator::{Orchestrator, ProgressAggregator};
use serde::Deserialize;
use token_pool::TokenPool;
use tracing::info;

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    engine: Orchestrator,
    pool: Arc<TokenPool>,
    client: Arc<CheckClient>,
    progress: Arc<ProgressAggregator>,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

impl AdminState {
    pub fn new(
        engine: Orchestrator,
        pool: Arc<TokenPool>,
        client: Arc<CheckClient>,
        progress: Arc<ProgressAggregator>,
        prometheus: PrometheusHandle,
    ) -> Self {
        Self {
            engine,
            pool,
            client,
            progress,
            prometheus,
            started_at: Instant::now(),
        }
    }
}

/// Build the admin router. `max_connections` caps concurrent requests.
pub fn build_admin_router(state: AdminState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
        .route("/status", get(status))
        .route("/pending", get(pending))
        .route("/results", get(results))
        .route("/session/pause", post(pause))
        .route("/session/resume", post(resume))
        .route("/session/stop", post(stop))
        .route("/breaker/reset", post(reset_breaker))
        .route("/credentials", get(list_credentials).post(add_credential))
        .route("/credentials/reset-errors", post(reset_errors))
        .route("/credentials/test", post(test_credentials))
        .route("/credentials/invalid", delete(remove_invalid))
        .route("/credentials/{index}", delete(remove_credential))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /health: 200 while at least one credential is usable, 503 otherwise.
async fn health(State(state): State<AdminState>) -> Response {
    let pool = state.pool.health().await;
    let pool_status = pool["status"].as_str().unwrap_or("unhealthy").to_string();
    let code = if pool_status == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    json(
        code,
        serde_json::json!({
            "status": pool_status,
            "session": state.engine.status(),
            "credentials_available": pool["available"],
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        }),
    )
}

/// GET /metrics: Prometheus text exposition format.
async fn metrics_text(State(state): State<AdminState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn status(State(state): State<AdminState>) -> Response {
    let engine = &state.engine;
    json(
        StatusCode::OK,
        serde_json::json!({
            "session": engine.session_info(),
            "progress": state.progress.snapshot(),
            "workers": engine.worker_status(),
            "retry": engine.retry_stats(),
            "breaker": engine.breaker(),
            "credentials": engine.credential_health().await,
        }),
    )
}

async fn pending(State(state): State<AdminState>) -> Response {
    json(
        StatusCode::OK,
        serde_json::json!(state.engine.pending_info()),
    )
}

#[derive(Debug, Deserialize)]
struct ResultsQuery {
    outcome: Option<Outcome>,
}

async fn results(State(state): State<AdminState>, Query(query): Query<ResultsQuery>) -> Response {
    let results = match query.outcome {
        Some(outcome) => state.engine.results_by_outcome(outcome),
        None => state.engine.results(),
    };
    json(
        StatusCode::OK,
        serde_json::json!({ "count": results.len(), "results": results }),
    )
}

fn control_response(state: &AdminState, outcome: orchestrator::Result<()>) -> Response {
    match outcome {
        Ok(()) => json(
            StatusCode::OK,
            serde_json::json!({ "status": state.engine.status() }),
        ),
        Err(e) => json(
            StatusCode::CONFLICT,
            serde_json::json!({ "error": e.to_string(), "status": state.engine.status() }),
        ),
    }
}

async fn pause(State(state): State<AdminState>) -> Response {
    let outcome = state.engine.pause();
    control_response(&state, outcome)
}

async fn resume(State(state): State<AdminState>) -> Response {
    let outcome = state.engine.resume();
    control_response(&state, outcome)
}

async fn stop(State(state): State<AdminState>) -> Response {
    let outcome = state.engine.stop().await.map(|_| ());
    control_response(&state, outcome)
}

async fn reset_breaker(State(state): State<AdminState>) -> Response {
    state.engine.reset_breaker();
    json(
        StatusCode::OK,
        serde_json::json!({ "breaker": state.engine.breaker() }),
    )
}

async fn list_credentials(State(state): State<AdminState>) -> Response {
    json(StatusCode::OK, state.pool.health().await)
}

#[derive(Deserialize)]
struct AddCredential {
    token: String,
}

/// POST /credentials: add a credential. The token is never echoed back.
async fn add_credential(
    State(state): State<AdminState>,
    Json(body): Json<AddCredential>,
) -> Response {
    let token = body.token.trim();
    if token.is_empty() {
        return json(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "token must not be empty" }),
        );
    }
    let id = state.pool.add(token).await;
    info!(token_id = id, "credential added via admin API");
    json(StatusCode::CREATED, serde_json::json!({ "id": id }))
}

async fn reset_errors(State(state): State<AdminState>) -> Response {
    state.pool.reset_errors().await;
    json(StatusCode::OK, serde_json::json!({ "status": "ok" }))
}

/// POST /credentials/test: 401 invalidates a credential, 200 or 404
/// revalidates it, anything else is reported without a state change.
async fn test_credentials(State(state): State<AdminState>) -> Response {
    let report = state.client.test_credentials().await;
    info!(
        valid = report.valid.len(),
        invalid = report.invalid.len(),
        errors = report.errors.len(),
        "credential test requested via admin API"
    );
    match serde_json::to_value(&report) {
        Ok(body) => json(StatusCode::OK, body),
        Err(e) => json(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

async fn remove_invalid(State(state): State<AdminState>) -> Response {
    let removed = state.pool.remove_invalid().await;
    json(StatusCode::OK, serde_json::json!({ "removed": removed }))
}

async fn remove_credential(
    State(state): State<AdminState>,
    Path(index): Path<usize>,
) -> Response {
    match state.pool.remove_by_index(index).await {
        Ok(id) => json(StatusCode::OK, serde_json::json!({ "removed_id": id })),
        Err(e) => json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}
