//! HTTP API server.
//!
//! The endpoints mirror the run lifecycle: submit, list, fetch log, fetch
//! status, cancel, plus liveness and metrics. Every response is JSON, and
//! every request passes the bearer-token / policy-engine middleware.

mod auth;

pub use auth::{auth_middleware, user_id_from_token, AuthClient, AuthContext, PolicyClient};

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::engine;
use crate::error::{Error, Result};
use crate::jobs::{engine_job_spec, Orchestrator};
use crate::metrics;
use crate::registry::{RunRequest, RunStatus, RunStore};
use crate::workflow::{validate, PackedWorkflow};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: RunStore,
    pub broker: Arc<dyn Orchestrator>,
    pub auth: Arc<dyn AuthClient>,
    pub config: Arc<Config>,
}

/// Build the complete router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/runs", post(submit_run).get(list_runs))
        .route("/runs/{run_id}", get(run_log))
        .route("/runs/{run_id}/status", get(run_status))
        .route("/runs/{run_id}/cancel", post(cancel_run))
        .route("/_status", get(health_check))
        .route("/metrics", get(prometheus_metrics))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(e: Error) -> Response {
    error!("API error: {e}");
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(e.to_json())).into_response()
}

// ============================================================================
// Runs
// ============================================================================

/// `POST /runs`: validate the packed document, persist the run, dispatch
/// the engine job that will drive it.
async fn submit_run(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(request): Json<RunRequest>,
) -> Response {
    match handle_submit(&state, &auth, request).await {
        Ok(run_id) => Json(json!({"runID": run_id})).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_submit(
    state: &AppState,
    auth: &AuthContext,
    request: RunRequest,
) -> Result<String> {
    let doc: PackedWorkflow = serde_json::from_value(request.workflow.clone())
        .map_err(|e| Error::Validation(format!("not a packed workflow document: {e}")))?;
    let report = validate(&doc);
    if !report.is_clean() {
        return Err(Error::Validation(serde_json::to_string(&report)?));
    }

    debug!(
        user = %auth.user_id,
        staged_objects = request.manifest.len(),
        "accepting workflow request"
    );

    let run_id = state
        .store
        .create_run(&auth.user_id, &request.workflow, &request.input)
        .await?;
    metrics::record_run_submitted();

    let spec = engine_job_spec(
        &state.config,
        &auth.user_id,
        &run_id,
        state.store.root().to_path_buf(),
    );
    match state.broker.submit(&spec).await {
        Ok(handle) => {
            metrics::record_job_dispatched("engine");
            info!(run = %run_id, job = %handle.name, "workflow job dispatched");
            Ok(run_id)
        }
        Err(e) => {
            // the run exists but will never start; record why
            let mut log = state.store.read_log(&auth.user_id, &run_id).await?;
            log.main.status = RunStatus::Failed;
            log.main.error = Some(e.to_string());
            state.store.write_log(&auth.user_id, &run_id, &log).await?;
            Err(e)
        }
    }
}

/// `GET /runs`: the caller's run ids.
async fn list_runs(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Response {
    match state.store.list_runs(&auth.user_id).await {
        Ok(run_ids) => Json(json!({"runIDs": run_ids})).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /runs/{runID}`: the full main log.
async fn run_log(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
) -> Response {
    match state.store.read_log(&auth.user_id, &run_id).await {
        Ok(log) => Json(json!({"log": log})).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /runs/{runID}/status`: status only.
async fn run_status(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
) -> Response {
    match state.store.status(&auth.user_id, &run_id).await {
        Ok(status) => Json(json!({"status": status.to_string()})).into_response(),
        Err(e) => error_response(e),
    }
}

/// `POST /runs/{runID}/cancel`: delete the run's jobs, mark it cancelled.
async fn cancel_run(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(run_id): Path<String>,
) -> Response {
    let result = engine::cancel_run(
        state.broker.as_ref(),
        &state.store,
        &auth.user_id,
        &run_id,
        state.config.engine.reaper_grace_seconds,
    )
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(e),
    }
}

// ============================================================================
// Liveness & metrics
// ============================================================================

async fn health_check() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn prometheus_metrics() -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics::render_metrics(),
    )
        .into_response()
}
