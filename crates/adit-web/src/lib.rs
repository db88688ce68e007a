//! Axum surface for the ingestion coordinator: trigger and status routes.
//! Dashboard rendering lives elsewhere; this crate only speaks the
//! coordinator contract.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;

use adit_sync::{IngestCoordinator, TriggerOutcome};

pub const CRATE_NAME: &str = "adit-web";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<IngestCoordinator>,
}

impl AppState {
    pub fn new(coordinator: Arc<IngestCoordinator>) -> Self {
        Self { coordinator }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(status_handler))
        .route("/status", get(status_handler))
        .route("/pull-data", post(api_pull_handler))
        .route("/pull", post(browser_pull_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(coordinator: Arc<IngestCoordinator>) -> anyhow::Result<()> {
    let port: u16 = std::env::var("ADIT_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    axum::serve(listener, app(AppState::new(coordinator))).await?;
    Ok(())
}

/// One-shot status read: pending message/error are cleared by this call.
async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.coordinator.status()).into_response()
}

/// API-style trigger: runs the pipeline in-request and reports the outcome
/// in the response body.
async fn api_pull_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.coordinator.trigger_blocking().await {
        TriggerOutcome::Completed { status, records } => (
            StatusCode::OK,
            Json(serde_json::json!({
                "busy": false,
                "ok": true,
                "records": records,
                "status": status,
            })),
        )
            .into_response(),
        TriggerOutcome::Rejected => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "busy": true, "ok": false })),
        )
            .into_response(),
        TriggerOutcome::Failed { message } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "busy": false, "ok": false, "error": message })),
        )
            .into_response(),
        // trigger_blocking never reports Started
        TriggerOutcome::Started => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Browser-style trigger: spawn the pipeline (or queue the busy message) and
/// send the caller back to the status page either way.
async fn browser_pull_handler(State(state): State<Arc<AppState>>) -> Response {
    state.coordinator.trigger_detached();
    Redirect::to("/").into_response()
}
