use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use common_audit::{AuditLogger, Dispatch, InferenceEvent, TenantPublishTarget};
use common_observability::AuditMetrics;
use serde::Deserialize;
use serde_json::json;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub logger: AuditLogger,
    pub metrics: AuditMetrics,
}

/// Body posted by the serving path once it has answered its client.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceLogRequest {
    pub tenant_id: String,
    #[serde(default)]
    pub topic_name: Option<String>,
    #[serde(flatten)]
    pub event: InferenceEvent,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/internal/metrics", get(metrics))
        .route("/inference-log", post(log_inference))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.gather())
}

// Always 202: audit logging outcomes never reach the serving path.
async fn log_inference(
    State(state): State<AppState>,
    Json(body): Json<InferenceLogRequest>,
) -> (StatusCode, Json<serde_json::Value>) {
    let target = TenantPublishTarget::new(body.tenant_id, body.topic_name);
    let status = match state.logger.log(target, body.event) {
        Dispatch::Queued => "queued",
        Dispatch::Skipped => "skipped",
        Dispatch::Dropped => "dropped",
    };
    (StatusCode::ACCEPTED, Json(json!({ "status": status })))
}
