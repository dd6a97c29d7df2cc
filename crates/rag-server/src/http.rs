//! HTTP companion (spec §6, optional): a thin agent-facing API over the
//! same orchestrator the stdio loop drives. Grounded on
//! `skynet-gateway/src/app.rs`'s `build_router` (state-carrying `Router`,
//! `TraceLayer`) and `skynet-gateway/src/http/health.rs`'s plain
//! `Json<Value>` handler shape.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::{get, post}, Json, Router};
use rag_orchestrator::Orchestrator;
use serde::Deserialize;
use tower_http::trace::TraceLayer;

pub fn build_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/get_metrics", get(get_metrics))
        .route("/classify_intent", post(classify_intent))
        .route("/route_message", post(classify_intent))
        .with_state(orchestrator)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

async fn get_metrics(State(orchestrator): State<Arc<Orchestrator>>) -> Json<serde_json::Value> {
    Json(serde_json::to_value(orchestrator.metrics()).unwrap_or(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
struct ClassifyRequest {
    message: String,
}

/// Backs both `POST /classify_intent` and `POST /route_message` — spec §6
/// gives the two endpoints the same payload shape, so both routes land
/// here rather than duplicating the handler.
async fn classify_intent(
    State(orchestrator): State<Arc<Orchestrator>>,
    Json(req): Json<ClassifyRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    if req.message.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, Json(serde_json::json!({"error": "message must not be empty"}))));
    }
    let result = orchestrator.classify_intent(&req.message).await;
    Ok(Json(serde_json::to_value(result).unwrap_or(serde_json::Value::Null)))
}
