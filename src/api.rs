//! HTTP adapter for the assistant
//!
//! Exposes the turn loop as a webhook the NLU front end calls once per
//! utterance.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::agent::Assistant;
use crate::models::{TurnRequest, TurnResponse};

/// =============================
/// Response Models
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub timestamp: String,
}

impl ApiError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub assistant: Arc<Assistant>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Webhook Endpoint
/// =============================

async fn webhook(
    State(state): State<ApiState>,
    payload: Result<Json<TurnRequest>, JsonRejection>,
) -> Result<Json<TurnResponse>, (StatusCode, Json<ApiError>)> {
    let Json(request) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Malformed webhook payload");
        (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new(rejection.body_text())),
        )
    })?;

    if request.session_id.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("sessionId must not be empty")),
        ));
    }

    Ok(Json(state.assistant.handle_turn(request).await))
}

/// =============================
/// Router
/// =============================

pub fn create_router(assistant: Arc<Assistant>) -> Router {
    let state = ApiState { assistant };

    Router::new()
        .route("/health", get(health))
        .route("/webhook", post(webhook))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    assistant: Arc<Assistant>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(assistant);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Webhook listening on http://0.0.0.0:{}/webhook", port);

    axum::serve(listener, router).await?;
    Ok(())
}
