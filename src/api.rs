//! HTTP frontend adapter
//!
//! Thin axum surface over `ConversationSession`: resolves a location from
//! request ids, runs one turn, and returns the assembled reply with the
//! sentinel stripped.

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::address::Location;
use crate::dispatch::STOP_SENTINEL;
use crate::error::RelayError;
use crate::session::ConversationSession;

/// =============================
/// Request / Response Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
    pub user_name: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<ConversationSession>,
}

/// Map request ids to a location. Non-numeric user ids are rejected before
/// any memory record is touched.
fn resolve_location(req: &ChatRequest) -> crate::Result<Location> {
    if let Some(chat_id) = req.chat_id.as_deref() {
        if chat_id.trim().is_empty() {
            return Err(RelayError::AddressResolutionFailure(
                "chat_id must not be empty".to_string(),
            ));
        }
        return Ok(Location::ApiChat {
            chat_id: chat_id.to_string(),
        });
    }

    if let Some(user_id) = req.user_id.as_deref() {
        let user_id: u64 = user_id.trim().parse().map_err(|_| {
            RelayError::AddressResolutionFailure(format!("Invalid user id: {}", user_id))
        })?;
        return Ok(Location::DirectMessage {
            user_id,
            user_name: req
                .user_name
                .clone()
                .unwrap_or_else(|| "anonymous".to_string()),
        });
    }

    Err(RelayError::AddressResolutionFailure(
        "Request carries neither chat_id nor user_id".to_string(),
    ))
}

/// =============================
/// Endpoints
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let location = match resolve_location(&req) {
        Ok(location) => location,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::error(e.to_string())),
            )
        }
    };

    info!("Chat request for {:?}", location);

    let stream = match state.session.execute(&location, &req.message, None).await {
        Ok(stream) => stream,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("Session failed: {}", e))),
            )
        }
    };

    // The final element is always the sentinel; strip it before display.
    let chunks: Vec<String> = stream.collect().await;
    let reply: String = chunks
        .iter()
        .filter(|c| c.as_str() != STOP_SENTINEL)
        .cloned()
        .collect();

    (
        StatusCode::OK,
        Json(ApiResponse::success(serde_json::json!({
            "reply": reply,
            "turn_id": uuid::Uuid::new_v4(),
        }))),
    )
}

/// =============================
/// Router & Server Startup
/// =============================

pub fn create_router(session: Arc<ConversationSession>) -> Router {
    let state = ApiState { session };

    Router::new()
        .route("/health", axum::routing::get(health))
        .route("/api/chat", post(chat_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

pub async fn start_server(
    session: Arc<ConversationSession>,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(session);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
