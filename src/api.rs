//! REST API Server for the cricket stats agent
//!
//! `POST /ask` streams pipeline snapshots as newline-delimited JSON.
//! The session routes are thin passthroughs to conversation memory.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::agent::Pipeline;
use crate::error::PipelineError;
use crate::memory::ConversationMemory;
use crate::models::{AskRequest, Snapshot};

pub const NDJSON: &str = "application/x-ndjson";

/// =============================
/// Response Wrapper
/// =============================

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
    pub pipeline: Arc<Pipeline>,
    pub memory: Arc<ConversationMemory>,
}

fn respond<T: Serialize>(result: crate::Result<T>, context: &str) -> (StatusCode, Json<ApiResponse>) {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::success(data))),
        Err(e) => {
            error!("{} failed: {}", context, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("{} failed: {}", context, e))),
            )
        }
    }
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
/// Ask Endpoint (streaming)
/// =============================

/// Every outcome, a rejected body included, is an NDJSON stream of snapshots.
async fn ask(
    State(state): State<ApiState>,
    body: std::result::Result<Json<AskRequest>, JsonRejection>,
) -> Response {
    let snapshots: BoxStream<'static, Snapshot> = match body {
        Ok(Json(req)) => {
            info!(
                user_id = ?req.user_id,
                session_id = ?req.session_id,
                "Received question"
            );
            state.pipeline.stream(req).boxed()
        }
        Err(rejection) => {
            warn!("Rejected ask body: {}", rejection.body_text());
            let error = PipelineError::InputValidation(rejection.body_text());
            stream::iter([Snapshot::Error {
                error: error.to_string(),
                executed_steps: Vec::new(),
            }])
            .boxed()
        }
    };

    let lines = snapshots.map(|snapshot| serde_json::to_string(&snapshot).map(|line| line + "\n"));

    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(lines)).into_response()
}

/// =============================
/// Session Endpoints
/// =============================

async fn list_sessions(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(state.memory.list_sessions(&user_id).await, "Listing sessions")
}

async fn session_history(
    State(state): State<ApiState>,
    Path((user_id, session_id)): Path<(String, String)>,
) -> (StatusCode, Json<ApiResponse>) {
    respond(
        state.memory.session_history(&user_id, &session_id).await,
        "Loading session history",
    )
}

async fn delete_session(
    State(state): State<ApiState>,
    Path((user_id, session_id)): Path<(String, String)>,
) -> (StatusCode, Json<ApiResponse>) {
    let result = state
        .memory
        .delete_session(&user_id, &session_id)
        .await
        .map(|deleted| serde_json::json!({ "sessionId": session_id, "deleted": deleted }));
    respond(result, "Deleting session")
}

async fn user_summary(
    State(state): State<ApiState>,
    Path(user_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.memory.summary(&user_id).await {
        Ok(Some(summary)) => (StatusCode::OK, Json(ApiResponse::success(summary))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("No summary for user {}", user_id))),
        ),
        Err(e) => respond::<()>(Err(e), "Loading summary"),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ask", post(ask))
        .route("/sessions/:user_id", get(list_sessions))
        .route("/sessions/:user_id/:session_id/history", get(session_history))
        .route("/sessions/:user_id/:session_id", axum::routing::delete(delete_session))
        .route("/summary/:user_id", get(user_summary))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);
    info!("Local: http://127.0.0.1:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
