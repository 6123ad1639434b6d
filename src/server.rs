//! HTTP adapter exposing the engine to the surrounding application.
//!
//! A thin JSON API over the engine's operations — upload widgets and chat
//! renderers integrate here; no engine logic lives in this module.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `PUT`  | `/documents/{document_id}` | Ingest extracted text (request body = bytes) |
//! | `POST` | `/ask` | Ask a question against a collection |
//! | `GET`  | `/sessions?user_id=…` | List a user's chat sessions |
//! | `GET`  | `/sessions/{session_id}/turns` | List a session's turns |
//! | `DELETE` | `/sessions/{session_id}` | Delete a session and its turns |
//! | `DELETE` | `/collections/{collection_id}` | Delete a collection and its snapshot |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "invalid_document", "message": "document contains no text" } }
//! ```
//!
//! Error codes: `invalid_document` (400), `conflict` (409),
//! `ingestion_failed` (502), `upstream_unavailable` (503), `internal` (500).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted to support browser-based
//! upload and chat clients.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::engine::{AskOutcome, Engine};
use crate::error::EngineError;
use crate::models::Turn;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Start the HTTP server on the configured bind address. Runs until the
/// process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let bind_addr = config.server.bind.clone();
    let engine = Engine::from_config(config.clone()).await?;

    let state = AppState {
        engine: Arc::new(engine),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/documents/{document_id}", put(handle_ingest))
        .route("/ask", post(handle_ask))
        .route("/sessions", get(handle_list_sessions))
        .route("/sessions/{session_id}/turns", get(handle_list_turns))
        .route("/sessions/{session_id}", delete(handle_delete_session))
        .route("/collections/{collection_id}", delete(handle_delete_collection))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state);

    println!("askdoc server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for AppError {
    fn from(err: EngineError) -> Self {
        let (status, code) = match &err {
            EngineError::InvalidDocument(_) => (StatusCode::BAD_REQUEST, "invalid_document"),
            EngineError::StaleVersion { .. } => (StatusCode::CONFLICT, "conflict"),
            EngineError::IngestionFailed(_) => (StatusCode::BAD_GATEWAY, "ingestion_failed"),
            EngineError::EmbeddingUnavailable(_) | EngineError::GenerationUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "upstream_unavailable")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

// ============ Handlers ============

#[derive(Serialize)]
struct IngestResponse {
    collection_id: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Path(document_id): Path<String>,
    body: Bytes,
) -> Result<Json<IngestResponse>, AppError> {
    if document_id.trim().is_empty() {
        return Err(bad_request("document_id must not be empty"));
    }

    let collection_id = state.engine.ingest(&document_id, &body).await?;
    Ok(Json(IngestResponse { collection_id }))
}

#[derive(Deserialize)]
struct AskRequest {
    collection_id: String,
    /// Generated when absent, so a first question can open a session.
    session_id: Option<String>,
    user_id: String,
    question: String,
    language_hint: Option<String>,
}

#[derive(Serialize)]
struct AskResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    turn: Option<Turn>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    no_document_context: bool,
}

async fn handle_ask(
    State(state): State<AppState>,
    Json(request): Json<AskRequest>,
) -> Result<Json<AskResponse>, AppError> {
    if request.question.trim().is_empty() {
        return Err(bad_request("question must not be empty"));
    }

    let session_id = request
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let outcome = state
        .engine
        .ask(
            &request.collection_id,
            &session_id,
            &request.user_id,
            &request.question,
            request.language_hint.as_deref(),
        )
        .await?;

    Ok(Json(match outcome {
        AskOutcome::Answered(turn) => AskResponse {
            turn: Some(turn),
            no_document_context: false,
        },
        AskOutcome::NoDocumentContext => AskResponse {
            turn: None,
            no_document_context: true,
        },
    }))
}

#[derive(Deserialize)]
struct SessionsQuery {
    user_id: String,
}

async fn handle_list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionsQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let sessions = state.engine.list_sessions(&query.user_id).await?;
    Ok(Json(serde_json::json!({ "sessions": sessions })))
}

async fn handle_list_turns(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let turns = state.engine.list_turns(&session_id).await?;
    Ok(Json(serde_json::json!({ "turns": turns })))
}

async fn handle_delete_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_session(&session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_delete_collection(
    State(state): State<AppState>,
    Path(collection_id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.engine.delete_collection(&collection_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
