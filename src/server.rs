//! JSON HTTP API over a [`RagEngine`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/stats` | Document, chunk and cache counters |
//! | `GET`  | `/documents` | All registered documents |
//! | `POST` | `/documents` | Ingest a document (text or base64 body) |
//! | `GET`  | `/documents/{id}` | One document |
//! | `DELETE` | `/documents/{id}` | Remove a document |
//! | `POST` | `/query` | Answer a question |
//! | `POST` | `/query/frames` | Answer a question, delivered as bounded frames |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "question is empty" } }
//! ```
//!
//! | Kind | Status | Code |
//! |------|--------|------|
//! | Input | 400 | `bad_request` |
//! | NotFound | 404 | `not_found` |
//! | Dependency | 503 | `dependency_unavailable` |
//! | Cancelled | 504 | `timeout` |
//! | Transport | 502 | `transport` |
//! | Fatal | 500 | `internal` |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::RagEngine;
use crate::error::{ErrorKind, RagError};
use crate::index::Filter;
use crate::models::{Answer, Document, DocumentMetadata, Stats, Upload};
use crate::transport::{ChunkedTransport, Frame, VecSink};

#[derive(Clone)]
struct AppState {
    engine: Arc<RagEngine>,
}

/// Builds the router; useful for embedding the API in another server.
pub fn router(engine: Arc<RagEngine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/stats", get(handle_stats))
        .route("/documents", get(handle_list_documents).post(handle_add_document))
        .route(
            "/documents/{id}",
            get(handle_get_document).delete(handle_remove_document),
        )
        .route("/query", post(handle_query))
        .route("/query/frames", post(handle_query_frames))
        .layer(cors)
        .with_state(AppState { engine })
}

/// Binds to `bind` and serves until the process is terminated.
pub async fn run_server(engine: Arc<RagEngine>, bind: &str) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    serve(listener, engine).await
}

/// Serves on an already-bound listener.
pub async fn serve(listener: tokio::net::TcpListener, engine: Arc<RagEngine>) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "docent server listening");
    axum::serve(listener, router(engine)).await?;
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        let (status, code) = match err.kind() {
            ErrorKind::Input => (StatusCode::BAD_REQUEST, "bad_request"),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not_found"),
            ErrorKind::Dependency => (StatusCode::SERVICE_UNAVAILABLE, "dependency_unavailable"),
            ErrorKind::Cancelled => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
            ErrorKind::Transport => (StatusCode::BAD_GATEWAY, "transport"),
            ErrorKind::Fatal => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        AppError {
            status,
            code,
            message: err.to_string(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

// ============ GET /health, /stats ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<Stats>, AppError> {
    Ok(Json(state.engine.stats().await?))
}

// ============ /documents ============

#[derive(Serialize)]
struct DocumentList {
    documents: Vec<Document>,
}

async fn handle_list_documents(State(state): State<AppState>) -> Json<DocumentList> {
    Json(DocumentList {
        documents: state.engine.list_documents(),
    })
}

/// Body of `POST /documents`. Exactly one of `content` and `content_base64`.
#[derive(Deserialize)]
struct AddDocumentRequest {
    name: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    metadata: DocumentMetadata,
}

async fn handle_add_document(
    State(state): State<AppState>,
    Json(req): Json<AddDocumentRequest>,
) -> Result<(StatusCode, Json<Document>), AppError> {
    let bytes = match (req.content, req.content_base64) {
        (Some(text), None) => text.into_bytes(),
        (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| bad_request(format!("content_base64 is not valid base64: {}", e)))?,
        _ => {
            return Err(bad_request(
                "exactly one of content and content_base64 must be set",
            ))
        }
    };

    let mut upload = Upload::new(req.name, bytes);
    if let Some(mime) = req.mime_type {
        upload = upload.with_mime(mime);
    }
    let document = state.engine.add_document(upload, req.metadata).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

async fn handle_get_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    Ok(Json(state.engine.get_document(&id)?))
}

async fn handle_remove_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Document>, AppError> {
    Ok(Json(state.engine.remove_document(&id).await?))
}

// ============ /query ============

#[derive(Deserialize)]
struct QueryRequest {
    question: String,
    #[serde(default)]
    filter: Filter,
}

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<Answer>, AppError> {
    Ok(Json(state.engine.query(&req.question, &req.filter).await?))
}

#[derive(Serialize)]
struct FramedAnswer {
    message_id: String,
    confidence: f32,
    cached: bool,
    degraded: bool,
    truncated: bool,
    sources: Vec<String>,
    frames: Vec<Frame>,
}

/// Answers, then splits the answer text into frames bounded by
/// `transport.max_frame_bytes` as serialized JSON objects.
async fn handle_query_frames(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<FramedAnswer>, AppError> {
    let answer = state.engine.query(&req.question, &req.filter).await?;

    let transport = ChunkedTransport::new(
        VecSink::json_envelope(),
        state.engine.config().transport.clone(),
    );
    let report = transport
        .send(&uuid::Uuid::new_v4().to_string(), &answer.text)
        .await?;

    let mut seen = HashSet::new();
    let sources: Vec<String> = answer
        .sources
        .iter()
        .map(|s| s.document.name.clone())
        .filter(|name| seen.insert(name.clone()))
        .collect();

    Ok(Json(FramedAnswer {
        message_id: report.message_id,
        confidence: answer.confidence,
        cached: answer.cached,
        degraded: answer.degraded,
        truncated: report.truncated,
        sources,
        frames: transport.sink().take_frames(),
    }))
}
