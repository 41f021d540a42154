//! HTTP serving boundary.
//!
//! The sole entry points the UI layer calls: the query boundary and the
//! ingestion boundary, plus health and stats. Many requests are served in
//! parallel against the shared pipeline; a slow completion call suspends
//! only its own request.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Answer a question (userId, role, scope, queryText) |
//! | `POST` | `/documents` | Ingest extracted text (admin only) |
//! | `GET`  | `/documents` | List documents with ingestion status |
//! | `DELETE` | `/documents/{id}` | Delete a document (admin only) |
//! | `GET`  | `/stats` | Knowledge-base and serving stats |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `forbidden` (403), `not_found` (404),
//! `internal` (500). Internal detail is logged, never echoed to end users.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::error;

use crate::ingest::{IngestRequest, Ingestor};
use crate::models::{QueryRequest, Role, SourceType};
use crate::pipeline::RetrievalPipeline;
use crate::stats::collect_stats;
use crate::store::DocumentStore;

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<RetrievalPipeline>,
    pub ingestor: Arc<Ingestor>,
    pub store: Arc<DocumentStore>,
}

/// Start the HTTP server on `bind`.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = router(state).layer(cors);

    println!("aero serving on http://{}", bind);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/query", post(handle_query))
        .route("/documents", post(handle_ingest).get(handle_list_documents))
        .route("/documents/{id}", delete(handle_delete_document))
        .route("/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .with_state(state)
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn forbidden(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::FORBIDDEN,
        code: "forbidden".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

/// Log the detail, return the single friendly message.
fn internal(err: anyhow::Error) -> AppError {
    error!("internal error: {:#}", err);
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: "Something went wrong. Please try again.".to_string(),
    }
}

// ============ GET /health ============

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

// ============ POST /query ============

async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<crate::models::QueryResponse>, AppError> {
    if req.user_id.trim().is_empty() {
        return Err(bad_request("user_id must not be empty"));
    }
    if req.scope.trim().is_empty() {
        return Err(bad_request("scope must not be empty"));
    }
    if req.query.trim().is_empty() {
        return Err(bad_request("query must not be empty"));
    }

    // The pipeline degrades internally; this await never errors.
    Ok(Json(state.pipeline.answer(req).await))
}

// ============ POST /documents ============

#[derive(Deserialize)]
struct IngestBody {
    role: Role,
    #[serde(default)]
    document_id: Option<String>,
    title: String,
    source_type: SourceType,
    scope: String,
    text: String,
}

async fn handle_ingest(
    State(state): State<AppState>,
    Json(body): Json<IngestBody>,
) -> Result<Json<crate::ingest::IngestReport>, AppError> {
    if !body.role.can_manage_documents() {
        return Err(forbidden(format!(
            "role '{}' may not manage documents",
            body.role.as_str()
        )));
    }
    if body.title.trim().is_empty() {
        return Err(bad_request("title must not be empty"));
    }
    if body.scope.trim().is_empty() {
        return Err(bad_request("scope must not be empty"));
    }

    let report = state
        .ingestor
        .ingest(IngestRequest {
            document_id: body.document_id,
            title: body.title,
            source_type: body.source_type,
            scope: body.scope,
            text: body.text,
        })
        .await
        .map_err(classify_ingest_error)?;

    Ok(Json(report))
}

fn classify_ingest_error(err: anyhow::Error) -> AppError {
    if err
        .downcast_ref::<crate::error::IngestionError>()
        .is_some()
    {
        return bad_request(err.to_string());
    }
    let msg = err.to_string();
    if msg.contains("not found") {
        return not_found(msg);
    }
    internal(err)
}

// ============ GET /documents ============

#[derive(Deserialize)]
struct ListParams {
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Serialize)]
struct DocumentListResponse {
    documents: Vec<crate::models::Document>,
}

async fn handle_list_documents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<DocumentListResponse>, AppError> {
    let documents = state
        .store
        .list_documents(params.scope.as_deref())
        .await
        .map_err(internal)?;
    Ok(Json(DocumentListResponse { documents }))
}

// ============ DELETE /documents/{id} ============

#[derive(Deserialize)]
struct DeleteParams {
    role: Role,
}

#[derive(Serialize)]
struct DeleteResponse {
    deleted: bool,
}

async fn handle_delete_document(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DeleteParams>,
) -> Result<Json<DeleteResponse>, AppError> {
    if !params.role.can_manage_documents() {
        return Err(forbidden(format!(
            "role '{}' may not manage documents",
            params.role.as_str()
        )));
    }

    let deleted = state.ingestor.delete(&id).await.map_err(internal)?;
    if !deleted {
        return Err(not_found(format!("no document with id: {}", id)));
    }
    Ok(Json(DeleteResponse { deleted }))
}

// ============ GET /stats ============

async fn handle_stats(
    State(state): State<AppState>,
) -> Result<Json<crate::stats::StatsReport>, AppError> {
    let report = collect_stats(&state.store, Some(state.pipeline.metrics()))
        .await
        .map_err(internal)?;
    Ok(Json(report))
}
