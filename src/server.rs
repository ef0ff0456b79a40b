//! JSON HTTP API over the pipeline.
//!
//! The caller's tenant and user come from the trusted `x-tenant-id` and
//! `x-user-id` headers set by the upstream session layer; this server does
//! not authenticate them.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/sources` | Store a source document and index it |
//! | `POST` | `/index/source` | Re-index one stored source |
//! | `POST` | `/index/all` | Re-index every source and knowledge entry |
//! | `POST` | `/index/refresh` | Re-index only if a publish marked the index dirty |
//! | `POST` | `/search` | Answer a query from the index |
//! | `POST` | `/search/manual` | Log a query from a non-AI search path |
//! | `GET`  | `/mining/status` | Whether mining may run today |
//! | `POST` | `/mining/run` | Run today's mining |
//! | `GET`  | `/mining/today` | Today's suggestion payload |
//! | `GET`  | `/drafts` | List drafts |
//! | `POST` | `/drafts/{id}/publish` | Publish a draft |
//! | `DELETE` | `/drafts/{id}` | Discard a draft |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "mining already ran today", "next_eligible_at": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `nothing_to_mine` (422), `contract_violation` (502),
//! `service_unavailable` (503), `internal` (500).

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::config::Config;
use crate::error::PipelineError;
use crate::mining::MiningOutcome;
use crate::models::{Module, SourceDocument};
use crate::pipeline::Pipeline;

pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pipeline = Arc::new(Pipeline::open(config).await?);
    let app = router(pipeline);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router. Separate from [`run_server`] so tests can serve it on
/// an ephemeral port.
pub fn router(pipeline: Arc<Pipeline>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/sources", post(handle_add_source))
        .route("/index/source", post(handle_index_source))
        .route("/index/all", post(handle_index_all))
        .route("/index/refresh", post(handle_index_refresh))
        .route("/search", post(handle_search))
        .route("/search/manual", post(handle_manual_query))
        .route("/mining/status", get(handle_mining_status))
        .route("/mining/run", post(handle_mining_run))
        .route("/mining/today", get(handle_mining_today))
        .route("/drafts", get(handle_list_drafts))
        .route("/drafts/{id}/publish", post(handle_publish))
        .route("/drafts/{id}", delete(handle_discard))
        .layer(cors)
        .with_state(pipeline)
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
    #[serde(skip_serializing_if = "Option::is_none")]
    next_eligible_at: Option<DateTime<Utc>>,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
    next_eligible_at: Option<DateTime<Utc>>,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
            next_eligible_at: None,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
                next_eligible_at: self.next_eligible_at,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::InvalidData(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::NothingToMine => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::ContractViolation(_) => StatusCode::BAD_GATEWAY,
            PipelineError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.code(), err.to_string())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| bad_request(format!("missing {} header", name)))
}

fn tenant(headers: &HeaderMap) -> Result<&str, AppError> {
    header(headers, "x-tenant-id")
}

fn parse_module(s: &str) -> Result<Module, AppError> {
    Module::parse(s).ok_or_else(|| bad_request(format!("unknown module: {}", s)))
}

// ============ Handlers ============

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

#[derive(Deserialize)]
struct AddSourceRequest {
    module: String,
    source_id: String,
    #[serde(default)]
    title: String,
    body: String,
}

async fn handle_add_source(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
    Json(req): Json<AddSourceRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let doc = SourceDocument {
        tenant_id: tenant(&headers)?.to_string(),
        module: parse_module(&req.module)?,
        source_id: req.source_id,
        title: req.title,
        body: req.body,
    };
    let chunks = p.indexer.add_source(&doc).await?;
    Ok(Json(serde_json::json!({ "chunks": chunks })))
}

#[derive(Deserialize)]
struct IndexSourceRequest {
    module: String,
    source_id: String,
}

async fn handle_index_source(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
    Json(req): Json<IndexSourceRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant_id = tenant(&headers)?;
    let module = parse_module(&req.module)?;
    let sources = p.store.list_sources(tenant_id).await.map_err(PipelineError::from)?;
    let doc = sources
        .into_iter()
        .find(|s| s.module == module && s.source_id == req.source_id)
        .ok_or_else(|| {
            PipelineError::NotFound(format!("source {}:{}", module, req.source_id))
        })?;
    let chunks = p
        .indexer
        .reindex_source(tenant_id, doc.module, &doc.source_id, &doc.title, &doc.body)
        .await?;
    Ok(Json(serde_json::json!({ "chunks": chunks })))
}

async fn handle_index_all(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let summary = p.indexer.reindex_all(tenant(&headers)?).await?;
    Ok(Json(serde_json::json!({ "summary": summary })))
}

async fn handle_index_refresh(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let summary = p.indexer.reindex_if_dirty(tenant(&headers)?).await?;
    Ok(Json(serde_json::json!({ "summary": summary })))
}

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
}

async fn handle_search(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
    Json(req): Json<SearchRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let answer = p.search.answer(tenant(&headers)?, &req.query).await?;
    Ok(Json(serde_json::json!(answer)))
}

#[derive(Deserialize)]
struct ManualQueryRequest {
    query: String,
    found: bool,
}

async fn handle_manual_query(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
    Json(req): Json<ManualQueryRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let log = p
        .search
        .record_manual_query(tenant(&headers)?, &req.query, req.found)
        .await?;
    Ok(Json(serde_json::json!({ "id": log.id })))
}

async fn handle_mining_status(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let eligibility = p.mining.can_run_today(tenant(&headers)?).await?;
    Ok(Json(serde_json::json!(eligibility)))
}

async fn handle_mining_run(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let tenant_id = tenant(&headers)?;
    let user_id = header(&headers, "x-user-id")?;
    match p.mining.run_for_today(tenant_id, user_id).await? {
        MiningOutcome::Completed(report) => Ok(Json(serde_json::json!(report))),
        MiningOutcome::AlreadyRan {
            next_eligible_at, ..
        } => {
            let mut err = AppError::new(
                StatusCode::CONFLICT,
                "conflict",
                "mining already ran today",
            );
            err.next_eligible_at = Some(next_eligible_at);
            Err(err)
        }
    }
}

async fn handle_mining_today(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let record = p.mining.get_today_suggestions(tenant(&headers)?).await?;
    Ok(Json(serde_json::json!({ "suggestions": record })))
}

async fn handle_list_drafts(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    let drafts = p.drafts.list(tenant(&headers)?).await?;
    Ok(Json(serde_json::json!({ "drafts": drafts })))
}

#[derive(Deserialize)]
struct PublishRequest {
    question: String,
    answer: String,
}

async fn handle_publish(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let result = p
        .drafts
        .publish(tenant(&headers)?, &id, &req.question, &req.answer)
        .await?;
    Ok(Json(serde_json::json!(result)))
}

async fn handle_discard(
    State(p): State<Arc<Pipeline>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let removed = p.drafts.discard(tenant(&headers)?, &id).await?;
    Ok(Json(serde_json::json!({ "removed": removed })))
}
