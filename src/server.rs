//! MCP-compatible HTTP tool server.
//!
//! Exposes the normative tool contract over a small JSON HTTP surface so
//! MCP hosts (and anything else) can call the engine:
//!
//! | Method | Path | Tool |
//! |--------|------|------|
//! | `POST` | `/tools/qmd_search` | BM25 search |
//! | `POST` | `/tools/qmd_vector_search` | vector-only search |
//! | `POST` | `/tools/qmd_deep_search` | full retrieval pipeline |
//! | `POST` | `/tools/qmd_get` | fetch one document by fileref |
//! | `POST` | `/tools/qmd_multi_get` | fetch documents by glob/list |
//! | `GET`  | `/tools/qmd_status` | index health |
//! | `GET`  | `/health` | liveness + version |
//!
//! Every tool is a thin adapter over the retrieval or store API; no
//! ranking logic lives here.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::error::QmdError;
use crate::get::{get_body, multi_get, parse_fileref, resolve_fileref, GetOptions};
use crate::search::{query_pipeline, search_bm25, search_vector, SearchHit, SearchOptions};

#[derive(Clone)]
struct AppState {
    engine: Arc<Engine>,
}

/// Start the tool server. Binds `QMD_MCP_BIND` (default `127.0.0.1:8181`)
/// and runs until the process is terminated.
pub async fn run_server(engine: Arc<Engine>) -> anyhow::Result<()> {
    let bind_addr =
        std::env::var("QMD_MCP_BIND").unwrap_or_else(|_| "127.0.0.1:8181".to_string());

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/tools/qmd_search", post(handle_search))
        .route("/tools/qmd_vector_search", post(handle_vector_search))
        .route("/tools/qmd_deep_search", post(handle_deep_search))
        .route("/tools/qmd_get", post(handle_get))
        .route("/tools/qmd_multi_get", post(handle_multi_get))
        .route("/tools/qmd_status", get(handle_status))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { engine });

    eprintln!("qmd tool server listening on http://{bind_addr}");
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error plumbing ============

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

fn app_error(err: QmdError) -> AppError {
    let (status, code) = match &err {
        QmdError::Usage(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        QmdError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        QmdError::VectorUnavailable => (StatusCode::BAD_REQUEST, "vector_unavailable"),
        QmdError::DimensionMismatch { .. } => (StatusCode::CONFLICT, "dimension_mismatch"),
        QmdError::ProviderCoolingDown { .. } => (StatusCode::SERVICE_UNAVAILABLE, "cooling_down"),
        QmdError::Provider { .. } => (StatusCode::BAD_GATEWAY, "provider_error"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    AppError {
        status,
        code,
        message: err.to_string(),
    }
}

// ============ Requests ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    min_score: f64,
    #[serde(default)]
    collections: Vec<String>,
    #[serde(default)]
    context: Option<String>,
}

fn default_limit() -> usize {
    10
}

impl SearchRequest {
    fn options(&self) -> SearchOptions {
        SearchOptions {
            limit: self.limit,
            min_score: self.min_score,
            collections: self.collections.clone(),
            context: self.context.clone(),
            ..SearchOptions::default()
        }
    }
}

#[derive(Serialize)]
struct SearchResponse {
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(app_error(QmdError::Usage("query must not be empty".into())));
    }
    let results = search_bm25(&state.engine, &req.query, &req.options())
        .await
        .map_err(app_error)?;
    Ok(Json(SearchResponse { results }))
}

async fn handle_vector_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(app_error(QmdError::Usage("query must not be empty".into())));
    }
    let mut opts = req.options();
    if req.min_score == 0.0 {
        opts.min_score = 0.3;
    }
    let results = search_vector(&state.engine, &req.query, &opts)
        .await
        .map_err(app_error)?;
    Ok(Json(SearchResponse { results }))
}

async fn handle_deep_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(app_error(QmdError::Usage("query must not be empty".into())));
    }
    let results = query_pipeline(&state.engine, &req.query, &req.options())
        .await
        .map_err(app_error)?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Deserialize)]
struct GetRequest {
    file: String,
    #[serde(default)]
    from: Option<usize>,
    #[serde(default)]
    lines: Option<usize>,
    #[serde(default)]
    line_numbers: bool,
}

#[derive(Serialize)]
struct GetResponse {
    docid: String,
    file: String,
    title: String,
    body: String,
}

async fn handle_get(
    State(state): State<AppState>,
    Json(req): Json<GetRequest>,
) -> Result<Json<GetResponse>, AppError> {
    let fileref = parse_fileref(&req.file).map_err(app_error)?;
    let doc = resolve_fileref(&state.engine, &fileref)
        .await
        .map_err(app_error)?;
    let opts = GetOptions {
        from: req.from,
        lines: req.lines,
        line_numbers: req.line_numbers,
    };
    let body = get_body(&state.engine, &doc, &opts)
        .await
        .map_err(app_error)?;
    Ok(Json(GetResponse {
        docid: crate::chunker::docid(&doc.hash).to_string(),
        file: format!("qmd://{}/{}", doc.collection, doc.path),
        title: doc.title,
        body,
    }))
}

#[derive(Deserialize)]
struct MultiGetRequest {
    pattern: String,
    #[serde(default)]
    lines: Option<usize>,
    #[serde(default = "default_max_bytes")]
    max_bytes: u64,
}

fn default_max_bytes() -> u64 {
    1024 * 1024
}

async fn handle_multi_get(
    State(state): State<AppState>,
    Json(req): Json<MultiGetRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let results = multi_get(&state.engine, &req.pattern, req.lines, req.max_bytes)
        .await
        .map_err(app_error)?;
    Ok(Json(SearchResponse { results }))
}

#[derive(Serialize)]
struct StatusResponse {
    total_docs: u64,
    needs_embedding: u64,
    days_stale: i64,
    collections: Vec<CollectionStatus>,
}

#[derive(Serialize)]
struct CollectionStatus {
    name: String,
    documents: i64,
}

async fn handle_status(
    State(state): State<AppState>,
) -> Result<Json<StatusResponse>, AppError> {
    let now = chrono::Utc::now().timestamp();
    let health = state
        .engine
        .store
        .get_index_health(now)
        .await
        .map_err(app_error)?;
    let counts = state
        .engine
        .store
        .collection_counts()
        .await
        .map_err(app_error)?;
    Ok(Json(StatusResponse {
        total_docs: health.total_docs,
        needs_embedding: health.needs_embedding,
        days_stale: health.days_stale,
        collections: counts
            .into_iter()
            .map(|(name, documents)| CollectionStatus { name, documents })
            .collect(),
    }))
}

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
