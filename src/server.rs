//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/upload_task` | Create a task from uploaded documents and index its bulk files |
//! | `POST` | `/get_recommendations` | Ranked passages for a selection of text |
//! | `GET`  | `/tasks` | List tasks with their files and status |
//! | `GET`  | `/pdfs/{task}/{filename}` | Raw bytes of a stored document |
//! | `GET`  | `/health` | Health check (version and model state) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query text is empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `nothing_indexed` (422), `index_error` (500), `internal` (500),
//! `embeddings_unavailable` (503), `rerank_unavailable` (503).
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so a browser viewer
//! served from another port can call the API.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::RetrievalError;
use crate::models::{DocumentFailure, RankedResult};
use crate::retrieve::Retriever;
use crate::tasks::{DocumentSlot, TaskError, TaskStatus, TaskStore, TaskSummary};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    tasks: Arc<TaskStore>,
    retriever: Arc<Retriever>,
}

/// Load the models, then serve until the process is terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let tasks = Arc::new(TaskStore::new(&config.tasks.root));
    std::fs::create_dir_all(tasks.root())?;

    let model_config = config.clone();
    let locator = tasks.clone();
    let retriever =
        tokio::task::spawn_blocking(move || Retriever::from_config(&model_config, locator))
            .await?;

    let state = AppState {
        config: Arc::new(config.clone()),
        tasks,
        retriever: Arc::new(retriever),
    };

    let app = router(state);
    let bind_addr = config.server.bind.clone();
    tracing::info!("server listening on http://{}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    let upload_limit = state.config.server.max_upload_mb.saturating_mul(1024 * 1024);

    Router::new()
        .route("/upload_task", post(handle_upload_task))
        .route("/get_recommendations", post(handle_get_recommendations))
        .route("/tasks", get(handle_list_tasks))
        .route("/pdfs/{task}/{filename}", get(handle_get_document))
        .route("/health", get(handle_health))
        .layer(DefaultBodyLimit::max(upload_limit))
        .layer(cors)
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

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(code = self.code, "{}", self.message);
        }
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        let message = err.to_string();
        match err {
            RetrievalError::InvalidQuery(_)
            | RetrievalError::InvalidTaskName(_)
            | RetrievalError::DocumentParse { .. } => bad_request(message),
            RetrievalError::EmbeddingUnavailable(_) => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "embeddings_unavailable",
                message,
            ),
            RetrievalError::RerankUnavailable(_) => AppError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "rerank_unavailable",
                message,
            ),
            RetrievalError::IndexAccess { .. } => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "index_error", message)
            }
            RetrievalError::NothingIndexed { .. } => {
                AppError::new(StatusCode::UNPROCESSABLE_ENTITY, "nothing_indexed", message)
            }
        }
    }
}

impl From<TaskError> for AppError {
    fn from(err: TaskError) -> Self {
        let message = err.to_string();
        match err {
            TaskError::InvalidName(_) | TaskError::InvalidFileName(_) => bad_request(message),
            TaskError::AlreadyExists(_) => AppError::new(StatusCode::CONFLICT, "conflict", message),
            TaskError::NotFound(_) | TaskError::DocumentNotFound { .. } => {
                AppError::new(StatusCode::NOT_FOUND, "not_found", message)
            }
            TaskError::Io { .. } => {
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message)
            }
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    embedding_model: String,
    embeddings_available: bool,
    rerank_model: String,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let embedder = state.retriever.embedder();
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        embedding_model: embedder.model_name().to_string(),
        embeddings_available: embedder.ensure_available().is_ok(),
        rerank_model: state.retriever.reranker().model_name().to_string(),
    })
}

// ============ GET /tasks ============

async fn handle_list_tasks(
    State(state): State<AppState>,
) -> Result<Json<Vec<TaskSummary>>, AppError> {
    Ok(Json(state.tasks.list()?))
}

// ============ POST /upload_task ============

#[derive(Serialize)]
struct UploadResponse {
    status: String,
    task_name: String,
    chunks_indexed: usize,
    documents_failed: Vec<DocumentFailure>,
}

#[derive(Default)]
struct UploadForm {
    task_name: Option<String>,
    fresh_file: Option<(String, Bytes)>,
    bulk_files: Vec<(String, Bytes)>,
}

async fn read_upload_form(mut multipart: Multipart) -> Result<UploadForm, AppError> {
    let mut form = UploadForm::default();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "task_name" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| bad_request(format!("invalid task_name field: {}", e)))?;
                form.task_name = Some(text);
            }
            "fresh_file" | "bulk_files" => {
                let file_name = field
                    .file_name()
                    .map(str::to_string)
                    .ok_or_else(|| bad_request(format!("{} part has no file name", name)))?;
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("failed to read {}: {}", file_name, e)))?;
                if name == "fresh_file" {
                    form.fresh_file = Some((file_name, bytes));
                } else {
                    form.bulk_files.push((file_name, bytes));
                }
            }
            other => tracing::debug!(field = other, "ignoring unknown multipart field"),
        }
    }
    Ok(form)
}

async fn handle_upload_task(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let form = read_upload_form(multipart).await?;
    let task_name = form
        .task_name
        .ok_or_else(|| bad_request("task_name is required"))?;
    let (fresh_name, fresh_bytes) = form
        .fresh_file
        .ok_or_else(|| bad_request("fresh_file is required"))?;
    if form.bulk_files.is_empty() {
        return Err(bad_request("at least one bulk_files part is required"));
    }

    let task = state.tasks.create(&task_name)?;
    state
        .tasks
        .save_document(&task, DocumentSlot::Fresh, &fresh_name, &fresh_bytes)?;
    let mut bulk_paths = Vec::with_capacity(form.bulk_files.len());
    for (file_name, bytes) in &form.bulk_files {
        bulk_paths.push(
            state
                .tasks
                .save_document(&task, DocumentSlot::Bulk, file_name, bytes)?,
        );
    }

    match state.retriever.index(&task, &bulk_paths).await {
        Ok(result) => {
            state.tasks.set_status(&task, TaskStatus::Ready)?;
            Ok(Json(UploadResponse {
                status: "success".to_string(),
                task_name: task,
                chunks_indexed: result.chunks_indexed,
                documents_failed: result.documents_failed,
            }))
        }
        Err(e) => {
            if let Err(status_err) = state.tasks.set_status(&task, TaskStatus::Failed) {
                tracing::warn!(task = %task, error = %status_err, "failed to record task status");
            }
            Err(e.into())
        }
    }
}

// ============ POST /get_recommendations ============

#[derive(Deserialize)]
struct RecommendationRequest {
    task_name: String,
    #[serde(default)]
    query_text: Value,
    #[serde(default)]
    top_n: Option<usize>,
}

#[derive(Serialize)]
struct RecommendationResponse {
    recommendations: Vec<RankedResult>,
}

/// Reduce the shapes a PDF viewer may send for a text selection to a
/// trimmed string: a plain string, `{data: ...}`, `{text: ...}`, or a list
/// whose first element carries `text`.
fn coerce_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Object(map) => {
            if let Some(data) = map.get("data") {
                coerce_text(data)
            } else if let Some(text) = map.get("text") {
                plain(text).trim().to_string()
            } else {
                value.to_string().trim().to_string()
            }
        }
        Value::Array(items) => match items.first() {
            None => String::new(),
            Some(Value::Object(first)) if first.contains_key("text") => {
                first.get("text").map(plain).unwrap_or_default().trim().to_string()
            }
            Some(first) => plain(first).trim().to_string(),
        },
        other => other.to_string().trim().to_string(),
    }
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn handle_get_recommendations(
    State(state): State<AppState>,
    Json(request): Json<RecommendationRequest>,
) -> Result<Json<RecommendationResponse>, AppError> {
    if !state.tasks.exists(&request.task_name)? {
        return Err(TaskError::NotFound(request.task_name).into());
    }
    let query = coerce_text(&request.query_text);
    if query.is_empty() {
        return Err(bad_request("query_text is empty after coercion"));
    }
    let top_n = request
        .top_n
        .unwrap_or(state.config.retrieval.default_top_n);

    let recommendations = state
        .retriever
        .query(&request.task_name, &query, top_n)
        .await?;
    if let Err(e) = state
        .tasks
        .save_recommendations(&request.task_name, &recommendations)
    {
        tracing::warn!(task = %request.task_name, error = %e, "failed to save recommendations");
    }

    Ok(Json(RecommendationResponse { recommendations }))
}

// ============ GET /pdfs/{task}/{filename} ============

async fn handle_get_document(
    State(state): State<AppState>,
    Path((task, filename)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let path = state.tasks.resolve_document(&task, &filename)?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal",
            format!("failed to read {}: {}", path.display(), e),
        )
    })?;
    Ok(([(header::CONTENT_TYPE, content_type(&filename))], bytes).into_response())
}

fn content_type(filename: &str) -> &'static str {
    let ext = std::path::Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("pdf") => "application/pdf",
        Some("txt") => "text/plain; charset=utf-8",
        Some("md") | Some("markdown") => "text/markdown; charset=utf-8",
        Some("docx") => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        Some("pptx") => {
            "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        }
        _ => "application/octet-stream",
    }
}
