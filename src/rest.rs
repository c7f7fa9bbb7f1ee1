/*!
alchemist REST API Server

HTTP frontend for the data cleaning session core. Every dataset lives in a
session served by either the in-memory engine or the disk-backed engine; the
endpoints below never care which, except where an operation only exists on one
side.

## Usage

```bash
alchemist-rest --host 127.0.0.1 --port 3335 --data-dir ./data
```

## Endpoints

- `POST /api/v1/upload` - Upload a dataset (multipart: file + optional session_id)
- `POST /api/v1/clean` - Apply cleaning operations
- `POST /api/v1/filter` - Filtered read (in-memory sessions)
- `POST /api/v1/transform` - Apply transform operations
- `POST /api/v1/preview` - Dry-run cleaning operations on a sample
- `POST /api/v1/undo` | `redo` | `reset` - History navigation
- `GET /api/v1/history` - Undo/redo stack summary
- `GET /api/v1/session/:session_id` - Session metadata
- `GET /api/v1/data/info` - Dataset shape and column types
- `GET /api/v1/data/page` - Paginated browse (disk-backed sessions)
- `GET /api/v1/facets/profile` - Column profile
- `GET /api/v1/cluster/suggest` - Fuzzy merge suggestions
- `POST /api/v1/cluster/apply` - Apply a value merge
- `GET /api/v1/stats` - Descriptive statistics
- `POST /api/v1/download` - Export (csv|excel|json|sql)
- `GET /api/v1/health` - Health check
- `GET /api/v1/version` - Version information
*/

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use alchemist::export::{self, ExportFormat};
use alchemist::relational::{PageQuery, SortDir};
use alchemist::session::DEFAULT_LARGE_FILE_THRESHOLD;
use alchemist::stats;
use alchemist::table::{CleanOp, FilterOperator, FilterPredicate, TransformOp};
use alchemist::{AlchemistError, SessionManager, SessionMode, VERSION};

/// Uploads larger than this are rejected by the body-limit layer.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

const DEFAULT_TOP_N: i64 = 10;
const DEFAULT_PREVIEW_SAMPLE: usize = 10;

/// CLI arguments for the REST API server
#[derive(Parser)]
#[command(name = "alchemist-rest")]
#[command(about = "alchemist data cleaning REST API Server")]
#[command(version = VERSION)]
struct Cli {
    /// Host address to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind to
    #[arg(long, default_value = "3335")]
    port: u16,

    /// CORS allowed origins (comma-separated)
    #[arg(long, default_value = "*")]
    cors_origin: String,

    /// Directory for stored uploads, SQLite databases, and session metadata
    #[arg(long, default_value = "./data")]
    data_dir: String,

    /// CSV uploads at or above this many bytes go to the disk engine
    #[arg(long, default_value_t = DEFAULT_LARGE_FILE_THRESHOLD)]
    large_file_threshold: usize,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    sessions: Arc<SessionManager>,
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct SessionParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ProfileParams {
    session_id: String,
    column: String,
    #[serde(default = "default_top_n")]
    top_n: i64,
}

#[derive(Debug, Deserialize)]
struct SuggestParams {
    session_id: String,
    column: String,
    max_unique: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StatsParams {
    session_id: String,
    #[serde(rename = "type")]
    kind: String,
    /// Comma-separated column subset; absent means every column.
    columns: Option<String>,
    method: Option<String>,
    #[serde(default = "default_top_n")]
    top_n: i64,
}

impl StatsParams {
    fn column_list(&self) -> Option<Vec<String>> {
        let names: Vec<String> = self
            .columns
            .as_deref()?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            None
        } else {
            Some(names)
        }
    }
}

/// Flat page parameters; `serde(flatten)` into [`PageQuery`] would lose the
/// numeric fields under query-string deserialization, so the fields are
/// spelled out and converted by hand.
#[derive(Debug, Deserialize)]
struct PageParams {
    session_id: String,
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
    sort_column: Option<String>,
    #[serde(default)]
    sort_dir: SortDir,
    filter_column: Option<String>,
    filter_operator: Option<FilterOperator>,
    filter_value: Option<String>,
    search_term: Option<String>,
}

fn default_top_n() -> i64 {
    DEFAULT_TOP_N
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

impl PageParams {
    fn into_query(self) -> (String, PageQuery) {
        (
            self.session_id,
            PageQuery {
                page: self.page,
                page_size: self.page_size,
                sort_column: self.sort_column,
                sort_dir: self.sort_dir,
                filter_column: self.filter_column,
                filter_operator: self.filter_operator,
                filter_value: self.filter_value,
                search_term: self.search_term,
            },
        )
    }
}

// ============================================================================
// Error Handling
// ============================================================================

/// Error response: `{success: false, error, detail}` plus an HTTP status.
struct ApiErrorResponse {
    status: StatusCode,
    body: Value,
}

impl IntoResponse for ApiErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<AlchemistError> for ApiErrorResponse {
    fn from(err: AlchemistError) -> Self {
        let (status, detail) = match &err {
            AlchemistError::Validation(_) => (StatusCode::BAD_REQUEST, "validation"),
            AlchemistError::Unsupported(_) => (StatusCode::BAD_REQUEST, "unsupported"),
            AlchemistError::Parse(_) => (StatusCode::BAD_REQUEST, "parse"),
            AlchemistError::NoHistory(_) => (StatusCode::BAD_REQUEST, "no_history"),
            AlchemistError::NoOriginal(_) => (StatusCode::BAD_REQUEST, "no_original"),
            AlchemistError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AlchemistError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage"),
            AlchemistError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        ApiErrorResponse {
            status,
            body: json!({
                "success": false,
                "error": err.to_string(),
                "detail": detail,
            }),
        }
    }
}

fn success(mut value: Value) -> Json<Value> {
    value["success"] = json!(true);
    Json(value)
}

/// Pull one typed field out of a JSON body, turning deserialization failures
/// into 400s. Unknown operation types are rejected here, before any dispatch.
fn body_field<T: serde::de::DeserializeOwned>(
    body: &Value,
    key: &str,
) -> Result<T, ApiErrorResponse> {
    let field = body.get(key).cloned().unwrap_or(Value::Null);
    serde_json::from_value(field).map_err(|e| {
        AlchemistError::Validation(format!("invalid '{}' field: {}", key, e)).into()
    })
}

fn body_session_id(body: &Value) -> Result<String, ApiErrorResponse> {
    match body.get("session_id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(AlchemistError::Validation("session_id is required".to_string()).into()),
    }
}

// ============================================================================
// Handler Functions
// ============================================================================

/// POST /api/v1/upload - Upload a dataset and create (or replace) a session
async fn upload_handler(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<Value>, ApiErrorResponse> {
    let multipart_err = |e: axum::extract::multipart::MultipartError| {
        ApiErrorResponse::from(AlchemistError::Validation(format!(
            "malformed multipart request: {}",
            e
        )))
    };

    let mut filename = String::new();
    let mut content: Option<Bytes> = None;
    let mut session_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_err)? {
        match field.name().unwrap_or("") {
            "file" => {
                filename = field.file_name().unwrap_or("").to_string();
                content = Some(field.bytes().await.map_err(multipart_err)?);
            }
            "session_id" => {
                session_id = Some(field.text().await.map_err(multipart_err)?);
            }
            _ => {}
        }
    }

    let content = content.ok_or_else(|| {
        ApiErrorResponse::from(AlchemistError::Validation(
            "no file part in request".to_string(),
        ))
    })?;
    info!("Upload: {} ({} bytes)", filename, content.len());

    let response = state.sessions.upload(
        &filename,
        &content,
        session_id.filter(|s| !s.is_empty()),
    )?;
    Ok(success(response))
}

/// POST /api/v1/clean - Apply cleaning operations
async fn clean_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    let operations: Vec<CleanOp> = body_field(&body, "operations")?;
    Ok(success(state.sessions.clean(&session_id, &operations)?))
}

/// POST /api/v1/filter - Filtered read over an in-memory session
async fn filter_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    let filters: Vec<FilterPredicate> = body_field(&body, "filters")?;
    Ok(success(state.sessions.filter(&session_id, &filters)?))
}

/// POST /api/v1/transform - Apply transform operations
async fn transform_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    let operations: Vec<TransformOp> = body_field(&body, "operations")?;
    Ok(success(state.sessions.transform(&session_id, &operations)?))
}

/// POST /api/v1/preview - Dry-run cleaning operations on a sample
async fn preview_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    let operations: Vec<CleanOp> = body_field(&body, "operations")?;
    let sample_size = body
        .get("sample_size")
        .and_then(Value::as_u64)
        .map(|n| n as usize)
        .unwrap_or(DEFAULT_PREVIEW_SAMPLE);
    let source_rows: Option<Vec<Value>> = match body.get("source_rows") {
        Some(Value::Array(rows)) => Some(rows.clone()),
        _ => None,
    };
    Ok(success(state.sessions.preview_operations(
        &session_id,
        &operations,
        sample_size,
        source_rows.as_deref(),
    )?))
}

/// POST /api/v1/undo
async fn undo_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    Ok(success(state.sessions.undo(&session_id)?))
}

/// POST /api/v1/redo
async fn redo_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    Ok(success(state.sessions.redo(&session_id)?))
}

/// POST /api/v1/reset - Restore the dataset as originally uploaded
async fn reset_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    Ok(success(state.sessions.reset(&session_id)?))
}

/// GET /api/v1/history
async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Result<Json<Value>, ApiErrorResponse> {
    Ok(success(state.sessions.history(&params.session_id)?))
}

/// GET /api/v1/data/info
async fn info_handler(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
) -> Result<Json<Value>, ApiErrorResponse> {
    Ok(success(state.sessions.info(&params.session_id)?))
}

/// GET /api/v1/session/:session_id - Session metadata
async fn session_meta_handler(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let meta = state.sessions.session_meta(&session_id)?;
    let body = serde_json::to_value(&meta)
        .map_err(|e| AlchemistError::Internal(format!("metadata serialization: {}", e)))?;
    Ok(success(json!({ "session": body })))
}

/// GET /api/v1/data/page - Paginated browse over a disk-backed session
async fn page_handler(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let (session_id, query) = params.into_query();
    Ok(success(state.sessions.page(&session_id, &query)?))
}

/// GET /api/v1/facets/profile
async fn profile_handler(
    State(state): State<AppState>,
    Query(params): Query<ProfileParams>,
) -> Result<Json<Value>, ApiErrorResponse> {
    Ok(success(state.sessions.profile(
        &params.session_id,
        &params.column,
        params.top_n,
    )?))
}

/// GET /api/v1/cluster/suggest
async fn cluster_suggest_handler(
    State(state): State<AppState>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<Value>, ApiErrorResponse> {
    Ok(success(state.sessions.suggest_clusters(
        &params.session_id,
        &params.column,
        params.max_unique,
    )?))
}

/// POST /api/v1/cluster/apply
async fn cluster_apply_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    let column: String = body_field(&body, "column")?;
    let canonical: String = body_field(&body, "canonical")?;
    let values: Vec<String> = body_field(&body, "values")?;
    Ok(success(state.sessions.apply_merge(
        &session_id,
        &column,
        &canonical,
        &values,
    )?))
}

/// GET /api/v1/stats - Descriptive statistics over an in-memory session
async fn stats_handler(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> Result<Json<Value>, ApiErrorResponse> {
    let kind = params.kind.clone();
    let top_n = params.top_n.max(0) as usize;
    let columns = params.column_list();
    let method = params.method.clone();
    let result = state.sessions.with_table(&params.session_id, |table| {
        let df = table.dataframe()?;
        let columns = columns.as_deref();
        let method = method.as_deref();
        match kind.as_str() {
            "descriptive" => stats::describe(df, columns),
            "categorical" => stats::categorical(df, columns, top_n),
            "correlation" => stats::correlate(df, columns, method),
            "quality" => stats::quality_report(df),
            "outliers" => stats::detect_outliers(df, columns, method),
            other => Err(AlchemistError::Validation(format!(
                "unknown stats type: {}",
                other
            ))),
        }
    })?;
    Ok(success(json!({
        "type": params.kind,
        "data": result,
    })))
}

/// POST /api/v1/download - Export the dataset as a file attachment
async fn download_handler(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Response, ApiErrorResponse> {
    let session_id = body_session_id(&body)?;
    let format_name: String = body_field(&body, "format")?;
    let format = ExportFormat::parse(&format_name)?;
    let filename = body
        .get("filename")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .unwrap_or("exported_data")
        .to_string();

    let mode = state.sessions.handle(&session_id)?.mode()?;
    let payload = match mode {
        SessionMode::InMemory => state.sessions.with_table(&session_id, |table| {
            export::export_dataframe(table.dataframe()?, format, &filename)
        })?,
        SessionMode::DiskBacked => state.sessions.with_relational(&session_id, |store| {
            export::export_relation(store, format, &filename)
        })?,
    };

    info!(
        "Download: {} ({} bytes, {})",
        payload.filename,
        payload.bytes.len(),
        format_name
    );
    Ok((
        [
            (header::CONTENT_TYPE, payload.content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", payload.filename),
            ),
        ],
        payload.bytes,
    )
        .into_response())
}

/// GET /api/v1/health - Health check
async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let sessions = state.sessions.session_count().unwrap_or(0);
    Json(json!({
        "status": "healthy",
        "version": VERSION,
        "active_sessions": sessions,
    }))
}

/// GET /api/v1/version - Version information
async fn version_handler() -> Json<Value> {
    Json(json!({
        "version": VERSION,
        "engines": ["in_memory", "disk_backed"],
    }))
}

/// Root handler
async fn root_handler() -> &'static str {
    "alchemist REST API Server - See /api/v1/health for status"
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/api/v1/upload", post(upload_handler))
        .route("/api/v1/clean", post(clean_handler))
        .route("/api/v1/filter", post(filter_handler))
        .route("/api/v1/transform", post(transform_handler))
        .route("/api/v1/preview", post(preview_handler))
        .route("/api/v1/undo", post(undo_handler))
        .route("/api/v1/redo", post(redo_handler))
        .route("/api/v1/reset", post(reset_handler))
        .route("/api/v1/history", get(history_handler))
        .route("/api/v1/session/:session_id", get(session_meta_handler))
        .route("/api/v1/data/info", get(info_handler))
        .route("/api/v1/data/page", get(page_handler))
        .route("/api/v1/facets/profile", get(profile_handler))
        .route("/api/v1/cluster/suggest", get(cluster_suggest_handler))
        .route("/api/v1/cluster/apply", post(cluster_apply_handler))
        .route("/api/v1/stats", get(stats_handler))
        .route("/api/v1/download", post(download_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/version", get(version_handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alchemist_rest=info,alchemist=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    let sessions = Arc::new(SessionManager::new(
        std::path::Path::new(&cli.data_dir),
        cli.large_file_threshold,
    )?);
    let state = AppState { sessions };

    // Configure CORS
    let cors = if cli.cors_origin == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    } else {
        let origins: Vec<_> = cli
            .cors_origin
            .split(',')
            .filter_map(|s| s.trim().parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(vec![header::CONTENT_TYPE])
    };

    let app = build_router(state)
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;

    info!("Starting alchemist REST API server on {}", addr);
    info!("Data directory: {}", cli.data_dir);
    info!(
        "Large file threshold: {} bytes",
        cli.large_file_threshold
    );

    // Start server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tempfile::TempDir;
    use tower::util::ServiceExt;

    const SMALL_CSV: &str = "city,population\nOslo,700000\noslo ,1\nBergen,290000\nOslo,700000\n";

    fn create_test_app(threshold: usize) -> (TempDir, Router) {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionManager::new(dir.path(), threshold).unwrap());
        (dir, build_router(AppState { sessions }))
    }

    fn multipart_upload(csv: &str, session_id: Option<&str>) -> Request<Body> {
        let mut body = format!(
            "--X-BOUNDARY\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"cities.csv\"\r\n\
             Content-Type: text/csv\r\n\r\n{}\r\n",
            csv
        );
        if let Some(id) = session_id {
            body.push_str(&format!(
                "--X-BOUNDARY\r\n\
                 Content-Disposition: form-data; name=\"session_id\"\r\n\r\n{}\r\n",
                id
            ));
        }
        body.push_str("--X-BOUNDARY--\r\n");

        Request::builder()
            .method("POST")
            .uri("/api/v1/upload")
            .header(
                "Content-Type",
                "multipart/form-data; boundary=X-BOUNDARY",
            )
            .body(Body::from(body))
            .unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn upload(app: &Router, csv: &str) -> String {
        let response = app
            .clone()
            .oneshot(multipart_upload(csv, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        json["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_dir, app) = create_test_app(usize::MAX);
        let response = app.oneshot(get_req("/api/v1/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert!(json["version"].is_string());
        assert_eq!(json["active_sessions"], 0);
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let (_dir, app) = create_test_app(usize::MAX);
        let response = app.oneshot(get_req("/api/v1/version")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["version"].is_string());
        assert_eq!(json["engines"], json!(["in_memory", "disk_backed"]));
    }

    #[tokio::test]
    async fn test_upload_and_info() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .oneshot(get_req(&format!("/api/v1/data/info?session_id={}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["shape"], json!([4, 2]));
        assert_eq!(json["columns"], json!(["city", "population"]));
    }

    #[tokio::test]
    async fn test_upload_keeps_caller_session_id() {
        let (_dir, app) = create_test_app(usize::MAX);
        let response = app
            .oneshot(multipart_upload(SMALL_CSV, Some("abc-123")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["session_id"], "abc-123");
    }

    #[tokio::test]
    async fn test_upload_without_file_is_rejected() {
        let (_dir, app) = create_test_app(usize::MAX);
        let body = "--X-BOUNDARY--\r\n";
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/upload")
            .header(
                "Content-Type",
                "multipart/form-data; boundary=X-BOUNDARY",
            )
            .body(Body::from(body))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
    }

    #[tokio::test]
    async fn test_clean_and_undo_round_trip() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/clean",
                json!({"session_id": id, "operations": [{"type": "remove_duplicates"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["shape"], json!([3, 2]));
        assert!(json["operation_log"]["log_id"].is_string());

        let response = app
            .oneshot(post_json("/api/v1/undo", json!({"session_id": id})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["shape"], json!([4, 2]));
    }

    #[tokio::test]
    async fn test_unknown_operation_type_is_a_400() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .oneshot(post_json(
                "/api/v1/clean",
                json!({"session_id": id, "operations": [{"type": "drop_database"}]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["success"], false);
        assert_eq!(json["detail"], "validation");
    }

    #[tokio::test]
    async fn test_missing_session_id_is_a_400() {
        let (_dir, app) = create_test_app(usize::MAX);
        let response = app
            .oneshot(post_json("/api/v1/undo", json!({})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_session_is_a_404() {
        let (_dir, app) = create_test_app(usize::MAX);
        let response = app
            .oneshot(post_json("/api/v1/undo", json!({"session_id": "missing"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = body_json(response).await;
        assert_eq!(json["detail"], "not_found");
    }

    #[tokio::test]
    async fn test_filter_endpoint() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .oneshot(post_json(
                "/api/v1/filter",
                json!({"session_id": id, "filters": [
                    {"column": "city", "operator": "equals", "value": "oslo"}
                ]}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["shape"], json!([2, 2]));
    }

    #[tokio::test]
    async fn test_page_on_in_memory_session_is_a_400() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;
        let response = app
            .oneshot(get_req(&format!("/api/v1/data/page?session_id={}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["detail"], "unsupported");
    }

    #[tokio::test]
    async fn test_large_mode_page_with_filter() {
        let (_dir, app) = create_test_app(1);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .oneshot(get_req(&format!(
                "/api/v1/data/page?session_id={}&page=1&page_size=10\
                 &filter_column=city&filter_operator=equals&filter_value=oslo",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total_rows"], 2);
        assert_eq!(json["page"], 1);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .clone()
            .oneshot(get_req(&format!(
                "/api/v1/stats?session_id={}&type=descriptive",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["population"]["count"], 4);

        let response = app
            .oneshot(get_req(&format!(
                "/api/v1/stats?session_id={}&type=nonsense",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stats_column_subset_and_method() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .clone()
            .oneshot(get_req(&format!(
                "/api/v1/stats?session_id={}&type=descriptive&columns=population",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["data"]["population"]["count"], 4);
        assert!(json["data"].get("city").is_none());

        let response = app
            .clone()
            .oneshot(get_req(&format!(
                "/api/v1/stats?session_id={}&type=descriptive&columns=no_such",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .oneshot(get_req(&format!(
                "/api/v1/stats?session_id={}&type=correlation&method=spearman",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_session_metadata_endpoint() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .clone()
            .oneshot(get_req(&format!("/api/v1/session/{}", id)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["session"]["session_id"], json!(id));
        assert_eq!(json["session"]["mode"], "in_memory");
        assert_eq!(json["session"]["filename"], "cities.csv");

        let response = app
            .oneshot(get_req("/api/v1/session/missing"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cluster_suggest_and_apply() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .clone()
            .oneshot(get_req(&format!(
                "/api/v1/cluster/suggest?session_id={}&column=city",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["clusters"][0]["canonical"], "Oslo");

        let response = app
            .oneshot(post_json(
                "/api/v1/cluster/apply",
                json!({
                    "session_id": id,
                    "column": "city",
                    "canonical": "Oslo",
                    "values": ["oslo "]
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert!(json["changed_rows"].is_null());
        assert_eq!(json["operation_log"]["operation_type"], "cluster_merge");
    }

    #[tokio::test]
    async fn test_profile_endpoint() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .oneshot(get_req(&format!(
                "/api/v1/facets/profile?session_id={}&column=city&top_n=2",
                id
            )))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["total_rows"], 4);
        assert_eq!(json["top_values"][0]["value"], "Oslo");
    }

    #[tokio::test]
    async fn test_download_csv_attachment() {
        let (_dir, app) = create_test_app(usize::MAX);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .oneshot(post_json(
                "/api/v1/download",
                json!({"session_id": id, "format": "csv"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_DISPOSITION],
            "attachment; filename=\"exported_data.csv\""
        );
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.starts_with("city,population"));
    }

    #[tokio::test]
    async fn test_download_sql_from_large_session() {
        let (_dir, app) = create_test_app(1);
        let id = upload(&app, SMALL_CSV).await;

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/v1/download",
                json!({"session_id": id, "format": "sql", "filename": "cities"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("CREATE TABLE `cities`"));

        // Non-SQL formats need the in-memory engine.
        let response = app
            .oneshot(post_json(
                "/api/v1/download",
                json!({"session_id": id, "format": "csv"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let (_dir, app) = create_test_app(usize::MAX);
        let response = app.oneshot(get_req("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&bytes).contains("alchemist"));
    }
}
