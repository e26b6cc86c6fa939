//! HTTP route handlers for the PiggyChick server.
//!
//! This module provides the HTTP API endpoints:
//!
//! - `GET /api/roots?prdSort=asc|desc` - All roots with their PRDs
//! - `GET /api/roots/{rootId}/prds/{prdId}/plan` - Plan pair of a PRD
//! - `GET /api/roots/{rootId}/prds/{prdId}/{docId}` - Markdown document
//! - `GET /api/roots/{rootId}/events` - Change stream for one root (SSE)
//! - `GET /api/events` - Change stream for every root (SSE)
//! - `GET /health` - Health check endpoint
//!
//! # Architecture
//!
//! All routes share application state through [`AppState`], which contains:
//! - The roots configuration (re-read on every request)
//! - The watch registry backing the change streams
//! - A shutdown token that ends open streams on graceful shutdown
//! - Server start time for uptime reporting
//!
//! Filesystem work runs on the blocking thread pool. Failures are returned
//! as `{ "error": { "code", "message" } }` with a matching status.
//!
//! # Example
//!
//! ```rust,no_run
//! use pgch_server::routes::{create_router, AppState};
//! use pgch_server::roots::RootsConfig;
//!
//! #[tokio::main]
//! async fn main() {
//!     let state = AppState::new(RootsConfig::new("/home/me/.config/piggychick/config.jsonc"));
//!     let app = create_router(state);
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3000").await.unwrap();
//!     axum::serve(listener, app).await.unwrap();
//! }
//! ```

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::error::{ConfigError, TasksError};
use crate::events::{sse_response, stream_all, stream_root};
use crate::roots::RootsConfig;
use crate::tasks::{list_roots, read_markdown_by_root, read_plan_by_root};
use crate::types::{RootsListing, SortDirection};
use crate::watch::{RegistryError, WatchRegistry};

/// Document id that selects the plan pair instead of a markdown file.
const PLAN_DOC_ID: &str = "plan";

// ============================================================================
// Application State
// ============================================================================

/// Shared application state for all route handlers.
#[derive(Clone)]
pub struct AppState {
    /// Roots configuration file.
    pub roots: RootsConfig,

    /// Live root watches backing the change streams.
    pub registry: WatchRegistry,

    /// Cancelled on graceful shutdown; every stream holds a child token.
    pub shutdown: CancellationToken,

    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    /// Creates application state with a fresh registry over `roots`.
    #[must_use]
    pub fn new(roots: RootsConfig) -> Self {
        Self::with_registry(WatchRegistry::new(roots))
    }

    /// Creates application state around an existing registry.
    ///
    /// Useful for tests that need a shorter debounce window.
    #[must_use]
    pub fn with_registry(registry: WatchRegistry) -> Self {
        Self {
            roots: registry.config().clone(),
            registry,
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("roots", &self.roots)
            .field("registry", &self.registry.snapshot())
            .field("start_time", &self.start_time)
            .finish()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Creates the application router with all routes configured.
///
/// Unknown paths answer 404 `not_found`; other methods on known paths answer
/// 405 `method_not_allowed`.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/roots", get(get_roots).fallback(method_not_allowed))
        .route(
            "/api/roots/{root_id}/events",
            get(get_root_events).fallback(method_not_allowed),
        )
        .route(
            "/api/roots/{root_id}/prds/{prd_id}/{doc_id}",
            get(get_prd_document).fallback(method_not_allowed),
        )
        .route("/api/events", get(get_all_events).fallback(method_not_allowed))
        .route("/health", get(get_health).fallback(method_not_allowed))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by every failing endpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}

/// Code and message of an [`ErrorResponse`].
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// Failure of a request handler.
#[derive(Debug)]
pub enum ApiError {
    Tasks(TasksError),
    Config(ConfigError),
    Registry(RegistryError),
    NotFound,
    MethodNotAllowed,
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Tasks(err) => err.status(),
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Registry(RegistryError::UnknownRoot(_)) | Self::NotFound => StatusCode::NOT_FOUND,
            Self::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Tasks(err) => err.code(),
            Self::Config(err) | Self::Registry(RegistryError::Config(err)) => err.code(),
            Self::Registry(RegistryError::UnknownRoot(_)) => "invalid_root",
            Self::Registry(RegistryError::Setup(_)) | Self::Internal(_) => "internal_error",
            Self::NotFound => "not_found",
            Self::MethodNotAllowed => "method_not_allowed",
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Tasks(err) => err.to_string(),
            Self::Config(err) => err.to_string(),
            Self::Registry(RegistryError::UnknownRoot(_)) => "Unknown root".to_string(),
            Self::Registry(err) => err.to_string(),
            Self::NotFound => "Not found".to_string(),
            Self::MethodNotAllowed => "Method not allowed".to_string(),
            Self::Internal(_) => "Internal server error".to_string(),
        }
    }
}

impl From<TasksError> for ApiError {
    fn from(err: TasksError) -> Self {
        Self::Tasks(err)
    }
}

impl From<ConfigError> for ApiError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), error = ?self, "Request failed");
        } else {
            debug!(code = self.code(), status = status.as_u16(), "Request rejected");
        }
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.message(),
            },
        };
        (status, Json(body)).into_response()
    }
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

/// Runs blocking filesystem work off the async workers.
async fn run_blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?
}

// ============================================================================
// GET /api/roots
// ============================================================================

/// Query parameters for `GET /api/roots`.
#[derive(Debug, Default, Deserialize)]
pub struct RootsQuery {
    #[serde(rename = "prdSort")]
    pub prd_sort: Option<String>,
}

async fn get_roots(
    State(state): State<AppState>,
    Query(query): Query<RootsQuery>,
) -> Result<Json<RootsListing>, ApiError> {
    let direction = SortDirection::parse(query.prd_sort.as_deref());
    let config = state.roots.clone();
    let listing = run_blocking(move || {
        let roots = config.load_roots()?;
        Ok(list_roots(&roots, direction)?)
    })
    .await?;
    debug!(roots = listing.roots.len(), sort = %direction, "Listed roots");
    Ok(Json(listing))
}

// ============================================================================
// GET /api/roots/{rootId}/prds/{prdId}/{docId}
// ============================================================================

async fn get_prd_document(
    State(state): State<AppState>,
    Path((root_id, prd_id, doc_id)): Path<(String, String, String)>,
) -> Result<Response, ApiError> {
    let config = state.roots.clone();
    run_blocking(move || {
        let roots = config.load_roots()?;
        if doc_id == PLAN_DOC_ID {
            let plan = read_plan_by_root(&roots, &root_id, &prd_id)?;
            Ok(Json(plan).into_response())
        } else {
            let doc = read_markdown_by_root(&roots, &root_id, &prd_id, &doc_id)?;
            Ok(Json(doc).into_response())
        }
    })
    .await
}

// ============================================================================
// Change streams
// ============================================================================

async fn get_root_events(
    State(state): State<AppState>,
    Path(root_id): Path<String>,
) -> Result<Response, ApiError> {
    let stream = stream_root(&state.registry, &root_id, state.shutdown.child_token()).await?;
    Ok(sse_response(stream))
}

async fn get_all_events(State(state): State<AppState>) -> Response {
    sse_response(stream_all(&state.registry, state.shutdown.child_token()))
}

// ============================================================================
// GET /health
// ============================================================================

/// Health check response body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok`, or `config_error` when the roots file cannot be loaded.
    pub status: String,

    /// Number of configured roots.
    pub roots: usize,

    /// Roots with a live watch entry.
    pub watched_roots: usize,

    /// Subscriber attachments across all watched roots.
    pub subscribers: usize,

    /// Open OS watchers.
    pub watchers: usize,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let config = state.roots.clone();
    let configured = run_blocking(move || Ok(config.load_roots()?.len())).await;
    let snapshot = state.registry.snapshot();

    Json(HealthResponse {
        status: if configured.is_ok() { "ok" } else { "config_error" }.to_string(),
        roots: configured.unwrap_or(0),
        watched_roots: snapshot.roots,
        subscribers: snapshot.subscribers,
        watchers: snapshot.watchers,
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use std::fs;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn empty_state() -> (TempDir, AppState) {
        let tmp = TempDir::new().unwrap();
        let state = AppState::new(RootsConfig::new(tmp.path().join("config.jsonc")));
        (tmp, state)
    }

    async fn send(app: Router, method: &str, uri: &str) -> Response {
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn error_code(response: Response) -> String {
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        error.error.code
    }

    #[tokio::test]
    async fn health_returns_ok_status() {
        let (_tmp, state) = empty_state();
        let response = send(create_router(state), "GET", "/health").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "ok");
        assert_eq!(health.roots, 0);
        assert_eq!(health.watched_roots, 0);
        assert_eq!(health.subscribers, 0);
    }

    #[tokio::test]
    async fn health_reports_config_errors() {
        let (tmp, state) = empty_state();
        fs::write(tmp.path().join("config.jsonc"), "{ not json").unwrap();
        let response = send(create_router(state), "GET", "/health").await;

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.status, "config_error");
    }

    #[tokio::test]
    async fn empty_config_lists_no_roots() {
        let (_tmp, state) = empty_state();
        let response = send(create_router(state), "GET", "/api/roots").await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let listing: RootsListing = serde_json::from_slice(&body).unwrap();
        assert!(listing.roots.is_empty());
    }

    #[tokio::test]
    async fn config_errors_surface_with_their_code() {
        let (tmp, state) = empty_state();
        fs::write(tmp.path().join("config.jsonc"), r#"{"roots": 5}"#).unwrap();
        let response = send(create_router(state), "GET", "/api/roots").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(error_code(response).await, "config_invalid");
    }

    #[tokio::test]
    async fn unknown_api_path_is_not_found() {
        let (_tmp, state) = empty_state();
        let response = send(create_router(state), "GET", "/api/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(response).await, "not_found");
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let (_tmp, state) = empty_state();
        let response = send(create_router(state), "POST", "/api/roots").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(error_code(response).await, "method_not_allowed");
    }

    #[tokio::test]
    async fn unknown_root_document_is_invalid_root() {
        let (_tmp, state) = empty_state();
        let response = send(
            create_router(state),
            "GET",
            "/api/roots/0123456789ab/prds/alpha/plan",
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(response).await, "invalid_root");
    }

    #[tokio::test]
    async fn unknown_root_events_is_invalid_root() {
        let (_tmp, state) = empty_state();
        let registry = state.registry.clone();
        let response = send(create_router(state), "GET", "/api/roots/0123456789ab/events").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(error_code(response).await, "invalid_root");
        assert_eq!(registry.snapshot().roots, 0);
    }

    #[tokio::test]
    async fn global_stream_sets_sse_headers() {
        let (_tmp, state) = empty_state();
        let response = send(create_router(state), "GET", "/api/events").await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["content-type"], "text/event-stream");
        assert_eq!(headers["cache-control"], "no-cache");
        assert_eq!(headers["x-accel-buffering"], "no");
    }

    #[test]
    fn api_error_mapping() {
        let err = ApiError::from(RegistryError::UnknownRoot("x".into()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);
        assert_eq!(err.code(), "invalid_root");

        let err = ApiError::from(RegistryError::Config(ConfigError::Parse("bad".into())));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.code(), "config_parse_error");

        let err = ApiError::from(TasksError::InvalidDoc);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "invalid_doc");
    }
}
