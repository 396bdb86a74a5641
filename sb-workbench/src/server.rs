use std::{
    io,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use assistant::{AssistantClient, AssistantError};
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State, WebSocketUpgrade},
    http::{StatusCode, header::CONTENT_TYPE},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use device::{
    RelayError, SKETCH_EXTENSION, SharedRelayRegistry, ToolRunReport, ToolchainError,
    ToolchainInvoker, new_relay_registry,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

mod handlers;
mod sketches;

pub use sketches::{SketchEntry, StoreError};
use sketches::{SketchStore, TemplateStore};

mod embedded_webui {
    include!(concat!(env!("OUT_DIR"), "/embedded_webui.rs"));
}

#[derive(Clone, Debug)]
pub struct WorkbenchConfig {
    pub sketch_dir: PathBuf,
    pub template_dir: PathBuf,
    pub toolchain: device::ToolchainConfig,
    pub assistant: assistant::AssistantConfig,
}

impl Default for WorkbenchConfig {
    fn default() -> Self {
        Self {
            sketch_dir: PathBuf::from(".sketchbench/sketches"),
            template_dir: PathBuf::from(".sketchbench/templates"),
            toolchain: device::ToolchainConfig::default(),
            assistant: assistant::AssistantConfig::default(),
        }
    }
}

#[derive(Clone)]
pub struct WorkbenchState {
    sketches: Arc<SketchStore>,
    templates: Arc<TemplateStore>,
    relay: SharedRelayRegistry,
    toolchain: ToolchainInvoker,
    assistant: AssistantClient,
    metrics: Arc<WorkbenchMetrics>,
}

impl WorkbenchState {
    pub fn new(config: WorkbenchConfig) -> io::Result<Self> {
        let sketches = SketchStore::new(config.sketch_dir)?;
        let templates = TemplateStore::new(config.template_dir)?;
        Ok(Self {
            sketches: Arc::new(sketches),
            templates: Arc::new(templates),
            relay: new_relay_registry(),
            toolchain: ToolchainInvoker::new(config.toolchain),
            assistant: AssistantClient::new(config.assistant),
            metrics: Arc::new(WorkbenchMetrics::default()),
        })
    }

    pub fn relay_registry(&self) -> &SharedRelayRegistry {
        &self.relay
    }

    pub fn toolchain(&self) -> &ToolchainInvoker {
        &self.toolchain
    }
}

struct WorkbenchMetrics {
    started_at: Instant,
    sketch_writes_total: AtomicU64,
    sketch_deletes_total: AtomicU64,
    compile_requests_total: AtomicU64,
    compile_failures_total: AtomicU64,
    upload_requests_total: AtomicU64,
    upload_failures_total: AtomicU64,
    relay_sessions_opened_total: AtomicU64,
    relay_sessions_denied_total: AtomicU64,
    assistant_requests_total: AtomicU64,
    assistant_failures_total: AtomicU64,
}

impl Default for WorkbenchMetrics {
    fn default() -> Self {
        Self {
            started_at: Instant::now(),
            sketch_writes_total: AtomicU64::new(0),
            sketch_deletes_total: AtomicU64::new(0),
            compile_requests_total: AtomicU64::new(0),
            compile_failures_total: AtomicU64::new(0),
            upload_requests_total: AtomicU64::new(0),
            upload_failures_total: AtomicU64::new(0),
            relay_sessions_opened_total: AtomicU64::new(0),
            relay_sessions_denied_total: AtomicU64::new(0),
            assistant_requests_total: AtomicU64::new(0),
            assistant_failures_total: AtomicU64::new(0),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
struct StatusResponse {
    status: &'static str,
}

#[derive(Clone, Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Clone, Debug, Serialize)]
struct BoardListResponse {
    boards: Vec<device::BoardProfile>,
}

#[derive(Clone, Debug, Serialize)]
struct SketchListResponse {
    sketches: Vec<SketchEntry>,
}

#[derive(Clone, Debug, Serialize)]
struct SketchResponse {
    name: String,
    content: String,
}

#[derive(Clone, Debug, Deserialize)]
struct SaveSketchRequest {
    content: String,
}

#[derive(Clone, Debug, Serialize)]
struct SavedSketchResponse {
    name: String,
    saved_unix_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
struct DeletedSketchResponse {
    name: String,
    deleted: bool,
}

#[derive(Clone, Debug, Serialize)]
struct TemplateListResponse {
    templates: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
struct TemplateResponse {
    name: String,
    content: String,
}

#[derive(Clone, Debug, Deserialize)]
struct CompileRequest {
    sketch: String,
    board: String,
}

#[derive(Clone, Debug, Deserialize)]
struct UploadRequest {
    sketch: String,
    board: String,
    port: String,
}

// Tool failures are reported, not raised: the response carries the captured
// output verbatim and `success` tells the caller what happened.
#[derive(Clone, Debug, Serialize)]
struct ToolResponse {
    success: bool,
    message: String,
    exit_code: Option<i32>,
    output: String,
    error: String,
}

#[derive(Clone, Debug, Deserialize)]
struct GenerateRequest {
    prompt: String,
}

#[derive(Clone, Debug, Serialize)]
struct GenerateResponse {
    code: String,
    model: String,
}

#[derive(Clone, Debug, Deserialize)]
struct ReviewRequest {
    code: String,
}

#[derive(Clone, Debug, Serialize)]
struct ReviewResponse {
    review: String,
    model: String,
}

#[derive(Clone, Debug, Serialize)]
struct ModelListResponse {
    models: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, Deserialize)]
struct SerialQuery {
    port: String,
    #[serde(default)]
    baud: Option<u32>,
}

pub fn build_workbench_app(state: WorkbenchState) -> Router {
    Router::new()
        .route("/healthz", get(handlers::healthz_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/ui", get(handlers::ui_index_handler))
        .route("/ui/", get(handlers::ui_index_handler))
        .route("/ui/{*path}", get(handlers::ui_asset_handler))
        .route("/v1/boards", get(handlers::list_boards_handler))
        .route("/v1/ports", get(handlers::list_ports_handler))
        .route("/v1/sketches", get(handlers::list_sketches_handler))
        .route(
            "/v1/sketches/{name}",
            get(handlers::get_sketch_handler)
                .put(handlers::save_sketch_handler)
                .delete(handlers::delete_sketch_handler),
        )
        .route("/v1/templates", get(handlers::list_templates_handler))
        .route("/v1/templates/{name}", get(handlers::get_template_handler))
        .route("/v1/compile", post(handlers::compile_handler))
        .route("/v1/upload", post(handlers::upload_handler))
        .route(
            "/v1/assistant/generate",
            post(handlers::assistant_generate_handler),
        )
        .route(
            "/v1/assistant/review",
            post(handlers::assistant_review_handler),
        )
        .route(
            "/v1/assistant/models",
            get(handlers::assistant_models_handler),
        )
        .route("/ws/v1/serial", get(handlers::serial_ws_handler))
        .layer(middleware::from_fn(handlers::access_log_middleware))
        .with_state(state)
}

fn webui_content_type(path: &str) -> &'static str {
    match path.rsplit('.').next() {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn bad_request(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn not_found(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn conflict(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

fn bad_gateway(message: String) -> (StatusCode, Json<ErrorResponse>) {
    (StatusCode::BAD_GATEWAY, Json(ErrorResponse { error: message }))
}

fn internal_error(message: String) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse { error: message }),
    )
}

fn store_error_response(err: StoreError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        StoreError::NotFound(_) => not_found(&err.to_string()),
        StoreError::InvalidName(_) => bad_request(&err.to_string()),
        StoreError::Io(_) => internal_error(err.to_string()),
    }
}

fn toolchain_error_response(err: ToolchainError) -> (StatusCode, Json<ErrorResponse>) {
    match &err {
        ToolchainError::UnsupportedBoard(_) => bad_request(&err.to_string()),
        ToolchainError::Launch { .. } => bad_gateway(err.to_string()),
        ToolchainError::TimedOut { .. } => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ErrorResponse {
                error: err.to_string(),
            }),
        ),
        ToolchainError::Stage { .. } => internal_error(err.to_string()),
    }
}

fn relay_error_response(err: &RelayError) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        RelayError::PortBusy(_) => conflict(&err.to_string()),
        RelayError::PortNotFound(_) => not_found(&err.to_string()),
        RelayError::InvalidBaud(_) => bad_request(&err.to_string()),
        RelayError::Open { .. } | RelayError::SessionClosed => bad_gateway(err.to_string()),
    }
}

fn assistant_error_response(err: AssistantError) -> (StatusCode, Json<ErrorResponse>) {
    bad_gateway(err.to_string())
}

fn tool_response(report: ToolRunReport, phase: &str) -> ToolResponse {
    ToolResponse {
        success: report.success,
        message: if report.success {
            format!("{phase} succeeded")
        } else {
            format!("{phase} failed")
        },
        exit_code: report.exit_code,
        output: report.stdout,
        error: report.stderr,
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}
