//! Defines the Axum API routes and handlers.

use crate::orchestrator::{Orchestrator, SubmitError, SubmitErrorKind};
use crate::web::auth::require_basic_auth;
use crate::web::models::{ErrorResponse, SubmitAccepted};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use makeme_shared::config::Config;
use makeme_shared::{AuthBackend, PrintRequest, StaticCredentials};
use std::sync::Arc;

pub const PRINTING_MESSAGE: &str = "Looks like it's printing correctly";

pub struct AppStateInner {
    pub orchestrator: Orchestrator,
    pub auth_backend: Box<dyn AuthBackend>,
}
pub type AppState = Arc<AppStateInner>;

/// Helper to create a JSON error response with a message and status code
fn json_error(message: &str, kind: &str, status: StatusCode) -> Response {
    let body = ErrorResponse {
        error: message.to_string(),
        kind: kind.to_string(),
        lock: None,
    };
    (status, Json(body)).into_response()
}

/// Creates the Axum router with all the API endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/print", post(print_handler))
        .route("/api/v1/status", get(status_handler))
        .route("/api/v1/log", get(log_handler))
        .route("/api/v1/current_model", get(current_model_handler))
        .with_state(state)
}

/// Router wired from configuration, with credentials from config or environment.
pub fn app(config: &Config) -> Result<Router, Box<dyn std::error::Error + Send + Sync + 'static>> {
    let orchestrator = Orchestrator::from_config(config)?;
    let (username, password) = config.server.credentials();
    let auth_backend = Box::new(StaticCredentials::new(username, password));
    Ok(create_router(Arc::new(AppStateInner {
        orchestrator,
        auth_backend,
    })))
}

pub fn status_code(kind: SubmitErrorKind) -> StatusCode {
    match kind {
        SubmitErrorKind::Conflict => StatusCode::LOCKED,
        SubmitErrorKind::InvalidInput => StatusCode::NOT_ACCEPTABLE,
        SubmitErrorKind::Normalize => StatusCode::CONFLICT,
        SubmitErrorKind::Fetch => StatusCode::BAD_GATEWAY,
        SubmitErrorKind::Config
        | SubmitErrorKind::Launch
        | SubmitErrorKind::EarlyExit
        | SubmitErrorKind::Lock => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn submit_error_response(err: SubmitError) -> Response {
    let kind = err.kind();
    let lock = match &err {
        SubmitError::AlreadyLocked(lock) => Some(lock.clone()),
        _ => None,
    };
    let body = ErrorResponse {
        error: err.to_string(),
        kind: kind.as_str().to_string(),
        lock,
    };
    (status_code(kind), Json(body)).into_response()
}

/// POST /api/v1/print -- submit a print job. An empty body means all defaults.
async fn print_handler(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Err(response) = require_basic_auth(state.auth_backend.as_ref(), &headers).await {
        return response;
    }
    let request: PrintRequest = if body.iter().all(u8::is_ascii_whitespace) {
        PrintRequest::default()
    } else {
        match serde_json::from_slice(&body) {
            Ok(request) => request,
            Err(e) => return json_error(&format!("Invalid request body: {}", e), "bad_request", StatusCode::BAD_REQUEST),
        }
    };

    match state.orchestrator.submit(request).await {
        Ok(accepted) => {
            let body = SubmitAccepted {
                result: PRINTING_MESSAGE.to_string(),
                job_id: accepted.job_id,
                pid: accepted.pid,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => {
            tracing::warn!("Print submission failed ({}): {}", err.kind().as_str(), err);
            submit_error_response(err)
        }
    }
}

/// GET /api/v1/status
async fn status_handler(State(state): State<AppState>) -> Response {
    match state.orchestrator.status().await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(e) => json_error(&e.to_string(), "status", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/log -- raw job log
async fn log_handler(State(state): State<AppState>) -> Response {
    match state.orchestrator.progress().read_log().await {
        Ok(log) => ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log).into_response(),
        Err(e) => json_error(&e.to_string(), "log", StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// GET /api/v1/current_model -- the last normalized model
async fn current_model_handler(State(state): State<AppState>) -> Response {
    let path = &state.orchestrator.paths().current_model_file;
    match tokio::fs::read(path).await {
        Ok(bytes) => ([(header::CONTENT_TYPE, "application/sla")], bytes).into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => (StatusCode::NOT_FOUND, "not found").into_response(),
        Err(e) => json_error(&e.to_string(), "current_model", StatusCode::INTERNAL_SERVER_ERROR),
    }
}
