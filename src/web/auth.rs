//! HTTP Basic authentication for the submission endpoint.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use makeme_shared::AuthBackend;

use super::models::ErrorResponse;

pub const REALM: &str = "The 3rd Dimension";

/// Check the request's Basic credentials against `backend`.
pub async fn require_basic_auth(backend: &dyn AuthBackend, headers: &HeaderMap) -> Result<(), Response> {
    let Some(Authorization(basic)) = headers.typed_get::<Authorization<Basic>>() else {
        return Err(unauthorized());
    };
    if backend.validate(basic.username(), basic.password()).await {
        Ok(())
    } else {
        tracing::warn!("Rejected print submission for user '{}'", basic.username());
        Err(unauthorized())
    }
}

fn unauthorized() -> Response {
    let body = Json(ErrorResponse {
        error: "Not authorized".to_string(),
        kind: "unauthorized".to_string(),
        lock: None,
    });
    let mut response = (StatusCode::UNAUTHORIZED, body).into_response();
    if let Ok(challenge) = HeaderValue::from_str(&format!("Basic realm=\"{}\"", REALM)) {
        response.headers_mut().insert(header::WWW_AUTHENTICATE, challenge);
    }
    response
}
