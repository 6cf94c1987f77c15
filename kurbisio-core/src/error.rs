//! The shared HTTP error taxonomy.
//!
//! Every handler and middleware in the system reports failures as an
//! [`ApiError`]. The wire contract is plain text with a short message;
//! internal failures additionally carry a stable four-digit code
//! (`Error 4723: …`) that is logged together with the underlying cause so
//! operators can correlate a client report with the structured log entry
//! without leaking the cause to the client.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

/// Content type of every JSON body the system emits.
pub const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Build a JSON response with the canonical content type.
pub fn json_response(status: StatusCode, body: &serde_json::Value) -> Response {
    (
        status,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(CONTENT_TYPE_JSON),
        )],
        body.to_string(),
    )
        .into_response()
}

pub enum ApiError {
    /// Malformed JSON, missing required property, parent-id mismatch,
    /// missing selector.
    BadRequest(String),
    /// Missing or invalid credentials. Failed permit evaluation renders
    /// identically, to avoid information leakage.
    Unauthorized(String),
    Forbidden(String),
    /// Row or ancestor row absent.
    NotFound(String),
    /// Unrecognized method on an existing route.
    MethodNotAllowed,
    /// Unique-constraint violation; carries the current conflicting row,
    /// returned as the response body.
    Conflict(serde_json::Value),
    /// Storage, key-generation or I/O failure. The message is logged, never
    /// sent; the client sees only the code.
    Internal { code: u16, message: String },
}

impl ApiError {
    /// Wrap an internal failure with a fresh four-digit error code.
    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal {
            code: rand::random::<u16>() % 9000 + 1000,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg).into_response(),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg).into_response(),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg).into_response(),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg).into_response(),
            ApiError::MethodNotAllowed => {
                (StatusCode::METHOD_NOT_ALLOWED, "method not allowed").into_response()
            }
            ApiError::Conflict(row) => json_response(StatusCode::CONFLICT, &row),
            ApiError::Internal { code, message } => {
                error!(code, error = %message, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Error {code}: internal server error"),
                )
                    .into_response()
            }
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::BadRequest(msg) => write!(f, "Bad Request: {msg}"),
            ApiError::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            ApiError::Forbidden(msg) => write!(f, "Forbidden: {msg}"),
            ApiError::NotFound(msg) => write!(f, "Not Found: {msg}"),
            ApiError::MethodNotAllowed => write!(f, "Method Not Allowed"),
            ApiError::Conflict(_) => write!(f, "Conflict"),
            ApiError::Internal { code, message } => write!(f, "Error {code}: {message}"),
        }
    }
}

impl std::fmt::Debug for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        <Self as std::fmt::Display>::fmt(self, f)
    }
}

impl std::error::Error for ApiError {}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn parts(err: ApiError) -> (StatusCode, String) {
        let resp = err.into_response();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn bad_request_is_plain_text() {
        let (status, body) = parts(ApiError::BadRequest("invalid json".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "invalid json");
    }

    #[tokio::test]
    async fn internal_hides_the_cause() {
        let (status, body) = parts(ApiError::internal("pool exhausted")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body.starts_with("Error "));
        assert!(!body.contains("pool exhausted"));
    }

    #[tokio::test]
    async fn conflict_returns_the_existing_row() {
        let row = serde_json::json!({"a_id": "x", "external_id": "e1"});
        let resp = ApiError::Conflict(row.clone()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_JSON
        );
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, row);
    }
}
