//! Error handling and JSON error responses for the gateway front

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Seconds clients are told to wait before retrying while the gateway starts
pub const STARTING_RETRY_SECS: u64 = 5;

/// Error codes for responses produced by this service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Gateway process could not be created
    SpawnFailed,
    /// Gateway is still starting
    Starting,
    /// No acceptable credentials
    Unauthorized,
    /// Credentials present but not accepted
    Forbidden,
    /// Another sync is running
    SyncInProgress,
    /// Durable storage is not mounted or not configured
    StorageUnavailable,
    /// Failed to connect to the gateway
    ConnectionFailed,
    /// Route or resource does not exist
    NotFound,
    /// Malformed request
    BadRequest,
    /// Internal error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::SpawnFailed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Starting => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::SyncInProgress => StatusCode::CONFLICT,
            ErrorCode::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::SpawnFailed => "SPAWN_FAILED",
            ErrorCode::Starting => "STARTING",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::SyncInProgress => "SYNC_IN_PROGRESS",
            ErrorCode::StorageUnavailable => "STORAGE_UNAVAILABLE",
            ErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Retry hint for transient failures
    fn retry_after(&self) -> Option<u64> {
        match self {
            ErrorCode::SpawnFailed | ErrorCode::Starting => Some(STARTING_RETRY_SECS),
            _ => None,
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

pub type ResponseBody = BoxBody<Bytes, hyper::Error>;

/// Wrap bytes into the boxed body type used by every handler
pub fn full_body(data: impl Into<Bytes>) -> ResponseBody {
    Full::new(data.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with X-Gateway-Error header
pub fn json_error_response(code: ErrorCode, message: impl Into<String>) -> Response<ResponseBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    let mut builder = Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value());
    if let Some(secs) = code.retry_after() {
        builder = builder.header("Retry-After", secs.to_string());
    }

    builder
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// JSON success response
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<ResponseBody> {
    match serde_json::to_vec(value) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(full_body(body))
            .expect("valid response builder"),
        Err(e) => json_error_response(ErrorCode::InternalError, format!("serialization failed: {}", e)),
    }
}

const STARTING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="utf-8">
<title>Starting up</title>
<style>
body { font-family: system-ui, sans-serif; display: flex; align-items: center; justify-content: center; height: 100vh; margin: 0; background: #111; color: #eee; }
.box { text-align: center; }
</style>
</head>
<body>
<div class="box">
<h1>Starting up</h1>
<p>The gateway is starting. This page reloads automatically.</p>
</div>
</body>
</html>
"#;

/// Retryable "starting up" response: HTML for browsers, JSON otherwise
pub fn starting_response(wants_html: bool) -> Response<ResponseBody> {
    if !wants_html {
        return json_error_response(ErrorCode::Starting, "Gateway is starting, retry shortly");
    }

    Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header("Content-Type", "text/html; charset=utf-8")
        .header("Cache-Control", "no-store")
        .header("Retry-After", STARTING_RETRY_SECS.to_string())
        .header("Refresh", STARTING_RETRY_SECS.to_string())
        .header("X-Gateway-Error", ErrorCode::Starting.as_header_value())
        .body(full_body(STARTING_PAGE))
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ErrorCode::SpawnFailed.status_code(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(ErrorCode::Unauthorized.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::Forbidden.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::SyncInProgress.status_code(), StatusCode::CONFLICT);
        assert_eq!(ErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ErrorCode::SyncInProgress, "A sync is already running");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"SYNC_IN_PROGRESS\""));
        assert!(json.contains("\"message\":\"A sync is already running\""));
        assert!(json.contains("\"status\":409"));
    }

    #[test]
    fn test_spawn_failure_has_retry_hint() {
        let response = json_error_response(ErrorCode::SpawnFailed, "Gateway unavailable");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("X-Gateway-Error").unwrap(), "SPAWN_FAILED");
        assert_eq!(response.headers().get("Retry-After").unwrap(), "5");

        let response = json_error_response(ErrorCode::Unauthorized, "Unauthorized");
        assert!(response.headers().get("Retry-After").is_none());
    }

    #[test]
    fn test_starting_response_variants() {
        let html = starting_response(true);
        assert_eq!(html.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(html
            .headers()
            .get("Content-Type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html"));
        assert_eq!(html.headers().get("Refresh").unwrap(), "5");

        let json = starting_response(false);
        assert_eq!(json.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(json.headers().get("X-Gateway-Error").unwrap(), "STARTING");
    }
}
