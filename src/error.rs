//! Error taxonomy and JSON error responses for the playground

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Errors raised by the supervisor, the share store and request validation
#[derive(Debug, thiserror::Error)]
pub enum PlaygroundError {
    /// A submitted document is not well-formed JSON
    #[error("{0}")]
    InvalidInput(String),

    /// The route definition has no usable `proxy.listen_path`
    #[error("empty or missing listen_path")]
    MissingRoute,

    /// The gateway binary could not be started
    #[error("failed to launch gateway '{command}': {source}")]
    LaunchFailure {
        command: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a configuration file for the gateway failed
    #[error("failed to write {}: {source}", path.display())]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No shared configuration exists under this name
    #[error("no shared configuration named '{0}'")]
    NotFound(String),

    /// A different configuration is already stored under the same short name
    #[error("share name '{0}' already holds a different configuration")]
    ShareCollision(String),

    /// The share store could not read or write a record
    #[error("share store error: {0}")]
    Storage(#[from] std::io::Error),

    /// A supervisor task ended without reporting back
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlaygroundError {
    /// The response code this error is reported with
    pub fn code(&self) -> ErrorCode {
        match self {
            PlaygroundError::InvalidInput(_) => ErrorCode::InvalidInput,
            PlaygroundError::MissingRoute => ErrorCode::MissingRoute,
            PlaygroundError::LaunchFailure { .. } => ErrorCode::LaunchFailure,
            PlaygroundError::ConfigWrite { .. } => ErrorCode::ConfigWrite,
            PlaygroundError::NotFound(_) => ErrorCode::NotFound,
            PlaygroundError::ShareCollision(_) => ErrorCode::ShareCollision,
            PlaygroundError::Storage(_) => ErrorCode::InternalError,
            PlaygroundError::Internal(_) => ErrorCode::InternalError,
        }
    }

    /// Render this error as a JSON response
    pub fn into_response(self) -> Response<BoxBody<Bytes, hyper::Error>> {
        json_error_response(self.code(), self.to_string())
    }
}

/// Error codes reported to HTTP clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Submitted document is not valid JSON
    InvalidInput,
    /// Route definition lacks a listen path
    MissingRoute,
    /// Gateway process failed to start
    LaunchFailure,
    /// Gateway configuration files could not be written
    ConfigWrite,
    /// Unknown share name or route
    NotFound,
    /// Short share name already taken by other content
    ShareCollision,
    /// Request body exceeds the configured limit
    PayloadTooLarge,
    /// Upstream gateway could not be reached
    UpstreamUnavailable,
    /// Upstream gateway did not answer in time
    RequestTimeout,
    /// Internal playground error
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidInput => StatusCode::BAD_REQUEST,
            ErrorCode::MissingRoute => StatusCode::BAD_REQUEST,
            ErrorCode::LaunchFailure => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::ConfigWrite => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ShareCollision => StatusCode::CONFLICT,
            ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ErrorCode::UpstreamUnavailable => StatusCode::BAD_GATEWAY,
            ErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Playground-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorCode::InvalidInput => "INVALID_INPUT",
            ErrorCode::MissingRoute => "MISSING_ROUTE",
            ErrorCode::LaunchFailure => "LAUNCH_FAILURE",
            ErrorCode::ConfigWrite => "CONFIG_WRITE",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ShareCollision => "SHARE_COLLISION",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ErrorCode,
    pub message: String,
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

    /// Convert to JSON string
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

/// Create a JSON error response with an X-Playground-Error header
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Playground-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
