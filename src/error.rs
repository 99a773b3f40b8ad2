//! Error types and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Reasons a configured backend address is rejected
#[derive(Debug, Error)]
pub enum AddressError {
    #[error("backend address is empty")]
    Empty,
    #[error("backend address '{address}' is not a valid URL: {source}")]
    Malformed {
        address: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error("backend address '{0}' must be an absolute URL with a scheme")]
    MissingScheme(String),
    #[error("backend address '{address}' uses unsupported scheme '{scheme}' (only http is supported)")]
    UnsupportedScheme { address: String, scheme: String },
    #[error("backend address '{0}' has no host")]
    MissingHost(String),
}

/// Failure while exchanging a request with a backend
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("upstream client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
    #[error("upstream did not respond within {}s", .0.as_secs())]
    Timeout(Duration),
}

/// Failure to serve a request through the dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("at least one backend is required")]
    NoBackends,
    #[error("none of the {total} backends is eligible")]
    NoEligibleBackend { total: usize },
    #[error("forwarding to {address} failed: {source}")]
    Forward {
        address: String,
        #[source]
        source: ForwardError,
    },
}

impl DispatchError {
    /// Map the failure onto the error code reported to the caller
    pub fn error_code(&self) -> ProxyErrorCode {
        match self {
            DispatchError::NoBackends | DispatchError::NoEligibleBackend { .. } => {
                ProxyErrorCode::NoEligibleBackend
            }
            DispatchError::Forward {
                source: ForwardError::Timeout(_),
                ..
            } => ProxyErrorCode::RequestTimeout,
            DispatchError::Forward {
                source: ForwardError::RequestBuild(_),
                ..
            } => ProxyErrorCode::InternalError,
            DispatchError::Forward { .. } => ProxyErrorCode::ConnectionFailed,
        }
    }

    /// Message safe to return to the caller (no upstream addresses)
    pub fn public_message(&self) -> String {
        match self {
            DispatchError::NoBackends | DispatchError::NoEligibleBackend { .. } => {
                "No backend is available to serve the request".to_string()
            }
            DispatchError::Forward {
                source: ForwardError::Timeout(timeout),
                ..
            } => format!("Request timed out after {} seconds", timeout.as_secs()),
            DispatchError::Forward {
                source: ForwardError::RequestBuild(_),
                ..
            } => "Failed to build upstream request".to_string(),
            DispatchError::Forward { .. } => "Failed to connect to backend".to_string(),
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No backend currently eligible to receive traffic
    NoEligibleBackend,
    /// Request timed out waiting for backend
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::NoEligibleBackend => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::NoEligibleBackend => "NO_ELIGIBLE_BACKEND",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
