//! Error taxonomy and JSON error responses for the proxy

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Why a backend could not be brought up for a session.
///
/// `Clone` so one provisioning outcome can be handed to every caller waiting
/// on the same identity.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    /// Environment preparation or process launch failed
    #[error("provisioning failed: {0}")]
    Provisioning(String),
    /// The process never accepted connections on its port
    #[error("backend did not accept connections on port {port} within {}s", .timeout.as_secs())]
    ReadinessTimeout { port: u16, timeout: Duration },
}

impl ProvisionError {
    pub fn provisioning(msg: impl Into<String>) -> Self {
        ProvisionError::Provisioning(msg.into())
    }

    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ProvisionError::Provisioning(_) => ProxyErrorCode::ProvisioningFailed,
            ProvisionError::ReadinessTimeout { .. } => ProxyErrorCode::ReadinessTimeout,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No registry entry for the caller, or its process has exited
    SessionNotLive,
    /// Login form body could not be read
    InvalidForm,
    /// Login form body exceeds the size limit
    FormTooLarge,
    /// Submitted endpoint could not be normalized
    InvalidEndpoint,
    /// Login form without a credential
    MissingCredential,
    /// Environment preparation or process launch failed
    ProvisioningFailed,
    /// Backend never opened its port
    ReadinessTimeout,
    /// A live backend refused or dropped the connection
    UpstreamTransport,
    /// Backend did not answer in time
    RequestTimeout,
    /// No route matched
    NotFound,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::SessionNotLive => StatusCode::NOT_FOUND,
            ProxyErrorCode::InvalidForm => StatusCode::BAD_REQUEST,
            ProxyErrorCode::FormTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyErrorCode::InvalidEndpoint => StatusCode::BAD_REQUEST,
            ProxyErrorCode::MissingCredential => StatusCode::BAD_REQUEST,
            ProxyErrorCode::ProvisioningFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::ReadinessTimeout => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::UpstreamTransport => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::SessionNotLive => "SESSION_NOT_LIVE",
            ProxyErrorCode::InvalidForm => "INVALID_FORM",
            ProxyErrorCode::FormTooLarge => "FORM_TOO_LARGE",
            ProxyErrorCode::InvalidEndpoint => "INVALID_ENDPOINT",
            ProxyErrorCode::MissingCredential => "MISSING_CREDENTIAL",
            ProxyErrorCode::ProvisioningFailed => "PROVISIONING_FAILED",
            ProxyErrorCode::ReadinessTimeout => "READINESS_TIMEOUT",
            ProxyErrorCode::UpstreamTransport => "UPSTREAM_TRANSPORT",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// WebSocket close code for an absent or expired session
pub const CLOSE_SESSION_EXPIRED: u16 = 4401;
/// WebSocket close code when the backend cannot be reached
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::SessionNotLive.status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ProxyErrorCode::InvalidForm.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ProxyErrorCode::FormTooLarge.status_code(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyErrorCode::UpstreamTransport.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::ProvisioningFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::UpstreamTransport, "Upstream error: connection refused");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"UPSTREAM_TRANSPORT\""));
        assert!(json.contains("\"message\":\"Upstream error: connection refused\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(ProxyErrorCode::InvalidEndpoint, "endpoint is required");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "INVALID_ENDPOINT"
        );
    }

    #[test]
    fn test_provision_error_codes_and_messages() {
        let err = ProvisionError::provisioning("prepare step `uv sync` exited with status 1");
        assert_eq!(err.code(), ProxyErrorCode::ProvisioningFailed);
        assert!(err.to_string().starts_with("provisioning failed:"));

        let err = ProvisionError::ReadinessTimeout {
            port: 41000,
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.code(), ProxyErrorCode::ReadinessTimeout);
        assert_eq!(
            err.to_string(),
            "backend did not accept connections on port 41000 within 30s"
        );
    }
}
