//! Error taxonomy and JSON error envelopes for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Version marker carried in every envelope
pub const API_VERSION: &str = "1.0";

/// Response body type shared by the pipeline, the proxy and the admin API
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

/// Error codes surfaced to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorCode {
    /// No route matches the request path
    RouteNotFound,
    /// A route matched but the method is not in its allowed set
    MethodNotAllowed,
    /// The routed service has no instance able to take the request
    ServiceUnavailable,
    /// The backend failed at the transport level
    ProxyError,
    /// The client exceeded its request budget
    RateLimitExceeded,
    /// Missing or invalid credentials in strict auth mode
    Unauthorized,
    /// Bad input to the registry API
    BadRequest,
    /// Internal gateway error
    InternalError,
}

impl GatewayErrorCode {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayErrorCode::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayErrorCode::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayErrorCode::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayErrorCode::ProxyError => StatusCode::BAD_GATEWAY,
            GatewayErrorCode::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            GatewayErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            GatewayErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            GatewayErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gateway-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GatewayErrorCode::RouteNotFound => "ROUTE_NOT_FOUND",
            GatewayErrorCode::MethodNotAllowed => "METHOD_NOT_ALLOWED",
            GatewayErrorCode::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            GatewayErrorCode::ProxyError => "PROXY_ERROR",
            GatewayErrorCode::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            GatewayErrorCode::Unauthorized => "UNAUTHORIZED",
            GatewayErrorCode::BadRequest => "BAD_REQUEST",
            GatewayErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error envelope: `{"success":false,"error":..,"code":..,"version":..}`
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: String,
    pub code: u16,
    pub version: &'static str,
}

impl ErrorEnvelope {
    pub fn new(code: GatewayErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            code: code.status_code().as_u16(),
            version: API_VERSION,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"error":"{}","code":{},"version":"{}"}}"#,
                self.error.replace('\"', "\\\""),
                self.code,
                self.version
            )
        })
    }
}

/// JSON success envelope: `{"success":true,"data":..,"code":..,"version":..}`
#[derive(Debug, Serialize)]
pub struct SuccessEnvelope<T: Serialize> {
    pub success: bool,
    pub data: T,
    pub code: u16,
    pub version: &'static str,
}

impl<T: Serialize> SuccessEnvelope<T> {
    pub fn new(status: StatusCode, data: T) -> Self {
        Self {
            success: true,
            data,
            code: status.as_u16(),
            version: API_VERSION,
        }
    }
}

/// Wrap a static or owned payload into the shared body type
pub fn full_body(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

/// Create a JSON error response with an X-Gateway-Error header
pub fn json_error_response(
    code: GatewayErrorCode,
    message: impl Into<String>,
) -> Response<GatewayBody> {
    let body = ErrorEnvelope::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gateway-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Create a JSON success response wrapping `data`
pub fn json_success_response<T: Serialize>(status: StatusCode, data: T) -> Response<GatewayBody> {
    match serde_json::to_string(&SuccessEnvelope::new(status, data)) {
        Ok(body) => Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(full_body(body))
            .expect("valid response with StatusCode enum and static header"),
        Err(_) => json_error_response(GatewayErrorCode::InternalError, "Failed to encode response"),
    }
}

/// Errors raised by the service registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registration: {0}")]
    InvalidRequest(String),
}

/// Errors raised by the discovery client
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DiscoveryError {
    #[error("no healthy instance of service '{0}'")]
    NoHealthyInstance(String),
    #[error("unknown load balancing strategy '{0}'")]
    UnknownStrategy(String),
}

/// Errors raised while forwarding to a backend
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("backend transport error: {0}")]
    Transport(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
    #[error("backend did not respond within {0:?}")]
    Timeout(std::time::Duration),
}
