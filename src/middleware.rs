//! Request interception pipeline
//!
//! Middlewares run in registration order. Each one receives the request and a
//! [`Next`] handle for the rest of the chain; calling `next.run(req)` passes
//! control inward, returning a response short-circuits. The innermost link is
//! the [`Endpoint`] that routes and proxies.

use crate::config::AuthMode;
use crate::error::{json_error_response, json_success_response, GatewayBody, GatewayErrorCode};
use crate::ratelimit::RateLimiter;
use base64::Engine;
use futures::future::BoxFuture;
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, RETRY_AFTER, WWW_AUTHENTICATE};
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub type GatewayRequest = Request<GatewayBody>;
pub type GatewayResponse = Response<GatewayBody>;

/// Path answered by the health check middleware
pub const HEALTH_PATH: &str = "/health";
/// Prefix that bypasses authentication
pub const PUBLIC_PREFIX: &str = "/public/";

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Peer address of the connection, stored in request extensions
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// Rate-limit key: first `X-Forwarded-For` entry, else the peer IP
pub fn client_key(req: &GatewayRequest) -> String {
    let forwarded = req
        .headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded {
        Some(ip) => ip.to_string(),
        None => req
            .extensions()
            .get::<ClientAddr>()
            .map(|addr| addr.0.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

/// Terminal request handler
pub trait Endpoint: Send + Sync {
    fn call<'a>(&'a self, req: GatewayRequest) -> BoxFuture<'a, GatewayResponse>;
}

/// A request interceptor
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle<'a>(&'a self, req: GatewayRequest, next: Next<'a>) -> BoxFuture<'a, GatewayResponse>;
}

/// The remainder of the chain after the current middleware
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a dyn Endpoint,
}

impl<'a> Next<'a> {
    pub fn run(self, req: GatewayRequest) -> BoxFuture<'a, GatewayResponse> {
        match self.chain.split_first() {
            Some((current, rest)) => current.handle(
                req,
                Next {
                    chain: rest,
                    endpoint: self.endpoint,
                },
            ),
            None => self.endpoint.call(req),
        }
    }
}

/// Ordered middlewares around an endpoint
pub struct Pipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    endpoint: Arc<dyn Endpoint>,
}

impl Pipeline {
    pub fn new(endpoint: Arc<dyn Endpoint>) -> Self {
        Self {
            middlewares: Vec::new(),
            endpoint,
        }
    }

    /// Append a middleware; it runs after every previously added one
    pub fn with<M: Middleware + 'static>(mut self, middleware: M) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middlewares.push(middleware);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    pub fn handle(&self, req: GatewayRequest) -> BoxFuture<'_, GatewayResponse> {
        Next {
            chain: &self.middlewares,
            endpoint: self.endpoint.as_ref(),
        }
        .run(req)
    }
}

/// Logs method, path, status and latency of every request
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &'static str {
        "logging"
    }

    fn handle<'a>(&'a self, req: GatewayRequest, next: Next<'a>) -> BoxFuture<'a, GatewayResponse> {
        Box::pin(async move {
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let started = Instant::now();

            let response = next.run(req).await;

            info!(
                %method,
                path,
                status = response.status().as_u16(),
                latency_ms = started.elapsed().as_millis() as u64,
                "Request handled"
            );
            response
        })
    }
}

/// Basic-auth credential check
pub struct AuthMiddleware {
    mode: AuthMode,
    username: String,
    password: String,
}

impl AuthMiddleware {
    pub fn new(mode: AuthMode, username: &str, password: &str) -> Self {
        Self {
            mode,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn is_public(path: &str) -> bool {
        path == HEALTH_PATH || path.starts_with(PUBLIC_PREFIX)
    }

    fn verify(&self, headers: &HeaderMap) -> Result<(), &'static str> {
        let header = headers
            .get(AUTHORIZATION)
            .ok_or("missing credentials")?
            .to_str()
            .map_err(|_| "malformed authorization header")?;

        let encoded = header
            .strip_prefix("Basic ")
            .ok_or("unsupported authorization scheme")?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| "malformed basic credentials")?;
        let decoded = String::from_utf8(decoded).map_err(|_| "malformed basic credentials")?;
        let (user, pass) = decoded
            .split_once(':')
            .ok_or("malformed basic credentials")?;

        if user == self.username && pass == self.password {
            Ok(())
        } else {
            Err("invalid credentials")
        }
    }

    /// Check the credentials in `headers`. Strict mode turns a failure into a
    /// 401 response; permissive mode only logs it.
    pub fn authorize(&self, headers: &HeaderMap, path: &str) -> Result<(), GatewayResponse> {
        let Err(reason) = self.verify(headers) else {
            return Ok(());
        };

        match self.mode {
            AuthMode::Strict => {
                warn!(path, reason, "Rejected unauthenticated request");
                let mut response = json_error_response(GatewayErrorCode::Unauthorized, "Unauthorized");
                response.headers_mut().insert(
                    WWW_AUTHENTICATE,
                    HeaderValue::from_static("Basic realm=\"svcgate\""),
                );
                Err(response)
            }
            AuthMode::Permissive => {
                warn!(path, reason, "Credential check failed, passing through (permissive mode)");
                Ok(())
            }
        }
    }
}

impl Middleware for AuthMiddleware {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn handle<'a>(&'a self, req: GatewayRequest, next: Next<'a>) -> BoxFuture<'a, GatewayResponse> {
        Box::pin(async move {
            if Self::is_public(req.uri().path()) {
                return next.run(req).await;
            }

            if let Err(response) = self.authorize(req.headers(), req.uri().path()) {
                return response;
            }

            next.run(req).await
        })
    }
}

/// Rejects clients over their per-window request budget with 429
pub struct RateLimitMiddleware {
    limiter: Arc<RateLimiter>,
}

impl RateLimitMiddleware {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

impl Middleware for RateLimitMiddleware {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    fn handle<'a>(&'a self, req: GatewayRequest, next: Next<'a>) -> BoxFuture<'a, GatewayResponse> {
        Box::pin(async move {
            let key = client_key(&req);
            if !self.limiter.check(&key) {
                warn!(client = key, limit = self.limiter.limit(), "Rate limit exceeded");
                let mut response =
                    json_error_response(GatewayErrorCode::RateLimitExceeded, "Rate limit exceeded");
                response
                    .headers_mut()
                    .insert(RETRY_AFTER, HeaderValue::from(self.limiter.window().as_secs()));
                return response;
            }
            next.run(req).await
        })
    }
}

/// Answers `/health` without touching the router
#[derive(Debug, Default)]
pub struct HealthCheckMiddleware;

impl Middleware for HealthCheckMiddleware {
    fn name(&self) -> &'static str {
        "health_check"
    }

    fn handle<'a>(&'a self, req: GatewayRequest, next: Next<'a>) -> BoxFuture<'a, GatewayResponse> {
        Box::pin(async move {
            if req.uri().path() == HEALTH_PATH {
                return json_success_response(
                    StatusCode::OK,
                    serde_json::json!({ "status": "healthy" }),
                );
            }
            next.run(req).await
        })
    }
}
