//! Reverse proxy and the terminal gateway handler
//!
//! [`ReverseProxy`] forwards a request to one backend instance through a pooled
//! HTTP/1.1 client. [`GatewayHandler`] sits at the end of the middleware chain:
//! it resolves the route, enforces the method set, asks discovery for a
//! healthy instance and hands the request to the proxy.

use crate::discovery::DiscoveryClient;
use crate::error::{json_error_response, GatewayErrorCode, ProxyError, API_VERSION};
use crate::middleware::{client_key, ClientAddr, Endpoint, GatewayRequest, GatewayResponse};
use crate::registry::ServiceInstance;
use crate::router::RouteTable;
use futures::future::BoxFuture;
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for the gateway version marker
pub const X_GATEWAY_VERSION: &str = "x-gateway-version";

/// Statistics for the proxy
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Requests handed to a backend
    pub total_requests: AtomicU64,
    /// Requests that ended in a 502
    pub failed_requests: AtomicU64,
}

impl ProxyStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failed_requests(&self) -> u64 {
        self.failed_requests.load(Ordering::Relaxed)
    }
}

/// Configuration for the backend client
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Maximum idle connections per backend host
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
    /// Upper bound on waiting for backend response headers
    pub request_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(15),
        }
    }
}

/// Pooled forwarder to backend instances
pub struct ReverseProxy {
    client: Client<HttpConnector, crate::error::GatewayBody>,
    stats: Arc<ProxyStats>,
    config: ProxyConfig,
}

impl ReverseProxy {
    pub fn new(config: ProxyConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            request_timeout_secs = config.request_timeout.as_secs(),
            "Backend client initialized"
        );

        Self {
            client,
            stats: Arc::new(ProxyStats::default()),
            config,
        }
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        Arc::clone(&self.stats)
    }

    /// Forward `req` to `instance`, turning every failure into a 502 envelope
    pub async fn forward(&self, req: GatewayRequest, instance: &ServiceInstance) -> GatewayResponse {
        let request_id = request_id(&req);
        self.stats.record_request();

        match self.send(req, &instance.base_url(), &request_id).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                // Details stay in the log; the client gets a uniform message
                error!(
                    service = instance.name,
                    instance_id = instance.id,
                    request_id,
                    error = %e,
                    "Failed to forward request"
                );
                json_error_response(GatewayErrorCode::ProxyError, "Bad gateway")
            }
        }
    }

    /// Send `req` to `base_url` and stream the backend response back as-is
    pub async fn send(
        &self,
        req: GatewayRequest,
        base_url: &str,
        request_id: &str,
    ) -> Result<GatewayResponse, ProxyError> {
        let backend_req = prepare_request(req, base_url, request_id)?;

        let response = tokio::time::timeout(self.config.request_timeout, self.client.request(backend_req))
            .await
            .map_err(|_| ProxyError::Timeout(self.config.request_timeout))??;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Propagated `X-Request-ID`, or a fresh one
fn request_id(req: &GatewayRequest) -> String {
    req.headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Rewrite the request onto `base_url` and set the forwarding headers
pub fn prepare_request(
    req: GatewayRequest,
    base_url: &str,
    request_id: &str,
) -> Result<GatewayRequest, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("{}{}", base_url.trim_end_matches('/'), path_and_query)
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ProxyError::RequestBuild(e.to_string()))?;
    parts.uri = uri;

    let client_ip = parts.extensions.get::<ClientAddr>().map(|addr| addr.0.ip());
    let headers = &mut parts.headers;

    // The client's Host moves to X-Forwarded-Host; the backend sees its own authority
    if let Some(host) = headers.remove(HOST) {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if let Some(ip) = client_ip {
        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    headers.insert(X_GATEWAY_VERSION, HeaderValue::from_static(API_VERSION));

    Ok(Request::from_parts(parts, body))
}

/// Innermost link of the pipeline: route, select, forward
pub struct GatewayHandler {
    routes: Arc<RouteTable>,
    discovery: Arc<DiscoveryClient>,
    proxy: Arc<ReverseProxy>,
}

impl GatewayHandler {
    pub fn new(routes: Arc<RouteTable>, discovery: Arc<DiscoveryClient>, proxy: Arc<ReverseProxy>) -> Self {
        Self {
            routes,
            discovery,
            proxy,
        }
    }

    async fn dispatch(&self, req: GatewayRequest) -> GatewayResponse {
        let path = req.uri().path();

        let route = match self.routes.find_route(path) {
            Some(route) => route,
            None => {
                debug!(path, "No route matched");
                return json_error_response(GatewayErrorCode::RouteNotFound, "Route not found");
            }
        };

        if !self.routes.is_method_allowed(&route, req.method()) {
            debug!(path, method = %req.method(), service = route.service_name, "Method not allowed");
            return json_error_response(GatewayErrorCode::MethodNotAllowed, "Method not allowed");
        }

        let key = client_key(&req);
        let instance = match self.discovery.select_instance(&route.service_name, &key) {
            Ok(instance) => instance,
            Err(e) => {
                warn!(service = route.service_name, error = %e, "No instance available");
                return json_error_response(GatewayErrorCode::ServiceUnavailable, "Service unavailable");
            }
        };

        self.proxy.forward(req, &instance).await
    }
}

impl Endpoint for GatewayHandler {
    fn call<'a>(&'a self, req: GatewayRequest) -> BoxFuture<'a, GatewayResponse> {
        Box::pin(self.dispatch(req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::full_body;
    use crate::loadbalancer::LoadBalanceStrategy;
    use crate::registry::{RegistrationRequest, ServiceRegistry};
    use hyper::{Method, StatusCode};

    fn request(method: Method, uri: &str) -> GatewayRequest {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(HOST, "gateway.local:8000")
            .body(full_body(""))
            .unwrap()
    }

    /// A localhost port nothing listens on
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn handler() -> (GatewayHandler, Arc<ServiceRegistry>, Arc<RouteTable>) {
        let registry = Arc::new(ServiceRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let discovery = Arc::new(DiscoveryClient::new(
            Arc::clone(&registry),
            LoadBalanceStrategy::RoundRobin,
        ));
        let proxy = Arc::new(ReverseProxy::new(ProxyConfig::default()));
        (
            GatewayHandler::new(Arc::clone(&routes), discovery, proxy),
            registry,
            routes,
        )
    }

    #[test]
    fn test_proxy_config_default() {
        let config = ProxyConfig::default();
        assert_eq!(config.max_idle_per_host, 10);
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
    }

    #[test]
    fn test_prepare_request_rewrites_uri_and_headers() {
        let mut req = request(Method::POST, "/api/ai/chat?stream=1");
        req.extensions_mut()
            .insert(ClientAddr("192.0.2.10:40000".parse().unwrap()));

        let prepared = prepare_request(req, "http://127.0.0.1:8081", "req-1").unwrap();

        assert_eq!(prepared.method(), Method::POST);
        assert_eq!(prepared.uri(), "http://127.0.0.1:8081/api/ai/chat?stream=1");
        let headers = prepared.headers();
        assert!(headers.get(HOST).is_none());
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "gateway.local:8000");
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.0.2.10");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), "req-1");
        assert_eq!(headers.get(X_GATEWAY_VERSION).unwrap(), API_VERSION);
    }

    #[test]
    fn test_request_id_is_propagated_or_generated() {
        let mut req = request(Method::GET, "/");
        req.headers_mut()
            .insert(X_REQUEST_ID, HeaderValue::from_static("abc"));
        assert_eq!(request_id(&req), "abc");

        let generated = request_id(&request(Method::GET, "/"));
        assert!(Uuid::parse_str(&generated).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (handler, _, _) = handler();
        let response = handler.call(request(Method::GET, "/nowhere")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("X-Gateway-Error").unwrap(), "ROUTE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_disallowed_method_is_405() {
        let (handler, _, routes) = handler();
        routes.add_route("/api/monitoring/", "monitoring-api", ["GET"]);

        let response = handler.call(request(Method::DELETE, "/api/monitoring/x")).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_route_without_healthy_instance_is_503() {
        let (handler, registry, routes) = handler();
        routes.add_route("/api/apps/", "app-store", ["GET"]);

        // No instances at all
        let response = handler.call(request(Method::GET, "/api/apps/1")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        // Registered but not yet probed
        registry
            .register(RegistrationRequest::new("app-store", "127.0.0.1", 9))
            .unwrap();
        let response = handler.call(request(Method::GET, "/api/apps/1")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_502() {
        let (handler, registry, routes) = handler();
        routes.add_route("/", "web-ui", ["GET"]);
        let instance = registry
            .register(RegistrationRequest::new("web-ui", "127.0.0.1", closed_port()).with_id("web-1"))
            .unwrap();
        registry.mark_healthy(&instance.id);

        let response = handler.call(request(Method::GET, "/index.html")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(response.headers().get("X-Gateway-Error").unwrap(), "PROXY_ERROR");

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Bad gateway");
        assert_eq!(body["code"], 502);
    }
}
