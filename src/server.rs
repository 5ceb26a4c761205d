//! Gateway server orchestration
//!
//! Boot order: register the configured services, bind their routes, run one
//! health tick, start the health checker, the registry API and the watch
//! dispatcher, subscribe route refreshes, then accept client connections until
//! the shutdown signal flips.

use crate::admin::AdminServer;
use crate::config::{Config, RouteConfig, ServiceConfig};
use crate::discovery::DiscoveryClient;
use crate::healthcheck::HealthChecker;
use crate::middleware::{
    AuthMiddleware, ClientAddr, HealthCheckMiddleware, LoggingMiddleware, Middleware, Pipeline,
    RateLimitMiddleware,
};
use crate::proxy::{GatewayHandler, ProxyConfig, ReverseProxy};
use crate::ratelimit::RateLimiter;
use crate::registry::ServiceRegistry;
use crate::router::{Route, RouteTable};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Built-in route for a service name
pub fn default_route(service: &str) -> Route {
    const ALL: [&str; 0] = [];
    match service {
        "ai-agent" => Route::new("/api/ai/", service, ["GET", "POST"]),
        "app-store" => Route::new("/api/apps/", service, ["GET", "POST", "PUT", "DELETE"]),
        "container-manager" => Route::new("/api/containers/", service, ["GET", "POST", "PUT", "DELETE"]),
        "website-manager" => Route::new("/api/websites/", service, ["GET", "POST", "PUT", "DELETE"]),
        "database-manager" => Route::new("/api/databases/", service, ["GET", "POST", "PUT", "DELETE"]),
        "monitoring-api" => Route::new("/api/monitoring/", service, ["GET"]),
        "web-ui" => Route::new("/", service, ALL),
        other => Route::new(&format!("/api/{}/", other), service, ALL),
    }
}

type RouteOverrides = Arc<RwLock<HashMap<String, RouteConfig>>>;

/// The override for `service` if any, else its built-in route
fn routes_for_service(overrides: &RwLock<HashMap<String, RouteConfig>>, service: &str) -> Vec<Route> {
    match overrides.read().get(service) {
        Some(route) => vec![Route::new(&route.path, service, &route.methods)],
        None => vec![default_route(service)],
    }
}

/// Components shared by the gateway listener and the registry API
pub struct GatewayState {
    registry: Arc<ServiceRegistry>,
    routes: Arc<RouteTable>,
    discovery: Arc<DiscoveryClient>,
    overrides: RouteOverrides,
}

impl GatewayState {
    pub fn new(registry: Arc<ServiceRegistry>, routes: Arc<RouteTable>, discovery: Arc<DiscoveryClient>) -> Self {
        Self {
            registry,
            routes,
            discovery,
            overrides: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn discovery(&self) -> &Arc<DiscoveryClient> {
        &self.discovery
    }

    /// Use an explicit route for `service` instead of the built-in one
    pub fn set_route_override(&self, service: &str, route: RouteConfig) {
        self.overrides.write().insert(service.to_string(), route);
    }

    /// Routes `service` should own: the override if any, else the built-in route
    pub fn derive_routes(&self, service: &str) -> Vec<Route> {
        routes_for_service(&self.overrides, service)
    }

    /// Replace the route table entries of `service` with its derived routes
    pub fn refresh_routes(&self, service: &str) {
        self.routes
            .replace_service_routes(service, self.derive_routes(service));
    }

    /// Subscribe a route-refresh callback for `service` unless one exists.
    /// Returns whether a new subscription was made. Each event re-derives the
    /// routes, so overrides set after subscribing take effect.
    pub fn watch_routes(&self, service: &str) -> bool {
        let routes = Arc::clone(&self.routes);
        let overrides = Arc::clone(&self.overrides);
        let name = service.to_string();
        self.discovery
            .watch_service_once(service, move |event| {
                debug!(
                    service = event.service,
                    kind = ?event.kind,
                    healthy = event.healthy.len(),
                    "Refreshing routes after topology change"
                );
                routes.replace_service_routes(&name, routes_for_service(&overrides, &name));
            })
            .is_some()
    }
}

/// The gateway: shared state, the request pipeline and its listeners
pub struct GatewayServer {
    config: Config,
    state: Arc<GatewayState>,
    pipeline: Arc<Pipeline>,
    proxy: Arc<ReverseProxy>,
    auth: Arc<AuthMiddleware>,
    limiter: Option<Arc<RateLimiter>>,
}

impl GatewayServer {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(ServiceRegistry::new());
        let routes = Arc::new(RouteTable::new());
        let discovery = Arc::new(DiscoveryClient::new(
            Arc::clone(&registry),
            config.load_balance_strategy(),
        ));
        let state = Arc::new(GatewayState::new(registry, Arc::clone(&routes), Arc::clone(&discovery)));

        let proxy = Arc::new(ReverseProxy::new(ProxyConfig {
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: config.server.idle_timeout(),
            request_timeout: config.server.write_timeout(),
        }));

        let password = config.auth.password.clone().unwrap_or_else(|| {
            let password = uuid::Uuid::new_v4().to_string();
            info!(
                username = config.auth.username,
                password = %password,
                "Generated gateway password (configure auth.password to set a fixed value)"
            );
            password
        });

        let limiter = config.rate_limit.enabled.then(|| {
            Arc::new(RateLimiter::new(
                config.rate_limit.requests_per_minute,
                config.rate_limit.window(),
            ))
        });

        // Shared with the registry API, which guards its changes with the same credentials
        let auth = Arc::new(AuthMiddleware::new(config.auth.mode, &config.auth.username, &password));

        let handler = GatewayHandler::new(routes, discovery, Arc::clone(&proxy));
        let mut pipeline = Pipeline::new(Arc::new(handler))
            .with(LoggingMiddleware)
            .with(HealthCheckMiddleware);
        pipeline.push(Arc::clone(&auth) as Arc<dyn Middleware>);
        if let Some(limiter) = &limiter {
            pipeline.push(Arc::new(RateLimitMiddleware::new(Arc::clone(limiter))));
        }
        info!(middlewares = ?pipeline.names(), "Middleware pipeline assembled");

        Self {
            config,
            state,
            pipeline: Arc::new(pipeline),
            proxy,
            auth,
            limiter,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> &Arc<GatewayState> {
        &self.state
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub fn proxy(&self) -> &Arc<ReverseProxy> {
        &self.proxy
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Register every boot service and bind its route
    pub fn register_default_services(&self) -> anyhow::Result<Vec<ServiceConfig>> {
        let services = self.config.boot_services();
        for service in &services {
            if let Some(route) = &service.route {
                self.state.set_route_override(&service.name, route.clone());
            }
            self.state.registry.register(service.to_registration())?;
            self.state.refresh_routes(&service.name);
        }
        info!(
            services = services.len(),
            routes = self.state.routes.len(),
            "Default services registered"
        );
        Ok(services)
    }

    fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.config.server.bind, self.config.server.port)
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))
    }

    fn registry_api_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.config.server.bind, self.config.server.registry_api_port())
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid registry API bind address: {}", e))
    }

    /// Boot every component and serve until `shutdown_rx` flips to `true`
    pub async fn run(self, shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr = self.bind_addr()?;
        let api_addr = self.registry_api_addr()?;

        let services = self.register_default_services()?;

        let checker = HealthChecker::new(
            Arc::clone(&self.state.registry),
            self.config.health.to_check_config(),
        )?;
        let initial = checker.check_all().await;
        info!(
            healthy = initial.healthy + initial.trusted,
            unhealthy = initial.unhealthy,
            "Initial health check complete"
        );
        tokio::spawn(checker.run(shutdown_rx.clone()));

        let admin = AdminServer::new(
            api_addr,
            Arc::clone(&self.state),
            Arc::clone(&self.auth),
            shutdown_rx.clone(),
        );
        tokio::spawn(async move {
            if let Err(e) = admin.run().await {
                error!(error = %e, "Registry API server error");
            }
        });

        self.state.discovery.start_watchers(shutdown_rx.clone());

        let mut watched: Vec<String> = self
            .state
            .registry
            .get_healthy_services()
            .into_keys()
            .collect();
        watched.extend(services.into_iter().map(|s| s.name));
        for service in &watched {
            self.state.watch_routes(service);
        }

        self.serve(addr, shutdown_rx).await
    }

    async fn serve(&self, addr: SocketAddr, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "Gateway listening");

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .header_read_timeout(self.config.server.read_timeout());

        let graceful = GracefulShutdown::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let pipeline = Arc::clone(&self.pipeline);
                            let service = service_fn(move |req: Request<Incoming>| {
                                let pipeline = Arc::clone(&pipeline);
                                async move {
                                    let mut req = req.map(|body| body.boxed());
                                    req.extensions_mut().insert(ClientAddr(client_addr));
                                    Ok::<_, hyper::Error>(pipeline.handle(req).await)
                                }
                            });

                            let conn = builder.serve_connection(TokioIo::new(stream), service);
                            let conn = graceful.watch(conn);
                            tokio::spawn(async move {
                                if let Err(e) = conn.await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        let drain = self.config.server.shutdown_timeout();
        tokio::select! {
            _ = graceful.shutdown() => {
                info!("All connections drained");
            }
            _ = tokio::time::sleep(drain) => {
                warn!(timeout_secs = drain.as_secs(), "Drain timed out, closing remaining connections");
            }
        }
        Ok(())
    }
}
