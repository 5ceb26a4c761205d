//! Registry API: HTTP control surface over the registry, routes and load balancer.
//! Listens on the gateway port + 1000.

use crate::error::{json_error_response, json_success_response, GatewayBody, GatewayErrorCode};
use crate::middleware::AuthMiddleware;
use crate::registry::RegistrationRequest;
use crate::server::GatewayState;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted registration body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Registry API server
pub struct AdminServer {
    bind_addr: SocketAddr,
    state: Arc<GatewayState>,
    auth: Arc<AuthMiddleware>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AdminServer {
    /// `auth` guards the mutating endpoints with the gateway's credentials
    pub fn new(
        bind_addr: SocketAddr,
        state: Arc<GatewayState>,
        auth: Arc<AuthMiddleware>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            state,
            auth,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Registry API listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            let auth = Arc::clone(&self.auth);
                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, state, auth).await {
                                    debug!(addr = %addr, error = %e, "Registry API connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept registry API connection");
                        }
                    }
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        info!("Registry API shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: tokio::net::TcpStream,
    state: Arc<GatewayState>,
    auth: Arc<AuthMiddleware>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        let auth = Arc::clone(&auth);
        async move { Ok::<_, hyper::Error>(handle_admin_request(req, &state, &auth).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Registry API connection error: {}", e))?;

    Ok(())
}

/// Route one registry API request. Reads are open; changes need credentials.
pub async fn handle_admin_request(
    req: Request<Incoming>,
    state: &GatewayState,
    auth: &AuthMiddleware,
) -> Response<GatewayBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, path, "Registry API request");

    if matches!(method, Method::POST | Method::PUT | Method::DELETE) {
        if let Err(response) = auth.authorize(req.headers(), &path) {
            return response;
        }
    }

    match (&method, path.as_str()) {
        (&Method::GET, "/health") => json_success_response(StatusCode::OK, serde_json::json!({ "status": "ok" })),

        (&Method::GET, "/version") => json_success_response(
            StatusCode::OK,
            serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        (&Method::GET, "/services") => json_success_response(StatusCode::OK, state.registry().list()),

        (&Method::POST, "/services") => register(req, state).await,

        (&Method::GET, path) if path.starts_with("/services/") => {
            match path_param(path, "/services/") {
                Some(name) => json_success_response(StatusCode::OK, state.registry().instances_of(name)),
                None => json_error_response(GatewayErrorCode::BadRequest, "Missing service name"),
            }
        }

        (&Method::DELETE, path) if path.starts_with("/services/") => match path_param(path, "/services/") {
            Some(id) => match state.registry().deregister(id) {
                Ok(()) => json_success_response(StatusCode::OK, serde_json::json!({ "deregistered": id })),
                Err(e) => json_error_response(GatewayErrorCode::BadRequest, e.to_string()),
            },
            None => json_error_response(GatewayErrorCode::BadRequest, "Missing instance id"),
        },

        (&Method::GET, "/stats") => json_success_response(StatusCode::OK, state.registry().get_service_stats()),

        (&Method::GET, "/routes") => json_success_response(StatusCode::OK, state.routes().routes()),

        (&Method::GET, "/loadbalancer") => json_success_response(
            StatusCode::OK,
            serde_json::json!({ "strategy": state.discovery().strategy().as_str() }),
        ),

        (&Method::PUT, path) if path.starts_with("/loadbalancer/") => {
            let strategy = path_param(path, "/loadbalancer/").unwrap_or("");
            match state.discovery().set_load_balancer(strategy) {
                Ok(()) => json_success_response(
                    StatusCode::OK,
                    serde_json::json!({ "strategy": state.discovery().strategy().as_str() }),
                ),
                Err(e) => json_error_response(GatewayErrorCode::BadRequest, e.to_string()),
            }
        }

        _ => json_error_response(GatewayErrorCode::RouteNotFound, "Not found"),
    }
}

/// Non-empty single path segment after `prefix`
fn path_param<'a>(path: &'a str, prefix: &str) -> Option<&'a str> {
    path.strip_prefix(prefix)
        .map(|rest| rest.trim_end_matches('/'))
        .filter(|rest| !rest.is_empty() && !rest.contains('/'))
}

/// Collect at most `MAX_BODY_BYTES` of `body`
async fn read_body<B>(body: B) -> Result<Bytes, Response<GatewayBody>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(json_error_response(
            GatewayErrorCode::BadRequest,
            "Request body too large",
        )),
        Err(e) => {
            warn!(error = %e, "Failed to read registration body");
            Err(json_error_response(
                GatewayErrorCode::BadRequest,
                "Failed to read request body",
            ))
        }
    }
}

async fn register(req: Request<Incoming>, state: &GatewayState) -> Response<GatewayBody> {
    let body = match read_body(req.into_body()).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let request: RegistrationRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return json_error_response(GatewayErrorCode::BadRequest, format!("Invalid registration: {}", e));
        }
    };

    match state.registry().register(request) {
        Ok(instance) => {
            if state.routes().routes_for(&instance.name).is_empty() {
                state.refresh_routes(&instance.name);
            }
            if state.watch_routes(&instance.name) {
                info!(service = instance.name, "Watching routes for newly registered service");
            }
            json_success_response(StatusCode::CREATED, instance)
        }
        Err(e) => json_error_response(GatewayErrorCode::BadRequest, e.to_string()),
    }
}
