//! Route table mapping request paths to service names
//!
//! Lookup tries an exact match first, then the longest registered path that is
//! a prefix of the request path. The prefix order is kept sorted on every
//! mutation so resolution never depends on map iteration order.

use hyper::Method;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

/// Binding from a path (exact or prefix) to a service
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub path: String,
    pub service_name: String,
    /// Upper-case method names; empty allows every method
    pub allowed_methods: BTreeSet<String>,
}

impl Route {
    pub fn new<I, S>(path: &str, service_name: &str, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            path: path.to_string(),
            service_name: service_name.to_string(),
            allowed_methods: methods
                .into_iter()
                .map(|m| m.as_ref().trim().to_ascii_uppercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Empty method set permits everything; otherwise exact membership
    pub fn allows(&self, method: &Method) -> bool {
        self.allowed_methods.is_empty() || self.allowed_methods.contains(method.as_str())
    }
}

#[derive(Default)]
struct RouteSet {
    routes: HashMap<String, Route>,
    /// Paths ordered longest first, ties broken lexically
    prefix_order: Vec<String>,
}

impl RouteSet {
    fn reindex(&mut self) {
        let mut paths: Vec<String> = self.routes.keys().cloned().collect();
        paths.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        self.prefix_order = paths;
    }
}

pub struct RouteTable {
    inner: RwLock<RouteSet>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RouteSet::default()),
        }
    }

    /// Insert or replace the route for `path`
    pub fn add_route<I, S>(&self, path: &str, service_name: &str, methods: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.insert(Route::new(path, service_name, methods));
    }

    pub fn insert(&self, route: Route) {
        info!(
            path = route.path,
            service = route.service_name,
            methods = ?route.allowed_methods,
            "Route added"
        );
        let mut inner = self.inner.write();
        inner.routes.insert(route.path.clone(), route);
        inner.reindex();
    }

    pub fn remove_route(&self, path: &str) -> Option<Route> {
        let mut inner = self.inner.write();
        let removed = inner.routes.remove(path);
        if removed.is_some() {
            inner.reindex();
        }
        removed
    }

    /// Atomically replace every route bound to `service_name`
    pub fn replace_service_routes(&self, service_name: &str, routes: Vec<Route>) {
        let mut inner = self.inner.write();
        inner.routes.retain(|_, r| r.service_name != service_name);
        for route in routes {
            inner.routes.insert(route.path.clone(), route);
        }
        inner.reindex();
        debug!(service = service_name, total_routes = inner.routes.len(), "Service routes replaced");
    }

    /// Exact match first, then longest matching prefix
    pub fn find_route(&self, request_path: &str) -> Option<Route> {
        let inner = self.inner.read();
        if let Some(route) = inner.routes.get(request_path) {
            return Some(route.clone());
        }
        inner
            .prefix_order
            .iter()
            .find(|path| request_path.starts_with(path.as_str()))
            .and_then(|path| inner.routes.get(path))
            .cloned()
    }

    pub fn is_method_allowed(&self, route: &Route, method: &Method) -> bool {
        route.allows(method)
    }

    /// All routes, longest path first
    pub fn routes(&self) -> Vec<Route> {
        let inner = self.inner.read();
        inner
            .prefix_order
            .iter()
            .filter_map(|path| inner.routes.get(path))
            .cloned()
            .collect()
    }

    pub fn routes_for(&self, service_name: &str) -> Vec<Route> {
        self.routes()
            .into_iter()
            .filter(|r| r.service_name == service_name)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().routes.is_empty()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}
