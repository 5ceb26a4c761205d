//! svcgate - An internal service gateway
//!
//! This library provides a path-routing HTTP gateway that:
//! - Keeps a live in-memory registry of backend service instances
//! - Probes instance health on an interval and reacts to status flips
//! - Routes requests by longest path prefix and enforces allowed methods
//! - Load-balances across healthy instances with swappable strategies
//! - Runs every request through logging, health, auth and rate-limit middleware
//! - Exposes a registry API for runtime registration and inspection

pub mod admin;
pub mod config;
pub mod discovery;
pub mod error;
pub mod healthcheck;
pub mod loadbalancer;
pub mod middleware;
pub mod proxy;
pub mod ratelimit;
pub mod registry;
pub mod router;
pub mod server;
