//! Health check loop for registered service instances
//!
//! Periodically probes every instance's health URL and records the outcome in
//! the registry. The checker only reports: it never removes instances unless
//! the opt-in eviction policy is enabled.

use crate::registry::{ServiceInstance, ServiceRegistry, ServiceStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Health check configuration
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health check ticks
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Deregister instances that reach their `max_fails` threshold
    pub evict_failed_instances: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            evict_failed_instances: false,
        }
    }
}

/// Outcome of a single tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickSummary {
    pub probed: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    /// Instances without a health URL, trusted without probing
    pub trusted: usize,
    pub evicted: Vec<String>,
}

/// Health checker that monitors registry instances
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
    config: HealthCheckConfig,
}

impl HealthChecker {
    pub fn new(registry: Arc<ServiceRegistry>, config: HealthCheckConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout)
            .build()?;

        Ok(Self {
            registry,
            client,
            config,
        })
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Run the health checker until the shutdown signal flips to `true`
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            timeout_secs = self.config.timeout.as_secs(),
            "Health checker started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        // A tick that overruns the interval pushes the next one back instead of bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of a tokio interval completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                result = shutdown_rx.changed() => {
                    if shutdown_requested(result, &shutdown_rx) {
                        break;
                    }
                    continue;
                }
            }

            // Shutdown abandons a tick in progress
            tokio::select! {
                _ = self.check_all() => {}
                result = shutdown_rx.changed() => {
                    if shutdown_requested(result, &shutdown_rx) {
                        break;
                    }
                }
            }
        }

        info!("Health checker shutting down");
    }

    /// Probe every registered instance once, sequentially
    pub async fn check_all(&self) -> TickSummary {
        let mut summary = TickSummary::default();

        for instance in self.registry.list() {
            if instance.health_url.is_empty() {
                self.registry.mark_healthy(&instance.id);
                summary.trusted += 1;
                continue;
            }

            summary.probed += 1;
            if self.probe(&instance).await {
                self.registry.record_probe_success(&instance.id);
                summary.healthy += 1;
            } else if let Some(ServiceStatus::Unhealthy) =
                self.registry.record_probe_failure(&instance.id)
            {
                summary.unhealthy += 1;
            }
        }

        if self.config.evict_failed_instances {
            summary.evicted = self.registry.evict_exhausted();
        }

        debug!(
            probed = summary.probed,
            healthy = summary.healthy,
            unhealthy = summary.unhealthy,
            trusted = summary.trusted,
            evicted = summary.evicted.len(),
            "Health check tick complete"
        );
        summary
    }

    /// GET the instance's health URL; only a 200 counts as healthy
    async fn probe(&self, instance: &ServiceInstance) -> bool {
        match self.client.get(&instance.health_url).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                debug!(instance_id = instance.id, "Health check passed");
                true
            }
            Ok(response) => {
                warn!(
                    service = instance.name,
                    instance_id = instance.id,
                    status = response.status().as_u16(),
                    "Health check failed (unexpected status)"
                );
                false
            }
            Err(e) if e.is_timeout() => {
                warn!(service = instance.name, instance_id = instance.id, "Health check failed (timeout)");
                false
            }
            Err(e) => {
                warn!(
                    service = instance.name,
                    instance_id = instance.id,
                    error = %e,
                    "Health check failed (connection error)"
                );
                false
            }
        }
    }
}

fn shutdown_requested(result: Result<(), watch::error::RecvError>, shutdown_rx: &watch::Receiver<bool>) -> bool {
    result.is_err() || *shutdown_rx.borrow()
}

/// Builder for configuring the health checker
pub struct HealthCheckerBuilder {
    registry: Option<Arc<ServiceRegistry>>,
    config: HealthCheckConfig,
}

impl HealthCheckerBuilder {
    pub fn new() -> Self {
        Self {
            registry: None,
            config: HealthCheckConfig::default(),
        }
    }

    pub fn registry(mut self, registry: Arc<ServiceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(mut self, config: HealthCheckConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.config.interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn build(self) -> anyhow::Result<HealthChecker> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("health checker requires a registry"))?;
        HealthChecker::new(registry, self.config)
    }
}

impl Default for HealthCheckerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
