//! In-memory service registry
//!
//! Holds every known service instance keyed by instance id. All mutations go
//! through a single reader/writer lock and every read hands back copies, so no
//! caller ever holds a reference into the map. Topology changes are published
//! on a broadcast channel for the discovery client to fan out to watchers.

use crate::error::RegistryError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Capacity of the registry event channel
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Health status of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Registered but not probed yet
    Unknown,
    /// Last probe succeeded
    Healthy,
    /// Last probe failed
    Unhealthy,
}

/// One running copy of a logical service
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    /// Absolute health-check URL; empty means trusted without probing
    pub health_url: String,
    pub version: String,
    pub tags: BTreeSet<String>,
    pub weight: u32,
    /// Consecutive failures tolerated before eviction (0 = never evict)
    pub max_fails: u32,
    pub status: ServiceStatus,
    pub last_seen: DateTime<Utc>,
    pub consecutive_failures: u32,
}

impl ServiceInstance {
    /// Base URL requests are proxied to
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.address, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }
}

/// Input to create or update a service instance
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RegistrationRequest {
    /// Instance id; derived from name, address and port when absent
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub health_url: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub max_fails: u32,
}

fn default_weight() -> u32 {
    1
}

impl RegistrationRequest {
    /// Create a request with default metadata (weight 1, no tags)
    pub fn new(name: &str, address: &str, port: u16) -> Self {
        Self {
            id: None,
            name: name.to_string(),
            address: address.to_string(),
            port,
            health_url: String::new(),
            version: String::new(),
            tags: BTreeSet::new(),
            weight: default_weight(),
            max_fails: 0,
        }
    }

    /// Set the instance id (builder pattern)
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    /// Set the health-check URL (builder pattern)
    pub fn with_health_url(mut self, url: &str) -> Self {
        self.health_url = url.to_string();
        self
    }

    /// Set the version (builder pattern)
    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    /// Set the tags (builder pattern)
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Set the selection weight (builder pattern)
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the eviction threshold (builder pattern)
    pub fn with_max_fails(mut self, max_fails: u32) -> Self {
        self.max_fails = max_fails;
        self
    }

    /// Id this request registers under
    pub fn instance_id(&self) -> String {
        match &self.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}-{}-{}", self.name, self.address, self.port),
        }
    }

    fn validate(&self) -> Result<(), RegistryError> {
        if self.name.trim().is_empty() {
            return Err(RegistryError::InvalidRequest("service name is required".into()));
        }
        if self.address.trim().is_empty() {
            return Err(RegistryError::InvalidRequest("address is required".into()));
        }
        if self.port == 0 {
            return Err(RegistryError::InvalidRequest("port must be non-zero".into()));
        }
        if !self.health_url.is_empty()
            && !(self.health_url.starts_with("http://") || self.health_url.starts_with("https://"))
        {
            return Err(RegistryError::InvalidRequest(format!(
                "health_url must be an absolute http(s) URL, got '{}'",
                self.health_url
            )));
        }
        Ok(())
    }
}

/// Kind of topology change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegistryEventKind {
    InstanceAdded,
    InstanceRemoved,
    StatusChanged,
}

/// A topology change published by the registry
#[derive(Debug, Clone)]
pub struct RegistryEvent {
    pub kind: RegistryEventKind,
    /// Snapshot of the instance after the change (before removal for removals)
    pub instance: ServiceInstance,
}

/// Per-service instance counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ServiceCounts {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// Snapshot of registry counts, for observability only
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub total_instances: usize,
    pub healthy_instances: usize,
    pub unhealthy_instances: usize,
    pub unknown_instances: usize,
    pub services: HashMap<String, ServiceCounts>,
}

/// The single source of truth for instances and their health
pub struct ServiceRegistry {
    instances: RwLock<HashMap<String, ServiceInstance>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            instances: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to topology changes
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    fn publish(&self, kind: RegistryEventKind, instance: ServiceInstance) {
        // No receivers is fine: nobody is watching yet
        let _ = self.events.send(RegistryEvent { kind, instance });
    }

    /// Register or re-register an instance.
    ///
    /// A new instance starts as `Unknown`. Re-registering an existing id
    /// replaces its metadata but keeps status and failure history.
    pub fn register(&self, req: RegistrationRequest) -> Result<ServiceInstance, RegistryError> {
        req.validate()?;
        let id = req.instance_id();
        let now = Utc::now();

        let instance = {
            let mut instances = self.instances.write();
            let (status, consecutive_failures) = match instances.get(&id) {
                Some(existing) => (existing.status, existing.consecutive_failures),
                None => (ServiceStatus::Unknown, 0),
            };
            let instance = ServiceInstance {
                id: id.clone(),
                name: req.name,
                address: req.address,
                port: req.port,
                health_url: req.health_url,
                version: req.version,
                tags: req.tags,
                weight: req.weight,
                max_fails: req.max_fails,
                status,
                last_seen: now,
                consecutive_failures,
            };
            instances.insert(id, instance.clone());
            instance
        };

        info!(
            service = instance.name,
            instance_id = instance.id,
            base_url = %instance.base_url(),
            version = instance.version,
            "Registered service instance"
        );
        self.publish(RegistryEventKind::InstanceAdded, instance.clone());
        Ok(instance)
    }

    /// Remove an instance; absent ids are a successful no-op
    pub fn deregister(&self, id: &str) -> Result<(), RegistryError> {
        let removed = self.instances.write().remove(id);
        if let Some(instance) = removed {
            info!(service = instance.name, instance_id = id, "Deregistered service instance");
            self.publish(RegistryEventKind::InstanceRemoved, instance);
        } else {
            debug!(instance_id = id, "Deregister of unknown instance ignored");
        }
        Ok(())
    }

    /// Get a copy of one instance
    pub fn get(&self, id: &str) -> Option<ServiceInstance> {
        self.instances.read().get(id).cloned()
    }

    /// All instances, sorted by id
    pub fn list(&self) -> Vec<ServiceInstance> {
        let mut all: Vec<_> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// All instances of a service regardless of status, sorted by id
    pub fn instances_of(&self, name: &str) -> Vec<ServiceInstance> {
        let mut found: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| i.name == name)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Healthy instances of a service, sorted by id
    pub fn healthy_instances(&self, name: &str) -> Vec<ServiceInstance> {
        let mut found: Vec<_> = self
            .instances
            .read()
            .values()
            .filter(|i| i.name == name && i.is_healthy())
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        found
    }

    /// Distinct service names, sorted
    pub fn service_names(&self) -> Vec<String> {
        let names: BTreeSet<String> = self
            .instances
            .read()
            .values()
            .map(|i| i.name.clone())
            .collect();
        names.into_iter().collect()
    }

    /// Healthy instances grouped by service name
    pub fn get_healthy_services(&self) -> HashMap<String, Vec<ServiceInstance>> {
        let mut grouped: HashMap<String, Vec<ServiceInstance>> = HashMap::new();
        for instance in self.instances.read().values().filter(|i| i.is_healthy()) {
            grouped
                .entry(instance.name.clone())
                .or_default()
                .push(instance.clone());
        }
        for instances in grouped.values_mut() {
            instances.sort_by(|a, b| a.id.cmp(&b.id));
        }
        grouped
    }

    /// Instance counts overall and per service
    pub fn get_service_stats(&self) -> RegistryStats {
        let instances = self.instances.read();
        let mut stats = RegistryStats {
            total_instances: instances.len(),
            ..Default::default()
        };

        for instance in instances.values() {
            let counts = stats.services.entry(instance.name.clone()).or_default();
            counts.total += 1;
            match instance.status {
                ServiceStatus::Healthy => {
                    counts.healthy += 1;
                    stats.healthy_instances += 1;
                }
                ServiceStatus::Unhealthy => {
                    counts.unhealthy += 1;
                    stats.unhealthy_instances += 1;
                }
                ServiceStatus::Unknown => {
                    counts.unknown += 1;
                    stats.unknown_instances += 1;
                }
            }
        }
        stats
    }

    /// Record a successful probe: Healthy, failures reset, last_seen advanced
    pub fn record_probe_success(&self, id: &str) -> Option<ServiceStatus> {
        self.update_health(id, |instance| {
            instance.status = ServiceStatus::Healthy;
            instance.consecutive_failures = 0;
        })
    }

    /// Record a failed probe: Unhealthy, failure count incremented
    pub fn record_probe_failure(&self, id: &str) -> Option<ServiceStatus> {
        self.update_health(id, |instance| {
            instance.status = ServiceStatus::Unhealthy;
            instance.consecutive_failures = instance.consecutive_failures.saturating_add(1);
        })
    }

    /// Mark an instance healthy without a probe (instances with no health URL)
    pub fn mark_healthy(&self, id: &str) -> Option<ServiceStatus> {
        self.record_probe_success(id)
    }

    /// Apply a health update, returning the new status. Publishes
    /// `StatusChanged` only when the status actually flipped.
    fn update_health<F>(&self, id: &str, apply: F) -> Option<ServiceStatus>
    where
        F: FnOnce(&mut ServiceInstance),
    {
        let (previous, updated) = {
            let mut instances = self.instances.write();
            let instance = instances.get_mut(id)?;
            let previous = instance.status;
            apply(instance);
            instance.last_seen = Utc::now();
            (previous, instance.clone())
        };

        if previous != updated.status {
            info!(
                service = updated.name,
                instance_id = updated.id,
                from = ?previous,
                to = ?updated.status,
                "Instance status changed"
            );
            let status = updated.status;
            self.publish(RegistryEventKind::StatusChanged, updated);
            Some(status)
        } else {
            Some(updated.status)
        }
    }

    /// Remove instances that reached their `max_fails` threshold
    pub fn evict_exhausted(&self) -> Vec<String> {
        let evicted: Vec<ServiceInstance> = {
            let mut instances = self.instances.write();
            let ids: Vec<String> = instances
                .values()
                .filter(|i| i.max_fails > 0 && i.consecutive_failures >= i.max_fails)
                .map(|i| i.id.clone())
                .collect();
            ids.iter().filter_map(|id| instances.remove(id)).collect()
        };

        let mut ids = Vec::with_capacity(evicted.len());
        for instance in evicted {
            warn!(
                service = instance.name,
                instance_id = instance.id,
                failures = instance.consecutive_failures,
                "Evicting instance after repeated health check failures"
            );
            ids.push(instance.id.clone());
            self.publish(RegistryEventKind::InstanceRemoved, instance);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
