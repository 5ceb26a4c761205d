//! Service discovery client
//!
//! Read path over the registry: resolves a service name to its healthy
//! instances, picks one through the active load balancing strategy, and fans
//! registry events out to per-service watch subscriptions.

use crate::error::DiscoveryError;
use crate::loadbalancer::{LoadBalanceStrategy, LoadBalancer};
use crate::registry::{RegistryEvent, RegistryEventKind, ServiceInstance, ServiceRegistry};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    InstanceAdded,
    InstanceRemoved,
    StatusChanged,
    /// Registry events were missed; `healthy` carries the current set
    Resync,
}

impl From<RegistryEventKind> for WatchEventKind {
    fn from(kind: RegistryEventKind) -> Self {
        match kind {
            RegistryEventKind::InstanceAdded => WatchEventKind::InstanceAdded,
            RegistryEventKind::InstanceRemoved => WatchEventKind::InstanceRemoved,
            RegistryEventKind::StatusChanged => WatchEventKind::StatusChanged,
        }
    }
}

/// Topology change delivered to watchers of one service
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub service: String,
    /// The instance the change is about; `None` for a resync
    pub instance: Option<ServiceInstance>,
    /// Healthy set of `service` after the change
    pub healthy: Vec<ServiceInstance>,
}

pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    service: String,
    callback: WatchCallback,
}

pub struct DiscoveryClient {
    registry: Arc<ServiceRegistry>,
    balancer: RwLock<Arc<dyn LoadBalancer>>,
    subscriptions: RwLock<Vec<Subscription>>,
    next_subscription: AtomicU64,
}

impl DiscoveryClient {
    pub fn new(registry: Arc<ServiceRegistry>, strategy: LoadBalanceStrategy) -> Self {
        Self {
            registry,
            balancer: RwLock::new(strategy.build()),
            subscriptions: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Current healthy instances of `name`; empty when none are healthy
    pub fn get_instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.registry.healthy_instances(name)
    }

    /// Pick one healthy instance of `name` using the active strategy
    pub fn select_instance(&self, name: &str, key: &str) -> Result<ServiceInstance, DiscoveryError> {
        let instances = self.get_instances(name);
        // Clone the Arc so a concurrent swap cannot change the strategy mid-selection
        let balancer = Arc::clone(&*self.balancer.read());

        let selected = balancer
            .select(&instances, key)
            .cloned()
            .ok_or_else(|| DiscoveryError::NoHealthyInstance(name.to_string()))?;

        debug!(
            service = name,
            instance_id = selected.id,
            strategy = %balancer.strategy(),
            "Selected instance"
        );
        Ok(selected)
    }

    /// Swap the load balancing strategy by name
    pub fn set_load_balancer(&self, strategy: &str) -> Result<(), DiscoveryError> {
        let parsed: LoadBalanceStrategy = strategy
            .parse()
            .map_err(DiscoveryError::UnknownStrategy)?;
        *self.balancer.write() = parsed.build();
        info!(strategy = %parsed, "Load balancing strategy changed");
        Ok(())
    }

    pub fn strategy(&self) -> LoadBalanceStrategy {
        self.balancer.read().strategy()
    }

    /// Register a callback for topology changes of `service`
    pub fn watch_service<F>(&self, service: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.write().push(Subscription {
            id,
            service: service.to_string(),
            callback: Arc::new(callback),
        });
        debug!(service, subscription_id = id, "Watch registered");
        id
    }

    /// Like `watch_service`, but only when `service` has no subscription yet.
    /// Check and insert happen under one lock.
    pub fn watch_service_once<F>(&self, service: &str, callback: F) -> Option<SubscriptionId>
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        let mut subscriptions = self.subscriptions.write();
        if subscriptions.iter().any(|s| s.service == service) {
            return None;
        }

        let id = self.next_subscription.fetch_add(1, Ordering::Relaxed);
        subscriptions.push(Subscription {
            id,
            service: service.to_string(),
            callback: Arc::new(callback),
        });
        debug!(service, subscription_id = id, "Watch registered");
        Some(id)
    }

    /// Remove a subscription; returns whether it existed
    pub fn unwatch(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Whether any subscription exists for `service`
    pub fn is_watched(&self, service: &str) -> bool {
        self.subscriptions.read().iter().any(|s| s.service == service)
    }

    /// Deliver one registry event to the matching subscriptions.
    /// Returns the number of callbacks invoked.
    pub fn dispatch(&self, event: &RegistryEvent) -> usize {
        let service = &event.instance.name;
        let callbacks: Vec<WatchCallback> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| &s.service == service)
            .map(|s| Arc::clone(&s.callback))
            .collect();

        if callbacks.is_empty() {
            return 0;
        }

        let watch_event = WatchEvent {
            kind: event.kind.into(),
            service: service.clone(),
            instance: Some(event.instance.clone()),
            healthy: self.registry.healthy_instances(service),
        };

        // Invoke outside the lock so callbacks may (un)subscribe
        for callback in &callbacks {
            callback(&watch_event);
        }
        callbacks.len()
    }

    /// Send every watched service its current healthy set.
    /// Returns the number of callbacks invoked.
    pub fn resync(&self) -> usize {
        let callbacks: Vec<(String, WatchCallback)> = self
            .subscriptions
            .read()
            .iter()
            .map(|s| (s.service.clone(), Arc::clone(&s.callback)))
            .collect();

        for (service, callback) in &callbacks {
            callback(&WatchEvent {
                kind: WatchEventKind::Resync,
                service: service.clone(),
                instance: None,
                healthy: self.registry.healthy_instances(service),
            });
        }
        callbacks.len()
    }

    /// Spawn the dispatcher task that turns registry events into callbacks
    pub fn start_watchers(self: &Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        // Subscribe before spawning so no event between now and the first poll is lost
        let mut events = self.registry.subscribe();
        let client = Arc::clone(self);

        tokio::spawn(async move {
            info!("Watch dispatcher started");
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            client.dispatch(&event);
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            let resynced = client.resync();
                            warn!(skipped, resynced, "Watch dispatcher lagged behind registry events, resynced watchers");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Watch dispatcher stopped");
        })
    }
}
