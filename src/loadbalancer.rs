//! Load balancing strategies for picking one instance out of a healthy set
//!
//! Strategies are stateless with respect to the instance list: the discovery
//! client passes the current healthy set on every call, so a strategy never
//! sees stale topology.

use crate::registry::ServiceInstance;
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Load balancing strategy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LoadBalanceStrategy {
    /// Round-robin: distribute requests evenly in order
    #[default]
    RoundRobin,
    /// Random: uniformly select an instance
    Random,
    /// Weighted: random selection biased by instance weight
    Weighted,
    /// Consistent hash: the same key sticks to the same instance
    ConsistentHash,
}

impl LoadBalanceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadBalanceStrategy::RoundRobin => "round-robin",
            LoadBalanceStrategy::Random => "random",
            LoadBalanceStrategy::Weighted => "weighted",
            LoadBalanceStrategy::ConsistentHash => "consistent-hash",
        }
    }

    /// Build a fresh balancer for this strategy
    pub fn build(&self) -> Arc<dyn LoadBalancer> {
        match self {
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobin::default()),
            LoadBalanceStrategy::Random => Arc::new(RandomChoice),
            LoadBalanceStrategy::Weighted => Arc::new(WeightedRandom),
            LoadBalanceStrategy::ConsistentHash => Arc::new(ConsistentHash),
        }
    }
}

impl fmt::Display for LoadBalanceStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "round-robin" | "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
            "random" => Ok(LoadBalanceStrategy::Random),
            "weighted" => Ok(LoadBalanceStrategy::Weighted),
            "consistent-hash" | "sticky" | "hash" => Ok(LoadBalanceStrategy::ConsistentHash),
            _ => Err(s.to_string()),
        }
    }
}

/// A selection policy over a healthy instance set
pub trait LoadBalancer: Send + Sync {
    fn strategy(&self) -> LoadBalanceStrategy;

    /// Pick one instance; `None` only when `instances` is empty
    fn select<'a>(&self, instances: &'a [ServiceInstance], key: &str) -> Option<&'a ServiceInstance>;
}

/// Cycles through instances in id order
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobin {
    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::RoundRobin
    }

    fn select<'a>(&self, instances: &'a [ServiceInstance], _key: &str) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % instances.len();
        instances.get(idx)
    }
}

#[derive(Debug, Default)]
pub struct RandomChoice;

impl LoadBalancer for RandomChoice {
    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::Random
    }

    fn select<'a>(&self, instances: &'a [ServiceInstance], _key: &str) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..instances.len());
        instances.get(idx)
    }
}

/// Random selection with probability proportional to `weight`.
/// Zero-weight instances are only used when every weight is zero.
#[derive(Debug, Default)]
pub struct WeightedRandom;

impl LoadBalancer for WeightedRandom {
    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::Weighted
    }

    fn select<'a>(&self, instances: &'a [ServiceInstance], key: &str) -> Option<&'a ServiceInstance> {
        let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
        if total == 0 {
            return RandomChoice.select(instances, key);
        }

        let mut point = rand::thread_rng().gen_range(0..total);
        for instance in instances {
            let weight = u64::from(instance.weight);
            if point < weight {
                return Some(instance);
            }
            point -= weight;
        }
        instances.last()
    }
}

/// Rendezvous hashing on the request key: each key maps to the instance with
/// the highest hash score, so removing one instance only moves the keys that
/// were pinned to it.
#[derive(Debug, Default)]
pub struct ConsistentHash;

impl ConsistentHash {
    fn score(key: &str, instance: &ServiceInstance) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        instance.id.hash(&mut hasher);
        hasher.finish()
    }
}

impl LoadBalancer for ConsistentHash {
    fn strategy(&self) -> LoadBalanceStrategy {
        LoadBalanceStrategy::ConsistentHash
    }

    fn select<'a>(&self, instances: &'a [ServiceInstance], key: &str) -> Option<&'a ServiceInstance> {
        instances.iter().max_by_key(|instance| Self::score(key, instance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{RegistrationRequest, ServiceRegistry};

    fn instances(weights: &[u32]) -> Vec<ServiceInstance> {
        let registry = ServiceRegistry::new();
        for (i, weight) in weights.iter().enumerate() {
            registry
                .register(
                    RegistrationRequest::new("svc", "127.0.0.1", 10001 + i as u16)
                        .with_id(&format!("instance-{}", i + 1))
                        .with_weight(*weight),
                )
                .unwrap();
        }
        registry.instances_of("svc")
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::default();
        let set = instances(&[1, 1, 1]);

        // Should cycle through instances
        assert_eq!(lb.select(&set, "").unwrap().port, 10001);
        assert_eq!(lb.select(&set, "").unwrap().port, 10002);
        assert_eq!(lb.select(&set, "").unwrap().port, 10003);
        assert_eq!(lb.select(&set, "").unwrap().port, 10001); // wraps around
    }

    #[test]
    fn test_empty_set_selects_nothing() {
        for strategy in [
            LoadBalanceStrategy::RoundRobin,
            LoadBalanceStrategy::Random,
            LoadBalanceStrategy::Weighted,
            LoadBalanceStrategy::ConsistentHash,
        ] {
            assert!(strategy.build().select(&[], "key").is_none(), "{}", strategy);
        }
    }

    #[test]
    fn test_weighted_skips_zero_weight() {
        let lb = WeightedRandom;
        let set = instances(&[0, 3]);

        for _ in 0..200 {
            assert_eq!(lb.select(&set, "").unwrap().id, "instance-2");
        }
    }

    #[test]
    fn test_weighted_all_zero_falls_back_to_uniform() {
        let lb = WeightedRandom;
        let set = instances(&[0, 0]);
        assert!(lb.select(&set, "").is_some());
    }

    #[test]
    fn test_consistent_hash_is_sticky() {
        let lb = ConsistentHash;
        let set = instances(&[1, 1, 1, 1]);

        let first = lb.select(&set, "10.0.0.7").unwrap().id.clone();
        for _ in 0..20 {
            assert_eq!(lb.select(&set, "10.0.0.7").unwrap().id, first);
        }
    }

    #[test]
    fn test_consistent_hash_only_moves_keys_of_removed_instance() {
        let lb = ConsistentHash;
        let set = instances(&[1, 1, 1]);
        let reduced: Vec<_> = set.iter().filter(|i| i.id != "instance-2").cloned().collect();

        for n in 0..50 {
            let key = format!("client-{}", n);
            let before = lb.select(&set, &key).unwrap().id.clone();
            let after = lb.select(&reduced, &key).unwrap().id.clone();
            if before != "instance-2" {
                assert_eq!(before, after);
            }
        }
    }

    #[test]
    fn test_strategy_parsing() {
        let parse = |s: &str| s.parse::<LoadBalanceStrategy>();
        assert_eq!(parse("round-robin"), Ok(LoadBalanceStrategy::RoundRobin));
        assert_eq!(parse("ROUND_ROBIN"), Ok(LoadBalanceStrategy::RoundRobin));
        assert_eq!(parse("weighted"), Ok(LoadBalanceStrategy::Weighted));
        assert_eq!(parse("sticky"), Ok(LoadBalanceStrategy::ConsistentHash));
        assert!("least-connections".parse::<LoadBalanceStrategy>().is_err());
    }
}
