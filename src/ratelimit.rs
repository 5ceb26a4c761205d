//! Sliding-window rate limiter keyed by client
//!
//! Each client key owns an ordered list of request timestamps. Timestamps
//! older than the window are pruned on every access; there is no separate
//! eviction pass. The key map is sharded (`DashMap`) and every window has its
//! own lock, so clients only contend with themselves.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    limit: usize,
    window: Duration,
    clients: DashMap<String, Mutex<VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: DashMap::new(),
        }
    }

    /// Limiter allowing `requests_per_minute` per client over a 60s window
    pub fn per_minute(requests_per_minute: usize) -> Self {
        Self::new(requests_per_minute, Duration::from_secs(60))
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a request for `key` if it fits in the window
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    /// Same as [`check`](Self::check) with an explicit clock reading
    pub fn check_at(&self, key: &str, now: Instant) -> bool {
        let entry = match self.clients.get(key) {
            Some(entry) => entry,
            None => self.clients.entry(key.to_string()).or_default().downgrade(),
        };

        let mut timestamps = entry.lock();
        Self::prune(&mut timestamps, now, self.window);

        if timestamps.len() >= self.limit {
            return false;
        }
        timestamps.push_back(now);
        true
    }

    /// Requests still available to `key` in the current window
    pub fn remaining(&self, key: &str) -> usize {
        self.remaining_at(key, Instant::now())
    }

    pub fn remaining_at(&self, key: &str, now: Instant) -> usize {
        match self.clients.get(key) {
            Some(entry) => {
                let mut timestamps = entry.lock();
                Self::prune(&mut timestamps, now, self.window);
                self.limit.saturating_sub(timestamps.len())
            }
            None => self.limit,
        }
    }

    /// Number of client keys with state
    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }

    fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = timestamps.front() {
            if now.saturating_duration_since(*oldest) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_burst_over_ceiling_then_window_reset() {
        let limiter = RateLimiter::per_minute(5);
        let start = Instant::now();

        let accepted = (0..8)
            .filter(|i| limiter.check_at("10.0.0.1", start + Duration::from_millis(*i)))
            .count();
        assert_eq!(accepted, 5);

        // Still inside the window
        assert!(!limiter.check_at("10.0.0.1", start + Duration::from_secs(59)));

        // Whole window elapsed: a full budget again
        let later = start + Duration::from_secs(61);
        let accepted = (0..8)
            .filter(|i| limiter.check_at("10.0.0.1", later + Duration::from_millis(*i)))
            .count();
        assert_eq!(accepted, 5);
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check_at("c", start));
        assert!(limiter.check_at("c", start + Duration::from_secs(5)));
        assert!(!limiter.check_at("c", start + Duration::from_secs(9)));
        // The first request ages out, freeing exactly one slot
        assert!(limiter.check_at("c", start + Duration::from_secs(10)));
        assert!(!limiter.check_at("c", start + Duration::from_secs(11)));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::per_minute(1);
        let now = Instant::now();

        assert!(limiter.check_at("a", now));
        assert!(!limiter.check_at("a", now));
        assert!(limiter.check_at("b", now));
        assert_eq!(limiter.tracked_clients(), 2);
    }

    #[test]
    fn test_remaining() {
        let limiter = RateLimiter::per_minute(3);
        let now = Instant::now();

        assert_eq!(limiter.remaining_at("a", now), 3);
        limiter.check_at("a", now);
        assert_eq!(limiter.remaining_at("a", now), 2);
        assert_eq!(limiter.remaining_at("a", now + Duration::from_secs(60)), 3);
    }

    #[test]
    fn test_concurrent_clients_never_exceed_ceiling() {
        let limiter = Arc::new(RateLimiter::per_minute(50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| limiter.check("shared")).count())
            })
            .collect();

        let accepted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(accepted, 50);
    }
}
