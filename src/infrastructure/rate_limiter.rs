//! Rate Limiter
//!
//! Token bucket rate limiting per client key. The limiter only throttles
//! while engaged, which the monitor triggers on connection pressure.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Bucket shared by requests that carry no client key.
pub const ANONYMOUS_CLIENT: &str = "anonymous";

/// Rate limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum requests per window
    pub max_requests: u64,
    /// Time window for rate limiting
    pub window: Duration,
    /// Maximum burst size (token bucket capacity)
    pub burst_size: u64,
    /// How long one engage signal keeps the limiter active
    pub engage_duration: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(1),
            burst_size: 10,
            engage_duration: Duration::from_secs(60),
        }
    }
}

/// Per-client bucket.
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
    /// Tokens added per millisecond
    refill_rate_per_ms: f64,
    engaged_until: Mutex<Option<Instant>>,
    limited: AtomicU64,
    engagements: AtomicU64,
}

impl RateLimiter {
    /// Create a new, disengaged rate limiter.
    pub fn new(config: RateLimitConfig) -> Self {
        let window_ms = config.window.as_millis().max(1) as f64;
        let refill_rate_per_ms = config.max_requests as f64 / window_ms;
        Self {
            config,
            buckets: DashMap::new(),
            refill_rate_per_ms,
            engaged_until: Mutex::new(None),
            limited: AtomicU64::new(0),
            engagements: AtomicU64::new(0),
        }
    }

    /// Start (or extend) throttling for `engage_duration`.
    ///
    /// A fresh engagement starts every client with a full bucket.
    pub fn engage(&self, reason: &str) {
        let now = Instant::now();
        let mut until = self.engaged_until.lock();
        let was_engaged = until.map(|u| u > now).unwrap_or(false);

        *until = Some(now + self.config.engage_duration);

        if !was_engaged {
            self.buckets.clear();
            self.engagements.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                reason = %reason,
                duration_secs = self.config.engage_duration.as_secs(),
                "rate limiting engaged"
            );
        }
    }

    /// Stop throttling immediately.
    pub fn disengage(&self) {
        *self.engaged_until.lock() = None;
        tracing::info!("rate limiting disengaged");
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged_until
            .lock()
            .map(|u| u > Instant::now())
            .unwrap_or(false)
    }

    /// Check if a request from this client is allowed.
    ///
    /// Always true while disengaged.
    pub fn check(&self, client: Option<&str>) -> bool {
        self.check_with_cost(client, 1)
    }

    /// Check if a request is allowed with a specific cost.
    pub fn check_with_cost(&self, client: Option<&str>, cost: u64) -> bool {
        if !self.is_engaged() {
            return true;
        }

        let key = client.unwrap_or(ANONYMOUS_CLIENT);
        let now = Instant::now();

        let mut bucket = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: self.config.burst_size as f64,
            last_refill: now,
        });

        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as f64;
        bucket.tokens = (bucket.tokens + elapsed_ms * self.refill_rate_per_ms).min(self.config.burst_size as f64);
        bucket.last_refill = now;

        if bucket.tokens >= cost as f64 {
            bucket.tokens -= cost as f64;
            true
        } else {
            self.limited.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(client = %key, "request rate limited");
            false
        }
    }

    /// Get remaining whole tokens for a client.
    pub fn remaining(&self, client: Option<&str>) -> u64 {
        self.buckets
            .get(client.unwrap_or(ANONYMOUS_CLIENT))
            .map(|b| b.tokens as u64)
            .unwrap_or(self.config.burst_size)
    }

    /// Get the number of tracked clients.
    pub fn client_count(&self) -> usize {
        self.buckets.len()
    }

    /// Remove buckets idle for longer than `max_age`. Returns the number removed.
    pub fn cleanup(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();
        self.buckets
            .retain(|_, b| now.duration_since(b.last_refill) < max_age);
        let removed = before - self.buckets.len();

        if removed > 0 {
            tracing::debug!("rate limiter cleanup: removed {} stale entries", removed);
        }
        removed
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            engaged: self.is_engaged(),
            tracked_clients: self.client_count(),
            limited_requests: self.limited.load(Ordering::Relaxed),
            engagements: self.engagements.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

/// Rate limiter counters.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub engaged: bool,
    pub tracked_clients: usize,
    pub limited_requests: u64,
    pub engagements: u64,
}
