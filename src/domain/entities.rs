//! Domain Entities - Core fabric objects
//!
//! These entities represent the core concepts of the service fabric.
//! They have no I/O and contain only state-transition logic.

use crate::domain::value_objects::{
    ActionStatus, AlertSeverity, AlertStatus, ScaleDirection,
};
use serde::Serialize;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

/// Milliseconds since the Unix epoch, for records that leave the process.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Operational status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Active,
    Unhealthy,
    Draining,
}

/// A backend instance the load balancer can route to.
#[derive(Debug, Clone, Serialize)]
pub struct Target {
    /// Unique identifier for this target
    pub id: String,
    /// Network address probed by health checks (host:port)
    pub address: String,
    /// Relative weight for weighted selection
    pub weight: u32,
    /// Maximum concurrent connections (hard cap)
    pub max_connections: u32,
    /// Connections routed and not yet released
    pub current_connections: u32,
    /// Last observed response time in milliseconds
    pub response_time_ms: u64,
    pub status: TargetStatus,
    /// Free-form region tag
    pub region: String,
    /// Capability tags (e.g. "api", "static")
    pub capabilities: Vec<String>,
    /// Lifetime number of requests routed here
    pub requests_served: u64,
}

impl Target {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            weight: 1,
            max_connections: 100,
            current_connections: 0,
            response_time_ms: 0,
            status: TargetStatus::Active,
            region: String::new(),
            capabilities: Vec::new(),
            requests_served: 0,
        }
    }

    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Whether another connection fits under the cap.
    pub fn has_capacity(&self) -> bool {
        self.current_connections < self.max_connections
    }
}

/// Outcome of a single health probe.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Success { latency_ms: u64 },
    Failure { error: String, latency_ms: u64 },
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Success { .. })
    }

    pub fn latency_ms(&self) -> u64 {
        match self {
            ProbeOutcome::Success { latency_ms } | ProbeOutcome::Failure { latency_ms, .. } => {
                *latency_ms
            }
        }
    }
}

/// Health bookkeeping for one target.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    pub healthy: bool,
    /// Unset until the first probe completes
    pub last_check: Option<Instant>,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            healthy: true,
            last_check: None,
            consecutive_failures: 0,
            last_latency_ms: None,
            last_error: None,
        }
    }
}

impl HealthRecord {
    /// Fold a probe outcome into the record.
    ///
    /// Returns `Some(healthy)` when the healthy flag flipped.
    pub fn observe(&mut self, outcome: &ProbeOutcome, unhealthy_threshold: u32) -> Option<bool> {
        let was_healthy = self.healthy;

        match outcome {
            ProbeOutcome::Success { latency_ms } => {
                self.consecutive_failures = 0;
                self.last_latency_ms = Some(*latency_ms);
                self.last_error = None;
                self.healthy = true;
            }
            ProbeOutcome::Failure { error, latency_ms } => {
                self.consecutive_failures += 1;
                self.last_latency_ms = Some(*latency_ms);
                self.last_error = Some(error.clone());
                if self.consecutive_failures >= unhealthy_threshold {
                    self.healthy = false;
                }
            }
        }

        self.last_check = Some(Instant::now());

        (was_healthy != self.healthy).then_some(self.healthy)
    }
}

/// An incoming request to be routed.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest {
    /// Client address used for IP-hash affinity and rate limiting
    pub client_addr: Option<String>,
    /// Request path, informational only
    pub path: Option<String>,
}

impl RouteRequest {
    pub fn from_client(client_addr: impl Into<String>) -> Self {
        Self {
            client_addr: Some(client_addr.into()),
            path: None,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// A value stored in one cache layer.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: serde_json::Value,
    /// Write or promotion time; drives both TTL and eviction order
    pub written_at: Instant,
    pub ttl: Duration,
    /// Estimated footprint in bytes
    pub size: usize,
    pub access_count: u64,
}

impl CacheEntry {
    pub fn new(key: &str, value: serde_json::Value, ttl: Duration) -> Self {
        let size = Self::estimate_size(key, &value);
        Self {
            value,
            written_at: Instant::now(),
            ttl,
            size,
            access_count: 0,
        }
    }

    /// Serialized JSON length plus the key length.
    pub fn estimate_size(key: &str, value: &serde_json::Value) -> usize {
        let body = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
        key.len() + body
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.written_at) > self.ttl
    }
}

/// A reusable resource handle owned by a named pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: String,
    pub pool: String,
    pub created_at: Instant,
    pub last_used: Instant,
    pub in_use: bool,
}

impl Connection {
    pub fn new(pool: &str) -> Self {
        let now = Instant::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            pool: pool.to_string(),
            created_at: now,
            last_used: now,
            in_use: false,
        }
    }

    /// Check if this connection has been idle too long.
    pub fn is_idle_expired(&self, idle_timeout: Duration, now: Instant) -> bool {
        !self.in_use && now.duration_since(self.last_used) > idle_timeout
    }

    /// Touch the connection to update last_used.
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

/// A threshold breach recorded by the monitor.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub id: String,
    pub metric: String,
    pub value: f64,
    pub severity: AlertSeverity,
    /// The threshold that was crossed
    pub threshold: f64,
    pub timestamp_ms: u64,
    pub status: AlertStatus,
}

impl Alert {
    pub fn new(metric: &str, value: f64, severity: AlertSeverity, threshold: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            metric: metric.to_string(),
            value,
            severity,
            threshold,
            timestamp_ms: epoch_millis(),
            status: AlertStatus::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == AlertStatus::Active
    }
}

/// A recorded scaling decision.
#[derive(Debug, Clone, Serialize)]
pub struct ScalingAction {
    /// Per-policy sequence number, used to match async completion
    pub sequence: u64,
    pub direction: ScaleDirection,
    pub from: u32,
    pub to: u32,
    pub reason: String,
    pub status: ActionStatus,
    pub timestamp_ms: u64,
    #[serde(skip)]
    pub at: Instant,
}
