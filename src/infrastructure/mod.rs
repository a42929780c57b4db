//! Infrastructure Layer
//!
//! Stateful fabric components and the periodic tasks that drive them.

pub mod autoscaler;
pub mod circuit_breaker;
pub mod connection_pool;
pub mod health_checker;
pub mod performance_monitor;
pub mod rate_limiter;
pub mod shutdown;
pub mod target_registry;
pub mod tiered_cache;

pub use autoscaler::{Autoscaler, AutoscalerStats, PolicyStats, ScalingPolicyConfig, DEFAULT_PROVISIONING_DELAY};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
pub use connection_pool::{ConnectionPool, PoolConfig, PoolStats};
pub use health_checker::{HealthCheckConfig, HealthChecker};
pub use performance_monitor::{
    default_thresholds, MetricStats, PerformanceMonitor, PerformanceReport, Threshold, MAX_ALERTS, MAX_SAMPLES,
};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterStats};
pub use shutdown::{shutdown_signal, ShutdownController};
pub use target_registry::{LoadBalancerStats, TargetRegistry, TargetStats};
pub use tiered_cache::{CachePolicy, CacheStats, LayerConfig, LayerStats, TieredCache};
