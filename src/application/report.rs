//! Scalability Report
//!
//! One snapshot of every fabric component plus the recommendations
//! derived from it.

use crate::domain::entities::epoch_millis;
use crate::infrastructure::{
    AutoscalerStats, CacheStats, CircuitMetrics, LoadBalancerStats, PerformanceReport, PoolStats, RateLimiterStats,
};
use serde::Serialize;

/// Cache hit rate below which the report suggests tuning the policies.
pub const CACHE_HIT_RATE_FLOOR: f64 = 0.8;

/// Pool utilization above which the report suggests a larger pool.
pub const POOL_UTILIZATION_CEILING: f64 = 0.8;

#[derive(Debug, Clone, Serialize)]
pub struct ScalabilityReport {
    pub generated_at_ms: u64,
    pub load_balancer: LoadBalancerStats,
    pub cache: CacheStats,
    pub performance: PerformanceReport,
    pub autoscaling: AutoscalerStats,
    pub pools: Vec<PoolStats>,
    pub circuit_breaker: CircuitMetrics,
    pub rate_limiter: RateLimiterStats,
    pub recommendations: Vec<String>,
}

impl ScalabilityReport {
    pub fn new(
        load_balancer: LoadBalancerStats,
        cache: CacheStats,
        performance: PerformanceReport,
        autoscaling: AutoscalerStats,
        pools: Vec<PoolStats>,
        circuit_breaker: CircuitMetrics,
        rate_limiter: RateLimiterStats,
    ) -> Self {
        let mut report = Self {
            generated_at_ms: epoch_millis(),
            load_balancer,
            cache,
            performance,
            autoscaling,
            pools,
            circuit_breaker,
            rate_limiter,
            recommendations: Vec::new(),
        };
        report.recommendations = report.derive_recommendations();
        report
    }

    fn derive_recommendations(&self) -> Vec<String> {
        let mut out = Vec::new();

        // A cache that has never been read says nothing about its hit rate
        if self.cache.total_gets > 0 && self.cache.hit_rate < CACHE_HIT_RATE_FLOOR {
            out.push(format!(
                "Cache hit rate {:.1}% is below {:.0}%: review cache policies and TTLs",
                self.cache.hit_rate * 100.0,
                CACHE_HIT_RATE_FLOOR * 100.0
            ));
        }

        if self.load_balancer.unhealthy_targets > 0 {
            out.push(format!(
                "{} of {} targets are unhealthy: investigate failing targets or add capacity",
                self.load_balancer.unhealthy_targets, self.load_balancer.total_targets
            ));
        }

        for pool in &self.pools {
            if pool.utilization > POOL_UTILIZATION_CEILING || pool.waiting > 0 {
                out.push(format!(
                    "Pool '{}' is at {:.0}% utilization with {} waiting: raise max_connections above {}",
                    pool.name,
                    pool.utilization * 100.0,
                    pool.waiting,
                    pool.max_connections
                ));
            }
        }

        for policy in &self.autoscaling.policies {
            if policy.enabled && policy.desired_instances >= policy.max_instances {
                out.push(format!(
                    "Scaling policy '{}' is pinned at its maximum of {} instances: raise max_instances",
                    policy.name, policy.max_instances
                ));
            }
        }

        out.extend(self.performance.recommendations.iter().cloned());
        out
    }
}
