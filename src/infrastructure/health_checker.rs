//! Active Health Checker
//!
//! Periodically probes every registered target and folds the outcome into
//! the target registry.

use crate::domain::entities::ProbeOutcome;
use crate::domain::ports::HealthProbe;
use crate::infrastructure::shutdown::ShutdownController;
use crate::infrastructure::target_registry::TargetRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Health check configuration.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    /// Interval between health check rounds
    pub interval: Duration,
    /// Timeout for each probe
    pub timeout: Duration,
    /// Number of consecutive failures before marking unhealthy
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
        }
    }
}

type HealthCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Active health checker for load balancer targets.
#[derive(Clone)]
pub struct HealthChecker {
    config: HealthCheckConfig,
    probe: Arc<dyn HealthProbe>,
    /// Callback when health changes
    on_health_change: Option<HealthCallback>,
}

impl HealthChecker {
    /// Create a new health checker using `probe`.
    pub fn new(config: HealthCheckConfig, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            config,
            probe,
            on_health_change: None,
        }
    }

    /// Set callback for health status changes.
    pub fn on_health_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, bool) + Send + Sync + 'static,
    {
        self.on_health_change = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    /// Run one health check round over every registered target.
    ///
    /// Returns the number of targets whose health flipped.
    pub async fn check_all(&self, registry: &TargetRegistry) -> usize {
        let mut flips = 0;

        for (id, address) in registry.addresses() {
            let outcome = self.check_target(&address).await;

            if let Some(healthy) = registry.apply_probe(&id, &outcome, self.config.unhealthy_threshold) {
                flips += 1;
                if healthy {
                    tracing::info!(target_id = %id, "target {} is now healthy", id);
                } else {
                    let error = match &outcome {
                        ProbeOutcome::Failure { error, .. } => error.as_str(),
                        ProbeOutcome::Success { .. } => "",
                    };
                    tracing::warn!(target_id = %id, "target {} is now unhealthy: {}", id, error);
                }

                if let Some(callback) = &self.on_health_change {
                    callback(&id, healthy);
                }
            }
        }

        flips
    }

    /// Probe one address, bounded by the configured timeout.
    async fn check_target(&self, address: &str) -> ProbeOutcome {
        let start = Instant::now();

        match tokio::time::timeout(self.config.timeout, self.probe.probe(address)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::Failure {
                error: "probe timeout".to_string(),
                latency_ms: start.elapsed().as_millis() as u64,
            },
        }
    }

    /// Start the health check loop.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start(&self, registry: Arc<TargetRegistry>, shutdown: &ShutdownController) -> JoinHandle<()> {
        let checker = self.clone();
        shutdown.spawn_periodic("health_check", self.config.interval, move || {
            let checker = checker.clone();
            let registry = registry.clone();
            async move {
                checker.check_all(&registry).await;
            }
        })
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::domain::entities::{RouteRequest, Target, TargetStatus};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Probe whose per-address outcome is set by the test.
    #[derive(Default)]
    struct ScriptedProbe {
        down: Mutex<HashMap<String, bool>>,
    }

    impl ScriptedProbe {
        fn set_down(&self, address: &str, down: bool) {
            self.down.lock().insert(address.to_string(), down);
        }
    }

    #[async_trait]
    impl HealthProbe for ScriptedProbe {
        async fn probe(&self, address: &str) -> ProbeOutcome {
            if self.down.lock().get(address).copied().unwrap_or(false) {
                ProbeOutcome::Failure {
                    error: "connection refused".to_string(),
                    latency_ms: 1,
                }
            } else {
                ProbeOutcome::Success { latency_ms: 2 }
            }
        }
    }

    struct HangingProbe;

    #[async_trait]
    impl HealthProbe for HangingProbe {
        async fn probe(&self, _address: &str) -> ProbeOutcome {
            std::future::pending().await
        }
    }

    fn registry() -> Arc<TargetRegistry> {
        let registry = Arc::new(TargetRegistry::default());
        registry.register(Target::new("a", "10.0.0.1:80")).unwrap();
        registry.register(Target::new("b", "10.0.0.2:80")).unwrap();
        registry
    }

    #[test]
    fn test_config_default() {
        let config = HealthCheckConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.unhealthy_threshold, 3);
    }

    #[tokio::test]
    async fn test_check_all_marks_unhealthy_after_threshold() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set_down("10.0.0.1:80", true);
        let checker = HealthChecker::new(HealthCheckConfig::default(), probe.clone());
        let registry = registry();

        assert_eq!(checker.check_all(&registry).await, 0);
        assert_eq!(checker.check_all(&registry).await, 0);
        assert_eq!(checker.check_all(&registry).await, 1);

        assert!(!registry.health("a").unwrap().healthy);
        assert_eq!(registry.get("a").unwrap().status, TargetStatus::Unhealthy);
        assert!(registry.health("b").unwrap().healthy);

        for _ in 0..3 {
            assert_eq!(registry.route(&RouteRequest::default()).unwrap().id, "b");
            registry.release("b").unwrap();
        }
    }

    #[tokio::test]
    async fn test_check_all_recovers_on_success() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set_down("10.0.0.1:80", true);
        let config = HealthCheckConfig {
            unhealthy_threshold: 1,
            ..Default::default()
        };
        let checker = HealthChecker::new(config, probe.clone());
        let registry = registry();

        checker.check_all(&registry).await;
        assert!(!registry.health("a").unwrap().healthy);

        probe.set_down("10.0.0.1:80", false);
        assert_eq!(checker.check_all(&registry).await, 1);
        assert!(registry.health("a").unwrap().healthy);
        assert_eq!(registry.get("a").unwrap().status, TargetStatus::Active);
    }

    #[tokio::test]
    async fn test_callback_invoked_on_flip() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set_down("10.0.0.2:80", true);
        let flips = Arc::new(Mutex::new(Vec::new()));
        let seen = flips.clone();

        let config = HealthCheckConfig {
            unhealthy_threshold: 2,
            ..Default::default()
        };
        let checker = HealthChecker::new(config, probe.clone())
            .on_health_change(move |id, healthy| seen.lock().push((id.to_string(), healthy)));
        let registry = registry();

        checker.check_all(&registry).await;
        assert!(flips.lock().is_empty());

        checker.check_all(&registry).await;
        assert_eq!(*flips.lock(), vec![("b".to_string(), false)]);
    }

    #[tracing_test::traced_test]
    #[tokio::test]
    async fn test_flip_is_logged() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set_down("10.0.0.1:80", true);
        let config = HealthCheckConfig {
            unhealthy_threshold: 1,
            ..Default::default()
        };
        let checker = HealthChecker::new(config, probe.clone());
        let registry = registry();

        checker.check_all(&registry).await;
        assert!(logs_contain("target a is now unhealthy: connection refused"));

        probe.set_down("10.0.0.1:80", false);
        checker.check_all(&registry).await;
        assert!(logs_contain("target a is now healthy"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let config = HealthCheckConfig {
            timeout: Duration::from_millis(50),
            unhealthy_threshold: 1,
            ..Default::default()
        };
        let checker = HealthChecker::new(config, Arc::new(HangingProbe));
        let registry = registry();

        assert_eq!(checker.check_all(&registry).await, 2);

        let health = registry.health("a").unwrap();
        assert!(!health.healthy);
        assert_eq!(health.last_error.as_deref(), Some("probe timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_runs_until_shutdown() {
        let probe = Arc::new(ScriptedProbe::default());
        probe.set_down("10.0.0.1:80", true);
        let config = HealthCheckConfig {
            interval: Duration::from_secs(30),
            ..Default::default()
        };
        let checker = HealthChecker::new(config, probe.clone());
        let registry = registry();
        let shutdown = ShutdownController::new();

        let handle = checker.start(registry.clone(), &shutdown);

        // Rounds at 0s, 30s and 60s
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!registry.health("a").unwrap().healthy);

        shutdown.shutdown();
        handle.await.unwrap();
    }
}
