//! Service Fabric
//!
//! Facade over every fabric component. Owns the periodic tasks and routes
//! monitor mitigation signals to the autoscaler, circuit breaker and rate
//! limiter.

use crate::application::report::ScalabilityReport;
use crate::config::Config;
use crate::domain::entities::{Connection, RouteRequest, Target};
use crate::domain::error::FabricError;
use crate::domain::ports::HealthProbe;
use crate::domain::value_objects::{metric, MitigationSignal, ScaleDirection};
use crate::infrastructure::rate_limiter::ANONYMOUS_CLIENT;
use crate::infrastructure::{
    Autoscaler, CircuitBreaker, ConnectionPool, HealthCheckConfig, HealthChecker, PerformanceMonitor, RateLimiter,
    ShutdownController, TargetRegistry, TieredCache,
};
use parking_lot::Mutex;
use regex::Regex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sampling interval of the built-in collectors.
pub const COLLECTOR_INTERVAL: Duration = Duration::from_secs(10);

/// How long `shutdown` waits for periodic tasks to exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Rate limiter buckets idle this long are dropped.
const RATE_LIMIT_IDLE: Duration = Duration::from_secs(300);

/// Periodic task intervals.
#[derive(Debug, Clone)]
pub struct FabricIntervals {
    pub cache_cleanup: Duration,
    pub pool_reclaim: Duration,
    pub autoscale: Duration,
    pub collector: Duration,
}

impl Default for FabricIntervals {
    fn default() -> Self {
        Self {
            cache_cleanup: Duration::from_secs(60),
            pool_reclaim: Duration::from_secs(60),
            autoscale: Duration::from_secs(60),
            collector: COLLECTOR_INTERVAL,
        }
    }
}

impl From<&Config> for FabricIntervals {
    fn from(config: &Config) -> Self {
        Self {
            cache_cleanup: config.cache_cleanup_interval(),
            pool_reclaim: config.pool_reclaim_interval(),
            autoscale: config.autoscale_interval(),
            collector: COLLECTOR_INTERVAL,
        }
    }
}

/// Completed request counters feeding the error rate collector.
#[derive(Default)]
struct RequestCounters {
    completed: AtomicU64,
    failed: AtomicU64,
}

impl RequestCounters {
    fn record(&self, success: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Error percentage since the previous call.
    fn take_error_rate(&self) -> f64 {
        let completed = self.completed.swap(0, Ordering::Relaxed);
        let failed = self.failed.swap(0, Ordering::Relaxed);
        if completed == 0 {
            0.0
        } else {
            failed as f64 * 100.0 / completed as f64
        }
    }
}

/// Receivers of the monitor's mitigation signals.
#[derive(Clone)]
struct Mitigator {
    autoscaler: Arc<Autoscaler>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
}

impl Mitigator {
    fn apply(&self, signal: &MitigationSignal) {
        match signal {
            MitigationSignal::ScaleUp { metric, value } => {
                let reason = format!("{} critical at {:.1}", metric, value);
                for policy in self.autoscaler.stats().policies {
                    if let Err(e) = self.autoscaler.trigger_scaling(ScaleDirection::Up, &reason, &policy.name) {
                        tracing::warn!(policy = %policy.name, "scale-up mitigation failed: {}", e);
                    }
                }
            }
            MitigationSignal::TripCircuit { value } => {
                self.breaker.trip(&format!("{} critical at {:.1}", metric::ERROR_RATE, value));
            }
            MitigationSignal::EngageRateLimit { value } => {
                self.limiter
                    .engage(&format!("{} critical at {:.0}", metric::ACTIVE_CONNECTIONS, value));
            }
        }
    }
}

/// The assembled fabric.
pub struct ServiceFabric {
    registry: Arc<TargetRegistry>,
    health_checker: HealthChecker,
    cache: Arc<TieredCache>,
    pools: Arc<ConnectionPool>,
    monitor: Arc<PerformanceMonitor>,
    autoscaler: Arc<Autoscaler>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    mitigator: Mitigator,
    requests: Arc<RequestCounters>,
    intervals: FabricIntervals,
    shutdown: ShutdownController,
    started: AtomicBool,
    mitigation_rx: Mutex<Option<mpsc::UnboundedReceiver<MitigationSignal>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceFabric {
    /// Assemble the fabric described by `config`. Nothing runs until
    /// [`ServiceFabric::start`].
    pub fn new(config: &Config, probe: Arc<dyn HealthProbe>) -> anyhow::Result<Self> {
        let topology = &config.topology;
        let intervals = FabricIntervals::from(config);

        let (mitigation_tx, mitigation_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(PerformanceMonitor::new().with_mitigation(mitigation_tx));
        for (name, threshold) in &topology.thresholds {
            monitor.set_threshold(name, threshold.warning, threshold.critical);
        }

        let registry = Arc::new(TargetRegistry::new(config.algorithm));
        for spec in &topology.targets {
            registry.register(spec.to_target())?;
        }

        let health_checker = HealthChecker::new(
            HealthCheckConfig {
                interval: config.health_check_interval(),
                timeout: config.health_check_timeout(),
                unhealthy_threshold: config.unhealthy_threshold,
            },
            probe,
        );

        let cache = Arc::new(TieredCache::new(
            topology.cache_layers.iter().map(|l| l.to_config()).collect(),
        ));
        for spec in &topology.cache_policies {
            cache.add_policy(spec.to_policy()?);
        }

        let pools = Arc::new(ConnectionPool::new());
        for spec in &topology.pools {
            pools.create_pool(&spec.name, spec.to_config())?;
        }

        let autoscaler =
            Arc::new(Autoscaler::new(monitor.clone()).with_provisioning_delay(config.provisioning_delay()));
        for spec in &topology.scaling_policies {
            autoscaler.create_policy(&spec.name, spec.to_config());
        }

        let requests = Arc::new(RequestCounters::default());
        let lb = registry.clone();
        monitor.register_collector(metric::ACTIVE_CONNECTIONS, intervals.collector, move || {
            lb.total_connections() as f64
        });
        let counters = requests.clone();
        monitor.register_collector(metric::ERROR_RATE, intervals.collector, move || counters.take_error_rate());

        let breaker = Arc::new(CircuitBreaker::default());
        let limiter = Arc::new(RateLimiter::default());
        let mitigator = Mitigator {
            autoscaler: autoscaler.clone(),
            breaker: breaker.clone(),
            limiter: limiter.clone(),
        };

        tracing::info!(
            algorithm = %config.algorithm,
            targets = registry.len(),
            cache_layers = topology.cache_layers.len(),
            pools = topology.pools.len(),
            scaling_policies = topology.scaling_policies.len(),
            "service fabric assembled"
        );

        Ok(Self {
            registry,
            health_checker,
            cache,
            pools,
            monitor,
            autoscaler,
            breaker,
            limiter,
            mitigator,
            requests,
            intervals,
            shutdown: ShutdownController::new(),
            started: AtomicBool::new(false),
            mitigation_rx: Mutex::new(Some(mitigation_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn every periodic task. Calling it twice is a no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            tracing::warn!("service fabric already started");
            return;
        }

        let mut tasks = self.tasks.lock();

        tasks.push(self.health_checker.start(self.registry.clone(), &self.shutdown));
        tasks.push(self.cache.start_cleanup(self.intervals.cache_cleanup, &self.shutdown));

        let pools = self.pools.clone();
        tasks.push(
            self.shutdown
                .spawn_periodic("pool_reclaim", self.intervals.pool_reclaim, move || {
                    pools.reclaim_idle();
                    std::future::ready(())
                }),
        );

        let limiter = self.limiter.clone();
        tasks.push(
            self.shutdown
                .spawn_periodic("rate_limit_cleanup", RATE_LIMIT_IDLE, move || {
                    limiter.cleanup(RATE_LIMIT_IDLE);
                    std::future::ready(())
                }),
        );

        tasks.extend(self.monitor.start_collectors(&self.shutdown));
        tasks.push(self.autoscaler.start_evaluation(self.intervals.autoscale, &self.shutdown));

        if let Some(rx) = self.mitigation_rx.lock().take() {
            tasks.push(self.spawn_mitigation(rx));
        }

        tracing::info!(tasks = tasks.len(), "service fabric started");
    }

    /// Stop every periodic task. Returns false if some task had to be
    /// aborted after the drain timeout.
    pub async fn shutdown(&self) -> bool {
        self.shutdown.shutdown();
        let drained = self.shutdown.wait_for_drain(DRAIN_TIMEOUT).await;

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if !task.is_finished() {
                task.abort();
            }
        }

        tracing::info!(drained, "service fabric stopped");
        drained
    }

    /// Pick a target for `request`.
    ///
    /// The circuit breaker and rate limiter are consulted before the load
    /// balancer. A successful route must be paired with
    /// [`ServiceFabric::complete_request`].
    pub fn route(&self, request: &RouteRequest) -> Result<Target, FabricError> {
        if !self.breaker.allow_request() {
            tracing::debug!("request rejected: circuit open");
            return Err(FabricError::CircuitOpen);
        }

        let client = request.client_addr.as_deref();
        if !self.limiter.check(client) {
            return Err(FabricError::RateLimited {
                client: client.unwrap_or(ANONYMOUS_CLIENT).to_string(),
            });
        }

        self.registry.route(request)
    }

    /// Finish a routed request.
    pub fn complete_request(&self, target_id: &str, response_time_ms: u64, success: bool) -> Result<(), FabricError> {
        self.registry.release(target_id)?;
        self.registry.record_response_time(target_id, response_time_ms)?;
        self.monitor.record_metric(metric::RESPONSE_TIME, response_time_ms as f64);
        self.requests.record(success);

        if success {
            self.breaker.record_success();
        } else {
            self.breaker.record_failure();
        }
        Ok(())
    }

    pub fn register_target(&self, target: Target) -> Result<String, FabricError> {
        self.registry.register(target)
    }

    pub fn deregister_target(&self, id: &str) -> Result<Target, FabricError> {
        self.registry.deregister(id)
    }

    pub fn cache_get(&self, key: &str) -> Option<serde_json::Value> {
        self.cache.get(key)
    }

    /// Store `value` in every layer its policy names. Returns the number of
    /// layers written.
    pub fn cache_set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> usize {
        self.cache.set(key, value, ttl)
    }

    /// Remove every key matching the regular expression `pattern`.
    pub fn cache_invalidate(&self, pattern: &str) -> Result<usize, FabricError> {
        let pattern = Regex::new(pattern).map_err(|e| FabricError::InvalidPattern(e.to_string()))?;
        Ok(self.cache.invalidate(&pattern))
    }

    pub async fn pool_acquire(&self, pool: &str) -> Result<Connection, FabricError> {
        self.pools.acquire(pool).await
    }

    pub fn pool_release(&self, pool: &str, connection_id: &str) -> Result<(), FabricError> {
        self.pools.release(pool, connection_id)
    }

    pub fn record_metric(&self, name: &str, value: f64) {
        self.monitor.record_metric(name, value);
    }

    /// Act on a mitigation signal immediately.
    pub fn apply_mitigation(&self, signal: &MitigationSignal) {
        self.mitigator.apply(signal);
    }

    pub fn generate_scalability_report(&self) -> ScalabilityReport {
        ScalabilityReport::new(
            self.registry.stats(),
            self.cache.stats(),
            self.monitor.generate_report(),
            self.autoscaler.stats(),
            self.pools.all_stats(),
            self.breaker.metrics(),
            self.limiter.stats(),
        )
    }

    pub fn registry(&self) -> &Arc<TargetRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.cache
    }

    pub fn pools(&self) -> &Arc<ConnectionPool> {
        &self.pools
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn autoscaler(&self) -> &Arc<Autoscaler> {
        &self.autoscaler
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn shutdown_controller(&self) -> &ShutdownController {
        &self.shutdown
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    fn spawn_mitigation(&self, mut rx: mpsc::UnboundedReceiver<MitigationSignal>) -> JoinHandle<()> {
        let mitigator = self.mitigator.clone();
        let controller = self.shutdown.clone();
        let mut shutdown_rx = controller.subscribe();

        tokio::spawn(async move {
            while !controller.is_shutdown() {
                tokio::select! {
                    signal = rx.recv() => match signal {
                        Some(signal) => {
                            tracing::debug!(?signal, "dispatching mitigation signal");
                            mitigator.apply(&signal);
                        }
                        None => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
            tracing::debug!("mitigation dispatcher stopped");
        })
    }
}
