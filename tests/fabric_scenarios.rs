//! End-to-end scenarios through the ServiceFabric facade.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use service_fabric::config::{Config, PoolSpec, ScalingSpec, TargetSpec, Topology};
use service_fabric::domain::value_objects::metric;
use service_fabric::infrastructure::CircuitState;
use service_fabric::{Algorithm, FabricError, HealthProbe, MitigationSignal, ProbeOutcome, RouteRequest, ServiceFabric};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Probe whose per-address outcome is set by the test.
#[derive(Default)]
struct ScriptedProbe {
    down: Mutex<HashSet<String>>,
}

impl ScriptedProbe {
    fn set_down(&self, address: &str) {
        self.down.lock().insert(address.to_string());
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, address: &str) -> ProbeOutcome {
        if self.down.lock().contains(address) {
            ProbeOutcome::Failure {
                error: "connection refused".to_string(),
                latency_ms: 1,
            }
        } else {
            ProbeOutcome::Success { latency_ms: 1 }
        }
    }
}

fn target(id: &str, weight: u32) -> TargetSpec {
    TargetSpec {
        id: id.to_string(),
        address: format!("{}.internal:8080", id),
        weight,
        ..TargetSpec::default()
    }
}

fn config(algorithm: Algorithm, targets: Vec<TargetSpec>) -> Config {
    let mut topology = Topology::standard();
    topology.targets = targets;
    Config {
        algorithm,
        topology,
        ..Config::default()
    }
}

fn build(config: &Config) -> ServiceFabric {
    ServiceFabric::new(config, Arc::new(ScriptedProbe::default())).unwrap()
}

fn route_and_complete(fabric: &ServiceFabric, request: &RouteRequest) -> String {
    let target = fabric.route(request).unwrap();
    fabric.complete_request(&target.id, 5, true).unwrap();
    target.id
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_fairness() {
    let fabric = build(&config(
        Algorithm::RoundRobin,
        vec![target("a", 1), target("b", 1), target("c", 1)],
    ));

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..999 {
        *counts.entry(route_and_complete(&fabric, &RouteRequest::default())).or_default() += 1;
    }

    assert_eq!(counts["a"], 333);
    assert_eq!(counts["b"], 333);
    assert_eq!(counts["c"], 333);
}

#[tokio::test(start_paused = true)]
async fn test_least_connections_spreads_in_flight_requests() {
    let fabric = build(&config(
        Algorithm::LeastConnections,
        vec![target("a", 1), target("b", 1), target("c", 1)],
    ));

    // Hold six requests open: each target ends with two
    let held: Vec<String> = (0..6)
        .map(|_| fabric.route(&RouteRequest::default()).unwrap().id)
        .collect();
    let stats = fabric.registry().stats();
    assert!(stats.targets.iter().all(|t| t.current_connections == 2));

    // Freeing one on b makes b the next pick
    let b = held.iter().find(|id| *id == "b").unwrap();
    fabric.complete_request(b, 5, true).unwrap();
    assert_eq!(fabric.route(&RouteRequest::default()).unwrap().id, "b");
}

#[tokio::test(start_paused = true)]
async fn test_weighted_distribution() {
    let fabric = build(&config(
        Algorithm::WeightedRoundRobin,
        vec![target("a", 3), target("b", 2), target("c", 1)],
    ));

    let mut counts: HashMap<String, usize> = HashMap::new();
    for _ in 0..6000 {
        *counts.entry(route_and_complete(&fabric, &RouteRequest::default())).or_default() += 1;
    }

    for (id, expected) in [("a", 3000.0), ("b", 2000.0), ("c", 1000.0)] {
        let got = counts[id] as f64;
        assert!(
            (got - expected).abs() <= expected * 0.1,
            "{} got {} expected ~{}",
            id,
            got,
            expected
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_ip_hash_affinity() {
    let fabric = build(&config(
        Algorithm::IpHash,
        vec![target("a", 1), target("b", 1), target("c", 1)],
    ));

    let request = RouteRequest::from_client("203.0.113.7");
    let first = route_and_complete(&fabric, &request);
    for _ in 0..20 {
        assert_eq!(route_and_complete(&fabric, &request), first);
    }
}

#[tokio::test(start_paused = true)]
async fn test_unhealthy_target_leaves_rotation() {
    let probe = Arc::new(ScriptedProbe::default());
    probe.set_down("b.internal:8080");

    let mut cfg = config(Algorithm::RoundRobin, vec![target("a", 1), target("b", 1)]);
    cfg.health_check_interval_secs = 10;
    cfg.unhealthy_threshold = 3;
    let fabric = ServiceFabric::new(&cfg, probe.clone()).unwrap();
    fabric.start();

    // Rounds at 0s, 10s and 20s
    tokio::time::sleep(Duration::from_secs(21)).await;
    assert!(!fabric.registry().health("b").unwrap().healthy);

    for _ in 0..5 {
        assert_eq!(route_and_complete(&fabric, &RouteRequest::default()), "a");
    }

    let report = fabric.generate_scalability_report();
    assert_eq!(report.load_balancer.unhealthy_targets, 1);
    assert!(report
        .recommendations
        .iter()
        .any(|r| r.starts_with("1 of 2 targets are unhealthy")));

    assert!(fabric.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_api_policy_scenario() {
    let fabric = build(&config(Algorithm::RoundRobin, Vec::new()));

    assert_eq!(fabric.cache_set("/api/users/42", json!({"id": 42}), None), 2);
    assert_eq!(fabric.cache_get("/api/users/42"), Some(json!({"id": 42})));

    let stats = fabric.cache().stats();
    let memory = stats.layer("memory").unwrap();
    let redis = stats.layer("redis").unwrap();
    assert_eq!(memory.hits, 1);
    assert_eq!(redis.hits, 0);
    assert_eq!(redis.misses, 0);
    assert_eq!(stats.layer("cdn").unwrap().entries, 0);
}

#[tokio::test(start_paused = true)]
async fn test_cache_ttl_expiry() {
    let fabric = build(&config(Algorithm::RoundRobin, Vec::new()));

    // /user/ policy: memory only, 60s
    fabric.cache_set("/user/7/profile", json!("alice"), None);
    tokio::time::advance(Duration::from_secs(59)).await;
    assert_eq!(fabric.cache_get("/user/7/profile"), Some(json!("alice")));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(fabric.cache_get("/user/7/profile"), None);

    // Explicit TTL overrides the policy
    fabric.cache_set("/user/8/profile", json!("bob"), Some(Duration::from_secs(5)));
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(fabric.cache_get("/user/8/profile"), None);
}

fn pool_config(max: usize, acquire_timeout_ms: u64) -> Config {
    let mut cfg = config(Algorithm::RoundRobin, Vec::new());
    cfg.topology.pools = vec![PoolSpec {
        name: "database".to_string(),
        min_connections: 0,
        max_connections: max,
        acquire_timeout_ms,
        ..PoolSpec::default()
    }];
    cfg
}

#[tokio::test(start_paused = true)]
async fn test_pool_waiters_served_in_order() {
    let fabric = Arc::new(build(&pool_config(1, 30_000)));
    let held = fabric.pool_acquire("database").await.unwrap();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut waiters = Vec::new();
    for i in 0..3 {
        let fabric = fabric.clone();
        let order = order.clone();
        waiters.push(tokio::spawn(async move {
            let conn = fabric.pool_acquire("database").await.unwrap();
            order.lock().push(i);
            fabric.pool_release("database", &conn.id).unwrap();
        }));
        // Let each waiter enqueue before the next one
        tokio::task::yield_now().await;
    }

    assert_eq!(fabric.pools().stats("database").unwrap().waiting, 3);
    fabric.pool_release("database", &held.id).unwrap();

    for result in futures::future::join_all(waiters).await {
        result.unwrap();
    }
    assert_eq!(*order.lock(), vec![0, 1, 2]);

    let stats = fabric.pools().stats("database").unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.in_use, 0);
}

#[tokio::test(start_paused = true)]
async fn test_pool_acquire_timeout() {
    let fabric = build(&pool_config(1, 500));
    let _held = fabric.pool_acquire("database").await.unwrap();

    match fabric.pool_acquire("database").await {
        Err(FabricError::AcquireTimeout { pool, in_use, max, .. }) => {
            assert_eq!(pool, "database");
            assert_eq!((in_use, max), (1, 1));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(fabric.pools().stats("database").unwrap().waiting, 0);
}

#[tokio::test(start_paused = true)]
async fn test_scale_up_cooldown() {
    let mut cfg = config(Algorithm::RoundRobin, Vec::new());
    cfg.topology.scaling_policies = vec![ScalingSpec {
        name: "api".to_string(),
        min_instances: 2,
        max_instances: 4,
        scale_up_cooldown_secs: 60,
        ..ScalingSpec::default()
    }];
    cfg.provisioning_delay_secs = 1;
    let fabric = build(&cfg);

    let signal = MitigationSignal::ScaleUp {
        metric: metric::CPU_USAGE.to_string(),
        value: 96.0,
    };

    fabric.apply_mitigation(&signal);
    fabric.apply_mitigation(&signal);
    assert_eq!(fabric.autoscaler().policy("api").unwrap().desired_instances, 3);

    tokio::time::sleep(Duration::from_secs(2)).await;
    let policy = fabric.autoscaler().policy("api").unwrap();
    assert_eq!(policy.current_instances, 3);
    assert!(!policy.scaling_in_progress);

    tokio::time::advance(Duration::from_secs(60)).await;
    fabric.apply_mitigation(&signal);
    fabric.apply_mitigation(&signal);
    assert_eq!(fabric.autoscaler().policy("api").unwrap().desired_instances, 4);

    // Pinned at max
    let report = fabric.generate_scalability_report();
    assert!(report.recommendations.iter().any(|r| r.contains("'api' is pinned")));
}

#[tokio::test(start_paused = true)]
async fn test_connection_pressure_engages_rate_limit() {
    let fabric = build(&config(Algorithm::RoundRobin, vec![target("a", 1)]));
    fabric.start();

    fabric.record_metric(metric::ACTIVE_CONNECTIONS, 1500.0);
    for _ in 0..100 {
        if fabric.rate_limiter().is_engaged() {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(fabric.rate_limiter().is_engaged());

    let request = RouteRequest::from_client("198.51.100.1");
    let mut limited = 0;
    for _ in 0..20 {
        match fabric.route(&request) {
            Ok(t) => fabric.complete_request(&t.id, 5, true).unwrap(),
            Err(FabricError::RateLimited { .. }) => limited += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(limited, 10);

    assert!(fabric.shutdown().await);
}

#[tokio::test(start_paused = true)]
async fn test_error_rate_trips_circuit_then_recovers() {
    let fabric = build(&config(Algorithm::RoundRobin, vec![target("a", 1)]));
    fabric.apply_mitigation(&MitigationSignal::TripCircuit { value: 15.0 });

    assert!(matches!(
        fabric.route(&RouteRequest::default()),
        Err(FabricError::CircuitOpen)
    ));
    assert_eq!(fabric.generate_scalability_report().circuit_breaker.rejected, 1);

    tokio::time::advance(Duration::from_secs(30)).await;
    for _ in 0..3 {
        route_and_complete(&fabric, &RouteRequest::default());
    }
    assert_eq!(fabric.circuit_breaker().state(), CircuitState::Closed);
}
