//! Configuration
//!
//! Runtime settings come from `FABRIC_*` environment variables. The fabric
//! topology (targets, cache layers and policies, pools, scaling policies,
//! thresholds) comes from an optional JSON file named by `FABRIC_TOPOLOGY`,
//! falling back to a built-in topology.

use crate::domain::entities::Target;
use crate::domain::value_objects::{Algorithm, LayerKind};
use crate::infrastructure::{CachePolicy, LayerConfig, PoolConfig, ScalingPolicyConfig, Threshold};
use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// How the health checker reaches targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// TCP connect
    Tcp,
    /// HTTP GET on a path, expecting 2xx
    Http { path: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub debug: bool,

    // Admin API settings
    pub api_enabled: bool,
    pub api_listen_addr: String,

    // Load balancer settings
    pub algorithm: Algorithm,
    pub probe: ProbeKind,
    pub health_check_interval_secs: u64,
    pub health_check_timeout_ms: u64,
    pub unhealthy_threshold: u32,

    // Periodic task intervals
    pub cache_cleanup_interval_secs: u64,
    pub pool_reclaim_interval_secs: u64,
    pub autoscale_interval_secs: u64,
    pub provisioning_delay_secs: u64,

    pub topology_path: Option<String>,
    pub topology: Topology,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            api_enabled: false,
            api_listen_addr: "0.0.0.0:8081".to_string(),
            algorithm: Algorithm::RoundRobin,
            probe: ProbeKind::Tcp,
            health_check_interval_secs: 30,
            health_check_timeout_ms: 5000,
            unhealthy_threshold: 3,
            cache_cleanup_interval_secs: 60,
            pool_reclaim_interval_secs: 60,
            autoscale_interval_secs: 60,
            provisioning_delay_secs: 5,
            topology_path: None,
            topology: Topology::standard(),
        }
    }
}

impl Config {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs)
    }

    pub fn pool_reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.pool_reclaim_interval_secs)
    }

    pub fn autoscale_interval(&self) -> Duration {
        Duration::from_secs(self.autoscale_interval_secs)
    }

    pub fn provisioning_delay(&self) -> Duration {
        Duration::from_secs(self.provisioning_delay_secs)
    }
}

/// Load configuration from the process environment.
pub fn load_config() -> anyhow::Result<Config> {
    load_config_from(|key| std::env::var(key).ok())
}

/// Load configuration from an arbitrary variable source.
pub fn load_config_from<F>(var: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let flag = |key: &str| {
        var(key)
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false)
    };
    let number = |key: &str, default: u64| var(key).and_then(|v| v.parse().ok()).unwrap_or(default);
    let interval = |key: &str, default: u64| match number(key, default) {
        0 => anyhow::bail!("invalid {} '0' (interval must be at least 1)", key),
        secs => Ok(secs),
    };

    let debug = flag("FABRIC_DEBUG");

    // Admin API settings
    let api_enabled = flag("FABRIC_API_ENABLED");
    let api_listen_addr = var("FABRIC_API_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:8081".to_string());

    // Load balancer settings
    let algorithm = match var("FABRIC_ALGORITHM") {
        Some(name) => name
            .parse::<Algorithm>()
            .with_context(|| format!("invalid FABRIC_ALGORITHM '{}'", name))?,
        None => Algorithm::RoundRobin,
    };

    let probe = match var("FABRIC_PROBE").as_deref() {
        Some("http") => ProbeKind::Http {
            path: var("FABRIC_PROBE_PATH").unwrap_or_else(|| "/health".to_string()),
        },
        Some("tcp") | None => ProbeKind::Tcp,
        Some(other) => anyhow::bail!("invalid FABRIC_PROBE '{}' (expected tcp or http)", other),
    };

    let health_check_interval_secs = interval("FABRIC_HEALTH_CHECK_INTERVAL_SECS", 30)?;
    let health_check_timeout_ms = number("FABRIC_HEALTH_CHECK_TIMEOUT_MS", 5000);
    let unhealthy_threshold = number("FABRIC_UNHEALTHY_THRESHOLD", 3) as u32;

    // Periodic task intervals
    let cache_cleanup_interval_secs = interval("FABRIC_CACHE_CLEANUP_INTERVAL_SECS", 60)?;
    let pool_reclaim_interval_secs = interval("FABRIC_POOL_RECLAIM_INTERVAL_SECS", 60)?;
    let autoscale_interval_secs = interval("FABRIC_AUTOSCALE_INTERVAL_SECS", 60)?;
    let provisioning_delay_secs = number("FABRIC_PROVISIONING_DELAY_SECS", 5);

    // Topology
    let topology_path = var("FABRIC_TOPOLOGY");
    let mut topology = match &topology_path {
        Some(path) => Topology::from_file(path)?,
        None => Topology::standard(),
    };

    if let Some(targets) = var("FABRIC_TARGETS") {
        topology.targets.extend(parse_targets(&targets));
    }

    Ok(Config {
        debug,
        api_enabled,
        api_listen_addr,
        algorithm,
        probe,
        health_check_interval_secs,
        health_check_timeout_ms,
        unhealthy_threshold,
        cache_cleanup_interval_secs,
        pool_reclaim_interval_secs,
        autoscale_interval_secs,
        provisioning_delay_secs,
        topology_path,
        topology,
    })
}

/// Parse `id=host:port` or bare `host:port` entries, comma separated.
/// Bare addresses get ids `target-1`, `target-2`, ...
fn parse_targets(list: &str) -> Vec<TargetSpec> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(i, entry)| {
            let (id, address) = match entry.split_once('=') {
                Some((id, address)) => (id.trim().to_string(), address.trim().to_string()),
                None => (format!("target-{}", i + 1), entry.to_string()),
            };
            TargetSpec {
                id,
                address,
                ..TargetSpec::default()
            }
        })
        .collect()
}

/// Declarative fabric layout.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Topology {
    pub targets: Vec<TargetSpec>,
    pub cache_layers: Vec<LayerSpec>,
    pub cache_policies: Vec<PolicySpec>,
    pub pools: Vec<PoolSpec>,
    pub scaling_policies: Vec<ScalingSpec>,
    /// Overrides for the monitor's default thresholds
    pub thresholds: HashMap<String, Threshold>,
}

impl Topology {
    /// Read a topology from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read topology file {}", path.display()))?;
        let topology: Topology = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse topology file {}", path.display()))?;

        tracing::info!(
            path = %path.display(),
            targets = topology.targets.len(),
            layers = topology.cache_layers.len(),
            pools = topology.pools.len(),
            "loaded topology"
        );
        Ok(topology)
    }

    /// Built-in topology: three cache layers, three pools, one scaling policy.
    pub fn standard() -> Self {
        let layer = |name: &str, kind, max_bytes, ttl_secs, priority| LayerSpec {
            name: name.to_string(),
            kind,
            max_bytes,
            ttl_secs,
            priority,
        };
        let policy = |name: &str, pattern: &str, layers: &[&str], ttl_secs| PolicySpec {
            name: name.to_string(),
            pattern: pattern.to_string(),
            ttl_secs,
            layers: layers.iter().map(|s| s.to_string()).collect(),
            compress: false,
            vary: Vec::new(),
        };
        let pool = |name: &str, min_connections, max_connections| PoolSpec {
            name: name.to_string(),
            min_connections,
            max_connections,
            ..PoolSpec::default()
        };

        Self {
            targets: Vec::new(),
            cache_layers: vec![
                layer("memory", LayerKind::Memory, 50 * 1024 * 1024, 300, 1),
                layer("redis", LayerKind::Distributed, 500 * 1024 * 1024, 3600, 2),
                layer("cdn", LayerKind::Edge, 5 * 1024 * 1024 * 1024, 86400, 3),
            ],
            cache_policies: vec![
                policy("api", r"^/api/", &["memory", "redis"], Some(300)),
                PolicySpec {
                    compress: true,
                    ..policy(
                        "static",
                        r"\.(css|js|png|jpe?g|gif|svg|ico|woff2?)$",
                        &["cdn", "memory"],
                        None,
                    )
                },
                PolicySpec {
                    vary: vec!["user".to_string()],
                    ..policy("user", r"^/user/", &["memory"], Some(60))
                },
            ],
            pools: vec![pool("database", 5, 20), pool("redis", 2, 10), pool("external_api", 1, 5)],
            scaling_policies: vec![ScalingSpec {
                name: "web_servers".to_string(),
                min_instances: 2,
                max_instances: 20,
                ..ScalingSpec::default()
            }],
            thresholds: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TargetSpec {
    pub id: String,
    pub address: String,
    pub weight: u32,
    pub max_connections: u32,
    pub region: String,
    pub capabilities: Vec<String>,
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self {
            id: String::new(),
            address: String::new(),
            weight: 1,
            max_connections: 100,
            region: String::new(),
            capabilities: Vec::new(),
        }
    }
}

impl TargetSpec {
    pub fn to_target(&self) -> Target {
        Target::new(&self.id, &self.address)
            .weight(self.weight)
            .max_connections(self.max_connections)
            .region(&self.region)
            .capabilities(self.capabilities.clone())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    pub kind: LayerKind,
    pub max_bytes: usize,
    pub ttl_secs: u64,
    pub priority: u32,
}

impl LayerSpec {
    pub fn to_config(&self) -> LayerConfig {
        LayerConfig::new(
            &self.name,
            self.kind,
            self.max_bytes,
            Duration::from_secs(self.ttl_secs),
            self.priority,
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicySpec {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
    pub layers: Vec<String>,
    #[serde(default)]
    pub compress: bool,
    #[serde(default)]
    pub vary: Vec<String>,
}

impl PolicySpec {
    pub fn to_policy(&self) -> anyhow::Result<CachePolicy> {
        let mut policy = CachePolicy::new(&self.name, &self.pattern, self.layers.clone())
            .with_context(|| format!("invalid pattern for cache policy '{}'", self.name))?
            .compress(self.compress)
            .vary(self.vary.clone());

        if let Some(ttl) = self.ttl_secs {
            policy = policy.ttl(Duration::from_secs(ttl));
        }
        Ok(policy)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolSpec {
    pub name: String,
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
}

impl Default for PoolSpec {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            name: String::new(),
            min_connections: defaults.min_connections,
            max_connections: defaults.max_connections,
            acquire_timeout_ms: defaults.acquire_timeout.as_millis() as u64,
            idle_timeout_secs: defaults.idle_timeout.as_secs(),
        }
    }
}

impl PoolSpec {
    pub fn to_config(&self) -> PoolConfig {
        PoolConfig {
            min_connections: self.min_connections,
            max_connections: self.max_connections,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScalingSpec {
    pub name: String,
    pub enabled: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    pub target_cpu: f64,
    pub target_memory: f64,
    pub scale_up_cooldown_secs: u64,
    pub scale_down_cooldown_secs: u64,
    pub metrics: Vec<String>,
    pub step: u32,
}

impl Default for ScalingSpec {
    fn default() -> Self {
        let defaults = ScalingPolicyConfig::default();
        Self {
            name: String::new(),
            enabled: defaults.enabled,
            min_instances: defaults.min_instances,
            max_instances: defaults.max_instances,
            target_cpu: defaults.target_cpu,
            target_memory: defaults.target_memory,
            scale_up_cooldown_secs: defaults.scale_up_cooldown.as_secs(),
            scale_down_cooldown_secs: defaults.scale_down_cooldown.as_secs(),
            metrics: defaults.metrics,
            step: defaults.step,
        }
    }
}

impl ScalingSpec {
    pub fn to_config(&self) -> ScalingPolicyConfig {
        ScalingPolicyConfig {
            enabled: self.enabled,
            min_instances: self.min_instances,
            max_instances: self.max_instances,
            target_cpu: self.target_cpu,
            target_memory: self.target_memory,
            scale_up_cooldown: Duration::from_secs(self.scale_up_cooldown_secs),
            scale_down_cooldown: Duration::from_secs(self.scale_down_cooldown_secs),
            metrics: self.metrics.clone(),
            step: self.step,
        }
    }
}
