//! Tiered Cache
//!
//! Ordered cache layers (memory, distributed, edge) with per-key content
//! policies. Reads promote entries toward the fastest layer in scope;
//! writes evict the oldest-written entries until the new one fits.

use crate::domain::entities::CacheEntry;
use crate::domain::value_objects::LayerKind;
use crate::infrastructure::shutdown::ShutdownController;
use parking_lot::Mutex;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// TTL of the fallback policy used when no policy matches a key.
pub const DEFAULT_POLICY_TTL: Duration = Duration::from_secs(300);

/// Static description of one cache layer.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    pub name: String,
    pub kind: LayerKind,
    /// Capacity in estimated bytes
    pub max_bytes: usize,
    pub default_ttl: Duration,
    /// Lower is checked first
    pub priority: u32,
}

impl LayerConfig {
    pub fn new(name: impl Into<String>, kind: LayerKind, max_bytes: usize, default_ttl: Duration, priority: u32) -> Self {
        Self {
            name: name.into(),
            kind,
            max_bytes,
            default_ttl,
            priority,
        }
    }
}

/// Content policy: which layers hold keys matching a pattern, and for how long.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub name: String,
    pub pattern: Regex,
    /// Overrides the layer default TTL when set
    pub ttl: Option<Duration>,
    /// Layer names in scope
    pub layers: Vec<String>,
    pub compress: bool,
    /// Request attributes the cached value varies on
    pub vary: Vec<String>,
}

impl CachePolicy {
    pub fn new(name: impl Into<String>, pattern: &str, layers: Vec<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            name: name.into(),
            pattern: Regex::new(pattern)?,
            ttl: None,
            layers,
            compress: false,
            vary: Vec::new(),
        })
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    pub fn vary(mut self, vary: Vec<String>) -> Self {
        self.vary = vary;
        self
    }
}

struct Layer {
    config: LayerConfig,
    entries: HashMap<String, CacheEntry>,
    current_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl Layer {
    fn new(config: LayerConfig) -> Self {
        Self {
            config,
            entries: HashMap::new(),
            current_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.current_bytes -= entry.size;
        Some(entry)
    }

    /// Store an entry, evicting oldest-written entries until it fits.
    ///
    /// Returns false when the entry is larger than the whole layer.
    fn insert(&mut self, key: &str, entry: CacheEntry) -> bool {
        if entry.size > self.config.max_bytes {
            return false;
        }

        self.remove(key);

        while self.current_bytes + entry.size > self.config.max_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, e)| e.written_at)
                .map(|(k, _)| k.clone());

            match oldest {
                Some(victim) => {
                    self.remove(&victim);
                    self.evictions += 1;
                    tracing::debug!(layer = %self.config.name, key = %victim, "evicted cache entry");
                }
                None => break,
            }
        }

        self.current_bytes += entry.size;
        self.entries.insert(key.to_string(), entry);
        true
    }

    fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str, &CacheEntry) -> bool,
    {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|k, e| {
            let kept = keep(k, e);
            if !kept {
                freed += e.size;
            }
            kept
        });
        self.current_bytes -= freed;
        before - self.entries.len()
    }

    fn stats(&self) -> LayerStats {
        let lookups = self.hits + self.misses;
        LayerStats {
            name: self.config.name.clone(),
            kind: self.config.kind,
            priority: self.config.priority,
            entries: self.entries.len(),
            current_bytes: self.current_bytes,
            max_bytes: self.config.max_bytes,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
        }
    }
}

/// Layers in scope for one key, ordered fastest first.
struct Scope {
    policy: String,
    ttl: Option<Duration>,
    layers: Vec<usize>,
}

struct CacheState {
    /// Sorted by ascending priority
    layers: Vec<Layer>,
    policies: Vec<CachePolicy>,
}

impl CacheState {
    fn scope_for(&self, key: &str) -> Scope {
        match self.policies.iter().find(|p| p.pattern.is_match(key)) {
            Some(policy) => Scope {
                policy: policy.name.clone(),
                ttl: policy.ttl,
                layers: self
                    .layers
                    .iter()
                    .enumerate()
                    .filter(|(_, l)| policy.layers.iter().any(|n| n == &l.config.name))
                    .map(|(i, _)| i)
                    .collect(),
            },
            None => Scope {
                policy: "default".to_string(),
                ttl: Some(DEFAULT_POLICY_TTL),
                layers: self.default_layer().into_iter().collect(),
            },
        }
    }

    /// First memory layer, else the fastest layer.
    fn default_layer(&self) -> Option<usize> {
        self.layers
            .iter()
            .position(|l| l.config.kind == LayerKind::Memory)
            .or_else(|| (!self.layers.is_empty()).then_some(0))
    }
}

/// Multi-layer cache with policy routing and promotion.
pub struct TieredCache {
    state: Mutex<CacheState>,
    gets: AtomicU64,
    get_hits: AtomicU64,
}

impl TieredCache {
    /// Create a cache over `layers` with no policies.
    pub fn new(layers: Vec<LayerConfig>) -> Self {
        let mut layers: Vec<Layer> = layers.into_iter().map(Layer::new).collect();
        layers.sort_by_key(|l| l.config.priority);

        Self {
            state: Mutex::new(CacheState {
                layers,
                policies: Vec::new(),
            }),
            gets: AtomicU64::new(0),
            get_hits: AtomicU64::new(0),
        }
    }

    /// Append a policy. Policies are matched in insertion order.
    pub fn add_policy(&self, policy: CachePolicy) {
        let mut state = self.state.lock();

        for name in &policy.layers {
            if !state.layers.iter().any(|l| &l.config.name == name) {
                tracing::warn!(policy = %policy.name, layer = %name, "policy references unknown cache layer");
            }
        }

        tracing::debug!(policy = %policy.name, pattern = %policy.pattern, "added cache policy");
        state.policies.push(policy);
    }

    /// Name of the policy that governs `key`.
    pub fn policy_for(&self, key: &str) -> String {
        self.state.lock().scope_for(key).policy
    }

    /// Look up a key, promoting a hit into the faster layers in scope.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.gets.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        let mut state = self.state.lock();
        let scope = state.scope_for(key);

        for (pos, &idx) in scope.layers.iter().enumerate() {
            let layer = &mut state.layers[idx];

            let expired = match layer.entries.get(key) {
                Some(entry) => entry.is_expired(now),
                None => continue,
            };
            if expired {
                layer.remove(key);
                continue;
            }

            layer.hits += 1;
            let layer_name = layer.config.name.clone();
            let Some(entry) = layer.entries.get_mut(key) else {
                continue;
            };
            entry.access_count += 1;

            let value = entry.value.clone();
            let remaining = entry.ttl.saturating_sub(now.duration_since(entry.written_at));
            let size = entry.size;

            for &faster in &scope.layers[..pos] {
                let promoted = CacheEntry {
                    value: value.clone(),
                    written_at: now,
                    ttl: remaining,
                    size,
                    access_count: 0,
                };
                let target = &mut state.layers[faster];
                if target.insert(key, promoted) {
                    tracing::debug!(key = %key, from = %layer_name, to = %target.config.name, "promoted cache entry");
                }
            }

            self.get_hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %key, layer = %layer_name, policy = %scope.policy, "cache hit");
            return Some(value);
        }

        for &idx in &scope.layers {
            state.layers[idx].misses += 1;
        }
        tracing::debug!(key = %key, policy = %scope.policy, "cache miss");
        None
    }

    /// Store a value in every layer in scope for `key`.
    ///
    /// TTL resolution: explicit, then the policy override, then the layer
    /// default. Returns the number of layers that accepted the entry.
    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> usize {
        let mut state = self.state.lock();
        let scope = state.scope_for(key);
        let mut stored = 0;

        for &idx in &scope.layers {
            let layer = &mut state.layers[idx];
            let ttl = ttl.or(scope.ttl).unwrap_or(layer.config.default_ttl);
            let entry = CacheEntry::new(key, value.clone(), ttl);

            if layer.insert(key, entry) {
                stored += 1;
            } else {
                layer.remove(key);
                tracing::debug!(key = %key, layer = %layer.config.name, "entry exceeds layer capacity, dropped");
            }
        }

        stored
    }

    /// Remove every key matching `pattern` from every layer.
    pub fn invalidate(&self, pattern: &Regex) -> usize {
        let mut state = self.state.lock();
        let removed: usize = state
            .layers
            .iter_mut()
            .map(|l| l.retain(|k, _| !pattern.is_match(k)))
            .sum();

        tracing::info!(pattern = %pattern, removed, "invalidated cache entries");
        removed
    }

    /// Drop expired entries from every layer.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();
        let removed: usize = state
            .layers
            .iter_mut()
            .map(|l| l.retain(|_, e| !e.is_expired(now)))
            .sum();

        if removed > 0 {
            tracing::debug!(removed, "cleaned up expired cache entries");
        }
        removed
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let gets = self.gets.load(Ordering::Relaxed);
        let hits = self.get_hits.load(Ordering::Relaxed);

        CacheStats {
            layers: state.layers.iter().map(Layer::stats).collect(),
            policies: state.policies.len(),
            total_gets: gets,
            total_hits: hits,
            hit_rate: if gets == 0 { 0.0 } else { hits as f64 / gets as f64 },
        }
    }

    /// Start the periodic expiry sweep.
    #[cfg_attr(coverage_nightly, coverage(off))]
    pub fn start_cleanup(self: &Arc<Self>, interval: Duration, shutdown: &ShutdownController) -> JoinHandle<()> {
        let cache = self.clone();
        shutdown.spawn_periodic("cache_cleanup", interval, move || {
            cache.cleanup_expired();
            std::future::ready(())
        })
    }
}

/// Per-layer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub name: String,
    pub kind: LayerKind,
    pub priority: u32,
    pub entries: usize,
    pub current_bytes: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate: f64,
}

/// Cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub layers: Vec<LayerStats>,
    pub policies: usize,
    pub total_gets: u64,
    pub total_hits: u64,
    /// Fraction of gets answered by any layer
    pub hit_rate: f64,
}

impl CacheStats {
    pub fn layer(&self, name: &str) -> Option<&LayerStats> {
        self.layers.iter().find(|l| l.name == name)
    }
}
