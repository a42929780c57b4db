//! Target Registry
//!
//! The stateful half of the load balancer: owns the registered targets,
//! their health records, the active algorithm and the round-robin cursor.
//! Selection itself is delegated to [`LoadBalancer`].

use crate::domain::entities::{HealthRecord, ProbeOutcome, RouteRequest, Target, TargetStatus};
use crate::domain::error::FabricError;
use crate::domain::services::LoadBalancer;
use crate::domain::value_objects::Algorithm;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A registered target with its health bookkeeping.
#[derive(Debug, Clone)]
struct TargetEntry {
    target: Target,
    health: HealthRecord,
}

impl TargetEntry {
    /// Active, healthy and below its connection cap.
    fn is_eligible(&self) -> bool {
        self.target.status == TargetStatus::Active && self.health.healthy && self.target.has_capacity()
    }
}

/// Registry of backend targets plus routing state.
pub struct TargetRegistry {
    /// Targets in registration order
    targets: RwLock<Vec<TargetEntry>>,
    algorithm: RwLock<Algorithm>,
    /// Global round-robin cursor, advanced by every routed request
    cursor: AtomicUsize,
    routed: AtomicU64,
    rejected: AtomicU64,
}

impl TargetRegistry {
    /// Create an empty registry using `algorithm`.
    pub fn new(algorithm: Algorithm) -> Self {
        Self {
            targets: RwLock::new(Vec::new()),
            algorithm: RwLock::new(algorithm),
            cursor: AtomicUsize::new(0),
            routed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Register a target. Returns its id as the handle.
    pub fn register(&self, target: Target) -> Result<String, FabricError> {
        let mut targets = self.targets.write();
        if targets.iter().any(|e| e.target.id == target.id) {
            return Err(FabricError::DuplicateTarget(target.id));
        }

        tracing::info!(
            target_id = %target.id,
            address = %target.address,
            weight = target.weight,
            "registered target"
        );

        let id = target.id.clone();
        targets.push(TargetEntry {
            target,
            health: HealthRecord::default(),
        });
        Ok(id)
    }

    /// Remove a target from the registry.
    pub fn deregister(&self, id: &str) -> Result<Target, FabricError> {
        let mut targets = self.targets.write();
        let pos = targets
            .iter()
            .position(|e| e.target.id == id)
            .ok_or_else(|| FabricError::UnknownTarget(id.to_string()))?;

        let entry = targets.remove(pos);
        tracing::info!(target_id = %id, "deregistered target");
        Ok(entry.target)
    }

    /// Stop routing new requests to a target without removing it.
    pub fn drain(&self, id: &str) -> Result<(), FabricError> {
        self.with_target(id, |entry| {
            entry.target.status = TargetStatus::Draining;
        })?;
        tracing::info!(target_id = %id, "draining target");
        Ok(())
    }

    /// Switch the routing algorithm. The round-robin cursor is kept.
    pub fn set_algorithm(&self, algorithm: Algorithm) {
        let previous = std::mem::replace(&mut *self.algorithm.write(), algorithm);
        if previous != algorithm {
            tracing::info!(from = %previous, to = %algorithm, "routing algorithm changed");
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        *self.algorithm.read()
    }

    /// Route a request to one eligible target.
    ///
    /// The chosen target's connection count is incremented; callers must
    /// [`release`](Self::release) it when the request completes.
    pub fn route(&self, request: &RouteRequest) -> Result<Target, FabricError> {
        let algorithm = self.algorithm();
        let mut targets = self.targets.write();

        let eligible: Vec<usize> = targets
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_eligible())
            .map(|(i, _)| i)
            .collect();

        if eligible.is_empty() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            let err = Self::unavailable(&targets);
            tracing::warn!("routing failed: {}", err);
            return Err(err);
        }

        let candidates: Vec<Target> = eligible.iter().map(|&i| targets[i].target.clone()).collect();

        let cursor = self.cursor.fetch_add(1, Ordering::Relaxed);

        // candidates is non-empty, so a pick always exists
        let picked = LoadBalancer::pick_target(
            algorithm,
            &candidates,
            cursor,
            request.client_addr.as_deref(),
            rand::random::<f64>(),
        )
        .unwrap_or(0);

        let entry = &mut targets[eligible[picked]];
        entry.target.current_connections += 1;
        entry.target.requests_served += 1;
        self.routed.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            target_id = %entry.target.id,
            algorithm = %algorithm,
            connections = entry.target.current_connections,
            "routed request"
        );

        Ok(entry.target.clone())
    }

    /// Release a connection previously handed out by [`route`](Self::route).
    pub fn release(&self, id: &str) -> Result<(), FabricError> {
        self.with_target(id, |entry| {
            entry.target.current_connections = entry.target.current_connections.saturating_sub(1);
        })
    }

    /// Record an observed response time for a target.
    pub fn record_response_time(&self, id: &str, response_time_ms: u64) -> Result<(), FabricError> {
        self.with_target(id, |entry| {
            entry.target.response_time_ms = response_time_ms;
        })
    }

    /// Fold a probe outcome into a target's health.
    ///
    /// Returns `Some(healthy)` when the healthy flag flipped. Unknown ids
    /// (deregistered mid-check) are ignored.
    pub fn apply_probe(&self, id: &str, outcome: &ProbeOutcome, unhealthy_threshold: u32) -> Option<bool> {
        let mut targets = self.targets.write();
        let entry = targets.iter_mut().find(|e| e.target.id == id)?;

        let flipped = entry.health.observe(outcome, unhealthy_threshold);

        if outcome.is_success() {
            entry.target.response_time_ms = outcome.latency_ms();
            if entry.target.status == TargetStatus::Unhealthy {
                entry.target.status = TargetStatus::Active;
            }
        } else if !entry.health.healthy && entry.target.status == TargetStatus::Active {
            entry.target.status = TargetStatus::Unhealthy;
        }

        flipped
    }

    /// (id, address) pairs for every registered target.
    pub fn addresses(&self) -> Vec<(String, String)> {
        self.targets
            .read()
            .iter()
            .map(|e| (e.target.id.clone(), e.target.address.clone()))
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Target> {
        self.targets
            .read()
            .iter()
            .find(|e| e.target.id == id)
            .map(|e| e.target.clone())
    }

    pub fn health(&self, id: &str) -> Option<HealthRecord> {
        self.targets
            .read()
            .iter()
            .find(|e| e.target.id == id)
            .map(|e| e.health.clone())
    }

    pub fn len(&self) -> usize {
        self.targets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.read().is_empty()
    }

    /// Sum of in-flight connections across targets.
    pub fn total_connections(&self) -> u64 {
        self.targets
            .read()
            .iter()
            .map(|e| e.target.current_connections as u64)
            .sum()
    }

    pub fn stats(&self) -> LoadBalancerStats {
        let targets = self.targets.read();

        let per_target: Vec<TargetStats> = targets
            .iter()
            .map(|e| TargetStats {
                id: e.target.id.clone(),
                address: e.target.address.clone(),
                status: e.target.status,
                healthy: e.health.healthy,
                weight: e.target.weight,
                region: e.target.region.clone(),
                current_connections: e.target.current_connections,
                max_connections: e.target.max_connections,
                response_time_ms: e.target.response_time_ms,
                requests_served: e.target.requests_served,
                consecutive_failures: e.health.consecutive_failures,
            })
            .collect();

        LoadBalancerStats {
            algorithm: self.algorithm(),
            total_targets: targets.len(),
            eligible_targets: targets.iter().filter(|e| e.is_eligible()).count(),
            unhealthy_targets: targets.iter().filter(|e| !e.health.healthy).count(),
            draining_targets: targets
                .iter()
                .filter(|e| e.target.status == TargetStatus::Draining)
                .count(),
            total_connections: per_target.iter().map(|t| t.current_connections as u64).sum(),
            total_routed: self.routed.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            targets: per_target,
        }
    }

    fn with_target<F>(&self, id: &str, f: F) -> Result<(), FabricError>
    where
        F: FnOnce(&mut TargetEntry),
    {
        let mut targets = self.targets.write();
        let entry = targets
            .iter_mut()
            .find(|e| e.target.id == id)
            .ok_or_else(|| FabricError::UnknownTarget(id.to_string()))?;
        f(entry);
        Ok(())
    }

    fn unavailable(targets: &[TargetEntry]) -> FabricError {
        let unhealthy = targets
            .iter()
            .filter(|e| !e.health.healthy || e.target.status == TargetStatus::Unhealthy)
            .count();
        let saturated = targets
            .iter()
            .filter(|e| e.health.healthy && e.target.status == TargetStatus::Active && !e.target.has_capacity())
            .count();
        FabricError::NoAvailableTarget {
            total: targets.len(),
            unhealthy,
            saturated,
        }
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new(Algorithm::default())
    }
}

/// Per-target view in [`LoadBalancerStats`].
#[derive(Debug, Clone, Serialize)]
pub struct TargetStats {
    pub id: String,
    pub address: String,
    pub status: TargetStatus,
    pub healthy: bool,
    pub weight: u32,
    pub region: String,
    pub current_connections: u32,
    pub max_connections: u32,
    pub response_time_ms: u64,
    pub requests_served: u64,
    pub consecutive_failures: u32,
}

/// Load balancer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStats {
    pub algorithm: Algorithm,
    pub total_targets: usize,
    pub eligible_targets: usize,
    pub unhealthy_targets: usize,
    pub draining_targets: usize,
    pub total_connections: u64,
    pub total_routed: u64,
    pub total_rejected: u64,
    pub targets: Vec<TargetStats>,
}
