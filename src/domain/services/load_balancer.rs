//! Load Balancer Service
//!
//! Pure selection logic over an already-filtered eligible set.
//! This service has NO external dependencies - it's pure Rust.

use crate::domain::entities::Target;
use crate::domain::value_objects::Algorithm;

/// Load balancer service for selecting a target.
///
/// Callers pass only eligible targets (active, healthy, below their
/// connection cap) together with the round-robin cursor and a uniform
/// random draw, so every decision is reproducible in tests.
pub struct LoadBalancer;

impl LoadBalancer {
    /// Select the index of a target within `eligible`.
    ///
    /// # Arguments
    /// * `algorithm` - Selection strategy
    /// * `eligible` - Routable targets, in registration order
    /// * `cursor` - Round-robin cursor value for this call
    /// * `client_addr` - Client address for IP-hash affinity
    /// * `draw` - Uniform random value in `[0, 1)` for weighted selection
    ///
    /// # Returns
    /// The chosen index, or None if `eligible` is empty
    pub fn pick_target(
        algorithm: Algorithm,
        eligible: &[Target],
        cursor: usize,
        client_addr: Option<&str>,
        draw: f64,
    ) -> Option<usize> {
        if eligible.is_empty() {
            return None;
        }

        let index = match algorithm {
            Algorithm::RoundRobin => cursor % eligible.len(),
            Algorithm::LeastConnections => Self::min_by_key(eligible, |t| t.current_connections as u64),
            Algorithm::WeightedRoundRobin => Self::weighted(eligible, draw),
            Algorithm::IpHash => {
                let hash = Self::hash_client(client_addr.unwrap_or_default());
                hash as usize % eligible.len()
            }
            Algorithm::LeastResponseTime => Self::min_by_key(eligible, |t| t.response_time_ms),
        };

        Some(index)
    }

    /// Deterministic string hash (`h = h * 31 + byte`, wrapping).
    ///
    /// Stable across processes and releases, unlike `DefaultHasher`.
    pub fn hash_client(addr: &str) -> u32 {
        addr.bytes()
            .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32))
    }

    /// First index holding the minimum key; ties go to list order.
    fn min_by_key<F>(eligible: &[Target], key: F) -> usize
    where
        F: Fn(&Target) -> u64,
    {
        let mut best = 0;
        for (i, target) in eligible.iter().enumerate().skip(1) {
            if key(target) < key(&eligible[best]) {
                best = i;
            }
        }
        best
    }

    /// Walk the list subtracting weights from a draw in `[0, total)` until
    /// the remainder is non-positive. A draw landing exactly on a boundary
    /// goes to the earlier target. Zero-weight targets are never chosen.
    fn weighted(eligible: &[Target], draw: f64) -> usize {
        let total: u64 = eligible.iter().map(|t| t.weight as u64).sum();
        if total == 0 {
            return 0;
        }

        let mut remainder = draw.clamp(0.0, 1.0) * total as f64;
        for (i, target) in eligible.iter().enumerate() {
            if target.weight == 0 {
                continue;
            }
            remainder -= target.weight as f64;
            if remainder <= 0.0 {
                return i;
            }
        }

        // draw == 1.0 or float drift: fall back to the last weighted target
        eligible
            .iter()
            .rposition(|t| t.weight > 0)
            .unwrap_or(0)
    }
}
