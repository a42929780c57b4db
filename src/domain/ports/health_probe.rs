//! Health Probe Port
//!
//! Defines the interface the load balancer uses to check a target.
//! Implementations may use a TCP connect, an HTTP GET or an application
//! heartbeat.

use crate::domain::entities::ProbeOutcome;
use async_trait::async_trait;

/// Probe for target liveness.
///
/// This is an outbound port. Implementations must return within a bounded
/// time; a probe that cannot reach the target reports
/// [`ProbeOutcome::Failure`] rather than erroring.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe a single target address.
    async fn probe(&self, address: &str) -> ProbeOutcome;
}
