//! Fabric Errors
//!
//! Only request-boundary failures surface here. Health-check failures,
//! cache overflow and alert generation are absorbed by their components.

/// Errors returned by the fabric's public operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FabricError {
    #[error("no available target ({total} registered, {unhealthy} unhealthy, {saturated} saturated)")]
    NoAvailableTarget {
        total: usize,
        unhealthy: usize,
        saturated: usize,
    },

    #[error("acquire on pool '{pool}' timed out after {waited_ms}ms ({in_use}/{max} in use)")]
    AcquireTimeout {
        pool: String,
        waited_ms: u64,
        in_use: usize,
        max: usize,
    },

    #[error("unknown pool: {0}")]
    UnknownPool(String),

    #[error("connection {id} does not belong to pool '{pool}'")]
    UnknownConnection { pool: String, id: String },

    #[error("pool already exists: {0}")]
    DuplicatePool(String),

    #[error("scaling policy not found: {0}")]
    PolicyNotFound(String),

    #[error("unknown routing algorithm: {0}")]
    UnknownAlgorithm(String),

    #[error("unknown target: {0}")]
    UnknownTarget(String),

    #[error("target already registered: {0}")]
    DuplicateTarget(String),

    #[error("invalid key pattern: {0}")]
    InvalidPattern(String),

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("rate limited: {client}")]
    RateLimited { client: String },
}

impl FabricError {
    /// Whether the caller should back off and retry later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FabricError::NoAvailableTarget { .. }
                | FabricError::AcquireTimeout { .. }
                | FabricError::CircuitOpen
                | FabricError::RateLimited { .. }
        )
    }
}
