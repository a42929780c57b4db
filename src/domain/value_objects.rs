//! Value Objects - Immutable domain primitives
//!
//! Value objects are identified by their value rather than identity.
//! They are immutable and can be freely shared.

use crate::domain::error::FabricError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Well-known metric names.
///
/// The monitor wires critical breaches of these metrics to mitigation
/// signals; any other name is recorded and alerted on but never mitigated.
pub mod metric {
    pub const RESPONSE_TIME: &str = "response_time";
    pub const CPU_USAGE: &str = "cpu_usage";
    pub const MEMORY_USAGE: &str = "memory_usage";
    pub const ERROR_RATE: &str = "error_rate";
    pub const ACTIVE_CONNECTIONS: &str = "active_connections";
}

/// Routing algorithm used by the load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Cyclic cursor over the eligible targets
    #[default]
    RoundRobin,
    /// Fewest in-flight connections wins
    LeastConnections,
    /// Random draw proportional to weight
    WeightedRoundRobin,
    /// Client address hash for session affinity
    IpHash,
    /// Lowest last observed response time wins
    LeastResponseTime,
}

impl Algorithm {
    pub const ALL: [Algorithm; 5] = [
        Algorithm::RoundRobin,
        Algorithm::LeastConnections,
        Algorithm::WeightedRoundRobin,
        Algorithm::IpHash,
        Algorithm::LeastResponseTime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::WeightedRoundRobin => "weighted_round_robin",
            Self::IpHash => "ip_hash",
            Self::LeastResponseTime => "least_response_time",
        }
    }
}

impl FromStr for Algorithm {
    type Err = FabricError;

    /// Accepts snake_case, kebab-case and camelCase spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_lowercase();

        match normalized.as_str() {
            "roundrobin" => Ok(Self::RoundRobin),
            "leastconnections" => Ok(Self::LeastConnections),
            "weightedroundrobin" | "weighted" => Ok(Self::WeightedRoundRobin),
            "iphash" => Ok(Self::IpHash),
            "leastresponsetime" => Ok(Self::LeastResponseTime),
            _ => Err(FabricError::UnknownAlgorithm(s.to_string())),
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of a cache layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    /// In-process memory
    Memory,
    /// Shared cache such as Redis
    Distributed,
    /// CDN / edge cache
    Edge,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::Memory => write!(f, "memory"),
            LayerKind::Distributed => write!(f, "distributed"),
            LayerKind::Edge => write!(f, "edge"),
        }
    }
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Alert lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Resolved,
}

/// Letter grade derived from the health score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthGrade {
    A,
    B,
    C,
    D,
    F,
}

impl HealthGrade {
    pub fn from_score(score: u32) -> Self {
        match score {
            90.. => Self::A,
            80..=89 => Self::B,
            70..=79 => Self::C,
            60..=69 => Self::D,
            _ => Self::F,
        }
    }
}

impl std::fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthGrade::A => "A",
            HealthGrade::B => "B",
            HealthGrade::C => "C",
            HealthGrade::D => "D",
            HealthGrade::F => "F",
        };
        write!(f, "{}", s)
    }
}

/// Direction of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScaleDirection {
    Up,
    Down,
}

impl std::fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScaleDirection::Up => write!(f, "up"),
            ScaleDirection::Down => write!(f, "down"),
        }
    }
}

/// Provisioning state of a scaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    InProgress,
    Completed,
}

/// One-way notification emitted by the monitor on a critical breach.
#[derive(Debug, Clone, PartialEq)]
pub enum MitigationSignal {
    /// Resource pressure: request more capacity
    ScaleUp { metric: String, value: f64 },
    /// Error rate too high: stop sending traffic for a while
    TripCircuit { value: f64 },
    /// Too many connections: start throttling clients
    EngageRateLimit { value: f64 },
}
