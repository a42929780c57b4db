//! Circuit Breaker
//!
//! Fabric-wide admission gate. Opens on an error-rate signal from the
//! monitor or on repeated request failures, then probes recovery through
//! a half-open phase.

use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to keep circuit open before testing
    pub reset_timeout: Duration,
    /// Number of successes in half-open to close circuit
    pub success_threshold: u32,
    /// Window for counting failures (failures older than this are forgotten)
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 3,
            failure_window: Duration::from_secs(60),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - requests allowed
    #[default]
    Closed,
    /// Circuit tripped - requests blocked
    Open,
    /// Testing recovery - requests allowed until a failure
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Default)]
struct Circuit {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    trips: u64,
    rejected: u64,
}

impl Circuit {
    fn open(&mut self, now: Instant) {
        if self.state != CircuitState::Open {
            self.trips += 1;
        }
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.successes = 0;
    }
}

/// Circuit breaker guarding the whole fabric.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    circuit: Mutex<Circuit>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            circuit: Mutex::new(Circuit::default()),
        }
    }

    /// Force the circuit open, restarting the reset timeout.
    pub fn trip(&self, reason: &str) {
        let mut circuit = self.circuit.lock();
        let was = circuit.state;
        circuit.open(Instant::now());

        if was != CircuitState::Open {
            tracing::warn!(reason = %reason, "circuit breaker opened");
        }
    }

    /// Check if a request is allowed.
    ///
    /// An open circuit whose reset timeout has elapsed moves to half-open
    /// and admits the request.
    pub fn allow_request(&self) -> bool {
        let mut circuit = self.circuit.lock();
        let state = circuit.state;

        match state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);

                if elapsed {
                    circuit.state = CircuitState::HalfOpen;
                    circuit.successes = 0;
                    tracing::info!("circuit breaker transitioning to half-open");
                    true
                } else {
                    circuit.rejected += 1;
                    false
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut circuit = self.circuit.lock();
        let state = circuit.state;

        match state {
            CircuitState::HalfOpen => {
                circuit.successes += 1;
                if circuit.successes >= self.config.success_threshold {
                    circuit.state = CircuitState::Closed;
                    circuit.failures = 0;
                    circuit.successes = 0;
                    tracing::info!("circuit breaker closed (recovered)");
                }
            }
            CircuitState::Closed => circuit.failures = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed request.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut circuit = self.circuit.lock();
        let state = circuit.state;

        match state {
            CircuitState::Closed => {
                let in_window = circuit
                    .last_failure
                    .map(|at| now.duration_since(at) <= self.config.failure_window)
                    .unwrap_or(false);

                circuit.failures = if in_window { circuit.failures + 1 } else { 1 };
                circuit.last_failure = Some(now);

                if circuit.failures >= self.config.failure_threshold {
                    let failures = circuit.failures;
                    circuit.open(now);
                    tracing::warn!("circuit breaker opened after {} failures", failures);
                }
            }
            CircuitState::HalfOpen => {
                circuit.open(now);
                tracing::warn!("circuit breaker re-opened (failed in half-open)");
            }
            CircuitState::Open => circuit.opened_at = Some(now),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.circuit.lock().state
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let circuit = self.circuit.lock();
        CircuitMetrics {
            state: circuit.state,
            failures: circuit.failures,
            successes: circuit.successes,
            trips: circuit.trips,
            rejected: circuit.rejected,
        }
    }

    /// Manually reset the circuit to closed.
    pub fn reset(&self) {
        let mut circuit = self.circuit.lock();
        circuit.state = CircuitState::Closed;
        circuit.failures = 0;
        circuit.successes = 0;
        tracing::info!("circuit breaker manually reset");
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Circuit breaker counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CircuitMetrics {
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    /// Times the circuit has opened
    pub trips: u64,
    /// Requests refused while open
    pub rejected: u64,
}
