//! Connection Pool
//!
//! Named, bounded pools of reusable connection handles. When a pool is
//! exhausted, acquirers queue in FIFO order and are handed connections
//! directly on release.

use crate::domain::entities::Connection;
use crate::domain::error::FabricError;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections created up front and kept through idle reclamation
    pub min_connections: usize,
    /// Hard cap on connections (idle + in use)
    pub max_connections: usize,
    /// How long a queued acquire waits before failing
    pub acquire_timeout: Duration,
    /// Idle time after which a connection may be reclaimed
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 2,
            max_connections: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// A queued acquirer.
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Connection>,
}

#[derive(Default)]
struct PoolState {
    /// Every connection owned by the pool, keyed by id
    connections: HashMap<String, Connection>,
    /// Idle connection ids, oldest release first
    available: VecDeque<String>,
    /// Queued acquirers, oldest first
    pending: VecDeque<Waiter>,
    created: u64,
    destroyed: u64,
    timeouts: u64,
    handoffs: u64,
    next_waiter: u64,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.connections.len() - self.available.len()
    }

    /// Waiters whose acquirer is still listening.
    fn live_waiters(&self) -> usize {
        self.pending.iter().filter(|w| !w.tx.is_closed()).count()
    }

    fn create(&mut self, pool: &str) -> Connection {
        let conn = Connection::new(pool);
        self.connections.insert(conn.id.clone(), conn.clone());
        self.created += 1;
        conn
    }

    /// Mark a connection in use and return a snapshot of it.
    fn check_out(&mut self, id: &str) -> Option<Connection> {
        let conn = self.connections.get_mut(id)?;
        conn.in_use = true;
        conn.touch();
        Some(conn.clone())
    }
}

/// A single named pool.
struct NamedPool {
    name: String,
    config: PoolConfig,
    state: Mutex<PoolState>,
}

impl NamedPool {
    fn new(name: &str, config: PoolConfig) -> Self {
        let mut state = PoolState::default();
        for _ in 0..config.min_connections.min(config.max_connections) {
            let conn = state.create(name);
            state.available.push_back(conn.id);
        }

        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(state),
        }
    }

    fn check_in(&self, connection_id: &str) -> Result<(), FabricError> {
        let mut state = self.state.lock();

        let mut handoff = match state.connections.get_mut(connection_id) {
            Some(conn) if conn.in_use => {
                conn.touch();
                conn.clone()
            }
            Some(_) => {
                tracing::warn!(pool = %self.name, connection = %connection_id, "released an idle connection");
                return Ok(());
            }
            None => {
                return Err(FabricError::UnknownConnection {
                    pool: self.name.clone(),
                    id: connection_id.to_string(),
                });
            }
        };

        while let Some(waiter) = state.pending.pop_front() {
            match waiter.tx.send(handoff) {
                Ok(()) => {
                    state.handoffs += 1;
                    tracing::debug!(pool = %self.name, connection = %connection_id, "handed connection to waiter");
                    return Ok(());
                }
                // Waiter went away; try the next one
                Err(conn) => handoff = conn,
            }
        }

        if let Some(conn) = state.connections.get_mut(connection_id) {
            conn.in_use = false;
        }
        state.available.push_back(connection_id.to_string());
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let total = state.connections.len();
        let in_use = state.in_use();

        PoolStats {
            name: self.name.clone(),
            total,
            idle: state.available.len(),
            in_use,
            waiting: state.live_waiters(),
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
            utilization: if self.config.max_connections == 0 {
                0.0
            } else {
                in_use as f64 / self.config.max_connections as f64
            },
            created: state.created,
            destroyed: state.destroyed,
            timeouts: state.timeouts,
            handoffs: state.handoffs,
        }
    }
}

/// Receiving end of a queued acquire.
///
/// A connection handed off after the acquirer stopped listening (timeout
/// race, task abort, losing `select!` branch) is checked back in on drop.
struct PendingAcquire {
    pool: Arc<NamedPool>,
    rx: oneshot::Receiver<Connection>,
    claimed: bool,
}

impl PendingAcquire {
    /// Take the handed-off connection, disarming the guard.
    fn claim(&mut self, conn: Connection) -> Connection {
        self.claimed = true;
        conn
    }
}

impl Drop for PendingAcquire {
    fn drop(&mut self) {
        if self.claimed {
            return;
        }
        self.rx.close();
        if let Ok(conn) = self.rx.try_recv() {
            tracing::debug!(pool = %self.pool.name, connection = %conn.id, "reclaimed connection from abandoned waiter");
            if let Err(e) = self.pool.check_in(&conn.id) {
                tracing::error!(pool = %self.pool.name, "failed to reclaim connection: {}", e);
            }
        }
    }
}

/// Connection pool manager.
///
/// Owns every named pool. Pool state sits behind a short-lived lock that
/// is never held across an await.
#[derive(Default)]
pub struct ConnectionPool {
    pools: DashMap<String, Arc<NamedPool>>,
}

impl ConnectionPool {
    /// Create an empty pool manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a named pool, pre-creating its minimum idle connections.
    pub fn create_pool(&self, name: &str, config: PoolConfig) -> Result<(), FabricError> {
        if self.pools.contains_key(name) {
            return Err(FabricError::DuplicatePool(name.to_string()));
        }

        tracing::info!(
            pool = %name,
            min = config.min_connections,
            max = config.max_connections,
            "created connection pool"
        );

        self.pools
            .insert(name.to_string(), Arc::new(NamedPool::new(name, config)));
        Ok(())
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Acquire a connection from a pool.
    ///
    /// Reuses an idle connection, else creates one below the cap, else
    /// queues behind earlier waiters for up to `acquire_timeout`.
    pub async fn acquire(&self, name: &str) -> Result<Connection, FabricError> {
        let pool = self.pool(name)?;
        let start = Instant::now();

        let (waiter_id, rx) = {
            let mut state = pool.state.lock();

            while let Some(id) = state.available.pop_front() {
                if let Some(conn) = state.check_out(&id) {
                    tracing::debug!(pool = %name, connection = %conn.id, "reused idle connection");
                    return Ok(conn);
                }
            }

            if state.connections.len() < pool.config.max_connections {
                let created = state.create(&pool.name);
                if let Some(conn) = state.check_out(&created.id) {
                    tracing::debug!(pool = %name, connection = %conn.id, "created connection");
                    return Ok(conn);
                }
            }

            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.pending.push_back(Waiter { id, tx });

            tracing::debug!(pool = %name, queued = state.pending.len(), "pool exhausted, waiting");
            (id, rx)
        };

        let mut pending = PendingAcquire {
            pool: pool.clone(),
            rx,
            claimed: false,
        };

        match tokio::time::timeout(pool.config.acquire_timeout, &mut pending.rx).await {
            Ok(Ok(conn)) => Ok(pending.claim(conn)),
            // Sender dropped without a handoff: the pool went away
            Ok(Err(_)) => Err(FabricError::UnknownPool(name.to_string())),
            Err(_) => {
                let mut state = pool.state.lock();

                if let Some(pos) = state.pending.iter().position(|w| w.id == waiter_id) {
                    state.pending.remove(pos);
                    state.timeouts += 1;

                    let err = FabricError::AcquireTimeout {
                        pool: name.to_string(),
                        waited_ms: start.elapsed().as_millis() as u64,
                        in_use: state.in_use(),
                        max: pool.config.max_connections,
                    };
                    tracing::warn!("{}", err);
                    return Err(err);
                }
                drop(state);

                // A release handed us a connection between the deadline
                // and taking the lock
                match pending.rx.try_recv() {
                    Ok(conn) => Ok(pending.claim(conn)),
                    Err(_) => Err(FabricError::UnknownPool(name.to_string())),
                }
            }
        }
    }

    /// Return a connection to its pool.
    ///
    /// The oldest live waiter receives it directly; otherwise it goes back
    /// on the idle list.
    pub fn release(&self, name: &str, connection_id: &str) -> Result<(), FabricError> {
        self.pool(name)?.check_in(connection_id)
    }

    /// Destroy idle connections past their idle timeout, never dropping a
    /// pool below its minimum. Returns the number destroyed.
    pub fn reclaim_idle(&self) -> usize {
        let now = Instant::now();
        let mut destroyed = 0;

        for entry in self.pools.iter() {
            let pool = entry.value();
            let mut state = pool.state.lock();

            let expired: Vec<String> = state
                .available
                .iter()
                .filter(|id| {
                    state
                        .connections
                        .get(*id)
                        .map(|c| c.is_idle_expired(pool.config.idle_timeout, now))
                        .unwrap_or(true)
                })
                .cloned()
                .collect();

            for id in expired {
                if state.connections.len() <= pool.config.min_connections {
                    break;
                }
                state.available.retain(|a| a != &id);
                state.connections.remove(&id);
                state.destroyed += 1;
                destroyed += 1;
            }
        }

        if destroyed > 0 {
            tracing::debug!(destroyed, "reclaimed idle connections");
        }
        destroyed
    }

    /// Statistics for one pool.
    pub fn stats(&self, name: &str) -> Result<PoolStats, FabricError> {
        Ok(self.pool(name)?.stats())
    }

    /// Statistics for every pool, sorted by name.
    pub fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|p| p.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    fn pool(&self, name: &str) -> Result<Arc<NamedPool>, FabricError> {
        match self.pools.get(name) {
            Some(pool) => Ok(pool.value().clone()),
            None => {
                tracing::error!(pool = %name, "unknown connection pool");
                Err(FabricError::UnknownPool(name.to_string()))
            }
        }
    }
}

/// Connection pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    /// Acquirers currently queued
    pub waiting: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    /// In-use connections over the cap
    pub utilization: f64,
    pub created: u64,
    pub destroyed: u64,
    pub timeouts: u64,
    pub handoffs: u64,
}
