use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use muxrpc_common::{Multiplexer, MuxrpcError, Result};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::{Connection, ConnectionState, Connector};

/// Connection pool configuration.
///
/// All limits apply per endpoint.
///
/// # Example
///
/// ```
/// use muxrpc_client::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig {
///     max_connections: 2,
///     acquire_timeout: Duration::from_secs(1),
///     ..Default::default()
/// };
/// assert_eq!(config.max_calls_per_connection, 100);
/// ```
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections, counting ones being dialed.
    ///
    /// Default: 4
    pub max_connections: usize,

    /// Maximum number of concurrent calls leased on one connection.
    ///
    /// Default: 100
    pub max_calls_per_connection: usize,

    /// How long `acquire` waits for capacity before giving up.
    ///
    /// Default: 5s
    pub acquire_timeout: Duration,

    /// Idle connections older than this are closed by eviction.
    ///
    /// Default: 60s
    pub idle_timeout: Duration,

    /// How often the background task runs eviction.
    ///
    /// Default: 10s
    pub eviction_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 4,
            max_calls_per_connection: 100,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            eviction_interval: Duration::from_secs(10),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections held by the pool, including failed ones still draining.
    pub connections: usize,
    /// Connections with no leased calls.
    pub idle: usize,
    /// Calls currently leased across all connections.
    pub leased_calls: usize,
    /// Dials in progress.
    pub dialing: usize,
    /// Callers blocked in `acquire`.
    pub waiters: usize,
}

/// Pools multiplexed connections per endpoint.
///
/// A lease grants one call slot on a connection. Acquisition prefers an idle
/// ready connection, then dials a new one while under `max_connections`,
/// then shares the least loaded ready connection. When all of that is
/// exhausted the caller waits in FIFO order until a lease is released or
/// `acquire_timeout` passes.
///
/// Creating a pool inside a tokio runtime starts a background task that
/// evicts idle connections every `eviction_interval`.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    eviction: Option<JoinHandle<()>>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let shared = Arc::new(PoolShared {
            config,
            connector,
            state: Mutex::new(PoolState::default()),
            next_conn_id: AtomicU64::new(1),
        });
        let eviction = spawn_eviction(&shared);
        Self { shared, eviction }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Leases a call slot on a connection to `endpoint`, waiting at most
    /// `acquire_timeout`.
    pub async fn acquire(&self, endpoint: &str) -> Result<ConnectionLease> {
        self.acquire_with_timeout(endpoint, self.shared.config.acquire_timeout)
            .await
    }

    /// Like [`acquire`](Self::acquire) with an explicit wait bound.
    ///
    /// The bound covers both waiting for capacity and dialing. Dropping the
    /// returned future gives back anything it had been granted.
    pub async fn acquire_with_timeout(&self, endpoint: &str, timeout: Duration) -> Result<ConnectionLease> {
        let started = Instant::now();
        let deadline = started + timeout;

        let granted = {
            let mut state = self.shared.state();
            if state.shutdown {
                return Err(pool_shut_down());
            }
            match self.shared.grant_locked(&mut state, endpoint) {
                Some(grant) => Ok(grant),
                None => {
                    let (tx, rx) = oneshot::channel();
                    state.endpoint(endpoint).waiters.push_back(tx);
                    Err(rx)
                }
            }
        };

        let grant = match granted {
            Ok(grant) => grant,
            Err(mut rx) => {
                tracing::trace!(endpoint, "waiting for pool capacity");
                match tokio::time::timeout_at(deadline, &mut rx).await {
                    Ok(Ok(grant)) => grant,
                    Ok(Err(_)) => return Err(pool_shut_down()),
                    Err(_) => {
                        // A grant may have been sent after the timer fired.
                        rx.close();
                        match rx.try_recv() {
                            Ok(grant) => grant,
                            Err(_) => {
                                let waited_ms = started.elapsed().as_millis() as u64;
                                tracing::debug!(endpoint, waited_ms, "pool exhausted");
                                return Err(MuxrpcError::PoolExhausted {
                                    endpoint: endpoint.to_string(),
                                    waited_ms,
                                });
                            }
                        }
                    }
                }
            }
        };

        match grant {
            Grant::Lease(lease) => Ok(lease),
            Grant::Dial(permit) => self.dial(permit, deadline).await,
        }
    }

    async fn dial(&self, permit: DialPermit, deadline: Instant) -> Result<ConnectionLease> {
        let endpoint = permit.endpoint.clone();
        tracing::debug!(endpoint = %endpoint, "dialing new connection");

        let connect = self.shared.connector.connect(&endpoint);
        let mux = match tokio::time::timeout_at(deadline, connect).await {
            Ok(Ok(mux)) => mux,
            Ok(Err(err)) => {
                tracing::warn!(endpoint = %endpoint, error = %err, "connect failed");
                return Err(match err {
                    err @ MuxrpcError::Transport(_) => err,
                    other => MuxrpcError::Transport(format!("connect to {endpoint} failed: {other}")),
                });
            }
            Err(_) => {
                return Err(MuxrpcError::Transport(format!(
                    "connect to {endpoint} timed out"
                )))
            }
        };

        Ok(permit.complete(mux))
    }

    /// Closes idle connections past `idle_timeout` and drops failed idle
    /// ones. Returns how many were closed.
    pub fn evict_idle(&self) -> usize {
        self.shared.evict_idle()
    }

    /// Aggregate counters across every endpoint.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state();
        state
            .endpoints
            .values()
            .fold(PoolStats::default(), |mut acc, ep| {
                let s = ep.stats();
                acc.connections += s.connections;
                acc.idle += s.idle;
                acc.leased_calls += s.leased_calls;
                acc.dialing += s.dialing;
                acc.waiters += s.waiters;
                acc
            })
    }

    /// Counters for one endpoint.
    pub fn endpoint_stats(&self, endpoint: &str) -> PoolStats {
        let state = self.shared.state();
        state
            .endpoints
            .get(endpoint)
            .map(EndpointPool::stats)
            .unwrap_or_default()
    }

    /// The state of every connection to `endpoint`, dials in progress included.
    pub fn connection_states(&self, endpoint: &str) -> Vec<ConnectionState> {
        let state = self.shared.state();
        let Some(ep) = state.endpoints.get(endpoint) else {
            return Vec::new();
        };
        let mut states: Vec<ConnectionState> = ep
            .entries
            .iter()
            .map(|entry| match entry.conn.health() {
                ConnectionState::Ready if entry.leases == 0 => ConnectionState::Idle,
                other => other,
            })
            .collect();
        states.extend(std::iter::repeat(ConnectionState::Connecting).take(ep.dialing));
        states
    }

    /// Closes every connection and fails pending and future acquisitions.
    ///
    /// Calls already leased see their connection close.
    pub fn shutdown(&self) {
        let (connections, waiters) = {
            let mut state = self.shared.state();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            let mut connections = Vec::new();
            let mut waiters = Vec::new();
            for (_, ep) in state.endpoints.drain() {
                connections.extend(ep.entries.into_iter().map(|entry| entry.conn));
                waiters.extend(ep.waiters);
            }
            (connections, waiters)
        };

        tracing::debug!(connections = connections.len(), waiters = waiters.len(), "pool shutting down");
        drop(waiters);
        for conn in connections {
            conn.shutdown();
        }
        if let Some(eviction) = &self.eviction {
            eviction.abort();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state().shutdown
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        if let Some(eviction) = self.eviction.take() {
            eviction.abort();
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// One call slot on a pooled connection.
///
/// Dropping the lease returns the slot to the pool.
pub struct ConnectionLease {
    pool: Arc<PoolShared>,
    conn: Arc<Connection>,
}

impl ConnectionLease {
    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Returns the slot. Same as dropping the lease.
    pub fn release(self) {}
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.pool.release(&self.conn);
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("conn_id", &self.conn.id())
            .field("endpoint", &self.conn.endpoint())
            .finish()
    }
}

/// What a caller is handed when capacity frees up.
enum Grant {
    Lease(ConnectionLease),
    Dial(DialPermit),
}

/// Reserves a dial slot. Dropping it unfinished gives the slot back.
struct DialPermit {
    pool: Arc<PoolShared>,
    endpoint: String,
    armed: bool,
}

impl DialPermit {
    fn complete(mut self, mux: Multiplexer) -> ConnectionLease {
        self.armed = false;
        let id = self.pool.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let conn = Arc::new(Connection::new(id, self.endpoint.clone(), mux));
        tracing::debug!(conn_id = id, endpoint = %self.endpoint, "connection established");

        let undelivered = {
            let mut state = self.pool.state();
            let shutdown = state.shutdown;
            let ep = state.endpoint(&self.endpoint);
            ep.dialing = ep.dialing.saturating_sub(1);
            if shutdown {
                conn.shutdown();
                Vec::new()
            } else {
                ep.entries.push(PoolEntry {
                    conn: conn.clone(),
                    leases: 1,
                    last_used: Instant::now(),
                });
                // A multiplexed connection may have room for queued callers.
                self.pool.hand_off(&mut state, &self.endpoint)
            }
        };
        drop(undelivered);

        ConnectionLease {
            pool: self.pool.clone(),
            conn,
        }
    }
}

impl Drop for DialPermit {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon_dial(&self.endpoint);
        }
    }
}

struct PoolShared {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    state: Mutex<PoolState>,
    next_conn_id: AtomicU64,
}

#[derive(Default)]
struct PoolState {
    endpoints: HashMap<String, EndpointPool>,
    shutdown: bool,
}

impl PoolState {
    fn endpoint(&mut self, endpoint: &str) -> &mut EndpointPool {
        self.endpoints.entry(endpoint.to_string()).or_default()
    }
}

#[derive(Default)]
struct EndpointPool {
    entries: Vec<PoolEntry>,
    dialing: usize,
    waiters: VecDeque<oneshot::Sender<Grant>>,
}

impl EndpointPool {
    /// Ready connections plus dials in flight. Failed connections still
    /// draining their calls do not count against the limit.
    fn live(&self) -> usize {
        self.entries.iter().filter(|e| e.conn.is_ready()).count() + self.dialing
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.dialing == 0 && self.waiters.is_empty()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            connections: self.entries.len(),
            idle: self.entries.iter().filter(|e| e.leases == 0).count(),
            leased_calls: self.entries.iter().map(|e| e.leases).sum(),
            dialing: self.dialing,
            waiters: self.waiters.iter().filter(|w| !w.is_closed()).count(),
        }
    }
}

struct PoolEntry {
    conn: Arc<Connection>,
    leases: usize,
    last_used: Instant,
}

impl PoolShared {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Picks capacity for one caller, if any is available right now.
    fn grant_locked(self: &Arc<Self>, state: &mut PoolState, endpoint: &str) -> Option<Grant> {
        let max_connections = self.config.max_connections.max(1);
        let max_calls = self.config.max_calls_per_connection.max(1);
        let ep = state.endpoint(endpoint);

        let idle = ep
            .entries
            .iter()
            .position(|e| e.leases == 0 && e.conn.is_ready());

        let index = match idle {
            Some(index) => index,
            None if ep.live() < max_connections => {
                ep.dialing += 1;
                return Some(Grant::Dial(DialPermit {
                    pool: self.clone(),
                    endpoint: endpoint.to_string(),
                    armed: true,
                }));
            }
            None => ep
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.conn.is_ready() && e.leases < max_calls)
                .min_by_key(|(_, e)| e.leases)
                .map(|(i, _)| i)?,
        };

        let entry = &mut ep.entries[index];
        entry.leases += 1;
        entry.last_used = Instant::now();
        Some(Grant::Lease(ConnectionLease {
            pool: self.clone(),
            conn: entry.conn.clone(),
        }))
    }

    /// Hands freed capacity to queued callers in FIFO order.
    ///
    /// Grants that could not be delivered are returned so the caller drops
    /// them after releasing the lock.
    fn hand_off(self: &Arc<Self>, state: &mut PoolState, endpoint: &str) -> Vec<Grant> {
        let mut undelivered = Vec::new();
        loop {
            let Some(ep) = state.endpoints.get_mut(endpoint) else {
                break;
            };
            while ep.waiters.front().is_some_and(|w| w.is_closed()) {
                ep.waiters.pop_front();
            }
            if ep.waiters.is_empty() {
                break;
            }
            let Some(grant) = self.grant_locked(state, endpoint) else {
                break;
            };
            let Some(waiter) = state.endpoint(endpoint).waiters.pop_front() else {
                undelivered.push(grant);
                break;
            };
            if let Err(grant) = waiter.send(grant) {
                undelivered.push(grant);
            }
        }
        undelivered
    }

    fn release(self: &Arc<Self>, conn: &Arc<Connection>) {
        let undelivered = {
            let mut state = self.state();
            let Some(ep) = state.endpoints.get_mut(conn.endpoint()) else {
                return;
            };
            if let Some(pos) = ep.entries.iter().position(|e| Arc::ptr_eq(&e.conn, conn)) {
                let entry = &mut ep.entries[pos];
                entry.leases = entry.leases.saturating_sub(1);
                entry.last_used = Instant::now();
                if entry.leases == 0 && !entry.conn.is_ready() {
                    let entry = ep.entries.swap_remove(pos);
                    tracing::debug!(
                        conn_id = entry.conn.id(),
                        endpoint = %entry.conn.endpoint(),
                        "discarding failed connection"
                    );
                    entry.conn.shutdown();
                }
            }
            self.hand_off(&mut state, conn.endpoint())
        };
        drop(undelivered);
    }

    fn abandon_dial(self: &Arc<Self>, endpoint: &str) {
        let undelivered = {
            let mut state = self.state();
            let Some(ep) = state.endpoints.get_mut(endpoint) else {
                return;
            };
            ep.dialing = ep.dialing.saturating_sub(1);
            self.hand_off(&mut state, endpoint)
        };
        drop(undelivered);
    }

    fn evict_idle(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        let idle_timeout = self.config.idle_timeout;

        let (evicted, undelivered) = {
            let mut state = self.state();
            let mut evicted = Vec::new();
            for ep in state.endpoints.values_mut() {
                let mut i = 0;
                while i < ep.entries.len() {
                    let entry = &ep.entries[i];
                    let expired = now.saturating_duration_since(entry.last_used) >= idle_timeout;
                    if entry.leases == 0 && (expired || !entry.conn.is_ready()) {
                        evicted.push(ep.entries.swap_remove(i).conn);
                    } else {
                        i += 1;
                    }
                }
            }

            let mut undelivered = Vec::new();
            let waiting: Vec<String> = state
                .endpoints
                .iter()
                .filter(|(_, ep)| !ep.waiters.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            for endpoint in waiting {
                undelivered.extend(self.hand_off(&mut state, &endpoint));
            }
            state.endpoints.retain(|_, ep| !ep.is_empty());
            (evicted, undelivered)
        };
        drop(undelivered);

        for conn in &evicted {
            tracing::debug!(conn_id = conn.id(), endpoint = %conn.endpoint(), "evicting idle connection");
            conn.shutdown();
        }
        evicted.len()
    }
}

fn spawn_eviction(shared: &Arc<PoolShared>) -> Option<JoinHandle<()>> {
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let pool: Weak<PoolShared> = Arc::downgrade(shared);
    let period = shared.config.eviction_interval.max(Duration::from_millis(1));

    Some(handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(pool) = pool.upgrade() else {
                break;
            };
            if pool.state().shutdown {
                break;
            }
            let evicted = pool.evict_idle();
            if evicted > 0 {
                tracing::debug!(evicted, "idle eviction pass");
            }
        }
    }))
}

fn pool_shut_down() -> MuxrpcError {
    MuxrpcError::Transport("connection pool is shut down".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::TestConnector;

    fn pool(config: PoolConfig, connector: &Arc<TestConnector>) -> ConnectionPool {
        ConnectionPool::new(config, connector.clone())
    }

    async fn wait_for_waiters(pool: &ConnectionPool, n: usize) {
        while pool.stats().waiters < n {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.max_calls_per_connection, 100);
        assert_eq!(config.acquire_timeout, Duration::from_secs(5));
        assert_eq!(config.idle_timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_idle_connection_is_reused() {
        let connector = TestConnector::new();
        let pool = pool(PoolConfig::default(), &connector);

        let first = pool.acquire("node-a").await.unwrap();
        let id = first.connection().id();
        drop(first);

        let second = pool.acquire("node-a").await.unwrap();
        assert_eq!(second.connection().id(), id);
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test]
    async fn test_endpoints_are_pooled_separately() {
        let connector = TestConnector::new();
        let pool = pool(PoolConfig::default(), &connector);

        let a = pool.acquire("node-a").await.unwrap();
        let b = pool.acquire("node-b").await.unwrap();
        assert_ne!(a.connection().id(), b.connection().id());
        assert_eq!(pool.endpoint_stats("node-a").connections, 1);
        assert_eq!(pool.endpoint_stats("node-b").connections, 1);
        assert_eq!(pool.stats().leased_calls, 2);
    }

    #[tokio::test]
    async fn test_calls_share_a_connection_at_the_limit() {
        let connector = TestConnector::new();
        let config = PoolConfig {
            max_connections: 1,
            max_calls_per_connection: 3,
            ..Default::default()
        };
        let pool = pool(config, &connector);

        let leases = vec![
            pool.acquire("node").await.unwrap(),
            pool.acquire("node").await.unwrap(),
            pool.acquire("node").await.unwrap(),
        ];
        assert!(leases
            .iter()
            .all(|l| l.connection().id() == leases[0].connection().id()));
        assert_eq!(connector.dials(), 1);

        let err = pool
            .acquire_with_timeout("node", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, MuxrpcError::PoolExhausted { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let connector = TestConnector::new();
        let config = PoolConfig {
            max_connections: 1,
            max_calls_per_connection: 1,
            acquire_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let pool = pool(config, &connector);

        let _held = pool.acquire("node").await.unwrap();
        let err = pool.acquire("node").await.unwrap_err();
        match err {
            MuxrpcError::PoolExhausted { endpoint, waited_ms } => {
                assert_eq!(endpoint, "node");
                assert!(waited_ms >= 100);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.stats().waiters, 0);
    }

    #[tokio::test]
    async fn test_waiters_are_served_in_order() {
        let connector = TestConnector::new();
        let config = PoolConfig {
            max_connections: 1,
            max_calls_per_connection: 1,
            ..Default::default()
        };
        let pool = Arc::new(pool(config, &connector));
        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();

        let held = pool.acquire("node").await.unwrap();

        let mut tasks = Vec::new();
        for name in ["first", "second"] {
            let task_pool = pool.clone();
            let order_tx = order_tx.clone();
            let queued = pool.stats().waiters;
            tasks.push(tokio::spawn(async move {
                let lease = task_pool.acquire("node").await.unwrap();
                order_tx.send(name).unwrap();
                drop(lease);
            }));
            wait_for_waiters(&pool, queued + 1).await;
        }

        drop(held);
        assert_eq!(order_rx.recv().await, Some("first"));
        assert_eq!(order_rx.recv().await, Some("second"));
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(connector.dials(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_leak_capacity() {
        let connector = TestConnector::new();
        let config = PoolConfig {
            max_connections: 1,
            max_calls_per_connection: 1,
            ..Default::default()
        };
        let pool = Arc::new(pool(config, &connector));

        let held = pool.acquire("node").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("node").await.map(|_| ()) })
        };
        wait_for_waiters(&pool, 1).await;
        waiter.abort();
        let _ = waiter.await;

        drop(held);
        let lease = pool
            .acquire_with_timeout("node", Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(lease.connection().id(), 1);
    }

    #[tokio::test]
    async fn test_failed_connection_is_replaced() {
        let connector = TestConnector::new();
        let pool = pool(PoolConfig::default(), &connector);

        let lease = pool.acquire("node").await.unwrap();
        let first_id = lease.connection().id();
        lease.connection().mux().close();
        assert_eq!(lease.connection().health(), ConnectionState::TransientFailure);
        drop(lease);

        assert_eq!(pool.endpoint_stats("node").connections, 0);
        let lease = pool.acquire("node").await.unwrap();
        assert_ne!(lease.connection().id(), first_id);
        assert_eq!(connector.dials(), 2);
    }

    #[tokio::test]
    async fn test_dial_failure_releases_slot() {
        let connector = TestConnector::new();
        let config = PoolConfig {
            max_connections: 1,
            ..Default::default()
        };
        let pool = pool(config, &connector);

        connector.refuse.store(true, Ordering::SeqCst);
        let err = pool.acquire("node").await.unwrap_err();
        assert!(matches!(err, MuxrpcError::Transport(_)));
        assert_eq!(pool.endpoint_stats("node").dialing, 0);

        connector.refuse.store(false, Ordering::SeqCst);
        assert!(pool.acquire("node").await.is_ok());
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let connector = TestConnector::new();
        let config = PoolConfig {
            idle_timeout: Duration::ZERO,
            ..Default::default()
        };
        let pool = pool(config, &connector);

        let busy = pool.acquire("node").await.unwrap();
        let idle = pool.acquire("node").await.unwrap();
        let idle_conn = idle.connection().clone();
        drop(idle);

        assert_eq!(pool.evict_idle(), 1);
        assert_eq!(idle_conn.health(), ConnectionState::Shutdown);
        assert_eq!(pool.endpoint_stats("node").connections, 1);
        assert!(busy.connection().is_ready());
    }

    #[tokio::test]
    async fn test_connection_states() {
        let connector = TestConnector::new();
        let pool = pool(PoolConfig::default(), &connector);

        let busy = pool.acquire("node").await.unwrap();
        drop(pool.acquire("node").await.unwrap());

        let mut states = pool.connection_states("node");
        states.sort_by_key(|s| *s as u8);
        assert_eq!(states, vec![ConnectionState::Idle, ConnectionState::Ready]);
        drop(busy);
        assert!(pool.connection_states("other").is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_fails_waiters_and_new_acquires() {
        let connector = TestConnector::new();
        let config = PoolConfig {
            max_connections: 1,
            max_calls_per_connection: 1,
            ..Default::default()
        };
        let pool = Arc::new(pool(config, &connector));

        let held = pool.acquire("node").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("node").await.map(|_| ()) })
        };
        wait_for_waiters(&pool, 1).await;

        pool.shutdown();
        assert!(matches!(waiter.await.unwrap(), Err(MuxrpcError::Transport(_))));
        assert_eq!(held.connection().health(), ConnectionState::Shutdown);
        assert!(pool.acquire("node").await.is_err());
        assert!(pool.is_shutdown());
    }
}
