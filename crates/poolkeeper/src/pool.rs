//! Connection pool: the shared handle the registry caches per instance.
//!
//! A [`ConnectionPool`] owns a bounded set of transports produced by a
//! [`Connector`]. Callers check connections out as RAII
//! [`PooledConnection`] guards; dropping the guard returns the connection to
//! the idle list (or closes it when unhealthy, expired, or surplus).
//!
//! # Architecture
//!
//! ```text
//! checkout()
//!   → idle connection available and not expired → hand it out
//!   → open < max_open → connect a new one (outside the lock)
//!   → at max_open → wait for a release, up to wait_timeout → PoolExhausted
//! ```

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use poolkeeper_core::{InstanceKey, PoolError, PoolResult};

/// Byte transport to one backend server.
pub trait ConnectionBackend: Send + std::fmt::Debug {
    /// Send bytes over the connection. Returns bytes sent.
    fn send(&mut self, data: &[u8]) -> PoolResult<usize>;
    /// Receive up to `max_bytes` from the connection.
    fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>>;
    /// Health check. Returns `true` if the connection is alive.
    fn ping(&mut self) -> bool;
    /// Close the underlying transport.
    fn close(&mut self);
    /// Server version announced during connection setup, if the protocol has one.
    fn server_version(&self) -> Option<&str> {
        None
    }
}

/// Opens new connections for a pool.
pub trait Connector: Send + Sync {
    fn connect(&self) -> PoolResult<Box<dyn ConnectionBackend>>;
}

/// Sizing and expiry limits for one pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolLimits {
    /// Cap on open connections, idle + checked out. `0` means unlimited.
    pub max_open: usize,
    /// Cap on idle connections kept for reuse.
    pub max_idle: usize,
    /// Connections older than this are closed instead of reused.
    pub max_lifetime: Option<Duration>,
    /// Idle connections unused for longer than this are closed.
    pub idle_timeout: Option<Duration>,
    /// How long `checkout()` waits when `max_open` connections are out.
    pub wait_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_open: 1000,
            max_idle: 10,
            max_lifetime: Some(Duration::from_secs(300)),
            idle_timeout: None,
            wait_timeout: Duration::from_secs(1),
        }
    }
}

/// Zero means "never expire".
pub(crate) fn non_zero(d: Duration) -> Option<Duration> {
    (!d.is_zero()).then_some(d)
}

/// Point-in-time pool counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections (idle + checked out).
    pub open: usize,
    /// Connections sitting idle in the pool.
    pub idle: usize,
    /// Connections currently checked out.
    pub active: usize,
    /// Checkouts that gave up after `wait_timeout`.
    pub wait_count: u64,
}

struct IdleConnection {
    backend: Box<dyn ConnectionBackend>,
    created_at: Instant,
    last_used: Instant,
}

impl IdleConnection {
    fn is_expired(&self, limits: &PoolLimits) -> bool {
        limits
            .max_lifetime
            .is_some_and(|l| self.created_at.elapsed() >= l)
            || limits
                .idle_timeout
                .is_some_and(|t| self.last_used.elapsed() >= t)
    }
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    open: usize,
    wait_count: u64,
}

/// Thread-safe pool of connections to one backend instance.
pub struct ConnectionPool {
    key: InstanceKey,
    limits: PoolLimits,
    connector: Box<dyn Connector>,
    state: Mutex<PoolState>,
    /// Signalled whenever a connection is released or an open slot frees up.
    released: Condvar,
}

impl ConnectionPool {
    pub fn new(key: InstanceKey, limits: PoolLimits, connector: impl Connector + 'static) -> Self {
        Self {
            key,
            limits,
            connector: Box::new(connector),
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
        }
    }

    pub fn key(&self) -> &InstanceKey {
        &self.key
    }

    pub fn limits(&self) -> &PoolLimits {
        &self.limits
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adopt an already-open connection (the factory's liveness check) as
    /// the first idle connection. Kept even when `max_idle` is zero.
    pub fn seed(&self, backend: Box<dyn ConnectionBackend>) {
        let now = Instant::now();
        let mut state = self.lock();
        state.open += 1;
        state.idle.push(IdleConnection {
            backend,
            created_at: now,
            last_used: now,
        });
    }

    /// Check out a connection, reusing an idle one when possible.
    pub fn checkout(&self) -> PoolResult<PooledConnection<'_>> {
        // `None`: the timeout is too large to represent, so wait indefinitely.
        let deadline = Instant::now().checked_add(self.limits.wait_timeout);
        let mut state = self.lock();

        loop {
            while let Some(mut conn) = state.idle.pop() {
                if conn.is_expired(&self.limits) {
                    state.open = state.open.saturating_sub(1);
                    conn.backend.close();
                    tracing::debug!(instance = %self.key, "closed expired idle connection");
                    continue;
                }
                return Ok(PooledConnection::new(self, conn.backend, conn.created_at));
            }

            if self.limits.max_open == 0 || state.open < self.limits.max_open {
                state.open += 1;
                drop(state);
                return match self.connector.connect() {
                    Ok(backend) => {
                        tracing::debug!(instance = %self.key, "opened new connection");
                        Ok(PooledConnection::new(self, backend, Instant::now()))
                    }
                    Err(e) => {
                        self.lock().open -= 1;
                        self.released.notify_one();
                        Err(e)
                    }
                };
            }

            let Some(deadline) = deadline else {
                state = self.released.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                state.wait_count += 1;
                return Err(PoolError::PoolExhausted {
                    key: self.key.to_string(),
                    timeout: self.limits.wait_timeout,
                });
            }
            state = self
                .released
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn release(&self, mut backend: Box<dyn ConnectionBackend>, created_at: Instant, healthy: bool) {
        let expired = self
            .limits
            .max_lifetime
            .is_some_and(|l| created_at.elapsed() >= l);

        let mut state = self.lock();
        if !healthy || expired || state.idle.len() >= self.limits.max_idle {
            state.open = state.open.saturating_sub(1);
            drop(state);
            backend.close();
            tracing::debug!(
                instance = %self.key,
                healthy,
                expired,
                "closed connection on release"
            );
        } else {
            state.idle.push(IdleConnection {
                backend,
                created_at,
                last_used: Instant::now(),
            });
        }
        self.released.notify_one();
    }

    /// Close idle connections past their lifetime or idle timeout.
    pub fn reap_idle(&self) -> usize {
        let expired: Vec<IdleConnection> = {
            let mut state = self.lock();
            let (expired, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|c| c.is_expired(&self.limits));
            state.idle = keep;
            state.open = state.open.saturating_sub(expired.len());
            expired
        };
        let reaped = close_all(expired);
        if reaped > 0 {
            self.released.notify_all();
            tracing::info!(instance = %self.key, reaped, "reaped idle connections");
        }
        reaped
    }

    /// Ping every idle connection and drop the ones that fail.
    ///
    /// Idle connections are taken out of the pool while being pinged, so
    /// concurrent checkouts never block on a slow ping.
    pub fn health_check_idle(&self) -> usize {
        let candidates = std::mem::take(&mut self.lock().idle);
        let (healthy, unhealthy): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .map(|mut c| {
                let alive = c.backend.ping();
                (c, alive)
            })
            .partition(|(_, alive)| *alive);

        let removed = unhealthy.len();
        {
            let mut state = self.lock();
            state.idle.extend(healthy.into_iter().map(|(c, _)| c));
            state.open = state.open.saturating_sub(removed);
        }
        close_all(unhealthy.into_iter().map(|(c, _)| c));
        self.released.notify_all();
        if removed > 0 {
            tracing::info!(instance = %self.key, removed, "removed unhealthy idle connections");
        }
        removed
    }

    /// Close every idle connection. Checked-out connections are unaffected.
    pub fn close_idle(&self) -> usize {
        let idle = {
            let mut state = self.lock();
            let idle = std::mem::take(&mut state.idle);
            state.open = state.open.saturating_sub(idle.len());
            idle
        };
        let closed = close_all(idle);
        self.released.notify_all();
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            open: state.open,
            idle: state.idle.len(),
            active: state.open.saturating_sub(state.idle.len()),
            wait_count: state.wait_count,
        }
    }
}

fn close_all(conns: impl IntoIterator<Item = IdleConnection>) -> usize {
    let mut closed = 0;
    for mut conn in conns {
        conn.backend.close();
        closed += 1;
    }
    closed
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("key", &self.key)
            .field("limits", &self.limits)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// Placeholder left behind once a guard hands its backend back to the pool.
#[derive(Debug)]
struct Released;

impl ConnectionBackend for Released {
    fn send(&mut self, _data: &[u8]) -> PoolResult<usize> {
        Err(PoolError::Transport("connection already released".to_string()))
    }

    fn recv(&mut self, _max_bytes: usize) -> PoolResult<Vec<u8>> {
        Err(PoolError::Transport("connection already released".to_string()))
    }

    fn ping(&mut self) -> bool {
        false
    }

    fn close(&mut self) {}
}

/// A checked-out connection. Returned to its pool on drop.
pub struct PooledConnection<'a> {
    pool: &'a ConnectionPool,
    backend: Box<dyn ConnectionBackend>,
    created_at: Instant,
    healthy: bool,
}

impl<'a> PooledConnection<'a> {
    fn new(
        pool: &'a ConnectionPool,
        backend: Box<dyn ConnectionBackend>,
        created_at: Instant,
    ) -> Self {
        Self {
            pool,
            backend,
            created_at,
            healthy: true,
        }
    }

    /// Send bytes; a transport error marks the connection unhealthy.
    pub fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
        let result = self.backend.send(data);
        self.healthy &= result.is_ok();
        result
    }

    /// Receive bytes; a transport error marks the connection unhealthy.
    pub fn recv(&mut self, max_bytes: usize) -> PoolResult<Vec<u8>> {
        let result = self.backend.recv(max_bytes);
        self.healthy &= result.is_ok();
        result
    }

    pub fn ping(&mut self) -> bool {
        self.healthy &= self.backend.ping();
        self.healthy
    }

    pub fn server_version(&self) -> Option<&str> {
        self.backend.server_version()
    }

    /// Close this connection on release instead of returning it to the pool.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for PooledConnection<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("instance", self.pool.key())
            .field("backend", &self.backend)
            .field("healthy", &self.healthy)
            .finish()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        let placeholder: Box<dyn ConnectionBackend> = Box::new(Released);
        let backend = std::mem::replace(&mut self.backend, placeholder);
        self.pool.release(backend, self.created_at, self.healthy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // ── Mock backend and connector ───────────────────────────────────

    #[derive(Debug)]
    struct MockBackend {
        healthy: Arc<AtomicBool>,
        closed: Arc<AtomicUsize>,
    }

    impl ConnectionBackend for MockBackend {
        fn send(&mut self, data: &[u8]) -> PoolResult<usize> {
            if self.healthy.load(Ordering::Relaxed) {
                Ok(data.len())
            } else {
                Err(PoolError::Transport("broken pipe".to_string()))
            }
        }

        fn recv(&mut self, _max_bytes: usize) -> PoolResult<Vec<u8>> {
            Ok(vec![])
        }

        fn ping(&mut self) -> bool {
            self.healthy.load(Ordering::Relaxed)
        }

        fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[derive(Clone, Default)]
    struct MockConnector {
        connects: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
        healthy: Arc<AtomicBool>,
        fail: Arc<AtomicBool>,
    }

    impl MockConnector {
        fn new() -> Self {
            let c = Self::default();
            c.healthy.store(true, Ordering::Relaxed);
            c
        }

        fn backend(&self) -> Box<dyn ConnectionBackend> {
            Box::new(MockBackend {
                healthy: Arc::clone(&self.healthy),
                closed: Arc::clone(&self.closed),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::Relaxed)
        }

        fn closed(&self) -> usize {
            self.closed.load(Ordering::Relaxed)
        }
    }

    impl Connector for MockConnector {
        fn connect(&self) -> PoolResult<Box<dyn ConnectionBackend>> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(PoolError::unreachable("connection refused"));
            }
            self.connects.fetch_add(1, Ordering::Relaxed);
            Ok(self.backend())
        }
    }

    fn test_limits() -> PoolLimits {
        PoolLimits {
            max_open: 2,
            max_idle: 2,
            max_lifetime: None,
            idle_timeout: None,
            wait_timeout: Duration::from_millis(50),
        }
    }

    fn make_pool(limits: PoolLimits) -> (ConnectionPool, MockConnector) {
        let connector = MockConnector::new();
        let pool = ConnectionPool::new(
            InstanceKey::new("orders", "prod"),
            limits,
            connector.clone(),
        );
        (pool, connector)
    }

    // ── Checkout / release ──────────────────────────────────────────

    #[test]
    fn checkout_reuses_released_connection() {
        let (pool, connector) = make_pool(test_limits());

        drop(pool.checkout().unwrap());
        drop(pool.checkout().unwrap());

        assert_eq!(connector.connects(), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                open: 1,
                idle: 1,
                active: 0,
                wait_count: 0,
            }
        );
    }

    #[test]
    fn seeded_connection_is_used_first() {
        let (pool, connector) = make_pool(test_limits());
        pool.seed(connector.backend());

        let _conn = pool.checkout().unwrap();
        assert_eq!(connector.connects(), 0);
        assert_eq!(pool.stats().active, 1);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let (pool, _) = make_pool(test_limits());
        let _a = pool.checkout().unwrap();
        let _b = pool.checkout().unwrap();

        let err = pool.checkout().unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));
        assert_eq!(pool.stats().wait_count, 1);
    }

    #[test]
    fn waiting_checkout_wakes_on_release() {
        let limits = PoolLimits {
            max_open: 1,
            wait_timeout: Duration::from_secs(5),
            ..test_limits()
        };
        let (pool, connector) = make_pool(limits);
        let held = pool.checkout().unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| pool.checkout().map(|_| ()));
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
            assert!(waiter.join().unwrap().is_ok());
        });
        assert_eq!(connector.connects(), 1);
    }

    #[test]
    fn unrepresentable_wait_timeout_waits_for_release() {
        let limits = PoolLimits {
            max_open: 1,
            wait_timeout: Duration::from_secs(i64::MAX as u64),
            ..test_limits()
        };
        let (pool, connector) = make_pool(limits);
        let held = pool.checkout().unwrap();

        std::thread::scope(|s| {
            let waiter = s.spawn(|| pool.checkout().map(|_| ()));
            std::thread::sleep(Duration::from_millis(20));
            drop(held);
            assert!(waiter.join().unwrap().is_ok());
        });
        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.stats().wait_count, 0);
    }

    #[test]
    fn failed_connect_frees_the_slot() {
        let limits = PoolLimits {
            max_open: 1,
            ..test_limits()
        };
        let (pool, connector) = make_pool(limits);
        connector.fail.store(true, Ordering::Relaxed);
        assert!(matches!(
            pool.checkout().unwrap_err(),
            PoolError::BackendUnreachable(_)
        ));
        assert_eq!(pool.stats().open, 0);

        connector.fail.store(false, Ordering::Relaxed);
        assert!(pool.checkout().is_ok());
    }

    #[test]
    fn unhealthy_connection_is_closed_on_release() {
        let (pool, connector) = make_pool(test_limits());
        let mut conn = pool.checkout().unwrap();
        conn.mark_unhealthy();
        drop(conn);

        assert_eq!(connector.closed(), 1);
        assert_eq!(pool.stats().open, 0);
    }

    #[test]
    fn transport_error_marks_unhealthy() {
        let (pool, connector) = make_pool(test_limits());
        let mut conn = pool.checkout().unwrap();
        connector.healthy.store(false, Ordering::Relaxed);
        assert!(conn.send(b"PING").is_err());
        assert!(!conn.is_healthy());
    }

    #[test]
    fn surplus_connections_beyond_max_idle_are_closed() {
        let limits = PoolLimits {
            max_open: 3,
            max_idle: 1,
            ..test_limits()
        };
        let (pool, connector) = make_pool(limits);
        let a = pool.checkout().unwrap();
        let b = pool.checkout().unwrap();
        drop(a);
        drop(b);

        assert_eq!(connector.closed(), 1);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().open, 1);
    }

    #[test]
    fn unlimited_max_open() {
        let limits = PoolLimits {
            max_open: 0,
            ..test_limits()
        };
        let (pool, connector) = make_pool(limits);
        let conns: Vec<_> = (0..5).map(|_| pool.checkout().unwrap()).collect();
        assert_eq!(conns.len(), 5);
        assert_eq!(connector.connects(), 5);
    }

    // ── Expiry and maintenance ──────────────────────────────────────

    #[test]
    fn expired_idle_connection_is_replaced_on_checkout() {
        let limits = PoolLimits {
            max_lifetime: Some(Duration::from_millis(10)),
            ..test_limits()
        };
        let (pool, connector) = make_pool(limits);
        pool.seed(connector.backend());
        std::thread::sleep(Duration::from_millis(20));

        let _conn = pool.checkout().unwrap();
        assert_eq!(connector.closed(), 1);
        assert_eq!(connector.connects(), 1);
        assert_eq!(pool.stats().open, 1);
    }

    #[test]
    fn reap_idle_closes_timed_out_connections() {
        let limits = PoolLimits {
            idle_timeout: Some(Duration::from_millis(10)),
            ..test_limits()
        };
        let (pool, connector) = make_pool(limits);
        drop(pool.checkout().unwrap());
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(pool.reap_idle(), 1);
        assert_eq!(connector.closed(), 1);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn health_check_removes_dead_idle_connections() {
        let (pool, connector) = make_pool(test_limits());
        pool.seed(connector.backend());
        assert_eq!(pool.health_check_idle(), 0);

        connector.healthy.store(false, Ordering::Relaxed);
        assert_eq!(pool.health_check_idle(), 1);
        assert_eq!(pool.stats().open, 0);
    }

    #[test]
    fn close_idle_leaves_checked_out_alone() {
        let (pool, connector) = make_pool(test_limits());
        let held = pool.checkout().unwrap();
        drop(pool.checkout().unwrap());
        let idle_before = pool.stats().idle;

        assert_eq!(pool.close_idle(), idle_before);
        assert_eq!(pool.stats().active, 1);
        drop(held);
        assert_eq!(connector.closed(), idle_before);
    }

    #[test]
    fn zero_duration_means_never_expire() {
        assert_eq!(non_zero(Duration::ZERO), None);
        assert_eq!(non_zero(Duration::from_secs(3)), Some(Duration::from_secs(3)));
    }
}
