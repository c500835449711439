//! Blocking connection pool.
//!
//! The gateway runs one OS thread per client connection, so the pool hands
//! out connections synchronously: [`Pool::get`] either reuses an idle
//! connection, opens a new one while under `max_connections`, or waits on a
//! condition variable until one is returned or the acquire timeout passes.
//!
//! Connections are returned when their [`PooledConnection`] guard drops.
//! Connections the manager reports as broken are discarded instead.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use mysqlgate_core::{Error, PoolError, PoolErrorKind, Result};

/// Opens and checks connections on behalf of a [`Pool`].
pub trait ManageConnection: Send + Sync + 'static {
    type Connection: Send + 'static;

    fn connect(&self) -> Result<Self::Connection>;

    /// Round-trip check run before checkout when `test_on_checkout` is set.
    fn is_valid(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Cheap synchronous check run when a connection is returned.
    fn has_broken(&self, conn: &Self::Connection) -> bool;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened by [`Pool::build`] up front
    pub min_connections: usize,
    pub max_connections: usize,
    /// Idle connections older than this are closed on checkout
    pub idle_timeout_ms: u64,
    /// How long [`Pool::get`] waits when the pool is at capacity
    pub acquire_timeout_ms: u64,
    pub max_lifetime_ms: u64,
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 10,
            idle_timeout_ms: 600_000,
            acquire_timeout_ms: 30_000,
            max_lifetime_ms: 1_800_000,
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            ..Default::default()
        }
    }

    pub fn min_connections(mut self, n: usize) -> Self {
        self.min_connections = n;
        self
    }

    pub fn idle_timeout(mut self, ms: u64) -> Self {
        self.idle_timeout_ms = ms;
        self
    }

    pub fn acquire_timeout(mut self, ms: u64) -> Self {
        self.acquire_timeout_ms = ms;
        self
    }

    pub fn max_lifetime(mut self, ms: u64) -> Self {
        self.max_lifetime_ms = ms;
        self
    }

    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections (active + idle)
    pub total_connections: usize,
    pub idle_connections: usize,
    pub active_connections: usize,
    /// Threads blocked in [`Pool::get`]
    pub pending_requests: usize,
    pub connections_created: u64,
    pub connections_discarded: u64,
}

struct Idle<C> {
    conn: C,
    created: Instant,
    idle_since: Instant,
}

struct State<C> {
    idle: VecDeque<Idle<C>>,
    total: usize,
    waiting: usize,
    closed: bool,
}

struct Shared<M: ManageConnection> {
    manager: M,
    config: PoolConfig,
    state: Mutex<State<M::Connection>>,
    available: Condvar,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<M: ManageConnection> Shared<M> {
    /// Give back a slot whose connection is gone.
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.total = state.total.saturating_sub(1);
        self.discarded.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.available.notify_one();
    }

    fn expired(&self, idle: &Idle<M::Connection>, now: Instant) -> bool {
        let lifetime = Duration::from_millis(self.config.max_lifetime_ms);
        let idle_timeout = Duration::from_millis(self.config.idle_timeout_ms);
        (self.config.max_lifetime_ms > 0 && now.duration_since(idle.created) >= lifetime)
            || (self.config.idle_timeout_ms > 0 && now.duration_since(idle.idle_since) >= idle_timeout)
    }
}

/// A cloneable handle to a connection pool.
pub struct Pool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for Pool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> std::fmt::Debug for Pool<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<M: ManageConnection> Pool<M> {
    /// Create a pool that opens connections lazily.
    pub fn new(manager: M, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                manager,
                config,
                state: Mutex::new(State {
                    idle: VecDeque::new(),
                    total: 0,
                    waiting: 0,
                    closed: false,
                }),
                available: Condvar::new(),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    /// Create a pool and open `min_connections` immediately.
    pub fn build(manager: M, config: PoolConfig) -> Result<Self> {
        if config.max_connections == 0 {
            return Err(Error::config("pool max_connections must be at least 1"));
        }
        let warm = config.min_connections.min(config.max_connections);
        let pool = Self::new(manager, config);
        let now = Instant::now();
        for _ in 0..warm {
            let conn = pool.shared.manager.connect()?;
            pool.shared.created.fetch_add(1, Ordering::Relaxed);
            let mut state = pool.shared.state.lock();
            state.total += 1;
            state.idle.push_back(Idle {
                conn,
                created: now,
                idle_since: now,
            });
        }
        tracing::debug!(warm, "connection pool ready");
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total_connections: state.total,
            idle_connections: state.idle.len(),
            active_connections: state.total - state.idle.len(),
            pending_requests: state.waiting,
            connections_created: self.shared.created.load(Ordering::Relaxed),
            connections_discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }

    pub fn at_capacity(&self) -> bool {
        self.shared.state.lock().total >= self.shared.config.max_connections
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub fn get(&self) -> Result<PooledConnection<M>> {
        let shared = &self.shared;
        let deadline = Instant::now() + Duration::from_millis(shared.config.acquire_timeout_ms);

        loop {
            let mut state = shared.state.lock();
            if state.closed {
                return Err(pool_error(PoolErrorKind::Closed, "pool is closed"));
            }

            let now = Instant::now();
            if let Some(idle) = state.idle.pop_front() {
                drop(state);
                if shared.expired(&idle, now) {
                    tracing::debug!("closing expired pooled connection");
                    drop(idle);
                    shared.release_slot();
                    continue;
                }
                let mut conn = idle.conn;
                if shared.config.test_on_checkout {
                    if let Err(e) = shared.manager.is_valid(&mut conn) {
                        tracing::debug!(error = %e, "pooled connection failed validation");
                        drop(conn);
                        shared.release_slot();
                        continue;
                    }
                }
                return Ok(PooledConnection::new(Arc::clone(shared), conn, idle.created));
            }

            if state.total < shared.config.max_connections {
                state.total += 1;
                drop(state);
                return match shared.manager.connect() {
                    Ok(conn) => {
                        shared.created.fetch_add(1, Ordering::Relaxed);
                        Ok(PooledConnection::new(Arc::clone(shared), conn, Instant::now()))
                    }
                    Err(e) => {
                        let mut state = shared.state.lock();
                        state.total -= 1;
                        drop(state);
                        shared.available.notify_one();
                        Err(e)
                    }
                };
            }

            if shared.config.acquire_timeout_ms == 0 {
                return Err(pool_error(
                    PoolErrorKind::Exhausted,
                    format!(
                        "all {} connections are in use",
                        shared.config.max_connections
                    ),
                ));
            }

            state.waiting += 1;
            let timed_out = shared
                .available
                .wait_until(&mut state, deadline)
                .timed_out();
            state.waiting -= 1;
            if timed_out && state.idle.is_empty() && state.total >= shared.config.max_connections {
                return Err(pool_error(
                    PoolErrorKind::Timeout,
                    format!(
                        "timed out after {}ms waiting for a connection",
                        shared.config.acquire_timeout_ms
                    ),
                ));
            }
        }
    }

    /// Close idle connections and refuse further checkouts.
    ///
    /// Connections currently checked out are closed when returned.
    pub fn close(&self) {
        let idle: Vec<_> = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        drop(idle);
        self.shared.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

fn pool_error(kind: PoolErrorKind, message: impl Into<String>) -> Error {
    Error::Pool(PoolError {
        kind,
        message: message.into(),
        source: None,
    })
}

/// A connection checked out of a [`Pool`].
pub struct PooledConnection<M: ManageConnection> {
    shared: Arc<Shared<M>>,
    conn: Option<M::Connection>,
    created: Instant,
}

impl<M: ManageConnection> PooledConnection<M> {
    fn new(shared: Arc<Shared<M>>, conn: M::Connection, created: Instant) -> Self {
        Self {
            shared,
            conn: Some(conn),
            created,
        }
    }

    /// Take the connection out of the pool for good, freeing its slot.
    pub fn detach(mut self) -> Option<M::Connection> {
        let conn = self.conn.take();
        self.shared.release_slot();
        conn
    }
}

impl<M: ManageConnection> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<M: ManageConnection> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<M: ManageConnection> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        let shared = &self.shared;
        if shared.manager.has_broken(&conn) {
            tracing::debug!("discarding broken connection");
            drop(conn);
            shared.release_slot();
            return;
        }
        let mut state = shared.state.lock();
        if state.closed {
            state.total -= 1;
            drop(state);
            drop(conn);
            shared.available.notify_one();
            return;
        }
        state.idle.push_back(Idle {
            conn,
            created: self.created,
            idle_since: Instant::now(),
        });
        drop(state);
        shared.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mysqlgate_core::ConnectionErrorKind;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[derive(Default)]
    struct FakeManager {
        opened: AtomicU64,
        fail_connect: AtomicBool,
        fail_validation: AtomicBool,
    }

    struct FakeConn {
        id: u64,
        broken: bool,
    }

    impl ManageConnection for FakeManager {
        type Connection = FakeConn;

        fn connect(&self) -> Result<FakeConn> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(Error::connection(ConnectionErrorKind::Refused, "down"));
            }
            let id = self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(FakeConn { id, broken: false })
        }

        fn is_valid(&self, _conn: &mut FakeConn) -> Result<()> {
            if self.fail_validation.load(Ordering::SeqCst) {
                Err(Error::connection(ConnectionErrorKind::Disconnected, "gone"))
            } else {
                Ok(())
            }
        }

        fn has_broken(&self, conn: &FakeConn) -> bool {
            conn.broken
        }
    }

    fn pool(config: PoolConfig) -> Pool<FakeManager> {
        Pool::build(FakeManager::default(), config).unwrap()
    }

    #[test]
    fn config_builder() {
        let config = PoolConfig::new(20)
            .min_connections(5)
            .idle_timeout(60_000)
            .acquire_timeout(5_000)
            .max_lifetime(3_600_000)
            .test_on_checkout(false);
        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 5);
        assert_eq!(config.idle_timeout_ms, 60_000);
        assert_eq!(config.acquire_timeout_ms, 5_000);
        assert_eq!(config.max_lifetime_ms, 3_600_000);
        assert!(!config.test_on_checkout);
    }

    #[test]
    fn connections_are_reused() {
        let pool = pool(PoolConfig::new(2));
        let first_id = pool.get().unwrap().id;
        let second_id = pool.get().unwrap().id;
        assert_eq!(first_id, second_id);
        assert_eq!(pool.stats().connections_created, 1);
        assert_eq!(pool.stats().idle_connections, 1);
    }

    #[test]
    fn warm_up_opens_min_connections() {
        let pool = pool(PoolConfig::new(4).min_connections(2));
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.idle_connections, 2);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn broken_connections_are_discarded() {
        let pool = pool(PoolConfig::new(2));
        {
            let mut conn = pool.get().unwrap();
            conn.broken = true;
        }
        let stats = pool.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.connections_discarded, 1);
        assert_eq!(pool.get().unwrap().id, 1);
    }

    #[test]
    fn failed_validation_opens_a_fresh_connection() {
        let pool = pool(PoolConfig::new(1));
        drop(pool.get().unwrap());
        pool.manager().fail_validation.store(true, Ordering::SeqCst);
        let conn = pool.get().unwrap();
        assert_eq!(conn.id, 1);
    }

    #[test]
    fn exhausted_without_timeout() {
        let pool = pool(PoolConfig::new(1).acquire_timeout(0));
        let _held = pool.get().unwrap();
        match pool.get() {
            Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Exhausted),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("pool handed out more than max_connections"),
        }
    }

    #[test]
    fn waits_for_a_returned_connection() {
        let pool = pool(PoolConfig::new(1).acquire_timeout(5_000));
        let held = pool.get().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get().map(|c| c.id))
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), 0);
    }

    #[test]
    fn times_out_when_nothing_is_returned() {
        let pool = pool(PoolConfig::new(1).acquire_timeout(30));
        let _held = pool.get().unwrap();
        match pool.get() {
            Err(Error::Pool(e)) => assert_eq!(e.kind, PoolErrorKind::Timeout),
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("expected timeout"),
        }
    }

    #[test]
    fn connect_failure_frees_the_slot() {
        let pool = pool(PoolConfig::new(1));
        pool.manager().fail_connect.store(true, Ordering::SeqCst);
        assert!(pool.get().is_err());
        assert_eq!(pool.stats().total_connections, 0);
        pool.manager().fail_connect.store(false, Ordering::SeqCst);
        assert!(pool.get().is_ok());
    }

    #[test]
    fn closed_pool_refuses_checkout() {
        let pool = pool(PoolConfig::new(2).min_connections(1));
        let held = pool.get().unwrap();
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.get(),
            Err(Error::Pool(ref e)) if e.kind == PoolErrorKind::Closed
        ));
        drop(held);
        assert_eq!(pool.stats().total_connections, 0);
    }

    #[test]
    fn expired_idle_connections_are_replaced() {
        let pool = pool(PoolConfig::new(1).idle_timeout(1));
        drop(pool.get().unwrap());
        thread::sleep(Duration::from_millis(10));
        assert_eq!(pool.get().unwrap().id, 1);
    }
}
