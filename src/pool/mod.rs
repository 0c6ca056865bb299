//! Keyed connection pool.
//!
//! Connections are pooled per logical namespace (keyspace). The pool never
//! blocks on exhaustion: when no idle connection is available a new one is
//! built, even past the configured soft cap. Connections are validated when
//! lent out and when they come back, never while idle.
//!
//! ```text
//!  borrow(ns) ──► idle[ns] ──pop──► validate_on_borrow ──ok──► PooledConnection
//!                    │                     │ stale / dead
//!                    │ empty               ▼
//!                    └──────────► factory.make(ns)        destroy
//!
//!  drop(PooledConnection) ──► validate_on_return ──ok──► idle[ns]
//!                                      │ stale generation / closed / over cap
//!                                      ▼
//!                                   destroy
//! ```
//!
//! Migrating to a new host is `factory.retarget(..)` followed by
//! [`ConnectionPool::close`]: idle connections go immediately, checked-out
//! ones are destroyed when returned because their generation is stale.

mod connection;
mod factory;

pub use connection::Connection;
pub use factory::{ConnectionFactory, EndpointTarget};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::metrics::StoreMetrics;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct PoolInner {
    factory: Arc<ConnectionFactory>,
    config: PoolConfig,
    idle: Mutex<HashMap<String, VecDeque<Connection>>>,
    idle_count: AtomicUsize,
    active: AtomicUsize,
    shut_down: AtomicBool,
    metrics: Arc<StoreMetrics>,
}

/// Keyed pool of connections built by a [`ConnectionFactory`].
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

/// Pool counters at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub active: usize,
    pub idle: usize,
    pub max_total: usize,
}

impl ConnectionPool {
    pub fn new(factory: Arc<ConnectionFactory>, config: PoolConfig, metrics: Arc<StoreMetrics>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                idle: Mutex::new(HashMap::new()),
                idle_count: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                shut_down: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    pub fn factory(&self) -> &Arc<ConnectionFactory> {
        &self.inner.factory
    }

    /// Lend a validated connection for `namespace`.
    ///
    /// Fails with a temporary error when a new connection cannot be opened.
    pub async fn borrow(&self, namespace: &str) -> Result<PooledConnection> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(Error::PoolShutdown);
        }

        while let Some(mut conn) = inner.pop_idle(namespace) {
            let valid = if inner.config.test_on_borrow {
                inner.factory.validate_on_borrow(&mut conn).await
            } else {
                inner.factory.validate_on_return(&conn)
            };
            if valid {
                return Ok(self.lend(conn));
            }
            debug!(%namespace, generation = conn.generation(), "Discarding invalid idle connection");
            inner.destroy(conn);
        }

        if self.total() >= inner.config.max_total {
            inner.evict_one_idle();
            if self.total() >= inner.config.max_total {
                warn!(
                    %namespace,
                    active = inner.active.load(Ordering::Relaxed),
                    max_total = inner.config.max_total,
                    "Connection pool exhausted, growing past soft cap"
                );
            }
        }

        loop {
            let conn = match inner.factory.make(namespace).await {
                Ok(conn) => conn,
                Err(e) => {
                    inner.metrics.borrow_failures.inc();
                    return Err(e);
                }
            };
            inner.metrics.connections_created.inc();
            // A retarget raced with the connect; the session points at the old host.
            if conn.generation() != inner.factory.generation() {
                debug!(%namespace, "Target changed while connecting, reconnecting");
                inner.destroy(conn);
                continue;
            }
            return Ok(self.lend(conn));
        }
    }

    fn lend(&self, conn: Connection) -> PooledConnection {
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        self.inner.metrics.borrows.inc();
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }

    /// Discard every idle connection. Checked-out connections are untouched.
    ///
    /// The pool stays usable; later borrows build fresh connections.
    pub fn close(&self) {
        let drained: Vec<Connection> = {
            let mut idle = self.inner.idle.lock();
            self.inner.idle_count.store(0, Ordering::Release);
            idle.drain().flat_map(|(_, conns)| conns).collect()
        };
        let count = drained.len();
        for conn in drained {
            self.inner.destroy(conn);
        }
        info!(discarded = count, "Closed connection pool");
    }

    /// Close and refuse all further borrows.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        self.close();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Active plus idle connections.
    pub fn total(&self) -> usize {
        self.inner.active.load(Ordering::Acquire) + self.inner.idle_count.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.inner.active.load(Ordering::Acquire),
            idle: self.inner.idle_count.load(Ordering::Acquire),
            max_total: self.inner.config.max_total,
        }
    }

    /// Idle connections held for a namespace.
    pub fn idle_for(&self, namespace: &str) -> usize {
        self.inner.idle.lock().get(namespace).map_or(0, VecDeque::len)
    }
}

impl PoolInner {
    fn pop_idle(&self, namespace: &str) -> Option<Connection> {
        let mut idle = self.idle.lock();
        let conn = idle.get_mut(namespace)?.pop_front()?;
        self.idle_count.fetch_sub(1, Ordering::AcqRel);
        Some(conn)
    }

    fn evict_one_idle(&self) {
        let victim = {
            let mut idle = self.idle.lock();
            let victim = idle.values_mut().find_map(VecDeque::pop_back);
            if victim.is_some() {
                self.idle_count.fetch_sub(1, Ordering::AcqRel);
            }
            victim
        };
        if let Some(conn) = victim {
            debug!(namespace = %conn.namespace(), "Evicting idle connection to stay under cap");
            self.destroy(conn);
        }
    }

    fn give_back(&self, conn: Connection) {
        self.active.fetch_sub(1, Ordering::AcqRel);

        let over_cap = self.active.load(Ordering::Acquire) + self.idle_count.load(Ordering::Acquire)
            >= self.config.max_total;
        let valid = !self.config.test_on_return || self.factory.validate_on_return(&conn);

        if self.shut_down.load(Ordering::Acquire) || !valid || over_cap {
            self.destroy(conn);
            return;
        }

        let mut idle = self.idle.lock();
        // Re-check under the lock: a retarget may have landed since validation.
        if conn.generation() != self.factory.generation() {
            drop(idle);
            self.destroy(conn);
            return;
        }
        idle.entry(conn.namespace().to_string())
            .or_default()
            .push_front(conn);
        self.idle_count.fetch_add(1, Ordering::AcqRel);
        self.metrics.connections_recycled.inc();
    }

    fn destroy(&self, conn: Connection) {
        self.metrics.connections_destroyed.inc();
        self.factory.destroy(conn);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("stats", &self.stats())
            .field("factory", &self.inner.factory)
            .finish()
    }
}

/// A borrowed connection; returned to the pool when dropped.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PooledConnection").field(&self.conn).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::testing::MemoryCluster;
    use std::time::Duration;

    fn pool_for(cluster: &MemoryCluster, host: &str, max_total: usize) -> ConnectionPool {
        let target = StoreConfig::default()
            .with_connection_timeout(Duration::from_secs(1))
            .endpoint_for(host);
        let factory = Arc::new(ConnectionFactory::new(cluster.connector(), target));
        ConnectionPool::new(
            factory,
            PoolConfig::default().with_max_total(max_total),
            Arc::new(StoreMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_borrow_and_recycle() {
        let cluster = MemoryCluster::new(&["a"]);
        let pool = pool_for(&cluster, "a", 8);

        let conn = pool.borrow("system").await.unwrap();
        assert_eq!(conn.target().hostname, "a");
        assert_eq!(pool.stats().active, 1);
        drop(conn);

        assert_eq!(pool.stats(), PoolStats { active: 0, idle: 1, max_total: 8 });
        let _again = pool.borrow("system").await.unwrap();
        assert_eq!(cluster.connections_opened("a"), 1);
    }

    #[tokio::test]
    async fn test_pool_grows_past_soft_cap() {
        let cluster = MemoryCluster::new(&["a"]);
        let pool = pool_for(&cluster, "a", 2);

        let c1 = pool.borrow("system").await.unwrap();
        let c2 = pool.borrow("system").await.unwrap();
        let c3 = pool.borrow("system").await.unwrap();
        assert_eq!(pool.stats().active, 3);

        drop(c1);
        drop(c2);
        drop(c3);
        // The return that would exceed the cap is destroyed, not kept idle.
        assert_eq!(pool.stats().active, 0);
        assert_eq!(pool.stats().idle, 2);
        assert_eq!(cluster.open_sessions(), 2);
    }

    #[tokio::test]
    async fn test_retarget_destroys_checked_out_connection() {
        let cluster = MemoryCluster::new(&["a", "b"]);
        let pool = pool_for(&cluster, "a", 8);

        let before = pool.borrow("system").await.unwrap();
        assert_eq!(before.target().hostname, "a");

        let new_target = pool.factory().target().with_hostname("b");
        pool.factory().retarget(new_target);
        pool.close();

        drop(before);
        assert_eq!(pool.idle_for("system"), 0, "stale connection must not be recycled");

        let after = pool.borrow("system").await.unwrap();
        assert_eq!(after.target().hostname, "b");
        assert_eq!(cluster.connections_opened("b"), 1);
    }

    #[tokio::test]
    async fn test_close_discards_idle_connections() {
        let cluster = MemoryCluster::new(&["a"]);
        let pool = pool_for(&cluster, "a", 8);

        let c1 = pool.borrow("system").await.unwrap();
        let c2 = pool.borrow("system").await.unwrap();
        drop(c1);
        assert_eq!(pool.stats().idle, 1);

        pool.close();
        assert_eq!(pool.stats().idle, 0);

        // Same generation: a connection checked out across close() is still recycled.
        drop(c2);
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test]
    async fn test_dead_idle_connection_replaced_on_borrow() {
        let cluster = MemoryCluster::new(&["a"]);
        let pool = pool_for(&cluster, "a", 8);

        drop(pool.borrow("system").await.unwrap());
        cluster.kill_sessions();

        let conn = pool.borrow("system").await.unwrap();
        assert!(conn.is_usable());
        assert_eq!(cluster.connections_opened("a"), 2);
    }

    #[tokio::test]
    async fn test_poisoned_connection_destroyed_on_return() {
        let cluster = MemoryCluster::new(&["a"]);
        let pool = pool_for(&cluster, "a", 8);

        let mut conn = pool.borrow("system").await.unwrap();
        conn.poison();
        drop(conn);
        assert_eq!(pool.stats().idle, 0);
    }

    #[tokio::test]
    async fn test_borrow_failure_is_temporary() {
        let cluster = MemoryCluster::new(&["a"]);
        cluster.set_host_down("a", true);
        let pool = pool_for(&cluster, "a", 8);

        let err = pool.borrow("system").await.unwrap_err();
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn test_namespaces_are_pooled_separately() {
        let cluster = MemoryCluster::new(&["a"]);
        cluster.create_keyspace("titan");
        let pool = pool_for(&cluster, "a", 8);

        drop(pool.borrow("system").await.unwrap());
        drop(pool.borrow("titan").await.unwrap());
        assert_eq!(pool.idle_for("system"), 1);
        assert_eq!(pool.idle_for("titan"), 1);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_borrows() {
        let cluster = MemoryCluster::new(&["a"]);
        let pool = pool_for(&cluster, "a", 8);
        pool.shutdown();
        assert!(matches!(pool.borrow("system").await, Err(Error::PoolShutdown)));
    }
}
