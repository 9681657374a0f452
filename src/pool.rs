//! Bounded per-host connection pools.

use crate::claim;
use crate::host::{self, Connection, Host, SharedConnector};
use crate::Role;

use debug_ignore::DebugIgnore;
use derive_where::derive_where;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::time::{timeout, Duration};
use tracing::{event, Level};

#[derive(Error, Debug)]
pub enum Error {
    /// The acquire deadline elapsed with every connection in use.
    #[error("timed out waiting for a connection to {host}")]
    Exhausted { host: host::Name },

    #[error("failed to connect to {host}")]
    Connect {
        host: host::Name,
        #[source]
        source: host::Error,
    },
}

/// A bounded pool of reusable connections to a single host.
///
/// Connections are created lazily: acquiring first waits for one of the
/// pool's slots (bounded by `pool_size`, under the acquire deadline),
/// then reuses an idle connection if one exists. A unit of work that is
/// cancelled mid-acquire gives its slot back; a dropped [claim::Handle]
/// returns its connection.
#[derive_where(Debug)]
pub struct Pool<Conn: Connection> {
    host: Host,
    role: Role,
    connector: DebugIgnore<SharedConnector<Conn>>,
    slots: Arc<Semaphore>,
    idle: DebugIgnore<Arc<Mutex<Vec<Conn>>>>,
    acquire_timeout: Duration,
}

impl<Conn: Connection> Pool<Conn> {
    pub fn new(
        host: Host,
        role: Role,
        connector: SharedConnector<Conn>,
        size: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            host,
            role,
            connector: DebugIgnore(connector),
            slots: Arc::new(Semaphore::new(size)),
            idle: DebugIgnore(Arc::new(Mutex::new(Vec::with_capacity(size)))),
            acquire_timeout,
        }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Claims a connection, waiting until one is available or the acquire
    /// deadline elapses.
    pub async fn acquire(&self) -> Result<claim::Handle<Conn>, Error> {
        let permit = timeout(self.acquire_timeout, self.slots.clone().acquire_owned())
            .await
            .map_err(|_| {
                event!(Level::WARN, host = %self.host.name, "Pool exhausted past deadline");
                Error::Exhausted {
                    host: self.host.name.clone(),
                }
            })?
            .expect("pool semaphore is never closed");

        let reused = self.idle.lock().unwrap().pop();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                self.connector
                    .connect(&self.host)
                    .await
                    .map_err(|source| Error::Connect {
                        host: self.host.name.clone(),
                        source,
                    })?
            }
        };

        Ok(claim::Handle::new(
            conn,
            self.idle.0.clone(),
            permit,
            self.host.name.clone(),
            self.role,
        ))
    }

    /// Number of idle connections held by the pool.
    ///
    /// Racy by nature; meant for stats and tests.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{test_host, TestConnection, TestConnector};

    use std::sync::atomic::Ordering;

    fn test_pool(
        size: usize,
        acquire_timeout: Duration,
    ) -> (Arc<TestConnector>, Pool<TestConnection>) {
        let connector = Arc::new(TestConnector::new());
        let pool = Pool::new(
            test_host("db1", 5432),
            Role::Replica,
            connector.clone(),
            size,
            acquire_timeout,
        );
        (connector, pool)
    }

    #[tokio::test]
    async fn connections_are_recycled() {
        let (connector, pool) = test_pool(2, Duration::from_secs(1));

        let first = pool.acquire().await.unwrap();
        drop(first);
        let _second = pool.acquire().await.unwrap();

        // The second claim reuses the idle connection rather than dialing
        // again.
        assert_eq!(connector.connect_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn discarded_connections_are_not_recycled() {
        let (connector, pool) = test_pool(2, Duration::from_secs(1));

        let mut handle = pool.acquire().await.unwrap();
        handle.discard();
        drop(handle);
        assert_eq!(pool.idle_count(), 0);

        let _again = pool.acquire().await.unwrap();
        assert_eq!(connector.connect_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_as_a_timeout() {
        let (_connector, pool) = test_pool(1, Duration::from_millis(20));

        let held = pool.acquire().await.unwrap();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Exhausted { .. }), "unexpected: {err}");

        // Releasing the only slot makes acquisition succeed again.
        drop(held);
        pool.acquire().await.unwrap();
    }

    #[tokio::test]
    async fn connect_failures_release_the_slot() {
        let (connector, pool) = test_pool(1, Duration::from_millis(50));
        connector.set_connectable(false);

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::Connect { .. }), "unexpected: {err}");

        // The failed claim must not leak its slot.
        connector.set_connectable(true);
        pool.acquire().await.unwrap();
    }
}
