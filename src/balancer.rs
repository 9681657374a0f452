//! Host selection, failover, and health tracking.
//!
//! The [LoadBalancer] owns the primary host and the replica set. It is
//! created once per process and shared behind an [Arc]; the replica set
//! is swapped atomically by service discovery while many sessions read it
//! concurrently, so it lives in a [watch] channel as an immutable map.

use crate::backoff::Backoff;
use crate::claim;
use crate::config::{Policy, Selection};
use crate::failure_window::FailureWindow;
use crate::host::{self, Connection, Health, HealthFlag, Host, SharedConnector};
use crate::pool::{self, Pool};
use crate::Role;

use futures::future::BoxFuture;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Instant};
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    /// Every eligible host failed with a connection-class error; the last
    /// one is attached unmodified.
    #[error("no healthy host could serve the query")]
    Unavailable {
        #[source]
        source: host::Error,
    },

    /// Claiming a connection failed for a non-connection reason, e.g. the
    /// pool stayed exhausted past its deadline.
    #[error(transparent)]
    Pool(#[from] pool::Error),

    /// The query itself failed. Not a routing problem; surfaced without
    /// retry.
    #[error("query failed on {role} host {host}")]
    Query {
        role: Role,
        host: host::Name,
        #[source]
        source: host::Error,
    },

    /// A pinned read named a replica that is no longer in the pool.
    #[error("replica {0} is not in the pool")]
    UnknownReplica(host::Name),
}

/// The outcome of a balanced operation, tagged with the host and role
/// that served it.
#[derive(Debug)]
pub struct Served<T> {
    pub host: host::Name,
    pub role: Role,
    pub value: T,
}

/// Per-host state owned by the balancer: the connection pool, the health
/// flag, and failure accounting.
pub(crate) struct HostState<Conn: Connection> {
    pub(crate) pool: Pool<Conn>,
    pub(crate) health: HealthFlag,
    pub(crate) failures: FailureWindow,
    last_checked: Mutex<Option<Instant>>,
}

impl<Conn: Connection> HostState<Conn> {
    fn new(host: Host, role: Role, connector: SharedConnector<Conn>, policy: &Policy) -> Self {
        Self {
            pool: Pool::new(
                host,
                role,
                connector,
                policy.pool_size,
                policy.acquire_timeout,
            ),
            health: HealthFlag::new(Health::Up),
            failures: FailureWindow::new(policy.failure_window),
            last_checked: Mutex::new(None),
        }
    }

    pub(crate) fn host(&self) -> &Host {
        self.pool.host()
    }

    /// A liveness check: can we open and validate a fresh connection?
    pub(crate) async fn probe(&self, connector: &SharedConnector<Conn>) -> bool {
        let healthy = match connector.connect(self.host()).await {
            Ok(mut conn) => connector.is_valid(&mut conn).await.is_ok(),
            Err(_) => false,
        };
        *self.last_checked.lock().unwrap() = Some(Instant::now());
        healthy
    }

    fn observed(&self) {
        *self.last_checked.lock().unwrap() = Some(Instant::now());
    }
}

/// The set of replicas currently eligible for reads.
///
/// Invariant: never contains the primary's address. Swapped wholesale by
/// reconciliation; never mutated in place.
pub(crate) type ReplicaSet<Conn> = Arc<BTreeMap<host::Name, Arc<HostState<Conn>>>>;

/// Routes operations to the primary or a healthy replica, absorbing
/// host-local failures while any healthy path remains.
pub struct LoadBalancer<Conn: Connection> {
    primary: Arc<HostState<Conn>>,
    replicas_tx: watch::Sender<ReplicaSet<Conn>>,
    connector: SharedConnector<Conn>,
    policy: Policy,
    next: AtomicUsize,
    probe_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Point-in-time view of one host, for instrumentation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HostStats {
    pub host: Host,
    pub role: Role,
    pub health: Health,
    pub recent_failures: usize,
    pub idle_connections: usize,
    /// When the failover logic last observed this host's health, via a
    /// probe or a reported connection error.
    pub last_checked: Option<Instant>,
}

// The outcome of one attempt against one host.
enum Attempt<T> {
    Ok(Served<T>),
    // Connection-class: the host is suspect, failover may continue.
    Connection(host::Error),
    // The query failed on a live connection; no retry.
    Query {
        role: Role,
        host: host::Name,
        source: host::Error,
    },
    Pool(pool::Error),
}

impl<Conn: Connection> LoadBalancer<Conn> {
    /// Creates the balancer and starts its background liveness probe,
    /// which returns hosts marked down to rotation once they pass a
    /// check. The probe stops when the balancer is dropped.
    pub fn new(primary: Host, connector: SharedConnector<Conn>, policy: Policy) -> Arc<Self> {
        let primary = Arc::new(HostState::new(
            primary,
            Role::Primary,
            connector.clone(),
            &policy,
        ));
        let (replicas_tx, _) = watch::channel(Arc::new(BTreeMap::new()));
        let health_interval = policy.health_interval;

        let balancer = Arc::new(Self {
            primary,
            replicas_tx,
            connector,
            policy,
            next: AtomicUsize::new(0),
            probe_task: Mutex::new(None),
        });

        let weak: Weak<Self> = Arc::downgrade(&balancer);
        let handle = tokio::task::spawn(async move {
            let mut ticker = interval(health_interval);
            loop {
                ticker.tick().await;
                let Some(balancer) = weak.upgrade() else {
                    return;
                };
                balancer.probe_down_hosts().await;
            }
        });
        *balancer.probe_task.lock().unwrap() = Some(handle);

        balancer
    }

    /// Executes a read against one healthy replica. A connection-class
    /// error marks the host down and retries a different healthy host, up
    /// to the retry bound; with no healthy replica left the read fails
    /// over to the primary.
    #[instrument(level = "debug", skip(self, op), name = "LoadBalancer::read")]
    pub async fn read<T, F>(&self, mut op: F) -> Result<Served<T>, Error>
    where
        F: for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<T, host::Error>>,
    {
        let mut attempted: Vec<host::Name> = Vec::new();
        let mut last_error = None;

        while attempted.len() <= self.policy.max_retries {
            let Some((name, replica)) = self.select_replica(&attempted) else {
                break;
            };
            match self.attempt(&replica, &mut op).await {
                Attempt::Ok(served) => return Ok(served),
                Attempt::Connection(err) => {
                    self.note_failure(&name, &replica, &err);
                    last_error = Some(err);
                    attempted.push(name);
                }
                Attempt::Query { role, host, source } => {
                    return Err(Error::Query { role, host, source })
                }
                Attempt::Pool(err) => return Err(Error::Pool(err)),
            }
        }

        if last_error.is_some() || !self.replicas_tx.borrow().is_empty() {
            event!(
                Level::WARN,
                attempted = attempted.len(),
                "No healthy replica available, failing over to primary"
            );
        }
        self.read_write(op).await
    }

    /// Executes an operation against the primary, retrying recoverable
    /// connection errors a bounded number of times with backoff.
    #[instrument(level = "debug", skip(self, op), name = "LoadBalancer::read_write")]
    pub async fn read_write<T, F>(&self, mut op: F) -> Result<Served<T>, Error>
    where
        F: for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<T, host::Error>>,
    {
        let mut backoff = Backoff::new(
            self.policy.min_retry_backoff,
            self.policy.max_retry_backoff,
            self.policy.retry_spread,
        );
        let mut attempt = 0;

        loop {
            match self.attempt(&self.primary, &mut op).await {
                Attempt::Ok(served) => return Ok(served),
                Attempt::Connection(err) => {
                    self.primary.failures.record();
                    attempt += 1;
                    if attempt > self.policy.max_retries {
                        return Err(Error::Unavailable { source: err });
                    }
                    event!(
                        Level::WARN,
                        err = %err,
                        attempt,
                        "Connection error on primary, retrying"
                    );
                    tokio::time::sleep(backoff.next_delay()).await;
                }
                Attempt::Query { role, host, source } => {
                    return Err(Error::Query { role, host, source })
                }
                Attempt::Pool(err) => return Err(Error::Pool(err)),
            }
        }
    }

    /// Executes a read against one specific replica, with no failover.
    /// Used for transactions pinned to a replica, where hopping hosts
    /// mid-transaction would break the caller's view of the data.
    #[instrument(level = "debug", skip(self, op), name = "LoadBalancer::read_pinned")]
    pub async fn read_pinned<T, F>(&self, name: &host::Name, mut op: F) -> Result<Served<T>, Error>
    where
        F: for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<T, host::Error>>,
    {
        let replica = {
            let set = self.replicas_tx.borrow();
            set.get(name)
                .cloned()
                .ok_or_else(|| Error::UnknownReplica(name.clone()))?
        };

        match self.attempt(&replica, &mut op).await {
            Attempt::Ok(served) => Ok(served),
            Attempt::Connection(err) => {
                self.note_failure(name, &replica, &err);
                Err(Error::Unavailable { source: err })
            }
            Attempt::Query { role, host, source } => Err(Error::Query { role, host, source }),
            Attempt::Pool(err) => Err(Error::Pool(err)),
        }
    }

    /// Stats for the primary and every known replica.
    pub fn stats(&self) -> Vec<HostStats> {
        let mut stats = vec![self.host_stats(&self.primary, Role::Primary)];
        for state in self.replicas_tx.borrow().values() {
            stats.push(self.host_stats(state, Role::Replica));
        }
        stats
    }

    async fn attempt<T, F>(&self, state: &HostState<Conn>, op: &mut F) -> Attempt<T>
    where
        F: for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<T, host::Error>>,
    {
        let mut handle = match state.pool.acquire().await {
            Ok(handle) => handle,
            Err(pool::Error::Connect { source, .. }) => return Attempt::Connection(source),
            Err(err) => return Attempt::Pool(err),
        };

        let host = handle.host().clone();
        let role = handle.role();
        match op(&mut handle).await {
            Ok(value) => Attempt::Ok(Served { host, role, value }),
            Err(err) if err.is_connection_error() => {
                handle.discard();
                Attempt::Connection(err)
            }
            Err(source) => Attempt::Query { role, host, source },
        }
    }

    // Selects one healthy replica not yet attempted for this query.
    fn select_replica(&self, exclude: &[host::Name]) -> Option<(host::Name, Arc<HostState<Conn>>)> {
        let set = self.replicas_tx.borrow().clone();
        let mut healthy: Vec<_> = set
            .iter()
            .filter(|(name, state)| state.health.get() == Health::Up && !exclude.contains(*name))
            .map(|(name, state)| (name.clone(), state.clone()))
            .collect();
        if healthy.is_empty() {
            return None;
        }

        let index = match self.policy.selection {
            Selection::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % healthy.len(),
            Selection::Random => rand::rng().random_range(0..healthy.len()),
        };
        Some(healthy.swap_remove(index))
    }

    fn note_failure(&self, name: &host::Name, state: &HostState<Conn>, err: &host::Error) {
        state.failures.record();
        state.observed();
        if state.health.mark_down() {
            event!(
                Level::WARN,
                host = %name,
                err = %err,
                "Marking host down after connection error"
            );
        }
    }

    async fn probe_down_hosts(&self) {
        let set = self.replicas_tx.borrow().clone();
        for (name, state) in set.iter() {
            if state.health.get() != Health::Down {
                continue;
            }
            if state.probe(&self.connector).await {
                if state.health.mark_up() {
                    event!(Level::INFO, host = %name, "Host passed liveness probe, marking up");
                }
            } else {
                state.failures.record();
            }
        }
    }

    fn host_stats(&self, state: &HostState<Conn>, role: Role) -> HostStats {
        HostStats {
            host: state.host().clone(),
            role,
            health: state.health.get(),
            recent_failures: state.failures.count(),
            idle_connections: state.pool.idle_count(),
            last_checked: *state.last_checked.lock().unwrap(),
        }
    }

    pub(crate) fn replicas(&self) -> ReplicaSet<Conn> {
        self.replicas_tx.borrow().clone()
    }

    pub(crate) fn replace_replicas(&self, set: ReplicaSet<Conn>) {
        self.replicas_tx.send_replace(set);
    }

    pub(crate) fn new_replica_state(&self, host: Host) -> Arc<HostState<Conn>> {
        Arc::new(HostState::new(
            host,
            Role::Replica,
            self.connector.clone(),
            &self.policy,
        ))
    }

    pub(crate) fn connector(&self) -> &SharedConnector<Conn> {
        &self.connector
    }

    pub(crate) fn primary_address(&self) -> std::net::SocketAddr {
        self.primary.host().address
    }
}

impl<Conn: Connection> Drop for LoadBalancer<Conn> {
    fn drop(&mut self) {
        if let Some(handle) = self.probe_task.lock().unwrap().take() {
            handle.abort();
        }
    }
}
