//! The query router: the single interception point between the
//! application and the database hosts.
//!
//! Every query the application is about to run flows through
//! [Router::execute]: the query is classified once, the session is
//! consulted for overrides and write-stickiness, the balancer supplies a
//! connection for the decided role, and the session is updated as a side
//! effect. Routing logic lives here and nowhere else.

use crate::balancer::{self, LoadBalancer};
use crate::claim;
use crate::classify::{classify, Query, QueryKind};
use crate::config::Config;
use crate::discovery::ServiceDiscovery;
use crate::host::{self, Connection, Host, SharedConnector};
use crate::resolver::BoxedResolver;
use crate::resolvers::dns::{DnsResolver, DnsResolverConfig};
use crate::resolvers::fixed::FixedResolver;
use crate::session::Session;
use crate::Role;

use futures::future::BoxFuture;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{event, instrument, Level};

#[derive(Error, Debug)]
pub enum Error {
    /// Load balancing was requested but no replica source is configured.
    /// The well-defined absent-proxy signal: callers decide whether to
    /// run primary-only or treat it as a deployment bug.
    #[error("load balancing is not configured: no static hosts and no service discovery")]
    NotConfigured,

    /// Service discovery is enabled but unusable as configured.
    #[error("service discovery requires a record name and at least one DNS server")]
    DiscoveryMisconfigured,

    /// A write was issued inside a transaction that the session promised
    /// would only touch replicas. The combination is contradictory and
    /// fails loudly rather than silently demoting the caller's read-only
    /// intent.
    #[error("write issued inside a read-only replica transaction")]
    WriteInsideReplicaTransaction,

    #[error(transparent)]
    Balancer(#[from] balancer::Error),
}

// Where a query must run.
#[derive(Clone, Debug, Eq, PartialEq)]
enum Route {
    Primary,
    Replica,
    // A replica transaction sticks to the host that served its first
    // query.
    Pinned(host::Name),
}

/// Routes queries for one process-wide [LoadBalancer].
pub struct Router<Conn: Connection> {
    balancer: Arc<LoadBalancer<Conn>>,
}

impl<Conn: Connection> std::fmt::Debug for Router<Conn> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router").finish_non_exhaustive()
    }
}

impl<Conn: Connection> Router<Conn> {
    pub fn new(balancer: Arc<LoadBalancer<Conn>>) -> Self {
        Self { balancer }
    }

    /// Builds the balancer, the router, and the service discovery task
    /// from configuration.
    pub fn configure(
        config: &Config,
        connector: SharedConnector<Conn>,
    ) -> Result<(Self, ServiceDiscovery), Error> {
        if !config.load_balancing_enabled() {
            return Err(Error::NotConfigured);
        }
        let sd = &config.service_discovery;
        if sd.enabled && (sd.record.is_empty() || sd.dns_servers.is_empty()) {
            return Err(Error::DiscoveryMisconfigured);
        }

        let primary = Host::from_address(config.primary);
        let balancer = LoadBalancer::new(primary, connector, config.policy());

        let resolver: BoxedResolver = if sd.enabled {
            Box::new(DnsResolver::new(
                &sd.record,
                sd.dns_servers.clone(),
                DnsResolverConfig {
                    query_interval: Duration::from_millis(sd.interval_ms),
                    ..Default::default()
                },
            ))
        } else {
            Box::new(FixedResolver::new(config.hosts.iter().copied()))
        };

        let discovery = ServiceDiscovery::start(balancer.clone(), resolver);
        Ok((Self::new(balancer), discovery))
    }

    pub fn balancer(&self) -> &Arc<LoadBalancer<Conn>> {
        &self.balancer
    }

    /// The role a query of this kind would be routed to, given the
    /// session's current state. Pure: no session mutation, no I/O.
    pub fn route(&self, kind: QueryKind, session: &Session) -> Result<Role, Error> {
        self.decide(kind, session).map(|route| match route {
            Route::Primary => Role::Primary,
            Route::Replica | Route::Pinned(_) => Role::Replica,
        })
    }

    /// Classifies the query, decides its route, runs `op` on a connection
    /// for that route, and updates session and host state.
    #[instrument(level = "debug", skip(self, query, session, op), name = "Router::execute")]
    pub async fn execute<T, F>(
        &self,
        query: &Query<'_>,
        session: &Session,
        op: F,
    ) -> Result<T, Error>
    where
        F: for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<T, host::Error>>,
    {
        let kind = classify(query);
        let route = self.decide(kind, session)?;

        if kind == QueryKind::Write {
            // Stickiness starts the moment the write is routed, whether or
            // not it ultimately succeeds.
            session.mark_write();
        }

        let served = match route {
            Route::Primary => self.balancer.read_write(op).await?,
            Route::Replica => self.balancer.read(op).await?,
            Route::Pinned(name) => self.balancer.read_pinned(&name, op).await?,
        };

        if session.in_transaction()
            && served.role == Role::Replica
            && session.pinned_replica().is_none()
        {
            session.pin_replica(served.host.clone());
        }

        event!(
            Level::DEBUG,
            kind = ?kind,
            role = %served.role,
            host = %served.host,
            "Routed query"
        );
        Ok(served.value)
    }

    // The routing decision table. Precedence, highest first: open
    // transactions, scoped use_primary, sticky use_primary, the scoped
    // read/ambiguous overrides, write-stickiness, then the per-kind
    // defaults.
    fn decide(&self, kind: QueryKind, session: &Session) -> Result<Route, Error> {
        if session.in_transaction() {
            return self.decide_in_transaction(kind, session);
        }

        match kind {
            QueryKind::Write | QueryKind::Schema => Ok(Route::Primary),

            QueryKind::Read => Ok(if session.use_primary_active() {
                Route::Primary
            } else if session.use_replicas_active() {
                // The read-override beats sticky-primary and
                // write-stickiness, but not a scoped use_primary block.
                Route::Replica
            } else if session.primary_sticky() || session.performed_write() {
                Route::Primary
            } else {
                Route::Replica
            }),

            QueryKind::Ambiguous => Ok(
                if session.use_primary_active() || session.primary_sticky() {
                    Route::Primary
                } else if session.fallback_active() && !session.performed_write() {
                    Route::Replica
                } else {
                    Route::Primary
                },
            ),
        }
    }

    fn decide_in_transaction(&self, kind: QueryKind, session: &Session) -> Result<Route, Error> {
        // A transaction opened under the ambiguous-fallback block, with no
        // prior write and no primary override, is a read-only replica
        // transaction.
        let replica_transaction = session.fallback_active()
            && !session.performed_write()
            && !session.use_primary_active()
            && !session.primary_sticky();

        if !replica_transaction {
            // The transaction may contain writes, so everything in it --
            // reads included -- is pinned to the primary. Nested
            // transactions land here again and flatten onto the same
            // decision.
            return Ok(Route::Primary);
        }

        match kind {
            QueryKind::Write => Err(Error::WriteInsideReplicaTransaction),
            // Replicas may lag schema changes even inside a replica
            // transaction.
            QueryKind::Schema => Ok(Route::Primary),
            QueryKind::Read | QueryKind::Ambiguous => Ok(match session.pinned_replica() {
                Some(name) => Route::Pinned(name),
                None => Route::Replica,
            }),
        }
    }
}

/// The role tag for an optional connection handle, for instrumentation
/// paths that may also observe connections the balancer did not vend.
pub fn role_for_connection<Conn: Connection>(handle: Option<&claim::Handle<Conn>>) -> Role {
    handle.map_or(Role::Unknown, |handle| handle.role())
}
