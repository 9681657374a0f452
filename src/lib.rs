//! rwsplit is a database read/write load-balancing crate.
//!
//! rwsplit transparently routes queries between a writable primary and a
//! set of read replicas, while preserving read-your-writes consistency
//! within each logical unit of work.
//!
//! It uses the following terminology:
//! * The primary is the single writable database endpoint.
//! * Replicas are read-only, eventually-consistent copies of the
//!   primary's data.
//! * A session is the routing-policy state scoped to one logical unit of
//!   work (one web request, one background job).
//!
//! # Usage
//!
//! * The main interface for this crate is [router::Router].
//! * To construct a router, you must supply a [host::Connector] and a
//!   [balancer::LoadBalancer]. These specify "how to open a connection to
//!   a host" and "which hosts exist and which of them are healthy",
//!   respectively.
//! * The replica set can be given statically, or kept current by
//!   [discovery::ServiceDiscovery] driving a [resolver::Resolver].
//!
//! ```no_run
//! use rwsplit::balancer::LoadBalancer;
//! use rwsplit::classify::QueryKind;
//! use rwsplit::config::Policy;
//! use rwsplit::connectors::tcp::TcpConnector;
//! use rwsplit::discovery::ServiceDiscovery;
//! use rwsplit::host::Host;
//! use rwsplit::resolvers::fixed::FixedResolver;
//! use rwsplit::router::Router;
//! use rwsplit::session::Session;
//! use std::net::SocketAddr;
//! use std::sync::Arc;
//!
//! # async {
//! // The primary, and a balancer over it. Here the replica list is
//! // static; a DNS resolver can keep it current instead.
//! let primary = Host::from_address("10.0.0.1:5432".parse::<SocketAddr>().unwrap());
//! let balancer =
//!     LoadBalancer::<tokio::net::TcpStream>::new(primary, Arc::new(TcpConnector {}), Policy::default());
//!
//! let replicas = ["10.0.0.2:5432".parse::<SocketAddr>().unwrap()];
//! let resolver = Box::new(FixedResolver::new(replicas));
//! let _discovery = ServiceDiscovery::start(balancer.clone(), resolver);
//!
//! // One session per unit of work; the router consults it per query.
//! let router = Router::new(balancer);
//! let session = Session::new();
//! let role = router.route(QueryKind::Read, &session).unwrap();
//! # };
//! ```

// Public API
pub mod balancer;
pub mod claim;
pub mod classify;
pub mod config;
pub mod discovery;
pub mod host;
pub mod pool;
pub mod resolver;
pub mod router;
pub mod session;

// Necessary for implementation
mod backoff;
mod failure_window;
mod join;
#[cfg(test)]
mod test_utils;

// Default implementations of generic interfaces
pub mod connectors;
pub mod resolvers;

/// The role of the endpoint that served a query.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Role {
    /// The single writable endpoint.
    Primary,
    /// A read-only, eventually-consistent copy.
    Replica,
    /// A connection the balancer does not recognize.
    Unknown,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "primary",
            Role::Replica => "replica",
            Role::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.as_str().fmt(f)
    }
}
