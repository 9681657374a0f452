//! Host identity, health state, and the interface for connecting to hosts.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O Error")]
    Io(#[from] std::io::Error),

    /// Raised when a statement is sent to a host that only accepts reads.
    ///
    /// During a failover this may also be observed when writing to a
    /// demoted primary.
    #[error("host rejected the statement in read-only mode")]
    ReadOnly,

    #[error(transparent)]
    Other(anyhow::Error),
}

impl Error {
    /// Connection-class errors qualify for mark-down and failover;
    /// anything else is a query problem that must reach the caller.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Error::Io(_) | Error::ReadOnly)
    }
}

/// Describes the name of a host.
#[derive(Clone, PartialEq, Eq, Ord, PartialOrd, Debug, Hash)]
pub struct Name(pub Arc<str>);

impl Name {
    pub fn new(name: impl ToString) -> Self {
        Self(name.to_string().into())
    }
}

impl From<String> for Name {
    fn from(s: String) -> Self {
        Self(s.into())
    }
}

impl From<&'_ str> for Name {
    fn from(s: &'_ str) -> Self {
        Self(s.into())
    }
}

impl std::borrow::Borrow<str> for Name {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Name {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// A single database endpoint: the primary, or one read replica.
#[derive(Clone, PartialEq, Eq, Debug, Hash, Ord, PartialOrd)]
pub struct Host {
    pub name: Name,
    pub address: SocketAddr,
}

impl Host {
    pub fn new(name: Name, address: SocketAddr) -> Self {
        Self { name, address }
    }

    /// Names the host after its address.
    pub fn from_address(address: SocketAddr) -> Self {
        Self {
            name: Name::new(address),
            address,
        }
    }
}

/// Liveness of a host, as observed by the failover logic.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Health {
    Up,
    Down,
}

const HEALTH_UP: u8 = 0;
const HEALTH_DOWN: u8 = 1;

/// An atomically mutable [Health] flag.
///
/// Many sessions may concurrently report a failure against the same host,
/// so transitions go through compare-and-set: only the caller that
/// actually performed the flip sees `true`, and can log it once.
#[derive(Debug)]
pub struct HealthFlag(AtomicU8);

impl HealthFlag {
    pub fn new(initial: Health) -> Self {
        let raw = match initial {
            Health::Up => HEALTH_UP,
            Health::Down => HEALTH_DOWN,
        };
        Self(AtomicU8::new(raw))
    }

    pub fn get(&self) -> Health {
        match self.0.load(Ordering::Acquire) {
            HEALTH_UP => Health::Up,
            _ => Health::Down,
        }
    }

    /// Up → Down. Returns true if this call performed the transition.
    pub fn mark_down(&self) -> bool {
        self.0
            .compare_exchange(HEALTH_UP, HEALTH_DOWN, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Down → Up. Returns true if this call performed the transition.
    pub fn mark_up(&self) -> bool {
        self.0
            .compare_exchange(HEALTH_DOWN, HEALTH_UP, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Interface for raw connections.
pub trait Connection: Send + 'static {}

impl<T> Connection for T where T: Send + 'static {}

/// Describes how a connection to a [Host] should be constructed.
///
/// The core treats hosts as opaque query executors: what a "connection"
/// is, and what running a statement on it means, belong to the
/// implementor.
#[async_trait]
pub trait Connector: Send + Sync {
    type Connection: Connection;

    /// Creates a connection to a host.
    async fn connect(&self, host: &Host) -> Result<Self::Connection, Error>;

    /// Determines whether a connection to a host is still usable.
    ///
    /// Called by the liveness probe when deciding whether a host marked
    /// down can serve reads again.
    ///
    /// By default this method does nothing.
    async fn is_valid(&self, _conn: &mut Self::Connection) -> Result<(), Error> {
        Ok(())
    }
}

pub type SharedConnector<Conn> = Arc<dyn Connector<Connection = Conn>>;
