//! The interface for resolvers, which find replica hosts.

use crate::host::{self, Host};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// The authoritative set of replica hosts, keyed by host name.
pub type AllHosts = Arc<BTreeMap<host::Name, Host>>;

/// Translates an external directory into a set of replica hosts.
///
/// A resolver reports the set of all addresses it can see; it does not
/// track or report their health. Reconciliation of the reported set into
/// the live replica pool is the service discovery task's job.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Start running a resolver.
    ///
    /// Returns a receiver to track ongoing activity.
    fn monitor(&mut self) -> watch::Receiver<AllHosts>;

    /// Cleanly terminates the resolver.
    ///
    /// This ensures that background tasks, if they exist, have stopped.
    async fn terminate(&mut self) {}
}

/// Helper type for anything that implements the Resolver interface.
pub type BoxedResolver = Box<dyn Resolver>;
