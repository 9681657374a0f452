//! Implementation of [Resolver] for a static replica list.

use crate::host::Host;
use crate::resolver::{AllHosts, Resolver};

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// A [`Resolver`] that always reports a fixed set of addresses, for the
/// `hosts: [...]` style of configuration.
#[derive(Clone, Debug)]
pub struct FixedResolver {
    tx: watch::Sender<AllHosts>,
}

impl FixedResolver {
    pub fn new(addresses: impl IntoIterator<Item = SocketAddr>) -> FixedResolver {
        let all_hosts = Arc::new(
            addresses
                .into_iter()
                .map(|address| {
                    let host = Host::from_address(address);
                    (host.name.clone(), host)
                })
                .collect(),
        );
        let (tx, _rx) = watch::channel(all_hosts);
        FixedResolver { tx }
    }
}

impl Resolver for FixedResolver {
    fn monitor(&mut self) -> watch::Receiver<AllHosts> {
        self.tx.subscribe()
    }
}
