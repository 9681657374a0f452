//! Implementation of [Resolver] for DNS service discovery.
//!
//! Replica endpoints are published as SRV records under a single service
//! name; each SRV target resolves to one or more addresses. The resolver
//! polls on a fixed interval and publishes the full set through a watch
//! channel. A failed or empty resolution never clears the published set:
//! a transient DNS outage must not drain the replica pool.

use crate::host::{self, Host};
use crate::join;
use crate::resolver::{AllHosts, Resolver};

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveError;
use hickory_resolver::TokioAsyncResolver;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::Duration;
use tracing::{event, instrument, Level};

/// How often do we re-resolve the replica set?
pub const DEFAULT_QUERY_INTERVAL: Duration = Duration::from_secs(60);

/// How long do we expect a healthy DNS server to take to respond?
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration options to tweak resolution behavior.
pub struct DnsResolverConfig {
    /// How long should we wait before re-querying DNS servers?
    ///
    /// Default: 60 seconds
    pub query_interval: Duration,

    /// After starting to query a DNS server, how long until we timeout?
    ///
    /// Default: 10 seconds
    pub query_timeout: Duration,
}

impl Default for DnsResolverConfig {
    fn default() -> Self {
        Self {
            query_interval: DEFAULT_QUERY_INTERVAL,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

struct DnsResolverWorker {
    // Message-passing channel to notify the reconciler of updates
    watch_tx: watch::Sender<AllHosts>,

    // The SRV record naming the replica set
    record: String,

    resolver: TokioAsyncResolver,

    query_interval: Duration,
}

impl DnsResolverWorker {
    fn new(
        watch_tx: watch::Sender<AllHosts>,
        record: String,
        dns_servers: Vec<SocketAddr>,
        config: DnsResolverConfig,
    ) -> Self {
        let mut rc = ResolverConfig::new();
        for address in dns_servers {
            rc.add_name_server(NameServerConfig {
                socket_addr: address,
                protocol: Protocol::Udp,
                tls_dns_name: None,
                trust_negative_responses: false,
                bind_addr: None,
            });
        }
        let mut opts = ResolverOpts::default();
        opts.use_hosts_file = false;
        opts.timeout = config.query_timeout;
        opts.edns0 = true;
        let resolver = TokioAsyncResolver::tokio(rc, opts);

        Self {
            watch_tx,
            record,
            resolver,
            query_interval: config.query_interval,
        }
    }

    async fn run(self, mut terminate_rx: oneshot::Receiver<()>) {
        let mut query_interval = tokio::time::interval(self.query_interval);
        loop {
            tokio::select! {
                _ = &mut terminate_rx => return,
                _ = query_interval.tick() => self.query_once().await,
            }
        }
    }

    #[instrument(skip(self), fields(record = %self.record), name = "DnsResolverWorker::query_once")]
    async fn query_once(&self) {
        let hosts = match self.lookup().await {
            Ok(hosts) => hosts,
            Err(err) => {
                event!(
                    Level::WARN,
                    err = %err,
                    "DNS resolution failed, keeping previous host set"
                );
                return;
            }
        };
        if hosts.is_empty() {
            event!(
                Level::WARN,
                "DNS resolution returned no usable records, keeping previous host set"
            );
            return;
        }

        self.watch_tx.send_if_modified(|current| {
            if **current == hosts {
                return false;
            }
            event!(Level::INFO, count = hosts.len(), "Resolved replica set changed");
            *current = Arc::new(hosts.clone());
            true
        });
    }

    // Looks up the SRV record, then resolves each target to addresses.
    async fn lookup(&self) -> Result<BTreeMap<host::Name, Host>, ResolveError> {
        let srv = self.resolver.srv_lookup(&self.record).await?;

        let mut hosts = BTreeMap::new();
        for record in srv.iter() {
            let target = record.target().clone();
            let port = record.port();

            let lookup = match self.resolver.lookup_ip(target.clone()).await {
                Ok(lookup) => lookup,
                Err(err) => {
                    event!(
                        Level::WARN,
                        target = %target,
                        err = %err,
                        "Failed to resolve SRV target, skipping"
                    );
                    continue;
                }
            };

            let addresses: Vec<_> = lookup.iter().collect();
            for ip in &addresses {
                let address = SocketAddr::new(*ip, port);
                // A target resolving to one address keeps its DNS name;
                // multi-address targets fall back to address-derived names
                // to keep keys unique.
                let name = if addresses.len() == 1 {
                    host::Name::new(target.to_utf8())
                } else {
                    host::Name::new(address)
                };
                hosts.insert(name.clone(), Host::new(name, address));
            }
        }
        Ok(hosts)
    }
}

/// Implements [crate::resolver::Resolver] via periodic SRV lookup over
/// UDP DNS.
pub struct DnsResolver {
    handle: Option<tokio::task::JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
    watch_rx: watch::Receiver<AllHosts>,
}

impl DnsResolver {
    /// Creates a new DNS resolver which polls for replica hosts.
    ///
    /// - `record`: the name of the SRV records to observe.
    /// - `dns_servers`: the DNS servers to query.
    /// - `config`: additional tweakable configuration options.
    pub fn new(
        record: impl ToString,
        dns_servers: Vec<SocketAddr>,
        config: DnsResolverConfig,
    ) -> Self {
        let (watch_tx, watch_rx) = watch::channel(Arc::new(BTreeMap::new()));
        let worker = DnsResolverWorker::new(watch_tx, record.to_string(), dns_servers, config);
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = Some(tokio::task::spawn(async move {
            worker.run(terminate_rx).await;
        }));

        Self {
            handle,
            terminate_tx: Some(terminate_tx),
            watch_rx,
        }
    }
}

impl Drop for DnsResolver {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        handle.abort();
    }
}

#[async_trait::async_trait]
impl Resolver for DnsResolver {
    fn monitor(&mut self) -> watch::Receiver<AllHosts> {
        self.watch_rx.clone()
    }

    async fn terminate(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let Some(terminate_tx) = self.terminate_tx.take() else {
            return;
        };

        let _send_result = terminate_tx.send(());
        join::check_join(handle.await);
    }
}
