//! Test doubles shared across module tests.

use crate::balancer::LoadBalancer;
use crate::claim;
use crate::config::Policy;
use crate::host::{self, Connection, Connector, Host};
use crate::resolver::{AllHosts, Resolver};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

pub(crate) fn setup_tracing_subscriber() {
    use tracing_subscriber::fmt::format::FmtSpan;
    let _ = tracing_subscriber::fmt()
        .with_thread_names(true)
        .with_span_events(FmtSpan::ENTER)
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
}

pub(crate) fn test_host(name: &str, port: u16) -> Host {
    Host::new(
        host::Name::new(name),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
    )
}

pub(crate) struct TestConnection {
    #[allow(dead_code)]
    pub(crate) id: usize,
    #[allow(dead_code)]
    pub(crate) host: Host,
}

pub(crate) struct TestConnector {
    can_connect: AtomicBool,
    pub(crate) connect_count: AtomicUsize,
}

impl TestConnector {
    pub(crate) fn new() -> Self {
        Self {
            can_connect: AtomicBool::new(true),
            connect_count: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_connectable(&self, can_connect: bool) {
        self.can_connect.store(can_connect, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for TestConnector {
    type Connection = TestConnection;

    async fn connect(&self, host: &Host) -> Result<Self::Connection, host::Error> {
        if !self.can_connect.load(Ordering::SeqCst) {
            return Err(host::Error::Io(std::io::Error::from(
                std::io::ErrorKind::ConnectionRefused,
            )));
        }
        let id = self.connect_count.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(TestConnection {
            id,
            host: host.clone(),
        })
    }
}

/// Funnel that pins a closure to the operation signature the balancer
/// expects, so inline test closures infer the right lifetimes.
pub(crate) fn op<Conn, T, F>(f: F) -> F
where
    Conn: Connection,
    F: for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<T, host::Error>>,
{
    f
}

/// An operation that always succeeds.
pub(crate) fn ok_op<Conn: Connection>(
) -> impl for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<(), host::Error>> {
    op(|_handle| async { Ok(()) }.boxed())
}

/// An operation that fails with a connection-class error on one host and
/// succeeds everywhere else.
pub(crate) fn fail_on_host<Conn: Connection>(
    bad: host::Name,
) -> impl for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<(), host::Error>> {
    op(move |handle: &mut claim::Handle<Conn>| {
        let failing = handle.host() == &bad;
        async move {
            if failing {
                Err(host::Error::Io(std::io::Error::from(
                    std::io::ErrorKind::ConnectionReset,
                )))
            } else {
                Ok(())
            }
        }
        .boxed()
    })
}

/// A balancer over a test connector, with the given replicas installed
/// directly (no discovery involved).
pub(crate) fn balancer_with_replicas(
    policy: Policy,
    replicas: &[&str],
) -> (Arc<TestConnector>, Arc<LoadBalancer<TestConnection>>) {
    let connector = Arc::new(TestConnector::new());
    let balancer = LoadBalancer::new(test_host("primary", 5432), connector.clone(), policy);

    let mut set = BTreeMap::new();
    for (index, name) in replicas.iter().enumerate() {
        let host = test_host(name, 5433 + index as u16);
        set.insert(host.name.clone(), balancer.new_replica_state(host));
    }
    balancer.replace_replicas(Arc::new(set));

    (connector, balancer)
}

/// A [Resolver] whose host set is replaced by hand.
#[derive(Clone)]
pub(crate) struct TestResolver {
    tx: watch::Sender<AllHosts>,
}

impl TestResolver {
    pub(crate) fn new() -> Self {
        let hosts = Arc::new(BTreeMap::new());
        let (tx, _) = watch::channel(hosts);
        Self { tx }
    }

    pub(crate) fn replace(&self, hosts: BTreeMap<host::Name, Host>) {
        self.tx.send_replace(Arc::new(hosts));
    }
}

impl Resolver for TestResolver {
    fn monitor(&mut self) -> watch::Receiver<AllHosts> {
        self.tx.subscribe()
    }
}

/// Builds a host map out of (name, port) pairs.
pub(crate) fn host_map(entries: &[(&str, u16)]) -> BTreeMap<host::Name, Host> {
    entries
        .iter()
        .map(|(name, port)| {
            let host = test_host(name, *port);
            (host.name.clone(), host)
        })
        .collect()
}
