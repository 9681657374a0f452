use criterion::{black_box, criterion_group, criterion_main, Criterion};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use rwsplit::balancer::LoadBalancer;
use rwsplit::claim;
use rwsplit::classify::{Operation, Query};
use rwsplit::config::Policy;
use rwsplit::discovery::ServiceDiscovery;
use rwsplit::host::{self, Connection, Connector, Host};
use rwsplit::resolvers::fixed::FixedResolver;
use rwsplit::router::Router;
use rwsplit::session::Session;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

fn criterion_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("route 10 concurrent sessions", |b| {
        b.to_async(&rt).iter(|| concurrent_sessions(black_box(10)))
    });

    let rt = tokio::runtime::Runtime::new().unwrap();
    c.bench_function("route 100 concurrent sessions", |b| {
        b.to_async(&rt).iter(|| concurrent_sessions(black_box(100)))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);

struct BenchConnection {}

struct BenchConnector {}

#[async_trait]
impl Connector for BenchConnector {
    type Connection = BenchConnection;

    async fn connect(&self, _host: &Host) -> Result<Self::Connection, host::Error> {
        Ok(BenchConnection {})
    }
}

fn op<Conn, T, F>(f: F) -> F
where
    Conn: Connection,
    F: for<'a> FnMut(&'a mut claim::Handle<Conn>) -> BoxFuture<'a, Result<T, host::Error>>,
{
    f
}

async fn routed_router() -> (Router<BenchConnection>, ServiceDiscovery) {
    let primary = Host::from_address(SocketAddr::new(
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
        5432,
    ));
    let balancer = LoadBalancer::new(primary, Arc::new(BenchConnector {}), Policy::default());

    let replicas = [
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5433),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 5434),
    ];
    let resolver = Box::new(FixedResolver::new(replicas));
    let discovery = ServiceDiscovery::start(balancer.clone(), resolver);

    // Both replicas plus the primary appear in stats once reconciled.
    while balancer.stats().len() < 3 {
        tokio::time::sleep(tokio::time::Duration::from_micros(50)).await;
    }

    (Router::new(balancer), discovery)
}

// Each session runs the canonical read/write/read sequence, exercising
// replica selection, write stickiness, and primary routing.
async fn concurrent_sessions(count: usize) {
    let (router, _discovery) = routed_router().await;
    let router = Arc::new(router);

    let tasks: Vec<_> = (0..count)
        .map(|_| {
            tokio::task::spawn({
                let router = router.clone();
                async move {
                    let session = Session::new();
                    for operation in [Operation::Select, Operation::Insert, Operation::Select] {
                        router
                            .execute(
                                &Query::Operation(operation),
                                &session,
                                op(|_conn| async { Ok(()) }.boxed()),
                            )
                            .await
                            .expect("Failed to route query");
                    }
                }
            })
        })
        .collect();

    futures::future::try_join_all(tasks)
        .await
        .expect("Failed to run sessions");
}
