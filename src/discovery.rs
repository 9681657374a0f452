//! Keeps the balancer's replica set in sync with a resolver.
//!
//! The discovery task runs on its own schedule, independent of any
//! request or session lifecycle. Each resolver update is reconciled into
//! the balancer's replica set with an atomic swap: existing replicas keep
//! their pools, health state, and in-flight connections; new addresses
//! join after an initial health probe; departed addresses are dropped
//! from the new set and drain naturally as their outstanding claims are
//! returned.

use crate::balancer::LoadBalancer;
use crate::host::Connection;
use crate::join;
use crate::resolver::{AllHosts, BoxedResolver};

use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_stream::wrappers::WatchStream;
use tracing::{event, instrument, Level};

/// The background reconciliation task.
///
/// Dropping it aborts the task; [ServiceDiscovery::terminate] shuts it
/// down cleanly, including the resolver's own background work.
#[derive(Debug)]
pub struct ServiceDiscovery {
    handle: Option<tokio::task::JoinHandle<()>>,
    terminate_tx: Option<oneshot::Sender<()>>,
}

impl ServiceDiscovery {
    /// Starts reconciling resolver updates into the balancer.
    pub fn start<Conn: Connection>(
        balancer: Arc<LoadBalancer<Conn>>,
        mut resolver: BoxedResolver,
    ) -> Self {
        let updates = resolver.monitor();
        let (terminate_tx, terminate_rx) = oneshot::channel();
        let handle = tokio::task::spawn(async move {
            run(balancer, resolver, updates, terminate_rx).await;
        });

        Self {
            handle: Some(handle),
            terminate_tx: Some(terminate_tx),
        }
    }

    /// Stops the reconciliation task and the resolver behind it.
    pub async fn terminate(&mut self) {
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

impl Drop for ServiceDiscovery {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

async fn run<Conn: Connection>(
    balancer: Arc<LoadBalancer<Conn>>,
    mut resolver: BoxedResolver,
    updates: tokio::sync::watch::Receiver<AllHosts>,
    mut terminate_rx: oneshot::Receiver<()>,
) {
    let mut updates = WatchStream::new(updates);
    loop {
        tokio::select! {
            _ = &mut terminate_rx => {
                resolver.terminate().await;
                return;
            }
            maybe_hosts = updates.next() => {
                match maybe_hosts {
                    Some(hosts) => reconcile(&balancer, hosts).await,
                    // The resolver dropped its sender; nothing more will
                    // ever arrive.
                    None => return,
                }
            }
        }
    }
}

#[instrument(skip(balancer, hosts), name = "discovery::reconcile")]
async fn reconcile<Conn: Connection>(balancer: &Arc<LoadBalancer<Conn>>, hosts: AllHosts) {
    if hosts.is_empty() {
        // An empty answer is indistinguishable from a directory outage;
        // the previous pool composition is retained.
        event!(
            Level::WARN,
            "Resolver reported no hosts, retaining current replica set"
        );
        return;
    }

    let current = balancer.replicas();
    let primary_address = balancer.primary_address();
    let mut next = BTreeMap::new();
    let mut added = 0usize;

    for (name, host) in hosts.iter() {
        // The replica pool never contains the primary.
        if host.address == primary_address {
            continue;
        }

        match current
            .values()
            .find(|state| state.host().address == host.address)
        {
            Some(existing) => {
                next.insert(name.clone(), existing.clone());
            }
            None => {
                let state = balancer.new_replica_state(host.clone());
                if !state.probe(balancer.connector()).await {
                    // Admitted, but not eligible for reads until the
                    // periodic probe sees it alive.
                    state.health.mark_down();
                }
                event!(
                    Level::INFO,
                    host = %name,
                    address = %host.address,
                    health = ?state.health.get(),
                    "Adding replica"
                );
                added += 1;
                next.insert(name.clone(), state);
            }
        }
    }

    let mut removed = 0usize;
    for (name, state) in current.iter() {
        if !next.values().any(|kept| Arc::ptr_eq(kept, state)) {
            event!(
                Level::INFO,
                host = %name,
                "Retiring replica; in-flight connections will drain"
            );
            removed += 1;
        }
    }

    if added > 0 || removed > 0 || next.len() != current.len() {
        event!(Level::INFO, added, removed, total = next.len(), "Replica set reconciled");
    }
    balancer.replace_replicas(Arc::new(next));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Policy;
    use crate::host::{Health, Name};
    use crate::test_utils::{
        balancer_with_replicas, host_map, ok_op, setup_tracing_subscriber, TestResolver,
    };
    use crate::Role;

    use std::time::Duration;

    async fn wait_for_replica_count<Conn: Connection>(
        balancer: &Arc<LoadBalancer<Conn>>,
        count: usize,
    ) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if balancer.replicas().len() == count {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "replica set never reached {count} hosts"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn new_hosts_become_eligible_for_reads() {
        setup_tracing_subscriber();
        let (_connector, balancer) = balancer_with_replicas(Policy::default(), &[]);
        let resolver = TestResolver::new();
        let mut discovery = ServiceDiscovery::start(balancer.clone(), Box::new(resolver.clone()));

        resolver.replace(host_map(&[("replica-1", 5433)]));
        wait_for_replica_count(&balancer, 1).await;

        let served = balancer.read(ok_op()).await.unwrap();
        assert_eq!(served.role, Role::Replica);
        assert_eq!(served.host, Name::from("replica-1"));

        discovery.terminate().await;
    }

    #[tokio::test]
    async fn removed_hosts_stop_serving_and_drain() {
        setup_tracing_subscriber();
        let (_connector, balancer) = balancer_with_replicas(Policy::default(), &[]);
        let resolver = TestResolver::new();
        let mut discovery = ServiceDiscovery::start(balancer.clone(), Box::new(resolver.clone()));

        resolver.replace(host_map(&[("replica-1", 5433), ("replica-2", 5434)]));
        wait_for_replica_count(&balancer, 2).await;

        // Hold a claim on the host about to be retired.
        let replicas = balancer.replicas();
        let retiring = replicas.get(&Name::from("replica-1")).unwrap().clone();
        let held = retiring.pool.acquire().await.unwrap();

        resolver.replace(host_map(&[("replica-2", 5434)]));
        wait_for_replica_count(&balancer, 1).await;

        // New reads only ever land on the survivor.
        for _ in 0..4 {
            let served = balancer.read(ok_op()).await.unwrap();
            assert_eq!(served.host, Name::from("replica-2"));
        }

        // The in-flight claim was not interrupted by the swap.
        assert_eq!(held.host(), &Name::from("replica-1"));
        drop(held);

        discovery.terminate().await;
    }

    #[tokio::test]
    async fn existing_host_state_survives_reconciliation() {
        setup_tracing_subscriber();
        let (_connector, balancer) = balancer_with_replicas(Policy::default(), &[]);
        let resolver = TestResolver::new();
        let mut discovery = ServiceDiscovery::start(balancer.clone(), Box::new(resolver.clone()));

        resolver.replace(host_map(&[("replica-1", 5433)]));
        wait_for_replica_count(&balancer, 1).await;
        let before = balancer.replicas().get(&Name::from("replica-1")).unwrap().clone();

        // A superset update must reuse the existing state rather than
        // rebuilding it.
        resolver.replace(host_map(&[("replica-1", 5433), ("replica-2", 5434)]));
        wait_for_replica_count(&balancer, 2).await;
        let after = balancer.replicas().get(&Name::from("replica-1")).unwrap().clone();
        assert!(Arc::ptr_eq(&before, &after));

        discovery.terminate().await;
    }

    #[tokio::test]
    async fn unreachable_new_hosts_are_admitted_down() {
        setup_tracing_subscriber();
        let (connector, balancer) = balancer_with_replicas(Policy::default(), &[]);
        let resolver = TestResolver::new();
        let mut discovery = ServiceDiscovery::start(balancer.clone(), Box::new(resolver.clone()));

        connector.set_connectable(false);
        resolver.replace(host_map(&[("replica-1", 5433)]));
        wait_for_replica_count(&balancer, 1).await;

        let state = balancer.replicas().get(&Name::from("replica-1")).unwrap().clone();
        assert_eq!(state.health.get(), Health::Down);

        discovery.terminate().await;
    }

    #[tokio::test]
    async fn empty_updates_retain_the_pool() {
        setup_tracing_subscriber();
        let (_connector, balancer) = balancer_with_replicas(Policy::default(), &[]);
        let resolver = TestResolver::new();
        let mut discovery = ServiceDiscovery::start(balancer.clone(), Box::new(resolver.clone()));

        resolver.replace(host_map(&[("replica-1", 5433)]));
        wait_for_replica_count(&balancer, 1).await;

        resolver.replace(host_map(&[]));
        // Give the reconciler time to see the update; the set must not
        // shrink.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(balancer.replicas().len(), 1);

        discovery.terminate().await;
    }

    #[tokio::test]
    async fn the_primary_address_is_never_pooled() {
        setup_tracing_subscriber();
        let (_connector, balancer) = balancer_with_replicas(Policy::default(), &[]);
        let resolver = TestResolver::new();
        let mut discovery = ServiceDiscovery::start(balancer.clone(), Box::new(resolver.clone()));

        // The primary in balancer_with_replicas listens on port 5432.
        resolver.replace(host_map(&[("primary", 5432), ("replica-1", 5433)]));
        wait_for_replica_count(&balancer, 1).await;
        assert!(balancer.replicas().get(&Name::from("primary")).is_none());

        discovery.terminate().await;
    }
}
