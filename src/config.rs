//! Configuration for the load-balancing layer.
//!
//! The application hands the core a deserialized [Config]; the core never
//! produces configuration. [Config::policy] derives the per-host tunables
//! the balancer consumes.

use serde::Deserialize;
use tokio::time::Duration;

/// How the balancer picks among healthy replicas.
///
/// Unrecognized values are rejected when the configuration is parsed.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selection {
    #[default]
    RoundRobin,
    Random,
}

/// Tunables applied to every host pool, retry loop, and probe cycle.
#[derive(Clone, Debug)]
pub struct Policy {
    /// Connections each host pool may hold open.
    pub pool_size: usize,

    /// Retries after the first attempt of a query, across hosts for reads
    /// and against the primary for writes.
    pub max_retries: usize,

    /// How long a claim may wait for a pool slot before failing with a
    /// pool-exhaustion error.
    pub acquire_timeout: Duration,

    /// How often hosts marked down are probed for liveness.
    pub health_interval: Duration,

    /// Window over which per-host failures are counted for stats.
    pub failure_window: Duration,

    /// Backoff bounds for retrying a write against the primary.
    pub min_retry_backoff: Duration,
    pub max_retry_backoff: Duration,

    /// Random spread added to each backoff step.
    pub retry_spread: Duration,

    /// Replica selection policy.
    pub selection: Selection,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            pool_size: 8,
            max_retries: 3,
            acquire_timeout: Duration::from_secs(5),
            health_interval: Duration::from_secs(15),
            failure_window: Duration::from_secs(60),
            min_retry_backoff: Duration::from_millis(100),
            max_retry_backoff: Duration::from_secs(2),
            retry_spread: Duration::from_millis(50),
            selection: Selection::RoundRobin,
        }
    }
}

/// Service discovery parameters.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub enabled: bool,

    /// SRV record resolved to the current replica set.
    #[serde(default)]
    pub record: String,

    /// Polling interval, in milliseconds.
    #[serde(default = "defaults::discovery_interval_ms")]
    pub interval_ms: u64,

    /// DNS servers to query. Empty means the system resolver
    /// configuration.
    #[serde(default)]
    pub dns_servers: Vec<std::net::SocketAddr>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            record: String::new(),
            interval_ms: defaults::discovery_interval_ms(),
            dns_servers: Vec::new(),
        }
    }
}

/// Top-level configuration, as the application deserializes it.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Address of the writable primary.
    pub primary: std::net::SocketAddr,

    /// Static replica addresses. Ignored when service discovery is
    /// enabled.
    #[serde(default)]
    pub hosts: Vec<std::net::SocketAddr>,

    #[serde(default)]
    pub service_discovery: DiscoveryConfig,

    #[serde(default = "defaults::pool_size")]
    pub pool_size: usize,

    #[serde(default = "defaults::max_retries")]
    pub max_retries: usize,

    #[serde(default = "defaults::acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "defaults::health_interval_ms")]
    pub health_interval_ms: u64,

    #[serde(default)]
    pub selection: Selection,
}

mod defaults {
    pub(super) fn pool_size() -> usize {
        8
    }
    pub(super) fn max_retries() -> usize {
        3
    }
    pub(super) fn acquire_timeout_ms() -> u64 {
        5_000
    }
    pub(super) fn health_interval_ms() -> u64 {
        15_000
    }
    pub(super) fn discovery_interval_ms() -> u64 {
        60_000
    }
}

impl Config {
    /// Whether any replica source is configured. A false value is the
    /// well-defined "no proxy here" signal: building a router from such a
    /// configuration fails with a typed error instead of routing reads
    /// nowhere.
    pub fn load_balancing_enabled(&self) -> bool {
        !self.hosts.is_empty() || self.service_discovery.enabled
    }

    pub fn policy(&self) -> Policy {
        Policy {
            pool_size: self.pool_size,
            max_retries: self.max_retries,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            health_interval: Duration::from_millis(self.health_interval_ms),
            selection: self.selection,
            ..Policy::default()
        }
    }
}
