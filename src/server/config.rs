//! Node Configuration

use bytes::Bytes;
use std::time::Duration;

use crate::cluster::ClusterConfig;
use crate::error::{Error, Result};
use crate::fanout::PubSubConfig;
use crate::storage::PoolConfig;

/// Node configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Endpoints to accept clients on
    pub listen: Vec<String>,

    /// Endpoint announced to `push_to` peers
    pub advertise: String,

    /// Backend kind, see `storage::backend_for`
    pub storage_kind: String,
    pub storage_addr: String,
    pub pool_size: usize,

    /// Secrets accepted for every key; the first one signs cluster commands
    pub global_secrets: Vec<String>,

    /// Peers this node announces itself to
    pub push_to: Vec<String>,

    /// Peers this node pulls changes from
    pub pull_from: Vec<String>,

    /// Storage handoff/reply, client delivery and peer call timeout
    pub request_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub cluster_interval: Duration,
    pub cluster_workers: usize,

    pub fanout_batch: usize,
    /// Per-client push queue capacity
    pub push_capacity: usize,
    /// Per-topic event queue capacity
    pub topic_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:6390".to_string()],
            advertise: "127.0.0.1:6390".to_string(),
            storage_kind: "memory".to_string(),
            storage_addr: "memory".to_string(),
            pool_size: 10,
            global_secrets: Vec::new(),
            push_to: Vec::new(),
            pull_from: Vec::new(),
            request_timeout: Duration::from_secs(10),
            reconnect_backoff: Duration::from_secs(2),
            cluster_interval: Duration::from_secs(5),
            cluster_workers: 20,
            fanout_batch: 500,
            push_capacity: 128,
            topic_queue: 1024,
        }
    }
}

impl Config {
    pub fn with_listen<I, S>(mut self, listen: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.listen = listen.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_advertise(mut self, advertise: impl Into<String>) -> Self {
        self.advertise = advertise.into();
        self
    }

    pub fn with_storage(mut self, kind: impl Into<String>, addr: impl Into<String>) -> Self {
        self.storage_kind = kind.into();
        self.storage_addr = addr.into();
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_global_secrets<I, S>(mut self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_secrets = secrets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_push_to<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.push_to = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pull_from<I, S>(mut self, peers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.pull_from = peers.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn with_cluster_interval(mut self, interval: Duration) -> Self {
        self.cluster_interval = interval;
        self
    }

    pub fn with_cluster_workers(mut self, workers: usize) -> Self {
        self.cluster_workers = workers;
        self
    }

    /// Reject configurations the node cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::ConfigInvalid(msg.to_string()));

        if self.listen.is_empty() || self.listen.iter().any(|l| l.trim().is_empty()) {
            return invalid("at least one listen endpoint is required");
        }
        if self.storage_kind.trim().is_empty() {
            return invalid("storage kind is required");
        }
        if self.pool_size == 0 {
            return invalid("pool size must be at least 1");
        }
        if self.cluster_workers == 0 || self.push_capacity == 0 || self.topic_queue == 0 || self.fanout_batch == 0 {
            return invalid("worker counts and queue capacities must be at least 1");
        }
        if [self.request_timeout, self.reconnect_backoff, self.cluster_interval]
            .iter()
            .any(Duration::is_zero)
        {
            return invalid("timeouts and intervals must be non-zero");
        }
        if !self.push_to.is_empty() && self.advertise.trim().is_empty() {
            return invalid("push_to requires an advertise endpoint");
        }
        let has_peers = !self.push_to.is_empty() || !self.pull_from.is_empty();
        if has_peers && self.global_secrets.is_empty() {
            return invalid("cluster peers require at least one global secret");
        }
        Ok(())
    }

    pub fn secret_bytes(&self) -> Vec<Bytes> {
        self.global_secrets
            .iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
            .with_size(self.pool_size)
            .with_timeout(self.request_timeout)
            .with_reconnect_interval(self.reconnect_backoff)
    }

    pub fn pubsub_config(&self) -> PubSubConfig {
        PubSubConfig {
            queue_capacity: self.topic_queue,
            delivery_timeout: self.request_timeout,
            batch_size: self.fanout_batch,
        }
    }

    pub fn cluster_config(&self, name: &str) -> ClusterConfig {
        ClusterConfig::named(name)
            .with_interval(self.cluster_interval)
            .with_backoff(self.reconnect_backoff)
            .with_call_timeout(self.request_timeout)
            .with_workers(self.cluster_workers)
    }
}
