//! Server Module
//!
//! `Node` wires the pool, registries, dispatcher and both cluster managers
//! together and serves clients over TCP.

mod config;
mod handler;

pub use config::Config;
pub use handler::Handler;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterManager, PeerConnector, PeerEvent, PeerEventHandler, TcpConnector};
use crate::command::Builtin;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::fanout::Fanout;
use crate::metrics::Metrics;
use crate::protocol::Action;
use crate::security::SecretStore;
use crate::storage::{backend_for, Backend, StoragePool};

/// Announce targets are not expected to push anything
struct IgnorePushes;

#[async_trait]
impl PeerEventHandler for IgnorePushes {
    async fn handle(&self, event: PeerEvent) {
        debug!(endpoint = %event.endpoint, "dropping push from announce target");
    }
}

/// One coordination node
pub struct Node {
    config: RwLock<Config>,
    dispatcher: Arc<Dispatcher>,
    announcer: ClusterManager,
    shutdown: CancellationToken,
}

impl Node {
    /// Start a node with the backend named in `config` and TCP peer links
    pub async fn start(config: Config) -> Result<Self> {
        let backend = backend_for(&config.storage_kind)?;
        let connector = Arc::new(TcpConnector::new(config.request_timeout));
        Self::with_parts(config, backend, connector).await
    }

    pub async fn with_parts(
        config: Config,
        backend: Arc<dyn Backend>,
        connector: Arc<dyn PeerConnector>,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let pool = StoragePool::connect(backend.clone(), &config.storage_addr, config.pool_config()).await?;
        let secrets = Arc::new(SecretStore::new(config.secret_bytes()));
        let fanout = Arc::new(Fanout::new(config.pubsub_config(), metrics.clone()));

        let puller = Arc::new(ClusterManager::start(
            connector.clone(),
            config.cluster_config("pull"),
            fanout.clone(),
        ));
        let announcer = ClusterManager::start(connector, config.cluster_config("announce"), Arc::new(IgnorePushes));

        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            Arc::new(pool),
            secrets,
            fanout,
            puller,
            metrics,
        ));

        let node = Self {
            config: RwLock::new(config.clone()),
            dispatcher,
            announcer,
            shutdown: CancellationToken::new(),
        };
        node.refresh_commands();
        node.reconcile_peers(&config).await;

        info!(
            listen = ?config.listen,
            advertise = %config.advertise,
            storage = %config.storage_kind,
            pool_size = config.pool_size,
            "node started"
        );
        Ok(node)
    }

    /// Re-sign both periodic commands with the current first global secret
    fn refresh_commands(&self) {
        let advertise = self.config.read().advertise.clone();
        let signer = self.dispatcher.secrets().global().into_iter().next();
        if signer.is_none() {
            debug!("no global secret, cluster commands disabled");
        }

        let pull = signer.as_ref().map(|secret| {
            Action::new(Builtin::PullChanges.name(), "")
                .with_requester(advertise.clone())
                .signed(secret)
        });
        let announce = signer.as_ref().map(|secret| {
            Action::new(Builtin::ListenAdd.name(), "")
                .with_arg(advertise.clone())
                .with_requester(advertise.clone())
                .signed(secret)
        });
        self.dispatcher.puller().set_command(pull);
        self.announcer.set_command(announce);
    }

    async fn reconcile_peers(&self, config: &Config) {
        let announced = self.announcer.reconcile(config.push_to.iter().cloned()).await;

        let mut pull: BTreeSet<String> = config.pull_from.iter().cloned().collect();
        pull.extend(self.dispatcher.announced());
        let pulled = self.dispatcher.puller().reconcile(pull).await;

        if !announced.is_empty() || !pulled.is_empty() {
            info!(?announced, ?pulled, "cluster topology updated");
        }
    }

    /// Apply a new configuration: secrets and peer sets change in place,
    /// listen and storage settings need a restart.
    pub async fn reload(&self, config: Config) -> Result<()> {
        config.validate()?;
        {
            let current = self.config.read();
            if current.listen != config.listen
                || current.storage_kind != config.storage_kind
                || current.storage_addr != config.storage_addr
                || current.pool_size != config.pool_size
            {
                warn!("listen and storage settings change only on restart");
            }
        }

        self.dispatcher.secrets().set_global(config.secret_bytes());
        *self.config.write() = config.clone();
        self.refresh_commands();
        self.reconcile_peers(&config).await;
        info!("configuration reloaded");
        Ok(())
    }

    /// Accept clients on `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local = listener.local_addr()?;
        info!("keywire listening on {}", local);

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((socket, peer_addr)) => {
                    debug!("new connection from {}", peer_addr);
                    let handler = Handler::new(
                        self.dispatcher.clone(),
                        self.config.read().push_capacity,
                        self.shutdown.child_token(),
                    );
                    tokio::spawn(async move {
                        if let Err(e) = handler.run(socket).await {
                            debug!("connection error from {}: {}", peer_addr, e);
                        }
                        debug!("connection closed: {}", peer_addr);
                    });
                }
                Err(e) => error!("accept error: {}", e),
            }
        }
        info!("stopped listening on {}", local);
        Ok(())
    }

    /// Bind every configured listen endpoint and serve until shutdown
    pub async fn run(&self) -> Result<()> {
        let endpoints = self.config.read().listen.clone();
        let mut listeners = Vec::with_capacity(endpoints.len());
        for endpoint in &endpoints {
            listeners.push(TcpListener::bind(endpoint).await?);
        }
        for result in join_all(listeners.into_iter().map(|l| self.serve(l))).await {
            result?;
        }
        Ok(())
    }

    /// Stop serving, close peer connections and the storage pool. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }
        self.shutdown.cancel();
        self.announcer.shutdown().await;
        self.dispatcher.puller().shutdown().await;
        self.dispatcher.pool().close().await?;
        info!("node stopped | {}", self.dispatcher.metrics().summary());
        Ok(())
    }

    pub fn config(&self) -> Config {
        self.config.read().clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn announcer(&self) -> &ClusterManager {
        &self.announcer
    }

    pub fn puller(&self) -> &Arc<ClusterManager> {
        self.dispatcher.puller()
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        self.dispatcher.fanout()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.dispatcher.metrics()
    }
}
