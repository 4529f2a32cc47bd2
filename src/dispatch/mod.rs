//! Dispatcher
//!
//! Turns one client `Action` into one `ActionReturn`:
//! classify, authorize, execute, post-process, then propagate the change.

mod builtin;

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::client::Client;
use crate::cluster::ClusterManager;
use crate::command::{classify, list_to_map, CommandKind};
use crate::error::Result;
use crate::fanout::Fanout;
use crate::metrics::Metrics;
use crate::protocol::{Action, ActionReturn, KeyChange, Value};
use crate::security::{Authorizer, SecretStore};
use crate::storage::{Backend, StoragePool};

/// Per-node request handler shared by every connection
pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    pool: Arc<StoragePool>,
    secrets: Arc<SecretStore>,
    authorizer: Authorizer,
    fanout: Arc<Fanout>,
    puller: Arc<ClusterManager>,
    metrics: Arc<Metrics>,
    /// Endpoints that announced themselves with ALISTENADD
    listeners: Mutex<BTreeSet<String>>,
}

impl Dispatcher {
    pub fn new(
        backend: Arc<dyn Backend>,
        pool: Arc<StoragePool>,
        secrets: Arc<SecretStore>,
        fanout: Arc<Fanout>,
        puller: Arc<ClusterManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            backend,
            pool,
            authorizer: Authorizer::new(secrets.clone()),
            secrets,
            fanout,
            puller,
            metrics,
            listeners: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn client_connected(&self, client: &Client) {
        self.fanout.register(client);
    }

    pub fn client_closed(&self, client: &Client) {
        self.fanout.client_closed(client);
    }

    pub async fn handle(&self, client: &Client, mut action: Action) -> ActionReturn {
        let started = Instant::now();
        let secret = action.secret.take();
        let name = action.command.to_ascii_uppercase();

        let result = self.execute(client, action, secret).await;
        if let Err(e) = &result {
            debug!(client = %client.id(), command = %name, error = %e, "action failed");
        }
        self.metrics
            .record_operation(&name, started.elapsed(), result.is_err());
        ActionReturn(result)
    }

    async fn execute(&self, client: &Client, action: Action, secret: Option<Bytes>) -> Result<Value> {
        let classified = classify(self.backend.as_ref(), &action)?;
        let info = classified.info;

        if info.needs_auth() {
            if let Err(e) = self.authorizer.authorize(
                &action.command,
                &action.key,
                &action.requester,
                secret.as_deref(),
            ) {
                self.metrics.record_auth_failure();
                warn!(client = %client.id(), command = %classified.name, requester = %action.requester, "authorization failed");
                return Err(e);
            }
        }

        let value = match classified.kind {
            CommandKind::Builtin(builtin) => self.run_builtin(client, builtin, &action).await?,
            CommandKind::Direct => {
                let command = self
                    .backend
                    .new_command(&classified.name, action.key.clone(), action.args.clone());
                self.pool.execute(command).await?
            }
        };
        let value = if info.returns_list_as_map {
            list_to_map(value)?
        } else {
            value
        };

        if info.modifies && !info.admin {
            self.fanout
                .key_changed(KeyChange::new(classified.name, action.key, action.args));
        }
        Ok(value)
    }

    pub fn fanout(&self) -> &Arc<Fanout> {
        &self.fanout
    }

    pub fn secrets(&self) -> &Arc<SecretStore> {
        &self.secrets
    }

    pub fn pool(&self) -> &Arc<StoragePool> {
        &self.pool
    }

    pub fn puller(&self) -> &Arc<ClusterManager> {
        &self.puller
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Endpoints currently announced to this node, sorted
    pub fn announced(&self) -> Vec<String> {
        self.listeners.lock().iter().cloned().collect()
    }
}
