//! Cluster Replication Manager
//!
//! Owns the set of managed peer connections for one purpose (announcing
//! this node, or pulling changes). Every mutation of the set goes through a
//! single actor task; connection tasks feed peer pushes into one bounded
//! output queue drained by a fixed set of event workers.

use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::Action;

use super::connection::{ConnectionState, ConnectionTimers, ManagedConnection};
use super::peer::{PeerConnector, PeerEvent, PeerEventHandler};

const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Used in log lines only
    pub name: String,
    /// Period of the periodic command
    pub interval: Duration,
    /// Delay between resurrection attempts
    pub backoff: Duration,
    /// Bound on one periodic call
    pub call_timeout: Duration,
    /// Event workers draining the output queue
    pub workers: usize,
    /// Output queue capacity
    pub queue_capacity: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: "cluster".to_string(),
            interval: Duration::from_secs(5),
            backoff: Duration::from_secs(2),
            call_timeout: Duration::from_secs(10),
            workers: 20,
            queue_capacity: 1024,
        }
    }
}

impl ClusterConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    fn timers(&self) -> ConnectionTimers {
        ConnectionTimers {
            interval: self.interval,
            backoff: self.backoff,
            call_timeout: self.call_timeout,
        }
    }
}

/// What a reconcile changed; both lists sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: Vec<String>,
    pub closed: Vec<String>,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

enum Op {
    Ensure(String, oneshot::Sender<bool>),
    Close(String, oneshot::Sender<bool>),
    CloseAll(oneshot::Sender<usize>),
    Reconcile(Vec<String>, oneshot::Sender<ReconcileReport>),
    Endpoints(oneshot::Sender<Vec<String>>),
    State(String, oneshot::Sender<Option<ConnectionState>>),
}

/// Handle to a running manager
pub struct ClusterManager {
    name: String,
    ops: mpsc::Sender<Op>,
    command: watch::Sender<Option<Action>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Spawn the actor and event workers. Must be called inside a Tokio
    /// runtime.
    pub fn start(
        connector: Arc<dyn PeerConnector>,
        config: ClusterConfig,
        handler: Arc<dyn PeerEventHandler>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let (ops_tx, ops_rx) = mpsc::channel(64);
        let (command_tx, command_rx) = watch::channel(None);
        let (events_tx, events_rx) = mpsc::channel(config.queue_capacity.max(1));
        let events_rx = Arc::new(tokio::sync::Mutex::new(events_rx));

        let mut tasks = Vec::with_capacity(config.workers + 1);
        let actor = Actor {
            name: config.name.clone(),
            connector,
            timers: config.timers(),
            command: command_rx,
            events: events_tx,
            connections: HashMap::new(),
            shutdown: shutdown.clone(),
        };
        tasks.push(tokio::spawn(actor.run(ops_rx)));

        for id in 0..config.workers.max(1) {
            tasks.push(tokio::spawn(event_worker(
                id,
                events_rx.clone(),
                handler.clone(),
                shutdown.clone(),
            )));
        }

        info!(manager = %config.name, workers = config.workers, "cluster manager started");
        Self {
            name: config.name,
            ops: ops_tx,
            command: command_tx,
            shutdown,
            tasks: Mutex::new(tasks),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replace the periodic command; `None` disables it
    pub fn set_command(&self, action: Option<Action>) {
        self.command.send_replace(action);
    }

    pub fn command(&self) -> Option<Action> {
        self.command.borrow().clone()
    }

    async fn request<T>(&self, op: impl FnOnce(oneshot::Sender<T>) -> Op) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.ops.send(op(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Returns true if a connection was created
    pub async fn ensure_client(&self, endpoint: &str) -> bool {
        let endpoint = endpoint.to_string();
        self.request(|tx| Op::Ensure(endpoint, tx)).await.unwrap_or(false)
    }

    /// Returns true if a connection existed
    pub async fn close_client(&self, endpoint: &str) -> bool {
        let endpoint = endpoint.to_string();
        self.request(|tx| Op::Close(endpoint, tx)).await.unwrap_or(false)
    }

    pub async fn close_all(&self) -> usize {
        self.request(Op::CloseAll).await.unwrap_or(0)
    }

    /// Make the connection set equal to `targets`
    pub async fn reconcile<I, S>(&self, targets: I) -> ReconcileReport
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let targets: Vec<String> = targets.into_iter().map(Into::into).collect();
        self.request(|tx| Op::Reconcile(targets, tx))
            .await
            .unwrap_or_default()
    }

    /// Managed endpoints, sorted
    pub async fn endpoints(&self) -> Vec<String> {
        self.request(Op::Endpoints).await.unwrap_or_default()
    }

    pub async fn state_of(&self, endpoint: &str) -> Option<ConnectionState> {
        let endpoint = endpoint.to_string();
        self.request(|tx| Op::State(endpoint, tx)).await.flatten()
    }

    /// Stop the actor, every connection and the event workers. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        if tasks.is_empty() {
            return;
        }
        for task in tasks {
            if timeout(JOIN_TIMEOUT, task).await.is_err() {
                warn!(manager = %self.name, "cluster task did not stop in time");
            }
        }
        info!(manager = %self.name, "cluster manager stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct Actor {
    name: String,
    connector: Arc<dyn PeerConnector>,
    timers: ConnectionTimers,
    command: watch::Receiver<Option<Action>>,
    events: mpsc::Sender<PeerEvent>,
    connections: HashMap<String, ManagedConnection>,
    shutdown: CancellationToken,
}

impl Actor {
    async fn run(mut self, mut ops: mpsc::Receiver<Op>) {
        loop {
            let op = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                op = ops.recv() => match op {
                    Some(op) => op,
                    None => break,
                },
            };
            self.apply(op);
        }

        let drained: Vec<_> = self.connections.drain().map(|(_, c)| c).collect();
        for conn in drained {
            conn.close_and_join(JOIN_TIMEOUT).await;
        }
        debug!(manager = %self.name, "cluster actor exited");
    }

    fn apply(&mut self, op: Op) {
        match op {
            Op::Ensure(endpoint, reply) => {
                let _ = reply.send(self.ensure(endpoint));
            }
            Op::Close(endpoint, reply) => {
                let _ = reply.send(self.close(&endpoint));
            }
            Op::CloseAll(reply) => {
                let endpoints: Vec<String> = self.connections.keys().cloned().collect();
                let closed = endpoints.iter().filter(|e| self.close(e)).count();
                let _ = reply.send(closed);
            }
            Op::Reconcile(targets, reply) => {
                let _ = reply.send(self.reconcile(targets));
            }
            Op::Endpoints(reply) => {
                let mut endpoints: Vec<String> = self.connections.keys().cloned().collect();
                endpoints.sort();
                let _ = reply.send(endpoints);
            }
            Op::State(endpoint, reply) => {
                let _ = reply.send(self.connections.get(&endpoint).map(ManagedConnection::state));
            }
        }
    }

    fn ensure(&mut self, endpoint: String) -> bool {
        if self.connections.contains_key(&endpoint) {
            return false;
        }
        info!(manager = %self.name, endpoint = %endpoint, "opening peer connection");
        let conn = ManagedConnection::spawn(
            endpoint.clone(),
            self.connector.clone(),
            self.timers,
            self.command.clone(),
            self.events.clone(),
            self.shutdown.child_token(),
        );
        self.connections.insert(endpoint, conn);
        true
    }

    fn close(&mut self, endpoint: &str) -> bool {
        match self.connections.remove(endpoint) {
            Some(conn) => {
                info!(manager = %self.name, endpoint, "closing peer connection");
                conn.close();
                true
            }
            None => false,
        }
    }

    fn reconcile(&mut self, targets: Vec<String>) -> ReconcileReport {
        let targets: BTreeSet<String> = targets.into_iter().collect();
        let mut closed: Vec<String> = self
            .connections
            .keys()
            .filter(|e| !targets.contains(*e))
            .cloned()
            .collect();
        closed.sort();
        for endpoint in &closed {
            self.close(endpoint);
        }

        let opened: Vec<String> = targets
            .into_iter()
            .filter(|e| self.ensure(e.clone()))
            .collect();

        let report = ReconcileReport { opened, closed };
        if !report.is_empty() {
            debug!(manager = %self.name, ?report, "reconciled");
        }
        report
    }
}

async fn event_worker(
    id: usize,
    events: Arc<tokio::sync::Mutex<mpsc::Receiver<PeerEvent>>>,
    handler: Arc<dyn PeerEventHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let event = {
            let mut events = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                guard = events.lock() => guard,
            };
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            }
        };
        match event {
            Some(event) => handler.handle(event).await,
            None => break,
        }
    }
    debug!(worker = id, "cluster event worker exited");
}
