//! Change fan-out
//!
//! Routes key-change notifications to local watchers and to pulling peers,
//! and turns client disconnects into notifications for ekg watchers.

pub mod delivery;
pub mod monitor;
pub mod pubsub;

pub use delivery::{deliver_all, DeliveryReport};
pub use monitor::MonitorRegistry;
pub use pubsub::{PubSub, PubSubConfig};

use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

use crate::client::{Client, ClientId};
use crate::cluster::{PeerEvent, PeerEventHandler};
use crate::metrics::Metrics;
use crate::protocol::{ActionReturn, KeyChange};

/// Reserved topic pulling peers subscribe to
pub const CHANGES_TOPIC: &str = "__keywire:changes";

/// Routing table plus the mon, ekg and pub/sub registries
pub struct Fanout {
    clients: RwLock<HashMap<ClientId, Client>>,
    mon: MonitorRegistry,
    ekg: MonitorRegistry,
    pubsub: PubSub,
    metrics: Arc<Metrics>,
}

impl Fanout {
    pub fn new(config: PubSubConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            mon: MonitorRegistry::new(),
            ekg: MonitorRegistry::new(),
            pubsub: PubSub::new(config, metrics.clone()),
            metrics,
        }
    }

    pub fn register(&self, client: &Client) {
        self.clients.write().insert(client.id(), client.clone());
    }

    pub fn unregister(&self, id: ClientId) -> bool {
        self.clients.write().remove(&id).is_some()
    }

    pub fn client(&self, id: ClientId) -> Option<Client> {
        self.clients.read().get(&id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// "Tell me when this key changes"
    pub fn mon(&self) -> &MonitorRegistry {
        &self.mon
    }

    /// "Tell this key's watchers when I disconnect"
    pub fn ekg(&self) -> &MonitorRegistry {
        &self.ekg
    }

    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Push `change` to this node's mon watchers of its key. Delivery runs on
    /// a spawned task; returns the number of clients targeted.
    pub fn deliver_local(&self, change: &KeyChange) -> usize {
        let targets: Vec<Client> = {
            let watchers = self.mon.watchers_of(&change.key);
            let clients = self.clients.read();
            watchers.iter().filter_map(|id| clients.get(id).cloned()).collect()
        };
        if targets.is_empty() {
            return 0;
        }

        let count = targets.len();
        let push = ActionReturn::ok(change.to_value());
        let config = self.pubsub.config().clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let report = deliver_all(targets, push, config.delivery_timeout, config.batch_size).await;
            metrics.record_deliveries(report.delivered, report.timed_out);
        });
        count
    }

    /// A key changed on this node: notify local watchers and pulling peers
    pub fn key_changed(&self, change: KeyChange) {
        self.metrics.record_key_change();
        let local = self.deliver_local(&change);
        let peers = self
            .pubsub
            .publish(change.to_value(), &[CHANGES_TOPIC.to_string()]);
        debug!(command = %change.command, local, peers, "key change propagated");
    }

    /// Remove every trace of `client` and notify watchers of its ekg keys.
    /// Calling it again is a no-op.
    pub fn client_closed(&self, client: &Client) {
        let id = client.id();
        let entries = self.ekg.cleanup_client(id);
        self.mon.cleanup_client(id);
        self.unregister(id);
        self.pubsub.unsubscribe_all(id);

        for (key, label) in entries {
            self.key_changed(KeyChange::disconnect(key, label));
        }
    }
}

#[async_trait]
impl PeerEventHandler for Fanout {
    /// Changes pulled from a peer go to local watchers only
    async fn handle(&self, event: PeerEvent) {
        match KeyChange::from_value(&event.value) {
            Ok(change) => {
                self.metrics.record_peer_event();
                self.deliver_local(&change);
            }
            Err(e) => debug!(endpoint = %event.endpoint, error = %e, "ignoring peer push"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fanout() -> Fanout {
        Fanout::new(PubSubConfig::default(), Arc::new(Metrics::new()))
    }

    fn key(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_key_change_reaches_watchers_and_change_topic() {
        let fanout = fanout();
        let (watcher, mut watcher_rx) = Client::channel(8);
        let (peer, mut peer_rx) = Client::channel(8);
        let (other, mut other_rx) = Client::channel(8);
        for c in [&watcher, &peer, &other] {
            fanout.register(c);
        }
        fanout.mon().add(watcher.id(), key("foo"), None);
        fanout.mon().add(other.id(), key("bar"), None);
        fanout.pubsub().subscribe(&peer, &[CHANGES_TOPIC.to_string()]);

        let change = KeyChange::new("SET", key("foo"), vec![key("v")]);
        fanout.key_changed(change.clone());

        let wait = Duration::from_secs(1);
        let expected = Some(ActionReturn::ok(change.to_value()));
        assert_eq!(timeout(wait, watcher_rx.recv()).await.unwrap(), expected);
        assert_eq!(timeout(wait, peer_rx.recv()).await.unwrap(), expected);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(other_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_client_closed_notifies_ekg_watchers_once() {
        let fanout = fanout();
        let (leaver, _leaver_rx) = Client::channel(8);
        let (watcher, mut watcher_rx) = Client::channel(8);
        fanout.register(&leaver);
        fanout.register(&watcher);
        fanout.ekg().add(leaver.id(), key("job"), Some("worker-1".into()));
        fanout.mon().add(watcher.id(), key("job"), None);
        fanout.mon().add(leaver.id(), key("job"), None);
        fanout.pubsub().subscribe(&leaver, &["t".to_string()]);

        fanout.client_closed(&leaver);
        fanout.client_closed(&leaver);

        let got = timeout(Duration::from_secs(1), watcher_rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            got.value(),
            Some(&Value::List(vec![
                Value::str("CHANGE"),
                Value::str("disconnect"),
                Value::str("job"),
                Value::str("worker-1"),
            ]))
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(watcher_rx.try_recv().is_err());

        assert!(fanout.client(leaver.id()).is_none());
        assert!(fanout.ekg().keys_of(leaver.id()).is_empty());
        assert_eq!(fanout.mon().watchers_of(&key("job")), vec![watcher.id()]);
        assert!(fanout.pubsub().topics().is_empty());
    }

    #[tokio::test]
    async fn test_peer_event_delivered_locally_only() {
        let fanout = fanout();
        let (watcher, mut watcher_rx) = Client::channel(8);
        let (peer, mut peer_rx) = Client::channel(8);
        fanout.register(&watcher);
        fanout.register(&peer);
        fanout.mon().add(watcher.id(), key("k"), None);
        fanout.pubsub().subscribe(&peer, &[CHANGES_TOPIC.to_string()]);

        let change = KeyChange::new("DEL", key("k"), vec![]);
        fanout
            .handle(PeerEvent {
                endpoint: "10.0.0.2:6390".into(),
                value: change.to_value(),
            })
            .await;
        fanout
            .handle(PeerEvent {
                endpoint: "10.0.0.2:6390".into(),
                value: Value::str("noise"),
            })
            .await;

        let got = timeout(Duration::from_secs(1), watcher_rx.recv()).await.unwrap();
        assert_eq!(got, Some(ActionReturn::ok(change.to_value())));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(peer_rx.try_recv().is_err());
    }
}
