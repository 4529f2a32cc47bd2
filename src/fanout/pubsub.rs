//! Topic Pub/Sub
//!
//! Each live topic owns a bounded event queue drained by one worker task.
//! The worker snapshots the subscriber set per event and fans out with
//! [`deliver_all`], so a slow subscriber only loses its own copy.

use parking_lot::RwLock;
use hashbrown::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::client::{Client, ClientId};
use crate::metrics::Metrics;
use crate::protocol::{ActionReturn, Value};

use super::delivery::deliver_all;

/// Pub/sub tuning
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Per-topic event queue capacity
    pub queue_capacity: usize,
    /// Bound on each per-client delivery
    pub delivery_timeout: Duration,
    /// Subscribers per delivery task
    pub batch_size: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            delivery_timeout: Duration::from_secs(10),
            batch_size: 500,
        }
    }
}

struct Topic {
    generation: u64,
    queue: mpsc::Sender<Value>,
    subscribers: HashMap<ClientId, Client>,
}

#[derive(Default)]
struct State {
    topics: HashMap<String, Topic>,
    by_client: HashMap<ClientId, HashSet<String>>,
    next_generation: u64,
}

impl State {
    /// Removes `topic` from `client`; drops the topic when it empties
    fn leave(&mut self, client: ClientId, topic: &str) -> bool {
        let Some(entry) = self.topics.get_mut(topic) else {
            return false;
        };
        let removed = entry.subscribers.remove(&client).is_some();
        if entry.subscribers.is_empty() {
            self.topics.remove(topic);
            debug!(topic, "topic removed");
        }
        if let Some(set) = self.by_client.get_mut(&client) {
            set.remove(topic);
            if set.is_empty() {
                self.by_client.remove(&client);
            }
        }
        removed
    }

    fn count_of(&self, client: ClientId) -> usize {
        self.by_client.get(&client).map_or(0, HashSet::len)
    }
}

struct Spawn {
    topic: String,
    generation: u64,
    events: mpsc::Receiver<Value>,
}

/// Topic registry plus per-topic delivery workers
pub struct PubSub {
    state: Arc<RwLock<State>>,
    config: PubSubConfig,
    metrics: Arc<Metrics>,
}

impl PubSub {
    pub fn new(config: PubSubConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            state: Arc::new(RwLock::new(State::default())),
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    /// Subscribe `client` to `topics`; returns how many topics it is now on.
    /// Must be called inside a Tokio runtime.
    pub fn subscribe(&self, client: &Client, topics: &[String]) -> usize {
        let mut spawns = Vec::new();
        let count = {
            let mut state = self.state.write();
            for topic in topics {
                if !state.topics.contains_key(topic) {
                    let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    state.topics.insert(
                        topic.clone(),
                        Topic {
                            generation,
                            queue: tx,
                            subscribers: HashMap::new(),
                        },
                    );
                    spawns.push(Spawn {
                        topic: topic.clone(),
                        generation,
                        events: rx,
                    });
                }
                if let Some(entry) = state.topics.get_mut(topic) {
                    entry.subscribers.insert(client.id(), client.clone());
                }
                state
                    .by_client
                    .entry(client.id())
                    .or_default()
                    .insert(topic.clone());
            }
            state.count_of(client.id())
        };

        for spawn in spawns {
            debug!(topic = %spawn.topic, generation = spawn.generation, "topic created");
            tokio::spawn(topic_worker(
                Arc::downgrade(&self.state),
                spawn,
                self.config.clone(),
                self.metrics.clone(),
            ));
        }
        count
    }

    /// Returns how many topics the client remains subscribed to
    pub fn unsubscribe(&self, client: ClientId, topics: &[String]) -> usize {
        let mut state = self.state.write();
        for topic in topics {
            state.leave(client, topic);
        }
        state.count_of(client)
    }

    /// Returns how many subscriptions were dropped
    pub fn unsubscribe_all(&self, client: ClientId) -> usize {
        let mut state = self.state.write();
        let topics: Vec<String> = state
            .by_client
            .get(&client)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        topics.iter().filter(|t| state.leave(client, t)).count()
    }

    /// Enqueue `event` on each existing topic without waiting; returns the
    /// topics reached. A full topic queue drops the event for that topic.
    pub fn publish(&self, event: Value, topics: &[String]) -> usize {
        let state = self.state.read();
        let mut reached = 0;
        for topic in topics {
            let Some(entry) = state.topics.get(topic) else {
                continue;
            };
            match entry.queue.try_send(event.clone()) {
                Ok(()) => reached += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(topic = %topic, "topic queue full, event dropped");
                    self.metrics.record_deliveries(0, 1);
                }
                Err(TrySendError::Closed(_)) => debug!(topic = %topic, "topic closed during publish"),
            }
        }
        reached
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .read()
            .topics
            .get(topic)
            .map_or(0, |t| t.subscribers.len())
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.state.read().topics.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn topics_of(&self, client: ClientId) -> Vec<String> {
        let mut topics: Vec<String> = self
            .state
            .read()
            .by_client
            .get(&client)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }
}

async fn topic_worker(
    state: Weak<RwLock<State>>,
    spawn: Spawn,
    config: PubSubConfig,
    metrics: Arc<Metrics>,
) {
    let Spawn {
        topic,
        generation,
        mut events,
    } = spawn;

    while let Some(event) = events.recv().await {
        let Some(state) = state.upgrade() else {
            break;
        };
        let snapshot: Vec<Client> = {
            let guard = state.read();
            match guard.topics.get(&topic) {
                Some(t) if t.generation == generation => t.subscribers.values().cloned().collect(),
                _ => break,
            }
        };
        drop(state);

        let report = deliver_all(
            snapshot,
            ActionReturn::ok(event),
            config.delivery_timeout,
            config.batch_size,
        )
        .await;
        metrics.record_deliveries(report.delivered, report.timed_out);
    }
    debug!(topic = %topic, generation, "topic worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn message(topic: &str, body: &str) -> Value {
        Value::List(vec![Value::str("MESSAGE"), Value::str(topic), Value::str(body)])
    }

    fn pubsub() -> PubSub {
        PubSub::new(
            PubSubConfig {
                delivery_timeout: Duration::from_millis(200),
                ..Default::default()
            },
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_publish_reaches_only_subscribers() {
        let ps = pubsub();
        let (a, mut a_rx) = Client::channel(8);
        let (b, mut b_rx) = Client::channel(8);
        assert_eq!(ps.subscribe(&a, &topics(&["t1"])), 1);
        assert_eq!(ps.subscribe(&b, &topics(&["t2"])), 1);

        assert_eq!(ps.publish(message("t1", "hi"), &topics(&["t1"])), 1);

        let got = timeout(Duration::from_secs(1), a_rx.recv()).await.unwrap();
        assert_eq!(got, Some(ActionReturn::ok(message("t1", "hi"))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_unsubscribe_removes_topic() {
        let ps = pubsub();
        let (a, _a_rx) = Client::channel(8);
        let (b, _b_rx) = Client::channel(8);
        ps.subscribe(&a, &topics(&["t1", "t2"]));
        ps.subscribe(&b, &topics(&["t1"]));
        assert_eq!(ps.topics(), topics(&["t1", "t2"]));

        assert_eq!(ps.unsubscribe(a.id(), &topics(&["t1"])), 1);
        assert_eq!(ps.subscriber_count("t1"), 1);
        assert_eq!(ps.unsubscribe_all(a.id()), 1);
        assert_eq!(ps.topics(), topics(&["t1"]));

        ps.unsubscribe(b.id(), &topics(&["t1"]));
        assert!(ps.topics().is_empty());
        assert_eq!(ps.publish(message("t1", "late"), &topics(&["t1"])), 0);
        assert_eq!(ps.unsubscribe_all(b.id()), 0);
    }

    #[tokio::test]
    async fn test_resubscribe_starts_fresh_topic() {
        let ps = pubsub();
        let (a, mut a_rx) = Client::channel(8);
        ps.subscribe(&a, &topics(&["t"]));
        ps.unsubscribe(a.id(), &topics(&["t"]));
        ps.subscribe(&a, &topics(&["t"]));

        assert_eq!(ps.publish(message("t", "once"), &topics(&["t"])), 1);
        let got = timeout(Duration::from_secs(1), a_rx.recv()).await.unwrap();
        assert_eq!(got, Some(ActionReturn::ok(message("t", "once"))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_times_out_alone() {
        let metrics = Arc::new(Metrics::new());
        let ps = PubSub::new(
            PubSubConfig {
                delivery_timeout: Duration::from_millis(100),
                ..Default::default()
            },
            metrics.clone(),
        );
        // Capacity 1 and never drained
        let (slow, _slow_rx) = Client::channel(1);
        let (fast, mut fast_rx) = Client::channel(8);
        ps.subscribe(&slow, &topics(&["t"]));
        ps.subscribe(&fast, &topics(&["t"]));

        ps.publish(Value::Int(1), &topics(&["t"]));
        ps.publish(Value::Int(2), &topics(&["t"]));

        for expected in [1, 2] {
            let got = timeout(Duration::from_secs(1), fast_rx.recv()).await.unwrap();
            assert_eq!(got, Some(ActionReturn::ok(Value::Int(expected))));
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(metrics.delivery_timeouts(), 1);
        assert_eq!(metrics.deliveries(), 3);
    }

    #[tokio::test]
    async fn test_in_flight_event_uses_its_snapshot() {
        let ps = PubSub::new(
            PubSubConfig {
                delivery_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            Arc::new(Metrics::new()),
        );
        let wait = Duration::from_secs(1);
        let (stays, mut stays_rx) = Client::channel(1);
        let (leaver, mut leaver_rx) = Client::channel(1);
        ps.subscribe(&stays, &topics(&["t"]));
        ps.subscribe(&leaver, &topics(&["t"]));

        // Fill both queues so the next event is held in flight
        assert_eq!(ps.publish(Value::Int(0), &topics(&["t"])), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ps.publish(Value::Int(1), &topics(&["t"])), 1);
        tokio::time::sleep(Duration::from_millis(50)).await;

        ps.unsubscribe(leaver.id(), &topics(&["t"]));
        let (joiner, mut joiner_rx) = Client::channel(8);
        ps.subscribe(&joiner, &topics(&["t"]));

        for rx in [&mut stays_rx, &mut leaver_rx] {
            for expected in [0, 1] {
                let got = timeout(wait, rx.recv()).await.unwrap();
                assert_eq!(got, Some(ActionReturn::ok(Value::Int(expected))));
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(joiner_rx.try_recv().is_err());

        assert_eq!(ps.publish(Value::Int(2), &topics(&["t"])), 1);
        let got = timeout(wait, joiner_rx.recv()).await.unwrap();
        assert_eq!(got, Some(ActionReturn::ok(Value::Int(2))));
        assert_eq!(timeout(wait, stays_rx.recv()).await.unwrap(), Some(ActionReturn::ok(Value::Int(2))));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(leaver_rx.try_recv().is_err());
    }
}
