//! End-to-end tests driving nodes over TCP with the wire codec

use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::codec::Framed;

use keywire::{Action, ActionReturn, Config, Error, Message, Node, Value, WireCodec, CHANGES_TOPIC};

const WAIT: Duration = Duration::from_secs(5);

struct WireClient {
    framed: Framed<TcpStream, WireCodec>,
    next_id: u64,
    pushes: VecDeque<ActionReturn>,
}

impl WireClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, WireCodec::new()),
            next_id: 1,
            pushes: VecDeque::new(),
        }
    }

    async fn read_message(&mut self) -> Message {
        timeout(WAIT, self.framed.next())
            .await
            .expect("frame in time")
            .expect("connection open")
            .unwrap()
    }

    async fn call(&mut self, action: Action) -> ActionReturn {
        let id = self.next_id;
        self.next_id += 1;
        self.framed.send(Message::Action { id, action }).await.unwrap();
        loop {
            match self.read_message().await {
                Message::Return { id: reply_to, ret } if reply_to == id => return ret,
                Message::Push(push) => self.pushes.push_back(push),
                _ => {}
            }
        }
    }

    async fn next_push(&mut self) -> Value {
        if let Some(push) = self.pushes.pop_front() {
            return push.into_result().unwrap();
        }
        loop {
            if let Message::Push(push) = self.read_message().await {
                return push.into_result().unwrap();
            }
        }
    }
}

async fn spawn_node(config: Config) -> (Arc<Node>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = config
        .with_listen([addr.to_string()])
        .with_advertise(addr.to_string())
        .with_pool_size(3)
        .with_cluster_interval(Duration::from_millis(100))
        .with_reconnect_backoff(Duration::from_millis(100));
    let node = Arc::new(Node::start(config).await.unwrap());
    let serving = node.clone();
    tokio::spawn(async move { serving.serve(listener).await });
    (node, addr)
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(20)).await;
    }
}

fn change(parts: &[&str]) -> Value {
    let mut items = vec![Value::str("CHANGE")];
    items.extend(parts.iter().map(|p| Value::str(p)));
    Value::List(items)
}

fn set(key: &'static str, value: &'static str) -> Action {
    Action::new("SET", key).with_arg(value).with_requester("tester")
}

#[tokio::test]
async fn test_commands_over_the_wire() {
    let (node, addr) = spawn_node(Config::default().with_global_secrets(["s1"])).await;
    let mut client = WireClient::connect(addr).await;

    assert_eq!(client.call(Action::new("PING", "")).await, ActionReturn::ok(Value::str("PONG")));
    assert_eq!(client.call(set("foo", "bar").signed(b"s1")).await, ActionReturn::ok(Value::ok()));
    assert_eq!(client.call(Action::new("GET", "foo")).await, ActionReturn::ok(Value::str("bar")));
    assert_eq!(
        client.call(set("foo", "baz").signed(b"s3")).await,
        ActionReturn::err(Error::AuthenticationFailure)
    );
    assert_eq!(
        client.call(Action::new("NOPE", "foo")).await,
        ActionReturn::err(Error::UnsupportedCommand("NOPE".into()))
    );

    node.shutdown().await.unwrap();
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_monitor_and_ekg_pushes() {
    let (node, addr) = spawn_node(Config::default().with_global_secrets(["s1"])).await;
    let mut watcher = WireClient::connect(addr).await;
    let mut writer = WireClient::connect(addr).await;
    let mut worker = WireClient::connect(addr).await;

    let eadd = Action::new("EADD", "job").with_arg("worker-7").signed(b"s1");
    assert!(worker.call(eadd).await.is_ok());
    assert!(watcher.call(Action::new("MADD", "foo")).await.is_ok());
    assert!(watcher.call(Action::new("MADD", "job")).await.is_ok());

    assert!(writer.call(set("foo", "bar").signed(b"s1")).await.is_ok());
    assert_eq!(watcher.next_push().await, change(&["SET", "foo", "bar"]));

    drop(worker);
    assert_eq!(watcher.next_push().await, change(&["disconnect", "job", "worker-7"]));
    assert_eq!(
        watcher.call(Action::new("ECARD", "job")).await,
        ActionReturn::ok(Value::Int(0))
    );
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_pulled_changes_reach_remote_watchers() {
    let (a, a_addr) = spawn_node(Config::default().with_global_secrets(["s1"])).await;
    let (b, b_addr) = spawn_node(
        Config::default()
            .with_global_secrets(["s1"])
            .with_pull_from([a_addr.to_string()]),
    )
    .await;

    eventually("B to subscribe on A", || {
        a.fanout().pubsub().subscriber_count(CHANGES_TOPIC) == 1
    })
    .await;

    let mut watcher = WireClient::connect(b_addr).await;
    assert!(watcher.call(Action::new("MADD", "foo")).await.is_ok());
    let mut writer = WireClient::connect(a_addr).await;
    assert!(writer.call(set("foo", "bar").signed(b"s1")).await.is_ok());

    assert_eq!(watcher.next_push().await, change(&["SET", "foo", "bar"]));
    assert!(b.metrics().peer_events() >= 1);

    b.shutdown().await.unwrap();
    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_announce_makes_peer_pull() {
    let (b, b_addr) = spawn_node(Config::default().with_global_secrets(["s1"])).await;
    let (a, a_addr) = spawn_node(
        Config::default()
            .with_global_secrets(["s1"])
            .with_push_to([b_addr.to_string()]),
    )
    .await;

    eventually("A to be announced on B", || {
        b.dispatcher().announced() == vec![a_addr.to_string()]
    })
    .await;
    assert_eq!(b.puller().endpoints().await, vec![a_addr.to_string()]);
    eventually("B to subscribe on A", || {
        a.fanout().pubsub().subscriber_count(CHANGES_TOPIC) == 1
    })
    .await;

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_reload_reconciles_and_rotates_secrets() {
    let (a, a_addr) = spawn_node(Config::default().with_global_secrets(["s1"])).await;
    let (b, b_addr) = spawn_node(Config::default().with_global_secrets(["s1"])).await;
    assert!(b.puller().endpoints().await.is_empty());

    let reloaded = b
        .config()
        .with_global_secrets(["s1", "s2"])
        .with_pull_from([a_addr.to_string()]);
    b.reload(reloaded.clone()).await.unwrap();
    assert_eq!(b.puller().endpoints().await, vec![a_addr.to_string()]);

    let mut client = WireClient::connect(b_addr).await;
    assert!(client.call(set("k", "v").signed(b"s2")).await.is_ok());

    b.reload(reloaded.with_pull_from(Vec::<String>::new())).await.unwrap();
    assert!(b.puller().endpoints().await.is_empty());

    let invalid = b.config().with_pool_size(0);
    assert!(matches!(b.reload(invalid).await, Err(Error::ConfigInvalid(_))));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}
