//! Peer Links
//!
//! A `PeerLink` is one request/response channel to a peer node plus the
//! stream of pushes the peer sends back. Links come from a `PeerConnector`;
//! `TcpConnector` speaks the wire codec over TCP.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use hashbrown::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::protocol::{Action, Message, Value, WireCodec};

/// A push received from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEvent {
    pub endpoint: String,
    pub value: Value,
}

/// Consumer of the shared cluster output queue
#[async_trait]
pub trait PeerEventHandler: Send + Sync + 'static {
    async fn handle(&self, event: PeerEvent);
}

/// Opens links to peers
#[async_trait]
pub trait PeerConnector: Send + Sync + 'static {
    async fn connect(&self, endpoint: &str) -> Result<PeerLink>;
}

/// One outstanding call
#[derive(Debug)]
pub struct PeerRequest {
    pub action: Action,
    pub reply: oneshot::Sender<Result<Value>>,
}

/// Sending half of a link
#[derive(Debug, Clone)]
pub struct PeerCaller {
    endpoint: String,
    requests: mpsc::Sender<PeerRequest>,
}

impl PeerCaller {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Send `action` and wait at most `wait` for the peer's reply. A peer
    /// error comes back as that error; a dead link or timeout as
    /// `ClusterConnectionUnreachable`.
    pub async fn call(&self, action: Action, wait: Duration) -> Result<Value> {
        let (reply, rx) = oneshot::channel();
        let unreachable = |why: &str| Error::ClusterConnectionUnreachable(format!("{}: {}", self.endpoint, why));

        let exchange = async {
            self.requests
                .send(PeerRequest { action, reply })
                .await
                .map_err(|_| unreachable("link closed"))?;
            rx.await.map_err(|_| unreachable("link closed"))?
        };
        match timeout(wait, exchange).await {
            Ok(result) => result,
            Err(_) => Err(unreachable("call timed out")),
        }
    }
}

/// Connected link as handed to a managed connection
#[derive(Debug)]
pub struct PeerLink {
    caller: PeerCaller,
    pushes: mpsc::Receiver<Value>,
}

/// Far side of a link, driven by the transport (or a test)
#[derive(Debug)]
pub struct PeerLinkRemote {
    pub requests: mpsc::Receiver<PeerRequest>,
    pub pushes: mpsc::Sender<Value>,
}

impl PeerLink {
    pub fn pair(endpoint: impl Into<String>, capacity: usize) -> (PeerLink, PeerLinkRemote) {
        let (req_tx, req_rx) = mpsc::channel(capacity.max(1));
        let (push_tx, push_rx) = mpsc::channel(capacity.max(1));
        let link = PeerLink {
            caller: PeerCaller {
                endpoint: endpoint.into(),
                requests: req_tx,
            },
            pushes: push_rx,
        };
        let remote = PeerLinkRemote {
            requests: req_rx,
            pushes: push_tx,
        };
        (link, remote)
    }

    pub fn endpoint(&self) -> &str {
        self.caller.endpoint()
    }

    pub fn into_parts(self) -> (PeerCaller, mpsc::Receiver<Value>) {
        (self.caller, self.pushes)
    }
}

/// Connects to peers over TCP using the wire codec
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    capacity: usize,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            capacity: 1024,
        }
    }
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for TcpConnector {
    async fn connect(&self, endpoint: &str) -> Result<PeerLink> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(Error::ClusterConnectionUnreachable(format!("{}: {}", endpoint, e)))
            }
            Err(_) => {
                return Err(Error::ClusterConnectionUnreachable(format!(
                    "{}: connect timed out",
                    endpoint
                )))
            }
        };
        stream.set_nodelay(true)?;

        let (link, remote) = PeerLink::pair(endpoint, self.capacity);
        tokio::spawn(drive(endpoint.to_string(), Framed::new(stream, WireCodec::new()), remote));
        Ok(link)
    }
}

/// Pump requests out and route replies and pushes back until either side
/// goes away. Dropping the pending replies fails their callers.
async fn drive(endpoint: String, framed: Framed<TcpStream, WireCodec>, mut remote: PeerLinkRemote) {
    let (mut sink, mut stream) = framed.split();
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value>>> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            request = remote.requests.recv() => {
                let Some(PeerRequest { action, reply }) = request else { break };
                let id = next_id;
                next_id = next_id.wrapping_add(1).max(1);
                if let Err(e) = sink.send(Message::Action { id, action }).await {
                    warn!(endpoint = %endpoint, error = %e, "peer write failed");
                    let _ = reply.send(Err(Error::ClusterConnectionUnreachable(endpoint.clone())));
                    break;
                }
                pending.insert(id, reply);
            }
            frame = stream.next() => match frame {
                Some(Ok(message)) => match message {
                    Message::Return { id, ret } => {
                        if let Some(reply) = pending.remove(&id) {
                            let _ = reply.send(ret.into_result());
                        }
                    }
                    Message::Push(push) => match push.into_result() {
                        Ok(value) => {
                            if remote.pushes.send(value).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => debug!(endpoint = %endpoint, error = %e, "peer pushed an error"),
                    },
                    Message::Malformed { id, opcode, error } => {
                        warn!(endpoint = %endpoint, ?opcode, error = %error, "undecodable message from peer");
                        if let Some(reply) = pending.remove(&id) {
                            let _ = reply.send(Err(error));
                        }
                    }
                    Message::Action { .. } => debug!(endpoint = %endpoint, "ignoring action sent by peer"),
                },
                Some(Err(e)) => {
                    warn!(endpoint = %endpoint, error = %e, "peer read failed");
                    break;
                }
                None => {
                    debug!(endpoint = %endpoint, "peer closed the connection");
                    break;
                }
            },
        }
    }
}
