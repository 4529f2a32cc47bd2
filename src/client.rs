//! Client Handles
//!
//! A connected consumer as seen by the registries: an id, a bounded push
//! queue and a closing signal. The transport owns the receiving side.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::protocol::ActionReturn;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque, comparable client identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

impl ClientId {
    pub fn next() -> Self {
        Self(NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Outcome of offering one push to a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    TimedOut,
    /// The client's receiver is gone
    Closed,
}

/// Handle to one connected client
#[derive(Debug, Clone)]
pub struct Client {
    id: ClientId,
    push: mpsc::Sender<ActionReturn>,
    closing: CancellationToken,
}

impl Client {
    pub fn new(push: mpsc::Sender<ActionReturn>, closing: CancellationToken) -> Self {
        Self {
            id: ClientId::next(),
            push,
            closing,
        }
    }

    /// New handle plus the receiver the transport drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ActionReturn>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx, CancellationToken::new()), rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn push(&self) -> &mpsc::Sender<ActionReturn> {
        &self.push
    }

    /// Fires once when the client disconnects
    pub fn closing(&self) -> &CancellationToken {
        &self.closing
    }

    /// Place `push` on the client's queue, waiting at most `wait`
    pub async fn deliver(&self, push: ActionReturn, wait: Duration) -> Delivery {
        match timeout(wait, self.push.send(push)).await {
            Ok(Ok(())) => Delivery::Delivered,
            Ok(Err(_)) => Delivery::Closed,
            Err(_) => Delivery::TimedOut,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;

    #[test]
    fn test_ids_are_unique() {
        let (a, _ra) = Client::channel(1);
        let (b, _rb) = Client::channel(1);
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("client-"));
    }

    #[tokio::test]
    async fn test_deliver_outcomes() {
        let (client, mut rx) = Client::channel(1);
        let wait = Duration::from_millis(20);

        assert_eq!(client.deliver(ActionReturn::ok(Value::Int(1)), wait).await, Delivery::Delivered);
        // Queue full and nobody draining
        assert_eq!(client.deliver(ActionReturn::ok(Value::Int(2)), wait).await, Delivery::TimedOut);
        assert_eq!(rx.recv().await, Some(ActionReturn::ok(Value::Int(1))));

        drop(rx);
        assert_eq!(client.deliver(ActionReturn::ok(Value::Int(3)), wait).await, Delivery::Closed);
    }
}
