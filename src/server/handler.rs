//! Connection Handler
//!
//! One task per client connection: decodes action frames, answers them in
//! order and interleaves pushes queued for the client.

use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::Client;
use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::protocol::{ActionReturn, Message, WireCodec};

/// Connection handler
pub struct Handler {
    dispatcher: Arc<Dispatcher>,
    push_capacity: usize,
    shutdown: CancellationToken,
}

impl Handler {
    pub fn new(dispatcher: Arc<Dispatcher>, push_capacity: usize, shutdown: CancellationToken) -> Self {
        Self {
            dispatcher,
            push_capacity,
            shutdown,
        }
    }

    /// Run the handler until the peer disconnects or the node shuts down
    pub async fn run(self, socket: TcpStream) -> std::io::Result<()> {
        socket.set_nodelay(true)?;
        let mut framed = Framed::new(socket, WireCodec::new());
        let (client, mut pushes) = Client::channel(self.push_capacity);
        self.dispatcher.client_connected(&client);
        debug!(client = %client.id(), "client registered");

        let result = self.pump(&mut framed, &client, &mut pushes).await;

        client.closing().cancel();
        self.dispatcher.client_closed(&client);
        debug!(client = %client.id(), "client unregistered");
        result
    }

    async fn pump(
        &self,
        framed: &mut Framed<TcpStream, WireCodec>,
        client: &Client,
        pushes: &mut mpsc::Receiver<ActionReturn>,
    ) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                _ = client.closing().cancelled() => return Ok(()),
                push = pushes.recv() => match push {
                    Some(push) => framed.send(Message::Push(push)).await?,
                    None => return Ok(()),
                },
                message = framed.next() => match message {
                    Some(message) => {
                        let (id, ret) = match message? {
                            Message::Action { id, action } => (id, self.dispatcher.handle(client, action).await),
                            Message::Malformed { id, error, .. } => (id, ActionReturn::err(error)),
                            other => (
                                other.id(),
                                ActionReturn::err(Error::Protocol(format!(
                                    "expected an action, got a {}",
                                    other.kind()
                                ))),
                            ),
                        };
                        framed.send(Message::Return { id, ret }).await?;
                    }
                    None => return Ok(()),
                },
            }
        }
    }
}
