//! Managed Connection
//!
//! One task per peer endpoint running
//! `Connecting -> Active <-> Resurrecting -> Closed`.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::protocol::{Action, Value};

use super::peer::{PeerCaller, PeerConnector, PeerEvent, PeerLink};

/// Lifecycle of a managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Resurrecting,
    Closed,
}

/// Timers shared by all connections of one manager
#[derive(Debug, Clone, Copy)]
pub struct ConnectionTimers {
    pub interval: Duration,
    pub backoff: Duration,
    pub call_timeout: Duration,
}

enum Step {
    Connect,
    Active(PeerLink),
    Resurrect,
    Closed,
}

/// Handle the manager keeps for each endpoint
pub struct ManagedConnection {
    endpoint: String,
    state: watch::Receiver<ConnectionState>,
    closing: CancellationToken,
    task: JoinHandle<()>,
}

impl ManagedConnection {
    pub fn spawn(
        endpoint: String,
        connector: Arc<dyn PeerConnector>,
        timers: ConnectionTimers,
        command: watch::Receiver<Option<Action>>,
        events: mpsc::Sender<PeerEvent>,
        closing: CancellationToken,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let runner = Runner {
            endpoint: endpoint.clone(),
            connector,
            timers,
            command,
            events,
            state: state_tx,
            closing: closing.clone(),
        };
        Self {
            endpoint,
            state: state_rx,
            closing,
            task: tokio::spawn(runner.run()),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Signal the task to stop; it reaches `Closed` on its own
    pub fn close(&self) {
        self.closing.cancel();
    }

    pub async fn close_and_join(self, wait: Duration) {
        self.closing.cancel();
        if timeout(wait, self.task).await.is_err() {
            warn!(endpoint = %self.endpoint, "connection task did not stop in time");
        }
    }
}

struct Runner {
    endpoint: String,
    connector: Arc<dyn PeerConnector>,
    timers: ConnectionTimers,
    command: watch::Receiver<Option<Action>>,
    events: mpsc::Sender<PeerEvent>,
    state: watch::Sender<ConnectionState>,
    closing: CancellationToken,
}

impl Runner {
    async fn run(self) {
        let mut step = Step::Connect;
        loop {
            step = match step {
                Step::Connect => {
                    self.set_state(ConnectionState::Connecting);
                    match self.connect().await {
                        Ok(link) => Step::Active(link),
                        Err(_) if self.closing.is_cancelled() => Step::Closed,
                        Err(e) => {
                            warn!(endpoint = %self.endpoint, error = %e, "peer connect failed");
                            Step::Resurrect
                        }
                    }
                }
                Step::Active(link) => {
                    self.set_state(ConnectionState::Active);
                    info!(endpoint = %self.endpoint, "peer connection active");
                    self.active(link).await
                }
                Step::Resurrect => {
                    self.set_state(ConnectionState::Resurrecting);
                    self.resurrect().await
                }
                Step::Closed => {
                    self.set_state(ConnectionState::Closed);
                    debug!(endpoint = %self.endpoint, "peer connection closed");
                    return;
                }
            };
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    async fn connect(&self) -> Result<PeerLink> {
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => Err(Error::ClusterConnectionUnreachable(self.endpoint.clone())),
            link = self.connector.connect(&self.endpoint) => link,
        }
    }

    async fn active(&self, link: PeerLink) -> Step {
        let (caller, mut pushes) = link.into_parts();
        let mut ticker = interval(self.timers.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Step::Closed,
                push = pushes.recv() => match push {
                    Some(value) => self.forward(value).await,
                    None => {
                        warn!(endpoint = %self.endpoint, "peer link dropped");
                        return Step::Resurrect;
                    }
                },
                _ = ticker.tick() => {
                    let command = self.command.borrow().clone();
                    if let Some(action) = command {
                        let name = action.command.clone();
                        if let Err(e) = self.run_periodic(&caller, &mut pushes, action).await {
                            if self.closing.is_cancelled() {
                                return Step::Closed;
                            }
                            warn!(endpoint = %self.endpoint, command = %name, error = %e, "periodic command failed");
                            return Step::Resurrect;
                        }
                    }
                }
            }
        }
    }

    /// Run one periodic call while still forwarding the peer's pushes
    async fn run_periodic(
        &self,
        caller: &PeerCaller,
        pushes: &mut mpsc::Receiver<Value>,
        action: Action,
    ) -> Result<()> {
        let call = caller.call(action, self.timers.call_timeout);
        tokio::pin!(call);
        let mut link_open = true;

        loop {
            tokio::select! {
                biased;
                _ = self.closing.cancelled() => {
                    return Err(Error::ClusterConnectionUnreachable(self.endpoint.clone()));
                }
                result = &mut call => return result.map(|_| ()),
                push = pushes.recv(), if link_open => match push {
                    Some(value) => self.forward(value).await,
                    None => link_open = false,
                },
            }
        }
    }

    async fn forward(&self, value: Value) {
        let event = PeerEvent {
            endpoint: self.endpoint.clone(),
            value,
        };
        tokio::select! {
            biased;
            _ = self.closing.cancelled() => {}
            sent = self.events.send(event) => {
                if sent.is_err() {
                    debug!(endpoint = %self.endpoint, "cluster output queue closed");
                }
            }
        }
    }

    async fn resurrect(&self) -> Step {
        loop {
            tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Step::Closed,
                _ = sleep(self.timers.backoff) => {}
            }
            match self.connect().await {
                Ok(link) => {
                    info!(endpoint = %self.endpoint, "peer connection resurrected");
                    return Step::Active(link);
                }
                Err(_) if self.closing.is_cancelled() => return Step::Closed,
                Err(e) => debug!(endpoint = %self.endpoint, error = %e, "resurrection attempt failed"),
            }
        }
    }
}
