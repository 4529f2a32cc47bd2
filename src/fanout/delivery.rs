//! Bounded concurrent delivery of one push to many clients

use futures::future::join_all;
use std::time::Duration;
use tracing::{debug, warn};

use crate::client::{Client, Delivery};
use crate::protocol::ActionReturn;

/// Outcome counts of one fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: u64,
    pub timed_out: u64,
    pub closed: u64,
}

impl DeliveryReport {
    fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.timed_out += other.timed_out;
        self.closed += other.closed;
    }
}

/// Offer `push` to every client concurrently, each bounded by `wait`.
///
/// Up to `batch_size` clients run on the current task; larger sets are split
/// into disjoint batches, each on its own short-lived task.
pub async fn deliver_all(
    clients: Vec<Client>,
    push: ActionReturn,
    wait: Duration,
    batch_size: usize,
) -> DeliveryReport {
    let batch_size = batch_size.max(1);
    if clients.len() <= batch_size {
        return deliver_batch(clients, push, wait).await;
    }

    let mut handles = Vec::with_capacity(clients.len().div_ceil(batch_size));
    let mut rest = clients;
    while !rest.is_empty() {
        let tail = rest.split_off(rest.len().min(batch_size));
        let batch = std::mem::replace(&mut rest, tail);
        handles.push(tokio::spawn(deliver_batch(batch, push.clone(), wait)));
    }

    let mut report = DeliveryReport::default();
    for handle in handles {
        match handle.await {
            Ok(batch) => report.merge(batch),
            Err(e) => warn!(error = %e, "delivery batch task failed"),
        }
    }
    report
}

async fn deliver_batch(clients: Vec<Client>, push: ActionReturn, wait: Duration) -> DeliveryReport {
    let outcomes = join_all(clients.iter().map(|c| c.deliver(push.clone(), wait))).await;

    let mut report = DeliveryReport::default();
    for (client, outcome) in clients.iter().zip(outcomes) {
        match outcome {
            Delivery::Delivered => report.delivered += 1,
            Delivery::TimedOut => {
                warn!(client = %client.id(), timeout_ms = wait.as_millis() as u64, "push delivery timed out, dropped");
                report.timed_out += 1;
            }
            Delivery::Closed => {
                debug!(client = %client.id(), "client gone before delivery");
                report.closed += 1;
            }
        }
    }
    report
}
