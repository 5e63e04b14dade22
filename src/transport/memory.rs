//! In-process message broker with queue semantics

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::traits::{BrokerClient, TransportError};

#[derive(Default)]
struct Queue {
    consumers: Vec<mpsc::UnboundedSender<Bytes>>,
    next: usize,
    backlog: VecDeque<Bytes>,
}

impl Queue {
    /// Hand `body` to the next live consumer, or keep it for later
    fn push(&mut self, body: Bytes) {
        self.consumers.retain(|c| !c.is_closed());
        if self.consumers.is_empty() {
            self.backlog.push_back(body);
            return;
        }

        let index = self.next % self.consumers.len();
        self.next = self.next.wrapping_add(1);
        if let Err(rejected) = self.consumers[index].send(body) {
            // Consumer went away between the retain and the send
            self.consumers.remove(index);
            self.push(rejected.0);
        }
    }
}

/// Broker that lives inside one process
///
/// Each channel is a queue: every published body goes to exactly one
/// consumer, round-robin, and bodies published before anyone consumes are
/// held until the first consumer arrives. `with_redeliveries` publishes
/// every body extra times to mimic an at-least-once broker.
#[derive(Default)]
pub struct MemoryBroker {
    queues: Mutex<HashMap<String, Queue>>,
    redeliveries: usize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver every body `1 + redeliveries` times
    pub fn with_redeliveries(redeliveries: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            redeliveries,
        }
    }

    /// Bodies waiting on `channel` for a consumer
    pub fn backlog_len(&self, channel: &str) -> usize {
        self.queues
            .lock()
            .get(channel)
            .map(|q| q.backlog.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, channel: &str) -> usize {
        self.queues
            .lock()
            .get(channel)
            .map(|q| q.consumers.iter().filter(|c| !c.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    async fn publish(&self, destination: &str, body: Bytes) -> Result<(), TransportError> {
        let mut queues = self.queues.lock();
        let queue = queues.entry(destination.to_string()).or_default();
        for _ in 0..self.redeliveries {
            queue.push(body.clone());
        }
        queue.push(body);
        Ok(())
    }

    async fn consume(
        &self,
        channel: &str,
    ) -> Result<BoxStream<'static, Result<Bytes, TransportError>>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut queues = self.queues.lock();
            let queue = queues.entry(channel.to_string()).or_default();
            let backlog: Vec<Bytes> = queue.backlog.drain(..).collect();
            if !backlog.is_empty() {
                debug!("Flushing {} queued messages to new consumer of {}", backlog.len(), channel);
            }
            for body in backlog {
                // rx is alive until this function returns
                let _ = tx.send(body);
            }
            queue.consumers.push(tx);
        }

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|body| (Ok(body), rx))
        });
        Ok(stream.boxed())
    }
}
